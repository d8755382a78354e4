//! Hot-swap sandbox for live-coded animation
//!
//! Core execution engine providing:
//! - Homoiconic value system and EDN-like S-expression parser
//! - Tree-walking evaluator with depth and step limits
//! - Cooperative host event loop (timers, frame callbacks, listeners)
//! - Generation-scoped resource tracking, frame-fault isolation and
//!   rollback to the last working revision

// Language
pub mod value;        // Homoiconic value system
pub mod parser;       // EDN-like S-expression parser
pub mod evaluator;    // Tree-walking evaluator
pub mod intrinsics;   // Constrained standard library
pub mod error;

// Host surface
pub mod event_loop;
pub mod capability;
pub mod headless;
pub mod audio;
pub mod protocol;
pub mod config;

// Hot-swap core
pub mod arena;
pub mod draw_guard;
pub mod sandbox;
pub mod execution;
pub mod scheduler;
pub mod supervisor;

// Re-export key types
pub use value::{Environment, Symbol, Value};
pub use error::{FaultKind, ParseError, EvalError, SandboxError, ScriptError};
pub use event_loop::EventLoop;
pub use capability::{Capability, CapabilityTable, DataSource, Peripheral};
pub use headless::HeadlessPeripheral;
pub use protocol::{InboundMessage, StatusBus, StatusReport, SwapRequest};
pub use config::{Limits, SandboxConfig};
pub use supervisor::{Supervisor, SwapPhase};
