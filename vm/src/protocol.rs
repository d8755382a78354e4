//! Messages exchanged with the host/editor boundary

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::{SandboxError, ScriptError};

/// A pending swap: the revision to run and whether clocks are zeroed first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapRequest {
    pub code: String,
    pub is_soft_reset: bool,
}

impl SwapRequest {
    pub fn run(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            is_soft_reset: false,
        }
    }

    pub fn soft_reset(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            is_soft_reset: true,
        }
    }
}

/// Inbound requests, one JSON object per message
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Run { code: String },
    SoftReset { code: String },
}

impl InboundMessage {
    pub fn parse(json: &str) -> Result<Self, SandboxError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl From<InboundMessage> for SwapRequest {
    fn from(message: InboundMessage) -> Self {
        match message {
            InboundMessage::Run { code } => SwapRequest::run(code),
            InboundMessage::SoftReset { code } => SwapRequest::soft_reset(code),
        }
    }
}

/// Outbound status reports
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusReport {
    /// Sandbox initialized
    Ready,
    /// Generation committed; UTC milliseconds
    RunOk { timestamp: i64 },
    RunError(ScriptError),
    /// Fault raised by an injected capability outside the user's call stack
    SoftError { source: String, message: String },
}

impl StatusReport {
    pub fn run_ok() -> Self {
        StatusReport::RunOk {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn to_json(&self) -> Result<String, SandboxError> {
        Ok(serde_json::to_string(self)?)
    }
}

type Listener = Rc<dyn Fn(&StatusReport)>;

/// Fan-out of status reports to subscribers
#[derive(Default)]
pub struct StatusBus {
    listeners: RefCell<Vec<Listener>>,
}

impl StatusBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&StatusReport) + 'static,
    {
        self.listeners.borrow_mut().push(Rc::new(listener));
    }

    pub fn emit(&self, report: StatusReport) {
        log::debug!("status: {:?}", report);
        // Listeners may subscribe while being notified
        let listeners: Vec<Listener> = self.listeners.borrow().clone();
        for listener in listeners {
            listener(&report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;

    #[test]
    fn test_inbound_messages() {
        let run = InboundMessage::parse(r#"{"type":"run","code":"(define x 1)"}"#).unwrap();
        assert_eq!(SwapRequest::from(run), SwapRequest::run("(define x 1)"));

        let reset = InboundMessage::parse(r#"{"type":"soft_reset","code":"x"}"#).unwrap();
        assert!(SwapRequest::from(reset).is_soft_reset);

        assert!(InboundMessage::parse(r#"{"type":"eval","code":"x"}"#).is_err());
    }

    #[test]
    fn test_status_report_wire_format() {
        assert_eq!(StatusReport::Ready.to_json().unwrap(), r#"{"type":"READY"}"#);

        let mut error = ScriptError::new(FaultKind::Syntax, "unexpected end of input");
        error.line = Some(1);
        error.column = Some(12);
        let json: serde_json::Value =
            serde_json::from_str(&StatusReport::RunError(error).to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "RUN_ERROR");
        assert_eq!(json["kind"], "syntax");
        assert_eq!(json["line"], 1);
        assert_eq!(json["column"], 12);
        assert!(json.get("stack").is_none());

        let ok: serde_json::Value =
            serde_json::from_str(&StatusReport::run_ok().to_json().unwrap()).unwrap();
        assert_eq!(ok["type"], "RUN_OK");
        assert!(ok["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_bus_fans_out() {
        let bus = StatusBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..2 {
            let seen = seen.clone();
            bus.subscribe(move |report| seen.borrow_mut().push(report.clone()));
        }
        bus.emit(StatusReport::Ready);
        assert_eq!(*seen.borrow(), vec![StatusReport::Ready, StatusReport::Ready]);
    }
}
