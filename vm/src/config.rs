//! Sandbox configuration

use serde::Deserialize;

use crate::error::SandboxError;

/// Evaluation limits applied to each top-level invocation of user code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Maximum nesting of evaluated forms
    pub max_depth: usize,
    /// Maximum number of evaluated forms
    pub max_steps: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_depth: 200,
            max_steps: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Peripheral methods whose callable arguments are per-frame callbacks
    pub frame_methods: Vec<String>,
    /// Methods whose callable arguments are deferred parameters, re-evaluated
    /// every frame
    pub param_methods: Vec<String>,
    pub limits: Limits,
    /// Re-run the last working revision after an init fault
    pub rollback: bool,
    /// Extra ticks a swap waits on an in-progress render before a warning is
    /// logged; it keeps waiting either way
    pub render_stall_warning: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            frame_methods: vec!["draw".to_string(), "on-frame".to_string()],
            param_methods: vec!["set".to_string()],
            limits: Limits::default(),
            rollback: true,
            render_stall_warning: 8,
        }
    }
}

impl SandboxConfig {
    pub fn from_json(json: &str) -> Result<Self, SandboxError> {
        let config: SandboxConfig = serde_json::from_str(json)?;
        if config.limits.max_depth == 0 || config.limits.max_steps == 0 {
            return Err(SandboxError::Config(
                "evaluation limits must be positive".to_string(),
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SandboxConfig::from_json(r#"{"rollback": false, "limits": {"max_depth": 64}}"#)
            .unwrap();
        assert!(!config.rollback);
        assert_eq!(config.limits.max_depth, 64);
        assert_eq!(config.limits.max_steps, 1_000_000);
        assert_eq!(config.frame_methods, vec!["draw", "on-frame"]);
        assert_eq!(config.param_methods, vec!["set"]);
    }

    #[test]
    fn test_rejects_zero_limits() {
        assert!(matches!(
            SandboxConfig::from_json(r#"{"limits": {"max_steps": 0}}"#),
            Err(SandboxError::Config(_))
        ));
        assert!(matches!(
            SandboxConfig::from_json("{not json"),
            Err(SandboxError::Json(_))
        ));
    }
}
