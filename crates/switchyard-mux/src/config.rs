//! Configuration types for children and the gateway.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default name reported in `clientInfo` and `serverInfo`.
pub const DEFAULT_GATEWAY_NAME: &str = "switchyard";

/// Default timeout for `tools/call`, in milliseconds.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Default wait for a handshake acknowledgment, in milliseconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Default cap on outstanding calls against a single child.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

fn default_name() -> String {
    DEFAULT_GATEWAY_NAME.to_string()
}

fn default_call_timeout() -> u64 {
    DEFAULT_CALL_TIMEOUT_MS
}

fn default_handshake_timeout() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

/// Static description of one child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    /// Unique logical name; also the tool-name prefix.
    pub name: String,
    /// Command to run (e.g., "npx", "python").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; inherits the gateway's when unset.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Extra environment variables for the child.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ChildSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            cwd: None,
            env: HashMap::new(),
        }
    }
}

/// Gateway-wide tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl GatewaySettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_child_spec() {
        let toml_str = r#"
name = "filesystem"
command = "npx"
args = ["@modelcontextprotocol/server-filesystem", "./projects"]
"#;
        let spec: ChildSpec = toml::from_str(toml_str).unwrap();
        assert_eq!(spec.name, "filesystem");
        assert_eq!(spec.args.len(), 2);
        assert!(spec.cwd.is_none());
        assert!(spec.env.is_empty());
    }

    #[test]
    fn parse_child_spec_with_cwd_and_env() {
        let toml_str = r#"
name = "search"
command = "npx"
cwd = "servers"
env = { BRAVE_API_KEY = "xxxx" }
"#;
        let spec: ChildSpec = toml::from_str(toml_str).unwrap();
        assert_eq!(spec.cwd, Some(PathBuf::from("servers")));
        assert_eq!(spec.env["BRAVE_API_KEY"], "xxxx");
    }

    #[test]
    fn settings_default_fill_missing_fields() {
        let settings: GatewaySettings = toml::from_str("call_timeout_ms = 500").unwrap();
        assert_eq!(settings.call_timeout(), Duration::from_millis(500));
        assert_eq!(settings.handshake_timeout_ms, DEFAULT_HANDSHAKE_TIMEOUT_MS);
        assert_eq!(settings.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
        assert_eq!(settings.name, "switchyard");
    }
}
