//! Serializable response types for the MCP tool.
//!
//! All types implement `Serialize`, `Deserialize`, and `JsonSchema` for MCP
//! protocol compatibility.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::runner::CommandResult;

/// Result of one `ssh_run_command` call.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SshRunResponse {
    /// Identifier correlating this run with server logs
    pub run_id: String,
    /// When the run started (RFC3339 format)
    pub started_at: String,
    /// `user@host:port` the command ran against
    pub target: String,
    #[serde(flatten)]
    pub result: CommandResult,
}

#[cfg(test)]
mod response_serialization {
    use std::time::Duration;

    use super::*;
    use crate::runner::ChannelKind;

    fn sample() -> SshRunResponse {
        SshRunResponse {
            run_id: "run-1".to_string(),
            started_at: "2025-01-01T00:00:00+00:00".to_string(),
            target: "admin@10.0.0.1:22".to_string(),
            result: CommandResult::succeeded(
                ChannelKind::Shell,
                "Cisco IOS Software".to_string(),
                Duration::from_millis(1520),
            ),
        }
    }

    #[test]
    fn test_json_structure_is_flat() {
        let json: serde_json::Value = serde_json::to_value(sample()).unwrap();

        assert_eq!(json["run_id"], "run-1");
        assert_eq!(json["output"], "Cisco IOS Software");
        assert_eq!(json["error"], "");
        assert_eq!(json["success"], true);
        assert_eq!(json["channel_kind"], "shell");
        assert_eq!(json["elapsed"], 1520);
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_deserialize_from_flat_json() {
        let json = r#"{
            "run_id": "run-2",
            "started_at": "2025-01-01T00:00:00+00:00",
            "target": "root@host:2222",
            "output": "",
            "error": "exit status 1",
            "success": false,
            "channel_kind": "exec",
            "elapsed": 40
        }"#;

        let response: SshRunResponse = serde_json::from_str(json).unwrap();

        assert_eq!(response.result.channel_kind, ChannelKind::Exec);
        assert_eq!(response.result.elapsed, Duration::from_millis(40));
        assert!(!response.result.success);
    }
}
