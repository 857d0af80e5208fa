//! External pattern-normalization collaborator.
//!
//! Discovery can produce many near-duplicate regex candidates for one source.
//! The normalizer merges semantically-equivalent patterns into canonical
//! forms. It runs out of process: a JSON-lines bridge subprocess over
//! stdin/stdout, same shape as an LLM provider sidecar. The caller must
//! tolerate syntactically invalid responses — they surface as typed errors,
//! never a crash.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};

use tracing::{info, warn};

use curator_shared::{CuratorError, NormalizerConfig, Result};

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

/// A normalization request: candidate patterns for one batch.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NormalizeRequest {
    /// Candidate pattern strings to merge.
    pub patterns: Vec<String>,
    /// Stricter retry mode: smaller list, lower sampling temperature on the
    /// collaborator side.
    pub strict: bool,
}

/// One merged group in a normalization response.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NormalizedGroup {
    /// Canonical pattern for the group.
    pub normalized_pattern: String,
    /// The input patterns this group absorbs.
    pub original_patterns: Vec<String>,
    /// Collaborator's explanation, kept for logging only.
    #[serde(default)]
    pub reason: String,
}

/// Seam for the normalization collaborator, so discovery can be tested with a
/// fake and run headless without the bridge.
pub trait PatternNormalizer {
    fn normalize(&mut self, request: &NormalizeRequest) -> Result<Vec<NormalizedGroup>>;
}

/// Request message sent to the bridge.
#[derive(Debug, serde::Serialize)]
#[serde(tag = "type")]
enum RequestMessage {
    #[serde(rename = "normalize")]
    Normalize {
        id: String,
        patterns: Vec<String>,
        strict: bool,
    },
    #[serde(rename = "shutdown")]
    Shutdown,
}

/// Response message received from the bridge.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type")]
enum ResponseMessage {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "result")]
    Result {
        id: String,
        groups: Vec<NormalizedGroup>,
    },
    #[serde(rename = "error")]
    Error {
        #[allow(dead_code)]
        id: String,
        error: String,
    },
}

// ---------------------------------------------------------------------------
// Bridge implementation
// ---------------------------------------------------------------------------

/// Handle to the spawned normalizer bridge subprocess.
pub struct BridgeNormalizer {
    child: Child,
    stdin: std::process::ChildStdin,
    reader: BufReader<std::process::ChildStdout>,
    request_counter: u64,
}

impl BridgeNormalizer {
    /// Spawn the bridge subprocess and wait for its ready handshake.
    pub fn spawn(config: &NormalizerConfig) -> Result<Self> {
        info!(cmd = %config.bridge_cmd, script = %config.bridge_script, "spawning normalizer bridge");

        let mut child = Command::new(&config.bridge_cmd)
            .arg("run")
            .arg(&config.bridge_script)
            .current_dir(&config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Bridge logs go to parent stderr
            .spawn()
            .map_err(|e| {
                CuratorError::Normalizer(format!(
                    "failed to spawn bridge: {e}. Is `{}` installed?",
                    config.bridge_cmd
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CuratorError::Normalizer("failed to capture bridge stdin".into()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CuratorError::Normalizer("failed to capture bridge stdout".into()))?;

        let mut handle = Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            request_counter: 0,
        };

        handle.wait_for_ready()?;
        Ok(handle)
    }

    /// Wait for the bridge to send its "ready" message.
    fn wait_for_ready(&mut self) -> Result<()> {
        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .map_err(|e| CuratorError::Normalizer(format!("bridge read error: {e}")))?;

        let msg: ResponseMessage = serde_json::from_str(line.trim()).map_err(|e| {
            CuratorError::Normalizer(format!("invalid bridge ready message: {e} (got: {line})"))
        })?;

        match msg {
            ResponseMessage::Ready => {
                info!("normalizer bridge is ready");
                Ok(())
            }
            _ => Err(CuratorError::Normalizer(format!(
                "expected ready message, got: {line}"
            ))),
        }
    }

    /// Send shutdown and wait for the bridge to exit.
    pub fn shutdown(mut self) -> Result<()> {
        if let Ok(json) = serde_json::to_string(&RequestMessage::Shutdown) {
            let _ = writeln!(self.stdin, "{json}");
            let _ = self.stdin.flush();
        }

        match self.child.wait() {
            Ok(status) => {
                info!(?status, "normalizer bridge exited");
                Ok(())
            }
            Err(e) => {
                warn!("bridge wait error: {e}");
                Ok(())
            }
        }
    }
}

impl PatternNormalizer for BridgeNormalizer {
    fn normalize(&mut self, request: &NormalizeRequest) -> Result<Vec<NormalizedGroup>> {
        self.request_counter += 1;
        let id = format!("req-{}", self.request_counter);

        let message = RequestMessage::Normalize {
            id: id.clone(),
            patterns: request.patterns.clone(),
            strict: request.strict,
        };

        let json = serde_json::to_string(&message)
            .map_err(|e| CuratorError::Normalizer(format!("failed to serialize request: {e}")))?;

        writeln!(self.stdin, "{json}")
            .map_err(|e| CuratorError::Normalizer(format!("failed to write to bridge stdin: {e}")))?;
        self.stdin
            .flush()
            .map_err(|e| CuratorError::Normalizer(format!("failed to flush bridge stdin: {e}")))?;

        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .map_err(|e| CuratorError::Normalizer(format!("bridge read error: {e}")))?;

        if line.is_empty() {
            return Err(CuratorError::Normalizer(
                "bridge closed stdout unexpectedly".into(),
            ));
        }

        let msg: ResponseMessage = serde_json::from_str(line.trim()).map_err(|e| {
            let preview: String = line.trim().chars().take(200).collect();
            CuratorError::Normalizer(format!("invalid bridge response: {e} (got: {preview})"))
        })?;

        match msg {
            ResponseMessage::Result { id: resp_id, groups } => {
                debug_assert_eq!(resp_id, id);
                Ok(groups)
            }
            ResponseMessage::Error { id: _, error } => Err(CuratorError::Normalizer(error)),
            ResponseMessage::Ready => Err(CuratorError::Normalizer(
                "unexpected ready message during normalization".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_message_serializes_correctly() {
        let msg = RequestMessage::Normalize {
            id: "req-1".into(),
            patterns: vec![r"^https?://a\.com/art-\d+/?$".into()],
            strict: false,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"normalize"#));
        assert!(json.contains(r#""id":"req-1"#));
        assert!(json.contains(r#""strict":false"#));
    }

    #[test]
    fn shutdown_message_serializes_correctly() {
        let json = serde_json::to_string(&RequestMessage::Shutdown).unwrap();
        assert_eq!(json, r#"{"type":"shutdown"}"#);
    }

    #[test]
    fn response_message_deserializes_result() {
        let json = r#"{"type":"result","id":"req-1","groups":[{"normalized_pattern":"^a$","original_patterns":["^a$","^a/?$"],"reason":"equivalent"}]}"#;
        let msg: ResponseMessage = serde_json::from_str(json).unwrap();
        match msg {
            ResponseMessage::Result { id, groups } => {
                assert_eq!(id, "req-1");
                assert_eq!(groups.len(), 1);
                assert_eq!(groups[0].original_patterns.len(), 2);
            }
            _ => panic!("expected Result"),
        }
    }

    #[test]
    fn response_message_deserializes_error() {
        let json = r#"{"type":"error","id":"req-2","error":"model overloaded"}"#;
        let msg: ResponseMessage = serde_json::from_str(json).unwrap();
        match msg {
            ResponseMessage::Error { id, error } => {
                assert_eq!(id, "req-2");
                assert_eq!(error, "model overloaded");
            }
            _ => panic!("expected Error"),
        }
    }

    #[test]
    fn malformed_response_is_a_parse_error_not_a_panic() {
        let result: std::result::Result<ResponseMessage, _> =
            serde_json::from_str("here are your patterns: ^a$");
        assert!(result.is_err());
    }

    #[test]
    fn group_reason_defaults_to_empty() {
        let json = r#"{"normalized_pattern":"^a$","original_patterns":["^a$"]}"#;
        let group: NormalizedGroup = serde_json::from_str(json).unwrap();
        assert!(group.reason.is_empty());
    }
}
