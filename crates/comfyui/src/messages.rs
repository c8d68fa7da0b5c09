//! ComfyUI WebSocket message types and parser.
//!
//! Text frames have the shape `{"type": "<kind>", "data": {...}}` and are
//! deserialized into [`ComfyMessage`]. Binary frames carry preview images
//! and are decoded by [`decode_preview`].

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;

/// Binary frame event type for preview images.
const BINARY_PREVIEW_IMAGE: u32 = 1;

/// Header length of a binary frame: event type plus image format.
const BINARY_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyMessage {
    /// Queue depth broadcast.
    #[serde(rename = "status")]
    Status(StatusData),

    #[serde(rename = "execution_start")]
    ExecutionStart(PromptRef),

    /// Some nodes were served from the node-side cache.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A node started executing. `node: None` means the prompt finished.
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node finished and produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    #[serde(rename = "execution_success")]
    ExecutionSuccess(PromptRef),

    #[serde(rename = "execution_interrupted")]
    ExecutionInterrupted(PromptRef),

    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),

    /// GPU/CPU readings from the Crystools extension.
    #[serde(rename = "crystools.monitor")]
    Monitor(serde_json::Value),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: u32,
    pub max: u32,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    /// Raw output (`images`, `gifs`, `text`, ...).
    pub output: serde_json::Value,
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    pub node_id: String,
    #[serde(default)]
    pub node_type: String,
    pub exception_message: String,
    pub exception_type: String,
}

impl ErrorData {
    /// One-line failure detail stored on the task.
    pub fn detail(&self) -> String {
        let message = self.exception_message.trim();
        if self.node_type.is_empty() {
            format!("node {}: {}: {}", self.node_id, self.exception_type, message)
        } else {
            format!(
                "{} (node {}): {}: {}",
                self.node_type, self.node_id, self.exception_type, message
            )
        }
    }
}

/// Parse a text frame. Unknown `type` values are an error; callers log and
/// continue.
pub fn parse_message(text: &str) -> Result<ComfyMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Decode a binary preview frame into base64 image bytes.
///
/// Returns `None` for frames that are not previews or are truncated.
pub fn decode_preview(frame: &[u8]) -> Option<String> {
    if frame.len() <= BINARY_HEADER_LEN {
        return None;
    }
    let event = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    if event != BINARY_PREVIEW_IMAGE {
        return None;
    }
    Some(STANDARD.encode(&frame[BINARY_HEADER_LEN..]))
}
