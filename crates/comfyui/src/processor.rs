//! WebSocket message processing loop.
//!
//! Reads frames from a node connection, parses them into
//! [`ComfyMessage`] variants and routes them either to the run currently
//! in flight on the node or to the node's lifecycle channel.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fleet_core::types::DbId;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use crate::client::WsStream;
use crate::error::NodeError;
use crate::events::{ExecutionEvent, NodeLifecycle};
use crate::messages::{decode_preview, parse_message, ComfyMessage};

/// Outputs collected from `executed` messages, keyed by graph node id.
pub type GraphOutputs = serde_json::Map<String, serde_json::Value>;

/// The single run a node is executing.
pub struct ActiveRun {
    /// Adopted from the first prompt-scoped message when the submit
    /// response has not been seen yet.
    pub prompt_id: Option<String>,
    pub events: mpsc::UnboundedSender<ExecutionEvent>,
    pub outputs: GraphOutputs,
    pub done: Option<oneshot::Sender<Result<GraphOutputs, NodeError>>>,
}

impl ActiveRun {
    pub fn new(
        events: mpsc::UnboundedSender<ExecutionEvent>,
        done: oneshot::Sender<Result<GraphOutputs, NodeError>>,
    ) -> Self {
        Self {
            prompt_id: None,
            events,
            outputs: GraphOutputs::new(),
            done: Some(done),
        }
    }

    /// Whether a message for `prompt_id` belongs to this run.
    fn owns(&mut self, prompt_id: Option<&str>) -> bool {
        match (self.prompt_id.as_deref(), prompt_id) {
            (Some(ours), Some(theirs)) => ours == theirs,
            (None, Some(theirs)) => {
                self.prompt_id = Some(theirs.to_string());
                true
            }
            (_, None) => true,
        }
    }

    fn finish(&mut self, result: Result<GraphOutputs, NodeError>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }
}

pub type RunSlot = Arc<Mutex<Option<ActiveRun>>>;

pub fn lock_slot(slot: &RunSlot) -> MutexGuard<'_, Option<ActiveRun>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fail the run in flight, if any.
pub fn fail_active(slot: &RunSlot, error: NodeError) {
    if let Some(run) = lock_slot(slot).as_mut() {
        run.finish(Err(error));
    }
}

/// Process frames until the WebSocket closes or errors.
pub async fn process_messages(
    stream: &mut WsStream,
    node_id: DbId,
    slot: &RunSlot,
    lifecycle: &broadcast::Sender<NodeLifecycle>,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_text(&text, node_id, slot, lifecycle),
            Ok(Message::Binary(bytes)) => forward_preview(&bytes, slot),
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Ok(Message::Close(frame)) => {
                tracing::info!(node_id, ?frame, "Node WebSocket closed");
                break;
            }
            Err(e) => {
                tracing::error!(node_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }
}

fn forward_preview(frame: &[u8], slot: &RunSlot) {
    let Some(preview) = decode_preview(frame) else {
        return;
    };
    if let Some(run) = lock_slot(slot).as_ref() {
        let _ = run.events.send(ExecutionEvent::Preview(preview));
    }
}

/// Route one text frame.
pub fn handle_text(
    text: &str,
    node_id: DbId,
    slot: &RunSlot,
    lifecycle: &broadcast::Sender<NodeLifecycle>,
) {
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(node_id, error = %e, raw_message = %text, "Unhandled node message");
            return;
        }
    };

    match msg {
        ComfyMessage::Status(data) => {
            let _ = lifecycle.send(NodeLifecycle::QueueStatus {
                node_id,
                queue_remaining: data.status.exec_info.queue_remaining,
            });
        }
        ComfyMessage::Monitor(payload) => {
            let _ = lifecycle.send(NodeLifecycle::SystemMonitor { node_id, payload });
        }
        ComfyMessage::ExecutionCached(data) => {
            tracing::debug!(node_id, prompt_id = %data.prompt_id, cached = data.nodes.len(), "Execution used cache");
        }
        other => route_to_run(other, node_id, slot),
    }
}

fn route_to_run(msg: ComfyMessage, node_id: DbId, slot: &RunSlot) {
    let mut guard = lock_slot(slot);
    let Some(run) = guard.as_mut() else {
        return;
    };

    match msg {
        ComfyMessage::ExecutionStart(data) => {
            if run.owns(Some(&data.prompt_id)) {
                tracing::info!(node_id, prompt_id = %data.prompt_id, "Execution started");
                let _ = run.events.send(ExecutionEvent::Start);
            }
        }
        ComfyMessage::Progress(data) => {
            if run.owns(data.prompt_id.as_deref()) {
                let _ = run.events.send(ExecutionEvent::Progress {
                    node: data.node,
                    value: data.value,
                    max: data.max,
                });
            }
        }
        ComfyMessage::Executing(data) => {
            if !run.owns(data.prompt_id.as_deref()) {
                return;
            }
            match data.node {
                Some(node) => tracing::debug!(node_id, node = %node, "Executing graph node"),
                None => {
                    let outputs = std::mem::take(&mut run.outputs);
                    run.finish(Ok(outputs));
                }
            }
        }
        ComfyMessage::Executed(data) => {
            if run.owns(Some(&data.prompt_id)) {
                run.outputs.insert(data.node, data.output);
            }
        }
        ComfyMessage::ExecutionSuccess(data) => {
            if run.owns(Some(&data.prompt_id)) {
                let outputs = std::mem::take(&mut run.outputs);
                run.finish(Ok(outputs));
            }
        }
        ComfyMessage::ExecutionInterrupted(data) => {
            if run.owns(Some(&data.prompt_id)) {
                tracing::info!(node_id, prompt_id = %data.prompt_id, "Execution interrupted");
                run.finish(Err(NodeError::Interrupted));
            }
        }
        ComfyMessage::ExecutionError(data) => {
            if run.owns(Some(&data.prompt_id)) {
                tracing::error!(
                    node_id,
                    prompt_id = %data.prompt_id,
                    error_type = %data.exception_type,
                    error_message = %data.exception_message,
                    "Execution error",
                );
                run.finish(Err(NodeError::ExecutionFailed(data.detail())));
            }
        }
        ComfyMessage::Status(_) | ComfyMessage::Monitor(_) | ComfyMessage::ExecutionCached(_) => {}
    }
}
