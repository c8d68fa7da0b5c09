//! Compute node protocol.
//!
//! [`NodeClient`] is the seam the scheduler talks to. [`ComfyNode`] is the
//! ComfyUI implementation (REST for submission and control, WebSocket for
//! lifecycle and progress, reconnect loop with backoff). [`ScriptedNode`]
//! replays canned runs for tests and local development.

pub mod api;
pub mod client;
pub mod comfy;
pub mod error;
pub mod events;
pub mod messages;
pub mod node;
pub mod outputs;
pub mod processor;
pub mod reconnect;
pub mod scripted;

pub use comfy::{ComfyConnector, ComfyNode};
pub use error::NodeError;
pub use events::{ExecutionEvent, NodeLifecycle, OutputValue, RunOutputs};
pub use node::{NodeClient, NodeConnector};
pub use scripted::{ScriptedConnector, ScriptedNode, ScriptedRun};
