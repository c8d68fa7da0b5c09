//! Compute node rows and their history.

use fleet_core::node::NodeAuth;
use fleet_core::status::{NodeEventKind, StatusId};
use fleet_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

/// A row from the `nodes` table.
///
/// Liveness is runtime state held by the registry, not a column.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Node {
    pub id: DbId,
    pub name: String,
    pub host: String,
    #[serde(skip_serializing)]
    pub auth: Json<NodeAuth>,
    /// Discovered checkpoints, samplers, schedulers and extensions.
    pub resources: serde_json::Value,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// DTO for importing a node.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateNode {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub auth: NodeAuth,
}

/// A row from the `node_events` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct NodeEvent {
    pub id: DbId,
    pub node_id: DbId,
    pub kind_id: StatusId,
    pub detail: serde_json::Value,
    pub created_at: Timestamp,
}

impl NodeEvent {
    pub fn kind(&self) -> Option<NodeEventKind> {
        NodeEventKind::from_id(self.kind_id)
    }
}
