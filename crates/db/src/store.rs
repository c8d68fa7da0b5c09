//! The persistence seam.
//!
//! Every method is its own unit of work; no transaction outlives a call.
//! Status-changing task methods append the matching `task_events` row in the
//! same unit of work and only apply when the current status allows the
//! transition (see [`TaskStatus::allowed_sources`]). They return `false`
//! when the transition did not apply.

use async_trait::async_trait;
use fleet_core::status::{AttachmentStatus, NodeEventKind, TaskStatus};
use fleet_core::types::DbId;

use crate::error::StoreError;
use crate::models::account::{Account, ApiToken};
use crate::models::attachment::{Attachment, NewAttachment, TaskAttachment};
use crate::models::node::{CreateNode, Node, NodeEvent};
use crate::models::notification::{NewNotification, UserNotification};
use crate::models::task::{CreatedExecution, NewExecution, Task, TaskCompletion, TaskEvent};
use crate::models::trigger::Trigger;
use crate::models::workflow::{CreateWorkflow, Workflow};

/// Detail written on tasks requeued by start-up recovery.
pub const REQUEUE_DETAIL: &str = "Requeued after restart";

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Backend name for logs and health output.
    fn backend(&self) -> &'static str;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), StoreError>;

    // -- workflows ------------------------------------------------------------

    async fn find_workflow(&self, id: DbId) -> Result<Option<Workflow>, StoreError>;

    async fn create_workflow(&self, input: &CreateWorkflow) -> Result<Workflow, StoreError>;

    // -- ledgers --------------------------------------------------------------

    async fn find_account(&self, id: DbId) -> Result<Option<Account>, StoreError>;

    async fn find_token(&self, id: DbId) -> Result<Option<ApiToken>, StoreError>;

    // -- tasks ----------------------------------------------------------------

    /// Persist trigger, optional parent, children, each task's initial event
    /// and the conditional debit in one transaction.
    ///
    /// Fails with [`StoreError::InsufficientBalance`] and persists nothing
    /// when the debit cannot be applied.
    async fn create_execution(&self, plan: &NewExecution)
        -> Result<CreatedExecution, StoreError>;

    /// Move up to `limit` `Queuing` tasks to `Pending`, lowest weight first
    /// then oldest first, and return them in that order.
    async fn claim_queued(&self, limit: i64) -> Result<Vec<Task>, StoreError>;

    /// Transition a task and append an event.
    async fn set_task_status(
        &self,
        task_id: DbId,
        status: TaskStatus,
        details: Option<&str>,
        data: Option<&serde_json::Value>,
    ) -> Result<bool, StoreError>;

    /// Append an event without changing status (progress, loading).
    async fn append_task_event(
        &self,
        task_id: DbId,
        status: TaskStatus,
        details: Option<&str>,
        data: Option<&serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// Bind a task to the node running it.
    async fn assign_node(&self, task_id: DbId, node_id: DbId) -> Result<(), StoreError>;

    /// Mark a `Running` task `Success`, store outputs and link attachments.
    async fn complete_task(
        &self,
        task_id: DbId,
        completion: &TaskCompletion,
    ) -> Result<bool, StoreError>;

    async fn find_task(&self, id: DbId) -> Result<Option<Task>, StoreError>;

    async fn list_task_events(&self, task_id: DbId) -> Result<Vec<TaskEvent>, StoreError>;

    async fn list_children(&self, parent_id: DbId) -> Result<Vec<Task>, StoreError>;

    async fn list_task_attachments(&self, task_id: DbId)
        -> Result<Vec<TaskAttachment>, StoreError>;

    /// `Queuing`, `Pending` and `Running` tasks in claim order.
    async fn running_tasks(&self, workflow_id: Option<DbId>) -> Result<Vec<Task>, StoreError>;

    async fn find_trigger(&self, id: DbId) -> Result<Option<Trigger>, StoreError>;

    /// `Pending|Running -> Queuing` with a [`REQUEUE_DETAIL`] event; clears
    /// the node binding. Returns the number of tasks requeued.
    async fn requeue_interrupted(&self) -> Result<u64, StoreError>;

    /// Delete `Success` tasks that expect files but have no attachments.
    async fn purge_outputless_successes(&self) -> Result<u64, StoreError>;

    // -- attachments ----------------------------------------------------------

    async fn find_uploaded_attachment_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<Attachment>, StoreError>;

    /// Insert a `Pending` attachment.
    async fn create_attachment(&self, input: &NewAttachment) -> Result<Attachment, StoreError>;

    async fn set_attachment_status(
        &self,
        id: DbId,
        status: AttachmentStatus,
    ) -> Result<(), StoreError>;

    /// Mark a `Pending` attachment `Uploaded` and return the uploaded row
    /// for its hash. When another row with the same hash won the race,
    /// `id` is marked `Failed` and the winner is returned.
    async fn promote_attachment(&self, id: DbId) -> Result<Attachment, StoreError>;

    async fn find_attachment(&self, id: DbId) -> Result<Option<Attachment>, StoreError>;

    // -- nodes ----------------------------------------------------------------

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError>;

    async fn find_node(&self, id: DbId) -> Result<Option<Node>, StoreError>;

    async fn create_node(&self, input: &CreateNode) -> Result<Node, StoreError>;

    async fn update_node_resources(
        &self,
        id: DbId,
        resources: &serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn record_node_event(
        &self,
        node_id: DbId,
        kind: NodeEventKind,
        detail: &serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Newest first.
    async fn list_node_events(&self, node_id: DbId, limit: i64)
        -> Result<Vec<NodeEvent>, StoreError>;

    async fn clear_node_events(&self, node_id: DbId) -> Result<u64, StoreError>;

    async fn delete_node(&self, id: DbId) -> Result<bool, StoreError>;

    // -- notifications --------------------------------------------------------

    async fn create_user_notification(
        &self,
        input: &NewNotification,
    ) -> Result<UserNotification, StoreError>;

    /// Newest first.
    async fn list_user_notifications(
        &self,
        user_id: DbId,
    ) -> Result<Vec<UserNotification>, StoreError>;
}
