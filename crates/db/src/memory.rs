//! In-process [`TaskStore`].
//!
//! Same semantics as the PostgreSQL store (conditional transitions,
//! all-or-nothing execution creation, claim order) behind a single mutex.
//! Used by tests and single-binary development runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use fleet_core::admission::LedgerRef;
use fleet_core::status::{AttachmentStatus, NodeEventKind, Role, TaskStatus, WorkflowStatus};
use fleet_core::types::DbId;
use sqlx::types::Json;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::models::account::{Account, ApiToken};
use crate::models::attachment::{Attachment, NewAttachment, TaskAttachment};
use crate::models::node::{CreateNode, Node, NodeEvent};
use crate::models::notification::{NewNotification, UserNotification};
use crate::models::task::{
    CreatedExecution, NewExecution, NewTask, Task, TaskCompletion, TaskEvent,
};
use crate::models::trigger::Trigger;
use crate::models::workflow::{CreateWorkflow, Workflow};
use crate::store::{TaskStore, REQUEUE_DETAIL};

#[derive(Default)]
struct Inner {
    next_id: DbId,
    workflows: BTreeMap<DbId, Workflow>,
    accounts: BTreeMap<DbId, Account>,
    tokens: BTreeMap<DbId, ApiToken>,
    triggers: BTreeMap<DbId, Trigger>,
    tasks: BTreeMap<DbId, Task>,
    task_events: Vec<TaskEvent>,
    attachments: BTreeMap<DbId, Attachment>,
    task_attachments: Vec<TaskAttachment>,
    nodes: BTreeMap<DbId, Node>,
    node_events: Vec<NodeEvent>,
    notifications: Vec<UserNotification>,
}

impl Inner {
    fn next_id(&mut self) -> DbId {
        self.next_id += 1;
        self.next_id
    }

    fn push_event(
        &mut self,
        task_id: DbId,
        status: TaskStatus,
        details: Option<&str>,
        data: Option<&serde_json::Value>,
    ) {
        let id = self.next_id();
        self.task_events.push(TaskEvent {
            id,
            task_id,
            status_id: status.id(),
            details: details.map(str::to_string),
            data: data.cloned(),
            created_at: Utc::now(),
        });
    }

    /// Apply a transition if the current status allows it.
    fn transition(&mut self, task_id: DbId, to: TaskStatus) -> bool {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return false;
        };
        let allowed = task.status().is_some_and(|from| from.can_transition(to));
        if allowed {
            task.status_id = to.id();
            task.updated_at = Utc::now();
        }
        allowed
    }

    fn balance_mut(&mut self, ledger: LedgerRef) -> Option<&mut f64> {
        match ledger {
            LedgerRef::Account(id) => self.accounts.get_mut(&id).map(|a| &mut a.balance),
            LedgerRef::Token(id) => self.tokens.get_mut(&id).map(|t| &mut t.balance),
        }
    }

    fn insert_task(
        &mut self,
        input: &NewTask,
        trigger_id: DbId,
        parent_id: Option<DbId>,
        status: TaskStatus,
    ) -> Task {
        let now = Utc::now();
        let task = Task {
            id: self.next_id(),
            workflow_id: input.workflow_id,
            parent_id,
            node_id: None,
            trigger_id,
            repeat_count: input.repeat_count,
            input_values: input.input_values.clone(),
            output_values: None,
            weight: input.weight,
            cost: input.cost,
            status_id: status.id(),
            execution_time_ms: None,
            expects_files: input.expects_files,
            created_at: now,
            updated_at: now,
        };
        self.tasks.insert(task.id, task.clone());
        task
    }
}

/// Mutex-guarded in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an account ledger.
    pub async fn insert_account(&self, role: Role, balance: f64, weight_offset: f64) -> Account {
        let mut inner = self.inner.lock().await;
        let account = Account {
            id: inner.next_id(),
            role_id: role.id(),
            balance,
            weight_offset,
        };
        inner.accounts.insert(account.id, account.clone());
        account
    }

    /// Seed an API token ledger owned by `user_id`.
    pub async fn insert_token(&self, user_id: DbId, balance: f64, weight_offset: f64) -> ApiToken {
        let mut inner = self.inner.lock().await;
        let token = ApiToken {
            id: inner.next_id(),
            user_id,
            balance,
            weight_offset,
        };
        inner.tokens.insert(token.id, token.clone());
        token
    }

    /// Change a workflow's availability.
    pub async fn set_workflow_status(&self, id: DbId, status: WorkflowStatus) {
        let mut inner = self.inner.lock().await;
        if let Some(w) = inner.workflows.get_mut(&id) {
            w.status_id = status.id();
        }
    }

    /// Force a task into `status` without checks. Used to stage recovery
    /// scenarios.
    pub async fn force_task_status(&self, id: DbId, status: TaskStatus) {
        let mut inner = self.inner.lock().await;
        if let Some(t) = inner.tasks.get_mut(&id) {
            t.status_id = status.id();
        }
    }

    pub async fn task_count(&self) -> usize {
        self.inner.lock().await.tasks.len()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn find_workflow(&self, id: DbId) -> Result<Option<Workflow>, StoreError> {
        Ok(self.inner.lock().await.workflows.get(&id).cloned())
    }

    async fn create_workflow(&self, input: &CreateWorkflow) -> Result<Workflow, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let workflow = Workflow {
            id: inner.next_id(),
            name: input.name.clone(),
            graph: input.graph.clone(),
            inputs: Json(input.inputs.clone()),
            outputs: Json(input.outputs.clone()),
            cost: input.cost,
            base_weight: input.base_weight,
            status_id: WorkflowStatus::Activated.id(),
            created_at: now,
            updated_at: now,
        };
        inner.workflows.insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    async fn find_account(&self, id: DbId) -> Result<Option<Account>, StoreError> {
        Ok(self.inner.lock().await.accounts.get(&id).cloned())
    }

    async fn find_token(&self, id: DbId) -> Result<Option<ApiToken>, StoreError> {
        Ok(self.inner.lock().await.tokens.get(&id).cloned())
    }

    async fn create_execution(
        &self,
        plan: &NewExecution,
    ) -> Result<CreatedExecution, StoreError> {
        let mut inner = self.inner.lock().await;

        if let Some(charge) = plan.charge {
            let Some(balance) = inner.balance_mut(charge.ledger) else {
                return Err(StoreError::InsufficientBalance {
                    ledger: charge.ledger,
                    required: charge.amount,
                    available: 0.0,
                });
            };
            if *balance < charge.amount {
                return Err(StoreError::InsufficientBalance {
                    ledger: charge.ledger,
                    required: charge.amount,
                    available: *balance,
                });
            }
            *balance -= charge.amount;
        }

        let trigger = Trigger {
            id: inner.next_id(),
            kind_id: plan.trigger.kind.id(),
            user_id: plan.trigger.user_id,
            token_id: plan.trigger.token_id,
            created_at: Utc::now(),
        };
        inner.triggers.insert(trigger.id, trigger.clone());

        let parent = plan.parent.as_ref().map(|p| {
            let task = inner.insert_task(p, trigger.id, None, TaskStatus::Parent);
            inner.push_event(task.id, TaskStatus::Parent, Some("Batch created"), None);
            task
        });

        let parent_id = parent.as_ref().map(|p| p.id);
        let mut tasks = Vec::with_capacity(plan.children.len());
        for child in &plan.children {
            let task = inner.insert_task(child, trigger.id, parent_id, TaskStatus::Queuing);
            inner.push_event(task.id, TaskStatus::Queuing, Some("Queued"), None);
            tasks.push(task);
        }

        Ok(CreatedExecution {
            trigger_id: trigger.id,
            parent,
            tasks,
        })
    }

    async fn claim_queued(&self, limit: i64) -> Result<Vec<Task>, StoreError> {
        let mut inner = self.inner.lock().await;

        let mut queued: Vec<&Task> = inner
            .tasks
            .values()
            .filter(|t| t.status() == Some(TaskStatus::Queuing))
            .collect();
        queued.sort_by(|a, b| {
            a.weight
                .total_cmp(&b.weight)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        let ids: Vec<DbId> = queued
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|t| t.id)
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if inner.transition(id, TaskStatus::Pending) {
                inner.push_event(id, TaskStatus::Pending, Some("Claimed by dispatcher"), None);
                if let Some(t) = inner.tasks.get(&id) {
                    claimed.push(t.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn set_task_status(
        &self,
        task_id: DbId,
        status: TaskStatus,
        details: Option<&str>,
        data: Option<&serde_json::Value>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.transition(task_id, status) {
            return Ok(false);
        }
        inner.push_event(task_id, status, details, data);
        Ok(true)
    }

    async fn append_task_event(
        &self,
        task_id: DbId,
        status: TaskStatus,
        details: Option<&str>,
        data: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.tasks.contains_key(&task_id) {
            return Err(StoreError::NotFound {
                entity: "task",
                id: task_id,
            });
        }
        inner.push_event(task_id, status, details, data);
        Ok(())
    }

    async fn assign_node(&self, task_id: DbId, node_id: DbId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(t) = inner.tasks.get_mut(&task_id) {
            t.node_id = Some(node_id);
            t.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn complete_task(
        &self,
        task_id: DbId,
        completion: &TaskCompletion,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.transition(task_id, TaskStatus::Success) {
            return Ok(false);
        }
        if let Some(t) = inner.tasks.get_mut(&task_id) {
            t.output_values = Some(completion.output_values.clone());
            t.execution_time_ms = Some(completion.execution_time_ms);
        }
        for (attachment_id, output_key) in &completion.attachments {
            let link = TaskAttachment {
                task_id,
                attachment_id: *attachment_id,
                output_key: output_key.clone(),
            };
            if !inner.task_attachments.contains(&link) {
                inner.task_attachments.push(link);
            }
        }
        inner.push_event(task_id, TaskStatus::Success, Some("Completed"), None);
        Ok(true)
    }

    async fn find_task(&self, id: DbId) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.lock().await.tasks.get(&id).cloned())
    }

    async fn list_task_events(&self, task_id: DbId) -> Result<Vec<TaskEvent>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .task_events
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn list_children(&self, parent_id: DbId) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.parent_id == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn list_task_attachments(
        &self,
        task_id: DbId,
    ) -> Result<Vec<TaskAttachment>, StoreError> {
        let inner = self.inner.lock().await;
        let mut links: Vec<TaskAttachment> = inner
            .task_attachments
            .iter()
            .filter(|l| l.task_id == task_id)
            .cloned()
            .collect();
        links.sort_by(|a, b| {
            a.output_key
                .cmp(&b.output_key)
                .then(a.attachment_id.cmp(&b.attachment_id))
        });
        Ok(links)
    }

    async fn running_tasks(&self, workflow_id: Option<DbId>) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| {
                matches!(
                    t.status(),
                    Some(TaskStatus::Queuing | TaskStatus::Pending | TaskStatus::Running)
                )
            })
            .filter(|t| workflow_id.map_or(true, |w| t.workflow_id == w))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            a.weight
                .total_cmp(&b.weight)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    async fn find_trigger(&self, id: DbId) -> Result<Option<Trigger>, StoreError> {
        Ok(self.inner.lock().await.triggers.get(&id).cloned())
    }

    async fn requeue_interrupted(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let ids: Vec<DbId> = inner
            .tasks
            .values()
            .filter(|t| t.status().is_some_and(TaskStatus::is_in_flight))
            .map(|t| t.id)
            .collect();

        for id in &ids {
            if inner.transition(*id, TaskStatus::Queuing) {
                if let Some(t) = inner.tasks.get_mut(id) {
                    t.node_id = None;
                }
                inner.push_event(*id, TaskStatus::Queuing, Some(REQUEUE_DETAIL), None);
            }
        }
        Ok(ids.len() as u64)
    }

    async fn purge_outputless_successes(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let doomed: Vec<DbId> = inner
            .tasks
            .values()
            .filter(|t| t.status() == Some(TaskStatus::Success) && t.expects_files)
            .filter(|t| !inner.task_attachments.iter().any(|l| l.task_id == t.id))
            .map(|t| t.id)
            .collect();

        for id in &doomed {
            inner.tasks.remove(id);
        }
        inner.task_events.retain(|e| !doomed.contains(&e.task_id));
        Ok(doomed.len() as u64)
    }

    async fn find_uploaded_attachment_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<Attachment>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .attachments
            .values()
            .find(|a| a.hash == hash && a.status() == Some(AttachmentStatus::Uploaded))
            .cloned())
    }

    async fn create_attachment(&self, input: &NewAttachment) -> Result<Attachment, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let attachment = Attachment {
            id: inner.next_id(),
            file_name: input.file_name.clone(),
            hash: input.hash.clone(),
            size: input.size,
            kind_id: input.kind.id(),
            ratio: input.ratio,
            status_id: AttachmentStatus::Pending.id(),
            storage: input.storage.clone(),
            task_id: input.task_id,
            workflow_id: input.workflow_id,
            created_at: now,
            updated_at: now,
        };
        inner.attachments.insert(attachment.id, attachment.clone());
        Ok(attachment)
    }

    async fn set_attachment_status(
        &self,
        id: DbId,
        status: AttachmentStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(a) = inner.attachments.get_mut(&id) {
            a.status_id = status.id();
            a.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn promote_attachment(&self, id: DbId) -> Result<Attachment, StoreError> {
        let mut inner = self.inner.lock().await;
        let pending = inner
            .attachments
            .get(&id)
            .filter(|a| a.status() == Some(AttachmentStatus::Pending))
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "attachment",
                id,
            })?;

        let winner = inner
            .attachments
            .values()
            .find(|a| a.hash == pending.hash && a.status() == Some(AttachmentStatus::Uploaded))
            .cloned();
        let now = Utc::now();
        let (status, result) = match winner {
            Some(winner) => (AttachmentStatus::Failed, winner),
            None => {
                let mut uploaded = pending;
                uploaded.status_id = AttachmentStatus::Uploaded.id();
                uploaded.updated_at = now;
                (AttachmentStatus::Uploaded, uploaded)
            }
        };
        if let Some(a) = inner.attachments.get_mut(&id) {
            a.status_id = status.id();
            a.updated_at = now;
        }
        Ok(result)
    }

    async fn find_attachment(&self, id: DbId) -> Result<Option<Attachment>, StoreError> {
        Ok(self.inner.lock().await.attachments.get(&id).cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self.inner.lock().await.nodes.values().cloned().collect())
    }

    async fn find_node(&self, id: DbId) -> Result<Option<Node>, StoreError> {
        Ok(self.inner.lock().await.nodes.get(&id).cloned())
    }

    async fn create_node(&self, input: &CreateNode) -> Result<Node, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let node = Node {
            id: inner.next_id(),
            name: input.name.clone(),
            host: input.host.clone(),
            auth: Json(input.auth.clone()),
            resources: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        inner.nodes.insert(node.id, node.clone());
        Ok(node)
    }

    async fn update_node_resources(
        &self,
        id: DbId,
        resources: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(n) = inner.nodes.get_mut(&id) {
            n.resources = resources.clone();
            n.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_node_event(
        &self,
        node_id: DbId,
        kind: NodeEventKind,
        detail: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id();
        inner.node_events.push(NodeEvent {
            id,
            node_id,
            kind_id: kind.id(),
            detail: detail.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_node_events(
        &self,
        node_id: DbId,
        limit: i64,
    ) -> Result<Vec<NodeEvent>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .node_events
            .iter()
            .rev()
            .filter(|e| e.node_id == node_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn clear_node_events(&self, node_id: DbId) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.node_events.len();
        inner.node_events.retain(|e| e.node_id != node_id);
        Ok((before - inner.node_events.len()) as u64)
    }

    async fn delete_node(&self, id: DbId) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let removed = inner.nodes.remove(&id).is_some();
        if removed {
            for task in inner.tasks.values_mut() {
                if task.node_id == Some(id) {
                    task.node_id = None;
                }
            }
        }
        Ok(removed)
    }

    async fn create_user_notification(
        &self,
        input: &NewNotification,
    ) -> Result<UserNotification, StoreError> {
        let mut inner = self.inner.lock().await;
        let notification = UserNotification {
            id: inner.next_id(),
            user_id: input.user_id,
            task_id: input.task_id,
            title: input.title.clone(),
            message: input.message.clone(),
            created_at: Utc::now(),
        };
        inner.notifications.push(notification.clone());
        Ok(notification)
    }

    async fn list_user_notifications(
        &self,
        user_id: DbId,
    ) -> Result<Vec<UserNotification>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .notifications
            .iter()
            .rev()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect())
    }
}
