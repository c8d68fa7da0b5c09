//! PostgreSQL-backed [`TaskStore`].

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
use crate::repositories::{
    AttachmentRepo, LedgerRepo, NodeEventRepo, NodeRepo, NotificationRepo, TaskEventRepo,
    TaskRepo, TriggerRepo, WorkflowRepo,
};
use crate::store::TaskStore;
use crate::DbPool;

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        crate::health_check(&self.pool).await?;
        Ok(())
    }

    async fn find_workflow(&self, id: DbId) -> Result<Option<Workflow>, StoreError> {
        Ok(WorkflowRepo::find_by_id(&self.pool, id).await?)
    }

    async fn create_workflow(&self, input: &CreateWorkflow) -> Result<Workflow, StoreError> {
        Ok(WorkflowRepo::create(&self.pool, input).await?)
    }

    async fn find_account(&self, id: DbId) -> Result<Option<Account>, StoreError> {
        Ok(LedgerRepo::find_account(&self.pool, id).await?)
    }

    async fn find_token(&self, id: DbId) -> Result<Option<ApiToken>, StoreError> {
        Ok(LedgerRepo::find_token(&self.pool, id).await?)
    }

    async fn create_execution(
        &self,
        plan: &NewExecution,
    ) -> Result<CreatedExecution, StoreError> {
        TaskRepo::create_execution(&self.pool, plan).await
    }

    async fn claim_queued(&self, limit: i64) -> Result<Vec<Task>, StoreError> {
        Ok(TaskRepo::claim_queued(&self.pool, limit).await?)
    }

    async fn set_task_status(
        &self,
        task_id: DbId,
        status: TaskStatus,
        details: Option<&str>,
        data: Option<&serde_json::Value>,
    ) -> Result<bool, StoreError> {
        Ok(TaskRepo::set_status(&self.pool, task_id, status, details, data).await?)
    }

    async fn append_task_event(
        &self,
        task_id: DbId,
        status: TaskStatus,
        details: Option<&str>,
        data: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        Ok(TaskEventRepo::insert(&self.pool, task_id, status, details, data).await?)
    }

    async fn assign_node(&self, task_id: DbId, node_id: DbId) -> Result<(), StoreError> {
        Ok(TaskRepo::assign_node(&self.pool, task_id, node_id).await?)
    }

    async fn complete_task(
        &self,
        task_id: DbId,
        completion: &TaskCompletion,
    ) -> Result<bool, StoreError> {
        Ok(TaskRepo::complete(&self.pool, task_id, completion).await?)
    }

    async fn find_task(&self, id: DbId) -> Result<Option<Task>, StoreError> {
        Ok(TaskRepo::find_by_id(&self.pool, id).await?)
    }

    async fn list_task_events(&self, task_id: DbId) -> Result<Vec<TaskEvent>, StoreError> {
        Ok(TaskEventRepo::list_by_task(&self.pool, task_id).await?)
    }

    async fn list_children(&self, parent_id: DbId) -> Result<Vec<Task>, StoreError> {
        Ok(TaskRepo::list_children(&self.pool, parent_id).await?)
    }

    async fn list_task_attachments(
        &self,
        task_id: DbId,
    ) -> Result<Vec<TaskAttachment>, StoreError> {
        Ok(AttachmentRepo::list_links(&self.pool, task_id).await?)
    }

    async fn running_tasks(&self, workflow_id: Option<DbId>) -> Result<Vec<Task>, StoreError> {
        Ok(TaskRepo::list_running(&self.pool, workflow_id).await?)
    }

    async fn find_trigger(&self, id: DbId) -> Result<Option<Trigger>, StoreError> {
        Ok(TriggerRepo::find_by_id(&self.pool, id).await?)
    }

    async fn requeue_interrupted(&self) -> Result<u64, StoreError> {
        Ok(TaskRepo::requeue_interrupted(&self.pool).await?)
    }

    async fn purge_outputless_successes(&self) -> Result<u64, StoreError> {
        Ok(TaskRepo::purge_outputless_successes(&self.pool).await?)
    }

    async fn find_uploaded_attachment_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<Attachment>, StoreError> {
        Ok(AttachmentRepo::find_uploaded_by_hash(&self.pool, hash).await?)
    }

    async fn create_attachment(&self, input: &NewAttachment) -> Result<Attachment, StoreError> {
        Ok(AttachmentRepo::create(&self.pool, input).await?)
    }

    async fn set_attachment_status(
        &self,
        id: DbId,
        status: AttachmentStatus,
    ) -> Result<(), StoreError> {
        Ok(AttachmentRepo::set_status(&self.pool, id, status).await?)
    }

    async fn promote_attachment(&self, id: DbId) -> Result<Attachment, StoreError> {
        let pending = AttachmentRepo::find_by_id(&self.pool, id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "attachment",
                id,
            })?;

        match AttachmentRepo::mark_uploaded(&self.pool, id).await {
            Ok(Some(uploaded)) => Ok(uploaded),
            Ok(None) => Err(StoreError::NotFound {
                entity: "attachment",
                id,
            }),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                AttachmentRepo::set_status(&self.pool, id, AttachmentStatus::Failed).await?;
                tracing::debug!(attachment_id = id, hash = %pending.hash, "Duplicate upload superseded");
                AttachmentRepo::find_uploaded_by_hash(&self.pool, &pending.hash)
                    .await?
                    .ok_or(StoreError::NotFound {
                        entity: "attachment",
                        id,
                    })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_attachment(&self, id: DbId) -> Result<Option<Attachment>, StoreError> {
        Ok(AttachmentRepo::find_by_id(&self.pool, id).await?)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(NodeRepo::list(&self.pool).await?)
    }

    async fn find_node(&self, id: DbId) -> Result<Option<Node>, StoreError> {
        Ok(NodeRepo::find_by_id(&self.pool, id).await?)
    }

    async fn create_node(&self, input: &CreateNode) -> Result<Node, StoreError> {
        Ok(NodeRepo::create(&self.pool, input).await?)
    }

    async fn update_node_resources(
        &self,
        id: DbId,
        resources: &serde_json::Value,
    ) -> Result<(), StoreError> {
        Ok(NodeRepo::update_resources(&self.pool, id, resources).await?)
    }

    async fn record_node_event(
        &self,
        node_id: DbId,
        kind: NodeEventKind,
        detail: &serde_json::Value,
    ) -> Result<(), StoreError> {
        Ok(NodeEventRepo::insert(&self.pool, node_id, kind, detail).await?)
    }

    async fn list_node_events(
        &self,
        node_id: DbId,
        limit: i64,
    ) -> Result<Vec<NodeEvent>, StoreError> {
        Ok(NodeEventRepo::list_recent(&self.pool, node_id, limit).await?)
    }

    async fn clear_node_events(&self, node_id: DbId) -> Result<u64, StoreError> {
        Ok(NodeEventRepo::clear(&self.pool, node_id).await?)
    }

    async fn delete_node(&self, id: DbId) -> Result<bool, StoreError> {
        Ok(NodeRepo::delete(&self.pool, id).await?)
    }

    async fn create_user_notification(
        &self,
        input: &NewNotification,
    ) -> Result<UserNotification, StoreError> {
        Ok(NotificationRepo::create(&self.pool, input).await?)
    }

    async fn list_user_notifications(
        &self,
        user_id: DbId,
    ) -> Result<Vec<UserNotification>, StoreError> {
        Ok(NotificationRepo::list_by_user(&self.pool, user_id).await?)
    }
}
