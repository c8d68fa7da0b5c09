//! Admission, pricing and fan-out against the in-memory store.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use fleet_core::admission::Requester;
use fleet_core::error::CoreError;
use fleet_core::status::{Role, TaskStatus, TriggerKind, WorkflowStatus};
use fleet_core::workflow::{InputDefs, InputKind, OutputDefs, WorkflowInput};
use fleet_db::TaskStore;
use fleet_events::{Category, Topic};
use fleet_worker::SchedulerError;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use common::harness;

fn input(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

fn seeded_defs() -> InputDefs {
    let mut defs = InputDefs::new();
    defs.insert("seed".into(), WorkflowInput::new(InputKind::Seed).with_target("3", "seed"));
    defs.insert("prompt".into(), WorkflowInput::new(InputKind::String).with_target("6", "text"));
    defs
}

#[tokio::test]
async fn repeat_three_debits_three_and_creates_parent_plus_children() {
    let h = harness();
    let account = h.store.insert_account(Role::User, 10.0, 0.0).await;
    let wf = h.workflow(1.0, 0.0, seeded_defs(), OutputDefs::new()).await;

    let mut balance_updates = h
        .bus
        .subscribe(
            Topic::key(Category::Balance, format!("account:{}", account.id)),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let submission = h
        .scheduler
        .submit_execution(wf.id, &input(json!({ "prompt": "a cat" })), 3, Requester::user(account.id))
        .await
        .unwrap();

    assert_eq!(submission.cost, 3.0);
    assert_eq!(submission.repeat_count, 3);
    assert!(!submission.cached);

    let account = h.store.find_account(account.id).await.unwrap().unwrap();
    assert_eq!(account.balance, 7.0);
    assert_eq!(h.store.task_count().await, 4);

    let parent = h.store.find_task(submission.task_id).await.unwrap().unwrap();
    assert!(parent.is_parent());
    let children = h.store.list_children(parent.id).await.unwrap();
    assert_eq!(children.len(), 3);
    assert!(children.iter().all(|c| c.status() == Some(TaskStatus::Queuing)));

    let message = tokio::time::timeout(Duration::from_secs(1), balance_updates.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.payload["balance"], json!(7.0));
}

#[tokio::test]
async fn zero_balance_is_rejected_without_side_effects() {
    let h = harness();
    let account = h.store.insert_account(Role::User, 0.0, 0.0).await;
    let wf = h.workflow(1.0, 0.0, InputDefs::new(), OutputDefs::new()).await;

    let result = h
        .scheduler
        .submit_execution(wf.id, &Map::new(), 1, Requester::user(account.id))
        .await;

    assert_matches!(
        result,
        Err(SchedulerError::Core(CoreError::InsufficientBalance { required, available }))
            if required == 1.0 && available == 0.0
    );
    assert_eq!(h.store.task_count().await, 0);
    let account = h.store.find_account(account.id).await.unwrap().unwrap();
    assert_eq!(account.balance, 0.0);
}

#[tokio::test]
async fn single_request_creates_one_queued_task() {
    let h = harness();
    let account = h.store.insert_account(Role::User, 10.0, 0.0).await;
    let wf = h.workflow(2.0, 0.0, seeded_defs(), OutputDefs::new()).await;

    let submission = h
        .scheduler
        .submit_execution(wf.id, &input(json!({ "seed": 5 })), 1, Requester::user(account.id))
        .await
        .unwrap();

    let task = h.store.find_task(submission.task_id).await.unwrap().unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Queuing));
    assert_eq!(task.parent_id, None);
    assert_eq!(task.input_values["seed"], json!(5));
    assert_eq!(h.store.task_count().await, 1);

    let events = h.store.list_task_events(task.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status_id, TaskStatus::Queuing.id());
}

#[tokio::test]
async fn batch_children_get_consecutive_seeds() {
    let h = harness();
    let account = h.store.insert_account(Role::User, -1.0, 0.0).await;
    let wf = h.workflow(1.0, 0.0, seeded_defs(), OutputDefs::new()).await;

    let submission = h
        .scheduler
        .submit_execution(wf.id, &input(json!({ "seed": 100 })), 3, Requester::user(account.id))
        .await
        .unwrap();

    let children = h.store.list_children(submission.task_id).await.unwrap();
    let seeds: Vec<i64> = children
        .iter()
        .map(|c| c.input_values["seed"].as_i64().unwrap())
        .collect();
    assert_eq!(seeds, vec![101, 102, 103]);

    // Later repeats are weighted behind earlier ones.
    assert!(children[0].weight < children[1].weight);
    assert!(children[1].weight < children[2].weight);
}

#[tokio::test]
async fn array_inputs_fan_out_and_are_priced_per_set() {
    let h = harness();
    let account = h.store.insert_account(Role::User, 100.0, 0.0).await;
    let mut defs = InputDefs::new();
    defs.insert(
        "steps".into(),
        WorkflowInput::new(InputKind::Number)
            .with_target("3", "steps")
            .with_cost_per_unit(0.1),
    );
    let wf = h.workflow(1.0, 0.0, defs, OutputDefs::new()).await;

    let submission = h
        .scheduler
        .submit_execution(wf.id, &input(json!({ "steps": [10, 20] })), 1, Requester::user(account.id))
        .await
        .unwrap();

    // (1 + 0.1 x 10) + (1 + 0.1 x 20)
    assert!((submission.cost - 5.0).abs() < 1e-9);
    let children = h.store.list_children(submission.task_id).await.unwrap();
    assert_eq!(children.len(), 2);
}

#[tokio::test]
async fn admins_are_neither_checked_nor_debited() {
    let h = harness();
    let admin = h.store.insert_account(Role::Admin, 0.0, 0.0).await;
    let wf = h.workflow(5.0, 0.0, InputDefs::new(), OutputDefs::new()).await;

    h.scheduler
        .submit_execution(wf.id, &Map::new(), 2, Requester::user(admin.id))
        .await
        .unwrap();

    let admin = h.store.find_account(admin.id).await.unwrap().unwrap();
    assert_eq!(admin.balance, 0.0);
}

#[tokio::test]
async fn token_requests_pay_from_the_token_and_notify_its_owner() {
    let h = harness();
    let owner = h.store.insert_account(Role::User, 50.0, 0.0).await;
    let token = h.store.insert_token(owner.id, 4.0, 0.0).await;
    let wf = h.workflow(1.0, 0.0, InputDefs::new(), OutputDefs::new()).await;

    let submission = h
        .scheduler
        .submit_execution(wf.id, &Map::new(), 1, Requester::token(token.id))
        .await
        .unwrap();

    assert_eq!(h.store.find_token(token.id).await.unwrap().unwrap().balance, 3.0);
    assert_eq!(h.store.find_account(owner.id).await.unwrap().unwrap().balance, 50.0);

    let task = h.store.find_task(submission.task_id).await.unwrap().unwrap();
    let trigger = h.store.find_trigger(task.trigger_id).await.unwrap().unwrap();
    assert_eq!(trigger.kind(), Some(TriggerKind::Token));
    assert_eq!(trigger.user_id, Some(owner.id));
}

#[tokio::test]
async fn unlimited_token_falls_back_to_the_owner() {
    let h = harness();
    let owner = h.store.insert_account(Role::User, 0.5, 0.0).await;
    let token = h.store.insert_token(owner.id, -1.0, 0.0).await;
    let wf = h.workflow(1.0, 0.0, InputDefs::new(), OutputDefs::new()).await;

    let result = h
        .scheduler
        .submit_execution(wf.id, &Map::new(), 1, Requester::token(token.id))
        .await;
    assert_matches!(
        result,
        Err(SchedulerError::Core(CoreError::InsufficientBalance { .. }))
    );
}

#[tokio::test]
async fn inactive_workflows_and_bad_repeat_are_validation_errors() {
    let h = harness();
    let wf = h.workflow(0.0, 0.0, InputDefs::new(), OutputDefs::new()).await;

    let result = h
        .scheduler
        .submit_execution(wf.id, &Map::new(), 0, Requester::system())
        .await;
    assert_matches!(result, Err(SchedulerError::Core(CoreError::Validation(_))));

    h.store.set_workflow_status(wf.id, WorkflowStatus::Deactivated).await;
    h.scheduler.admission().invalidate_workflow(wf.id).await;
    let result = h
        .scheduler
        .submit_execution(wf.id, &Map::new(), 1, Requester::system())
        .await;
    assert_matches!(result, Err(SchedulerError::Core(CoreError::Validation(_))));
    assert_eq!(h.store.task_count().await, 0);
}

#[tokio::test]
async fn unknown_workflow_is_not_found() {
    let h = harness();
    let result = h
        .scheduler
        .submit_execution(999, &Map::new(), 1, Requester::system())
        .await;
    assert_matches!(
        result,
        Err(SchedulerError::Core(CoreError::NotFound { entity: "Workflow", id: 999 }))
    );
}

#[tokio::test]
async fn second_submission_is_served_from_the_workflow_cache() {
    let h = harness();
    let wf = h.workflow(0.0, 0.0, InputDefs::new(), OutputDefs::new()).await;

    let first = h
        .scheduler
        .submit_execution(wf.id, &Map::new(), 1, Requester::system())
        .await
        .unwrap();
    let second = h
        .scheduler
        .submit_execution(wf.id, &Map::new(), 1, Requester::system())
        .await
        .unwrap();

    assert!(!first.cached);
    assert!(second.cached);
}

#[tokio::test]
async fn task_creation_is_published_for_workflow_views() {
    let h = harness();
    let wf = h.workflow(0.0, 0.0, InputDefs::new(), OutputDefs::new()).await;
    let mut updates = h
        .bus
        .subscribe(Topic::key(Category::Workflow, wf.id), CancellationToken::new())
        .await
        .unwrap();

    let submission = h
        .scheduler
        .submit_execution(wf.id, &Map::new(), 1, Requester::system())
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(1), updates.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.payload["event"], json!("tasks_created"));
    assert_eq!(message.payload["task_id"], json!(submission.task_id));
}
