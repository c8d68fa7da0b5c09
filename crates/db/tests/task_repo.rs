//! Integration tests for the PostgreSQL task store.
//!
//! Exercises the repository layer against a real database:
//! - Transactional execution creation with conditional debit
//! - `SKIP LOCKED` claiming in weight order
//! - Start-up recovery sweep
//! - One uploaded attachment per content hash

use assert_matches::assert_matches;
use fleet_core::admission::{Charge, LedgerRef};
use fleet_core::status::{AttachmentKind, AttachmentStatus, TaskStatus, TriggerKind};
use fleet_db::models::attachment::NewAttachment;
use fleet_db::models::task::{NewExecution, NewTask};
use fleet_db::models::trigger::NewTrigger;
use fleet_db::models::workflow::CreateWorkflow;
use fleet_db::{PgStore, StoreError, TaskStore};
use serde_json::json;
use sqlx::PgPool;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn seed_account(pool: &PgPool, balance: f64) -> i64 {
    sqlx::query_scalar("INSERT INTO accounts (role_id, balance) VALUES (3, $1) RETURNING id")
        .bind(balance)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn seed_workflow(store: &PgStore) -> i64 {
    store
        .create_workflow(&CreateWorkflow {
            name: "txt2img".into(),
            graph: json!({ "3": { "inputs": { "seed": 0 } } }),
            inputs: Default::default(),
            outputs: Default::default(),
            cost: 1.0,
            base_weight: 0.0,
        })
        .await
        .unwrap()
        .id
}

fn new_task(workflow_id: i64, weight: f64) -> NewTask {
    NewTask {
        workflow_id,
        repeat_count: 1,
        input_values: json!({}),
        weight,
        cost: 1.0,
        expects_files: false,
    }
}

fn plan(user_id: Option<i64>, children: Vec<NewTask>, charge: Option<Charge>) -> NewExecution {
    NewExecution {
        trigger: NewTrigger {
            kind: if user_id.is_some() {
                TriggerKind::User
            } else {
                TriggerKind::System
            },
            user_id,
            token_id: None,
        },
        parent: None,
        children,
        charge,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_create_execution_debits_in_transaction(pool: PgPool) {
    let store = PgStore::new(pool.clone());
    let wf = seed_workflow(&store).await;
    let user = seed_account(&pool, 10.0).await;

    let charge = Charge {
        ledger: LedgerRef::Account(user),
        amount: 3.0,
    };
    let created = store
        .create_execution(&plan(Some(user), vec![new_task(wf, 0.0)], Some(charge)))
        .await
        .unwrap();
    assert_eq!(created.tasks.len(), 1);

    let account = store.find_account(user).await.unwrap().unwrap();
    assert_eq!(account.balance, 7.0);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_insufficient_balance_rolls_back(pool: PgPool) {
    let store = PgStore::new(pool.clone());
    let wf = seed_workflow(&store).await;
    let user = seed_account(&pool, 0.0).await;

    let charge = Charge {
        ledger: LedgerRef::Account(user),
        amount: 1.0,
    };
    let err = store
        .create_execution(&plan(Some(user), vec![new_task(wf, 0.0)], Some(charge)))
        .await
        .unwrap_err();
    assert_matches!(err, StoreError::InsufficientBalance { .. });

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_claim_in_weight_order(pool: PgPool) {
    let store = PgStore::new(pool);
    let wf = seed_workflow(&store).await;
    for w in [0.5, 0.2, 0.9] {
        store
            .create_execution(&plan(None, vec![new_task(wf, w)], None))
            .await
            .unwrap();
    }

    let claimed = store.claim_queued(10).await.unwrap();
    let weights: Vec<f64> = claimed.iter().map(|t| t.weight).collect();
    assert_eq!(weights, vec![0.2, 0.5, 0.9]);

    let events = store.list_task_events(claimed[0].id).await.unwrap();
    assert_eq!(
        events.iter().map(|e| e.status_id).collect::<Vec<_>>(),
        vec![TaskStatus::Queuing.id(), TaskStatus::Pending.id()]
    );
}

#[sqlx::test(migrations = "./migrations")]
async fn test_requeue_interrupted_is_idempotent(pool: PgPool) {
    let store = PgStore::new(pool);
    let wf = seed_workflow(&store).await;
    store
        .create_execution(&plan(None, vec![new_task(wf, 0.0), new_task(wf, 1.0)], None))
        .await
        .unwrap();
    let claimed = store.claim_queued(10).await.unwrap();
    store
        .set_task_status(claimed[0].id, TaskStatus::Running, None, None)
        .await
        .unwrap();

    assert_eq!(store.requeue_interrupted().await.unwrap(), 2);
    assert_eq!(store.requeue_interrupted().await.unwrap(), 0);
    assert_eq!(store.claim_queued(10).await.unwrap().len(), 2);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_duplicate_hash_promotion_returns_first_upload(pool: PgPool) {
    let store = PgStore::new(pool);
    let input = |name: &str| NewAttachment {
        file_name: name.into(),
        hash: "dup".into(),
        size: 3,
        kind: AttachmentKind::Image,
        ratio: None,
        storage: "local".into(),
        task_id: None,
        workflow_id: None,
    };
    let first = store.create_attachment(&input("a.png")).await.unwrap();
    let second = store.create_attachment(&input("b.png")).await.unwrap();

    assert_eq!(store.promote_attachment(first.id).await.unwrap().id, first.id);
    assert_eq!(store.promote_attachment(second.id).await.unwrap().id, first.id);

    let loser = store.find_attachment(second.id).await.unwrap().unwrap();
    assert_eq!(loser.status(), Some(AttachmentStatus::Failed));
}
