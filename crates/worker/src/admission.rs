//! Admission & pricing: turn a caller request into persisted tasks.
//!
//! Validation, pricing, the balance check and batch fan-out are pure
//! functions in `fleet_core`; this service loads what they need, hands the
//! resulting plan to [`TaskStore::create_execution`] (one transaction,
//! conditional debit) and publishes the resulting bus messages.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_core::admission::{
    compute_cost, compute_weight, plan_charge, price_input_set, requester_weight_offset,
    resolve_inputs, time_bias, Charge, InputSet, LedgerRef, Requester,
};
use fleet_core::error::CoreError;
use fleet_core::fanout::{expand_input_sets, plan_children, ChildPlan, FanoutPlan};
use fleet_core::types::DbId;
use fleet_core::workflow::{expects_files, InputDefs};
use fleet_db::models::account::{Account, ApiToken};
use fleet_db::models::task::{NewExecution, NewTask};
use fleet_db::models::trigger::NewTrigger;
use fleet_db::models::workflow::Workflow;
use fleet_db::TaskStore;
use fleet_events::{Category, NotificationBus};
use moka::future::Cache;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::SchedulerError;

/// Largest accepted `repeat`.
pub const MAX_REPEAT: u32 = 100;

/// Workflows kept in the admission cache.
const WORKFLOW_CACHE_CAPACITY: u64 = 1_000;

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    /// Parent task for batches, otherwise the single task.
    pub task_id: DbId,
    pub cost: f64,
    pub repeat_count: u32,
    /// The workflow definition was served from the admission cache.
    pub cached: bool,
}

pub struct Admission {
    store: Arc<dyn TaskStore>,
    bus: NotificationBus,
    workflows: Cache<DbId, Arc<Workflow>>,
}

impl Admission {
    pub fn new(store: Arc<dyn TaskStore>, bus: NotificationBus, cache_ttl: Duration) -> Self {
        let workflows = Cache::builder()
            .max_capacity(WORKFLOW_CACHE_CAPACITY)
            .time_to_live(cache_ttl)
            .build();
        Self {
            store,
            bus,
            workflows,
        }
    }

    /// Drop a cached workflow after it was edited or deactivated.
    pub async fn invalidate_workflow(&self, workflow_id: DbId) {
        self.workflows.invalidate(&workflow_id).await;
    }

    async fn workflow(&self, workflow_id: DbId) -> Result<(Arc<Workflow>, bool), SchedulerError> {
        if let Some(workflow) = self.workflows.get(&workflow_id).await {
            return Ok((workflow, true));
        }
        let workflow = self
            .store
            .find_workflow(workflow_id)
            .await?
            .ok_or_else(|| SchedulerError::not_found("Workflow", workflow_id))?;
        let workflow = Arc::new(workflow);
        self.workflows
            .insert(workflow_id, Arc::clone(&workflow))
            .await;
        Ok((workflow, false))
    }

    async fn ledgers(
        &self,
        requester: Requester,
    ) -> Result<(Option<Account>, Option<ApiToken>), SchedulerError> {
        if let Some(token_id) = requester.token_id {
            let token = self
                .store
                .find_token(token_id)
                .await?
                .ok_or_else(|| SchedulerError::not_found("ApiToken", token_id))?;
            let account = self.store.find_account(token.user_id).await?;
            return Ok((account, Some(token)));
        }
        if let Some(user_id) = requester.user_id {
            let account = self
                .store
                .find_account(user_id)
                .await?
                .ok_or_else(|| SchedulerError::not_found("Account", user_id))?;
            return Ok((Some(account), None));
        }
        Ok((None, None))
    }

    /// Validate, price, charge and persist one execution request.
    ///
    /// Rejections (`Validation`, `NotFound`, `InsufficientBalance`) leave
    /// no trace: nothing is written and nothing is debited.
    pub async fn submit_execution(
        &self,
        workflow_id: DbId,
        input: &Map<String, Value>,
        repeat: u32,
        requester: Requester,
    ) -> Result<Submission, SchedulerError> {
        if repeat == 0 || repeat > MAX_REPEAT {
            return Err(SchedulerError::validation(format!(
                "repeat must be between 1 and {MAX_REPEAT}, got {repeat}"
            )));
        }

        let (workflow, cached) = self.workflow(workflow_id).await?;
        if !workflow.is_active() {
            return Err(SchedulerError::validation(format!(
                "Workflow {workflow_id} is not active"
            )));
        }
        let defs = &workflow.inputs.0;

        let resolved = resolve_inputs(defs, input, &mut rand::rng())?;
        let sets = expand_input_sets(defs, &resolved);
        let cost = compute_cost(workflow.cost, defs, &sets, repeat);

        let (account, token) = self.ledgers(requester).await?;
        let account_view = account.as_ref().map(Account::ledger_view);
        let token_view = token.as_ref().map(ApiToken::ledger_view);
        let role = account.as_ref().and_then(Account::role);
        let charge = plan_charge(role, account_view.as_ref(), token_view.as_ref(), cost)?;

        let offset = requester_weight_offset(account_view.as_ref(), token_view.as_ref());
        let weight = compute_weight(time_bias(Utc::now()), workflow.base_weight, offset);
        let plan = plan_children(defs, &resolved, repeat, weight);

        let trigger = NewTrigger {
            kind: requester.trigger_kind(),
            user_id: requester
                .user_id
                .or_else(|| token.as_ref().map(|t| t.user_id)),
            token_id: requester.token_id,
        };
        let execution = build_execution(&workflow, plan, trigger, charge, cost, repeat);
        let created = self.store.create_execution(&execution).await?;

        let task_id = created
            .root_task_id()
            .ok_or_else(|| CoreError::Internal("Execution created no tasks".into()))?;

        if let Some(charge) = charge {
            self.publish_balance(charge).await;
        }
        let task_ids: Vec<DbId> = created.tasks.iter().map(|t| t.id).collect();
        self.bus
            .emit(
                Category::Workflow,
                workflow_id,
                json!({
                    "event": "tasks_created",
                    "workflow_id": workflow_id,
                    "task_id": task_id,
                    "task_ids": task_ids,
                }),
            )
            .await;

        tracing::info!(
            workflow_id,
            task_id,
            cost,
            repeat,
            tasks = task_ids.len(),
            trigger_id = created.trigger_id,
            "Execution admitted",
        );

        Ok(Submission {
            task_id,
            cost,
            repeat_count: repeat,
            cached,
        })
    }

    async fn publish_balance(&self, charge: Charge) {
        let balance = match charge.ledger {
            LedgerRef::Account(id) => self.store.find_account(id).await.map(|a| a.map(|a| a.balance)),
            LedgerRef::Token(id) => self.store.find_token(id).await.map(|t| t.map(|t| t.balance)),
        };
        let balance = match balance {
            Ok(balance) => balance,
            Err(e) => {
                tracing::warn!(ledger = %charge.ledger.bus_key(), error = %e, "Failed to read balance");
                None
            }
        };
        self.bus
            .emit(
                Category::Balance,
                charge.ledger.bus_key(),
                json!({
                    "ledger": charge.ledger,
                    "debited": charge.amount,
                    "balance": balance,
                }),
            )
            .await;
    }
}

fn input_json(set: InputSet) -> Value {
    Value::Object(set.into_iter().collect())
}

fn build_execution(
    workflow: &Workflow,
    plan: FanoutPlan,
    trigger: NewTrigger,
    charge: Option<Charge>,
    cost: f64,
    repeat: u32,
) -> NewExecution {
    let defs: &InputDefs = &workflow.inputs.0;
    let expects = expects_files(&workflow.outputs.0);
    let repeat_count = i32::try_from(repeat).unwrap_or(i32::MAX);

    let task = |child: ChildPlan, cost: f64, repeat_count: i32| NewTask {
        workflow_id: workflow.id,
        repeat_count,
        input_values: input_json(child.input_values),
        weight: child.weight,
        cost,
        expects_files: expects,
    };

    match plan {
        FanoutPlan::Single(child) => NewExecution {
            trigger,
            parent: None,
            children: vec![task(child, cost, repeat_count)],
            charge,
        },
        FanoutPlan::Batch {
            parent_inputs,
            children,
        } => {
            let weight = children.first().map_or(0.0, |c| c.weight);
            let parent = NewTask {
                workflow_id: workflow.id,
                repeat_count,
                input_values: input_json(parent_inputs),
                weight,
                cost,
                expects_files: expects,
            };
            let children = children
                .into_iter()
                .map(|child| {
                    let child_cost = price_input_set(workflow.cost, defs, &child.input_values);
                    task(child, child_cost, 1)
                })
                .collect();
            NewExecution {
                trigger,
                parent: Some(parent),
                children,
                charge,
            }
        }
    }
}
