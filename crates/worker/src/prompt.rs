//! Node-specific prompt construction.
//!
//! Copies the workflow graph and writes each declared input into its
//! target fields. Media inputs are read from the attachment store and
//! uploaded to the node first; the prompt references the name the node
//! returns.

use fleet_comfyui::NodeClient;
use fleet_core::types::DbId;
use fleet_core::workflow::{InputKind, SlotTarget, WorkflowInput};
use fleet_db::models::task::Task;
use fleet_db::models::workflow::Workflow;
use fleet_pipeline::AttachmentService;
use serde_json::{Map, Value};

use crate::error::SchedulerError;

/// Build the prompt for `task` on the node behind `client`.
pub async fn build_prompt(
    workflow: &Workflow,
    task: &Task,
    client: &dyn NodeClient,
    attachments: &AttachmentService,
) -> Result<Value, SchedulerError> {
    let empty = Map::new();
    let values = task.input_values.as_object().unwrap_or(&empty);

    for key in values.keys() {
        if !workflow.inputs.0.contains_key(key) {
            tracing::warn!(
                task_id = task.id,
                workflow_id = workflow.id,
                input = %key,
                "Input not declared by workflow, skipped",
            );
        }
    }

    let mut prompt = workflow.graph.clone();
    for (key, def) in &workflow.inputs.0 {
        let value = values.get(key);
        let Some(resolved) = resolve_value(key, def, value, task.id, client, attachments).await?
        else {
            continue;
        };
        for target in &def.targets {
            set_field(&mut prompt, target, resolved.clone())?;
        }
    }
    Ok(prompt)
}

/// The graph value for one input, or `None` to keep the graph's own.
async fn resolve_value(
    key: &str,
    def: &WorkflowInput,
    value: Option<&Value>,
    task_id: DbId,
    client: &dyn NodeClient,
    attachments: &AttachmentService,
) -> Result<Option<Value>, SchedulerError> {
    if def.kind == InputKind::Prefixer {
        return Ok(Some(Value::String(task_id.to_string())));
    }
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(None);
    };

    let resolved = match def.kind {
        InputKind::Number | InputKind::Seed => match value {
            Value::Number(_) => value.clone(),
            other => {
                return Err(SchedulerError::validation(format!(
                    "Input '{key}' must be a number, got {other}"
                )))
            }
        },
        InputKind::Prefixer => Value::String(task_id.to_string()),
        InputKind::String | InputKind::Selection => match value {
            Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        },
        InputKind::Boolean => Value::Bool(truthy(value)),
        InputKind::Image | InputKind::Video | InputKind::File => {
            upload_media(key, value, client, attachments).await?
        }
    };
    Ok(Some(resolved))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => matches!(s.as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

/// Upload every referenced attachment. One name for a single id, a list
/// otherwise.
async fn upload_media(
    key: &str,
    value: &Value,
    client: &dyn NodeClient,
    attachments: &AttachmentService,
) -> Result<Value, SchedulerError> {
    let ids: Vec<DbId> = match value {
        Value::Array(items) => items.iter().filter_map(Value::as_i64).collect(),
        other => other.as_i64().into_iter().collect(),
    };
    if ids.is_empty() {
        return Err(SchedulerError::validation(format!(
            "Input '{key}' has no attachment ids"
        )));
    }

    let mut names = Vec::with_capacity(ids.len());
    for id in ids {
        let (attachment, bytes) = attachments.read(id).await?;
        let name = client.upload_image(bytes, &attachment.file_name).await?;
        tracing::debug!(attachment_id = id, node_id = client.node_id(), name = %name, "Uploaded input");
        names.push(Value::String(name));
    }

    Ok(match names.len() {
        1 => names.remove(0),
        _ => Value::Array(names),
    })
}

fn set_field(prompt: &mut Value, target: &SlotTarget, value: Value) -> Result<(), SchedulerError> {
    let node = prompt
        .get_mut(&target.node_id)
        .and_then(Value::as_object_mut)
        .ok_or_else(|| {
            SchedulerError::validation(format!("Graph has no node '{}'", target.node_id))
        })?;
    let inputs = node
        .entry("inputs")
        .or_insert_with(|| Value::Object(Map::new()));
    match inputs.as_object_mut() {
        Some(inputs) => {
            inputs.insert(target.field.clone(), value);
            Ok(())
        }
        None => Err(SchedulerError::validation(format!(
            "Graph node '{}' has malformed inputs",
            target.node_id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use chrono::Utc;
    use fleet_comfyui::ScriptedNode;
    use fleet_core::status::{AttachmentKind, TaskStatus, WorkflowStatus};
    use fleet_core::workflow::{InputDefs, OutputDefs};
    use fleet_db::MemoryStore;
    use fleet_pipeline::attachments::Owner;
    use fleet_pipeline::MemoryBlobStore;
    use serde_json::json;
    use sqlx::types::Json;

    fn workflow(inputs: InputDefs) -> Workflow {
        Workflow {
            id: 1,
            name: "txt2img".into(),
            graph: json!({
                "3": { "class_type": "KSampler", "inputs": { "seed": 0, "steps": 20 } },
                "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "" } },
                "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "x" } },
                "10": { "class_type": "LoadImage", "inputs": { "image": "" } },
            }),
            inputs: Json(inputs),
            outputs: Json(OutputDefs::new()),
            cost: 1.0,
            base_weight: 0.0,
            status_id: WorkflowStatus::Activated.id(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn task(input_values: Value) -> Task {
        Task {
            id: 42,
            workflow_id: 1,
            parent_id: None,
            node_id: None,
            trigger_id: 1,
            repeat_count: 1,
            input_values,
            output_values: None,
            weight: 0.0,
            cost: 1.0,
            status_id: TaskStatus::Pending.id(),
            execution_time_ms: None,
            expects_files: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn service() -> AttachmentService {
        AttachmentService::new(Arc::new(MemoryStore::new()), Arc::new(MemoryBlobStore::new()))
    }

    fn defs() -> InputDefs {
        let mut defs = InputDefs::new();
        defs.insert("seed".into(), WorkflowInput::new(InputKind::Seed).with_target("3", "seed"));
        defs.insert("prompt".into(), WorkflowInput::new(InputKind::String).with_target("6", "text"));
        defs.insert(
            "prefix".into(),
            WorkflowInput::new(InputKind::Prefixer).with_target("9", "filename_prefix"),
        );
        defs
    }

    #[tokio::test]
    async fn scalar_inputs_are_written_to_targets() {
        let node = ScriptedNode::new(1);
        let prompt = build_prompt(
            &workflow(defs()),
            &task(json!({ "seed": 7, "prompt": "a cat", "stray": true })),
            &node,
            &service(),
        )
        .await
        .unwrap();

        assert_eq!(prompt["3"]["inputs"]["seed"], json!(7));
        assert_eq!(prompt["3"]["inputs"]["steps"], json!(20));
        assert_eq!(prompt["6"]["inputs"]["text"], json!("a cat"));
        assert_eq!(prompt["9"]["inputs"]["filename_prefix"], json!("42"));
    }

    #[tokio::test]
    async fn media_inputs_are_uploaded_and_referenced() {
        let attachments = service();
        let stored = attachments
            .store(b"png-bytes", "input.png", AttachmentKind::Image, None, Owner::default())
            .await
            .unwrap();

        let mut defs = InputDefs::new();
        defs.insert("init".into(), WorkflowInput::new(InputKind::Image).with_target("10", "image"));

        let node = ScriptedNode::new(1);
        let prompt = build_prompt(
            &workflow(defs),
            &task(json!({ "init": [stored.id] })),
            &node,
            &attachments,
        )
        .await
        .unwrap();

        assert_eq!(prompt["10"]["inputs"]["image"], json!("9_input.png"));
        assert_eq!(node.uploads().await, vec!["9_input.png".to_string()]);
    }

    #[tokio::test]
    async fn unknown_target_node_is_rejected() {
        let mut defs = InputDefs::new();
        defs.insert("steps".into(), WorkflowInput::new(InputKind::Number).with_target("99", "steps"));

        let node = ScriptedNode::new(1);
        let result = build_prompt(&workflow(defs), &task(json!({ "steps": 4 })), &node, &service()).await;
        assert_matches!(result, Err(SchedulerError::Core(_)));
    }

    #[test]
    fn booleans_accept_loose_values() {
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!("true")));
        assert!(!truthy(&json!("no")));
        assert!(!truthy(&json!(null)));
    }
}
