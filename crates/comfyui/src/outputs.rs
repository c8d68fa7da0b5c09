//! Picking workflow outputs out of raw node output.
//!
//! A ComfyUI node reports output per graph node, e.g.
//! `{"9": {"images": [{"filename": "...", "subfolder": "", "type": "output"}]}}`.
//! A workflow output names the graph node and field to read.

use fleet_core::workflow::{OutputKind, WorkflowOutput};
use serde_json::Value;

use crate::api::FileRef;
use crate::error::NodeError;
use crate::events::OutputValue;

/// What a workflow output resolved to before any download.
#[derive(Debug, Clone, PartialEq)]
pub enum PickedOutput {
    /// Files still to be fetched from the node.
    Files(Vec<FileRef>),
    Value(OutputValue),
}

/// Read `output.target.field` from `graph_outputs[output.target.node_id]`.
///
/// Returns `Ok(None)` when the node produced nothing for it.
pub fn pick_output(
    output: &WorkflowOutput,
    graph_outputs: &Value,
) -> Result<Option<PickedOutput>, NodeError> {
    let Some(raw) = graph_outputs
        .get(&output.target.node_id)
        .and_then(|node| node.get(&output.target.field))
    else {
        return Ok(None);
    };

    let picked = match output.kind {
        OutputKind::Image | OutputKind::Video | OutputKind::File => {
            let files: Vec<FileRef> = match raw {
                Value::Array(_) => serde_json::from_value(raw.clone()),
                _ => serde_json::from_value(Value::Array(vec![raw.clone()])),
            }
            .map_err(|e| {
                NodeError::Protocol(format!(
                    "Output {}.{} is not a file list: {e}",
                    output.target.node_id, output.target.field
                ))
            })?;
            if files.is_empty() {
                return Ok(None);
            }
            PickedOutput::Files(files)
        }
        OutputKind::String => match first_scalar(raw) {
            Some(Value::String(s)) => PickedOutput::Value(OutputValue::Text(s.clone())),
            Some(other) => PickedOutput::Value(OutputValue::Text(other.to_string())),
            None => return Ok(None),
        },
        OutputKind::Number => match first_scalar(raw) {
            Some(Value::Number(n)) => {
                PickedOutput::Value(OutputValue::Number(n.as_f64().unwrap_or_default()))
            }
            Some(Value::String(s)) => match s.trim().parse::<f64>() {
                Ok(n) => PickedOutput::Value(OutputValue::Number(n)),
                Err(_) => return Err(mismatch(output, "number")),
            },
            Some(_) => return Err(mismatch(output, "number")),
            None => return Ok(None),
        },
        OutputKind::Boolean => match first_scalar(raw) {
            Some(Value::Bool(b)) => PickedOutput::Value(OutputValue::Bool(*b)),
            Some(_) => return Err(mismatch(output, "boolean")),
            None => return Ok(None),
        },
    };
    Ok(Some(picked))
}

/// Nodes wrap scalar outputs in one-element arrays.
fn first_scalar(raw: &Value) -> Option<&Value> {
    match raw {
        Value::Array(items) => items.first(),
        Value::Null => None,
        other => Some(other),
    }
}

fn mismatch(output: &WorkflowOutput, expected: &str) -> NodeError {
    NodeError::Protocol(format!(
        "Output {}.{} is not a {expected}",
        output.target.node_id, output.target.field
    ))
}

/// Graph node ids named by `outputs` that are missing from `graph_outputs`.
pub fn missing_nodes<'a>(
    outputs: impl IntoIterator<Item = &'a WorkflowOutput>,
    graph_outputs: &Value,
) -> Vec<&'a str> {
    outputs
        .into_iter()
        .filter(|o| graph_outputs.get(&o.target.node_id).is_none())
        .map(|o| o.target.node_id.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use fleet_core::workflow::SlotTarget;
    use serde_json::json;

    fn out(kind: OutputKind, node: &str, field: &str) -> WorkflowOutput {
        WorkflowOutput {
            kind,
            target: SlotTarget::new(node, field),
        }
    }

    #[test]
    fn image_output_lists_files() {
        let raw = json!({ "9": { "images": [
            { "filename": "a.png", "subfolder": "", "type": "output" },
            { "filename": "b.png", "subfolder": "", "type": "output" }
        ] } });
        let picked = pick_output(&out(OutputKind::Image, "9", "images"), &raw).unwrap();
        assert_matches!(picked, Some(PickedOutput::Files(files)) if files.len() == 2);
    }

    #[test]
    fn text_output_takes_first_element() {
        let raw = json!({ "12": { "text": ["a caption", "ignored"] } });
        let picked = pick_output(&out(OutputKind::String, "12", "text"), &raw).unwrap();
        assert_eq!(
            picked,
            Some(PickedOutput::Value(OutputValue::Text("a caption".into())))
        );
    }

    #[test]
    fn number_output_accepts_numeric_strings() {
        let raw = json!({ "3": { "value": ["0.75"] } });
        let picked = pick_output(&out(OutputKind::Number, "3", "value"), &raw).unwrap();
        assert_eq!(picked, Some(PickedOutput::Value(OutputValue::Number(0.75))));
    }

    #[test]
    fn boolean_output_rejects_strings() {
        let raw = json!({ "3": { "flag": ["yes"] } });
        assert_matches!(
            pick_output(&out(OutputKind::Boolean, "3", "flag"), &raw),
            Err(NodeError::Protocol(_))
        );
    }

    #[test]
    fn missing_node_yields_none() {
        let raw = json!({});
        assert!(pick_output(&out(OutputKind::Image, "9", "images"), &raw)
            .unwrap()
            .is_none());
    }

    #[test]
    fn missing_nodes_lists_absent_targets() {
        let outputs = [out(OutputKind::Image, "9", "images"), out(OutputKind::String, "4", "text")];
        let raw = json!({ "9": { "images": [] } });
        assert_eq!(missing_nodes(&outputs, &raw), vec!["4"]);
    }
}
