//! Workflow input and output declarations.
//!
//! A workflow is a raw node graph plus a typed description of which graph
//! fields callers may set (inputs) and which fields carry results
//! (outputs). Both maps are stored as JSON on the workflow row.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of a declared workflow input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Number,
    Seed,
    /// Receives the task id as a string, used as a filename prefix.
    Prefixer,
    String,
    Selection,
    Boolean,
    Image,
    Video,
    File,
}

impl InputKind {
    /// Image, Video and File inputs carry attachment ids.
    pub fn is_media(self) -> bool {
        matches!(self, InputKind::Image | InputKind::Video | InputKind::File)
    }

    /// Number and Seed inputs are range-checked and priced.
    pub fn is_numeric(self) -> bool {
        matches!(self, InputKind::Number | InputKind::Seed)
    }
}

/// A field in the node graph: graph node id plus input field name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotTarget {
    pub node_id: String,
    pub field: String,
}

impl SlotTarget {
    pub fn new(node_id: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            field: field.into(),
        }
    }
}

/// A caller-settable workflow input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub kind: InputKind,
    #[serde(default)]
    pub targets: Vec<SlotTarget>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub step: Option<f64>,
    #[serde(default)]
    pub choices: Vec<String>,
    /// Price added per unit of the numeric value.
    #[serde(default)]
    pub cost_per_unit: Option<f64>,
}

impl WorkflowInput {
    pub fn new(kind: InputKind) -> Self {
        Self {
            kind,
            targets: Vec::new(),
            default: None,
            min: None,
            max: None,
            step: None,
            choices: Vec::new(),
            cost_per_unit: None,
        }
    }

    pub fn with_target(mut self, node_id: &str, field: &str) -> Self {
        self.targets.push(SlotTarget::new(node_id, field));
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = choices.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cost_per_unit(mut self, cost: f64) -> Self {
        self.cost_per_unit = Some(cost);
        self
    }
}

/// Kind of a declared workflow output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Image,
    Video,
    File,
    String,
    Number,
    Boolean,
}

impl OutputKind {
    /// Outputs that produce blobs go through the artifact pipeline.
    pub fn is_media(self) -> bool {
        matches!(self, OutputKind::Image | OutputKind::Video | OutputKind::File)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOutput {
    pub kind: OutputKind,
    pub target: SlotTarget,
}

pub type InputDefs = BTreeMap<String, WorkflowInput>;
pub type OutputDefs = BTreeMap<String, WorkflowOutput>;

/// Whether a successful task of this workflow must have attachments.
pub fn expects_files(outputs: &OutputDefs) -> bool {
    outputs.values().any(|o| o.kind.is_media())
}
