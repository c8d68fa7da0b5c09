//! Status enums mapping to SMALLINT columns, plus the task state machine.
//!
//! Each enum variant's discriminant is the value stored in the database.
//! The enums live here (not in `db`) because the scheduler and the
//! admission logic reason about them without touching persistence.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Status ID type matching SMALLINT in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Look up a variant by its database ID.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( $val => Some(Self::$variant), )+
                    _ => None,
                }
            }

            /// Human-readable name, used in event details and error messages.
            pub fn label(self) -> &'static str {
                match self {
                    $( Self::$variant => $label ),+
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.label())
            }
        }
    };
}

define_status_enum! {
    /// Task lifecycle status.
    TaskStatus {
        Queuing = 1 => "Queuing",
        Pending = 2 => "Pending",
        Running = 3 => "Running",
        Success = 4 => "Success",
        Failed = 5 => "Failed",
        /// Groups batch children. Never dispatched.
        Parent = 6 => "Parent",
    }
}

define_status_enum! {
    /// Compute node liveness.
    NodeStatus {
        Offline = 1 => "Offline",
        Online = 2 => "Online",
        Executing = 3 => "Executing",
        Error = 4 => "Error",
    }
}

define_status_enum! {
    /// Attachment upload state.
    AttachmentStatus {
        Pending = 1 => "Pending",
        Uploaded = 2 => "Uploaded",
        Failed = 3 => "Failed",
    }
}

define_status_enum! {
    /// Classified media type of an attachment.
    AttachmentKind {
        Image = 1 => "Image",
        Video = 2 => "Video",
        File = 3 => "File",
    }
}

define_status_enum! {
    /// What caused a task to exist.
    TriggerKind {
        User = 1 => "User",
        Token = 2 => "Token",
        System = 3 => "System",
        Job = 4 => "Job",
    }
}

define_status_enum! {
    /// Workflow availability.
    WorkflowStatus {
        Activated = 1 => "Activated",
        Deactivated = 2 => "Deactivated",
        Deleted = 3 => "Deleted",
    }
}

define_status_enum! {
    /// Account role. Admins are exempt from balance checks.
    Role {
        Admin = 1 => "Admin",
        Editor = 2 => "Editor",
        User = 3 => "User",
    }
}

define_status_enum! {
    /// Category of a node history entry.
    NodeEventKind {
        Status = 1 => "Status",
        Action = 2 => "Action",
        Monitor = 3 => "Monitor",
    }
}

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Queuing,
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Success,
        TaskStatus::Failed,
        TaskStatus::Parent,
    ];

    /// Statuses from which `self` can be entered.
    pub fn allowed_sources(self) -> Vec<TaskStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition(self))
            .collect()
    }

    /// Statuses reachable from `self`.
    ///
    /// `Pending`/`Running` may fall back to `Queuing` only through the
    /// start-up recovery sweep. `Parent` and the terminal states have no
    /// outgoing transitions.
    pub fn valid_transitions(self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Queuing => &[TaskStatus::Pending],
            TaskStatus::Pending => &[TaskStatus::Running, TaskStatus::Failed, TaskStatus::Queuing],
            TaskStatus::Running => &[TaskStatus::Success, TaskStatus::Failed, TaskStatus::Queuing],
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Parent => &[],
        }
    }

    /// Check whether a transition from `self` to `to` is valid.
    pub fn can_transition(self, to: TaskStatus) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// Validate a transition, returning a descriptive error for invalid ones.
    pub fn validate_transition(self, to: TaskStatus) -> Result<(), CoreError> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(CoreError::Conflict(format!(
                "Invalid task transition: {self} -> {to}"
            )))
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }

    /// Claimed by the dispatcher but not finished.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

/// Display status of a parent task, derived from its children.
///
/// - any child in flight -> `Running`
/// - otherwise any child queued -> `Queuing`
/// - otherwise any child failed -> `Failed`
/// - all children succeeded -> `Success`
///
/// A parent without children reports `Queuing`.
pub fn aggregate_parent_status(children: &[TaskStatus]) -> TaskStatus {
    if children.iter().any(|s| s.is_in_flight()) {
        TaskStatus::Running
    } else if children.is_empty() || children.contains(&TaskStatus::Queuing) {
        TaskStatus::Queuing
    } else if children.contains(&TaskStatus::Failed) {
        TaskStatus::Failed
    } else {
        TaskStatus::Success
    }
}
