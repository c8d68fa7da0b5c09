pub mod nodes;
pub mod notifications;
pub mod tasks;
pub mod workflows;
