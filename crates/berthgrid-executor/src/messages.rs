//! Reason strings attached to outgoing task status updates.

pub const EXECUTOR_UNREGISTERED: &str = "executor-unregistered";
pub const UNMARSHAL_TASK_DATA_FAILURE: &str = "unmarshal-task-data-failure";
pub const CREATE_BINDING_FAILURE: &str = "create-binding-failure";
pub const CREATE_BINDING_SUCCESS: &str = "create-binding-success";
pub const LAUNCH_TASK_FAILED: &str = "launch-task-failed";
pub const CONTAINERS_DISAPPEARED: &str = "containers-disappeared";
pub const TASK_KILLED: &str = "task-killed";
pub const TASK_LOST_ACK: &str = "task-lost-acknowledged";
