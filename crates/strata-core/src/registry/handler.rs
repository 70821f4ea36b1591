//! The `TaskHandler` trait and registry -- how task execution plugs into
//! workers.
//!
//! A handler is looked up by `task_type` and invoked with the task's
//! opaque parameters. Handlers must be idempotent: at-least-once delivery
//! and janitor requeues can run the same task more than once.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Default wall-clock budget for one handler invocation.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// One unit of executable work.
///
/// On success the handler returns the bare result object; the worker
/// wraps it into the stored `{"success": true, "result": ...}` envelope.
/// On failure it returns an error whose rendering is captured verbatim
/// into the task's `error_details`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Handler lookup key, matched against `Task::task_type`.
    fn task_type(&self) -> &str;

    /// Execute the work described by `parameters`.
    async fn run(&self, parameters: &Value) -> Result<Value>;

    /// Per-handler execution deadline. The worker cancels the invocation
    /// and fails the task when it elapses.
    fn timeout(&self) -> Duration {
        DEFAULT_HANDLER_TIMEOUT
    }
}

// Compile-time assertion: TaskHandler must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn TaskHandler) {}
};

/// A collection of registered [`TaskHandler`] implementations, keyed by
/// task type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the name returned by
    /// [`TaskHandler::task_type`]. Replaces and returns any previous
    /// handler with the same name.
    pub fn register(&mut self, handler: impl TaskHandler + 'static) -> Option<Box<dyn TaskHandler>> {
        let name = handler.task_type().to_string();
        self.handlers.insert(name, Box::new(handler))
    }

    /// Look up a handler by task type.
    pub fn get(&self, task_type: &str) -> Option<&dyn TaskHandler> {
        self.handlers.get(task_type).map(|b| b.as_ref())
    }

    /// List the names of all registered handlers.
    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
