//! Outbound wire frames and task-string helpers.
//!
//! Every frame is a flat JSON object sent as one text message. Tasks carry a
//! command string of the form `[CMD:<NAME>] <params>`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Command name the server routes to the in-page JavaScript executor.
pub const BROWSER_JS: &str = "BROWSER_JS";

/// A `task` frame addressed to the server's command bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub role: String,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
}

impl TaskFrame {
    /// Frame whose reply echoes `command_id`.
    pub fn with_id(task: impl Into<String>, command_id: impl Into<String>) -> Self {
        Self {
            frame_type: "task".to_string(),
            role: "system".to_string(),
            task: task.into(),
            command_id: Some(command_id.into()),
        }
    }

    /// Frame for legacy commands whose replies carry no caller id.
    pub fn without_id(task: impl Into<String>) -> Self {
        Self {
            frame_type: "task".to_string(),
            role: "system".to_string(),
            task: task.into(),
            command_id: None,
        }
    }
}

/// Build `[CMD:<NAME>] <params>`; the params part is omitted when empty.
pub fn task_string(name: &str, params: &str) -> String {
    if params.is_empty() {
        format!("[CMD:{}]", name)
    } else {
        format!("[CMD:{}] {}", name, params)
    }
}

/// Extract `<NAME>` from a `[CMD:<NAME>] ...` task string.
pub fn command_name(task: &str) -> Option<&str> {
    let rest = task.trim_start().strip_prefix("[CMD:")?;
    let end = rest.find(']')?;
    let name = rest[..end].trim();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Mints `<name>_<secs>.<micros>` correlation ids.
///
/// The microsecond component never repeats within one generator, even when
/// the wall clock stalls or steps backwards.
#[derive(Debug, Default)]
pub struct CommandIdGenerator {
    last_micros: AtomicU64,
}

impl CommandIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, name: &str) -> String {
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let mut prev = self.last_micros.load(Ordering::Relaxed);
        let micros = loop {
            let candidate = now.max(prev + 1);
            match self.last_micros.compare_exchange_weak(
                prev,
                candidate,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break candidate,
                Err(actual) => prev = actual,
            }
        };
        format!("{}_{}.{:06}", name, micros / 1_000_000, micros % 1_000_000)
    }
}
