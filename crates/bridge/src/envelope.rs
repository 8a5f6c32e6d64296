//! Envelope unwrapping.
//!
//! A reply can be wrapped in up to three layers, outermost first:
//!
//! 1. transport: `{type, data}` or `{type: "result", result}`
//! 2. command bus: `{role: "BusCommand", result}`
//! 3. browser: `{result: {browserResponse: {success, result, output, error}}}`
//!
//! Each layer has its own peeler. A peeler that does not recognise its
//! layer leaves the value untouched, so partially stripped replies unwrap
//! to the same outcome as fully nested ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use continuum_core::{Error, ExecutionErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Frame,
    Transport,
    Bus,
    Browser,
}

type Peeler = fn(&Value) -> Option<&Value>;

const PEELERS: [(Layer, Peeler); 3] = [
    (Layer::Transport, peel_transport),
    (Layer::Bus, peel_bus),
    (Layer::Browser, peel_browser),
];

fn peel_transport(value: &Value) -> Option<&Value> {
    let frame_type = value.get("type")?.as_str()?;
    if let Some(data) = value.get("data").filter(|d| d.is_object()) {
        return Some(data);
    }
    // `{type: "result", result: {...}}`; a flat execution frame keeps its
    // `result` because the user value lives there next to `success`.
    if frame_type == "result" && value.get("success").is_none() {
        return value.get("result").filter(|r| r.is_object());
    }
    None
}

fn peel_bus(value: &Value) -> Option<&Value> {
    if value.get("role").and_then(|r| r.as_str()) != Some("BusCommand") {
        return None;
    }
    value.get("result").filter(|r| r.is_object())
}

fn peel_browser(value: &Value) -> Option<&Value> {
    value
        .get("result")
        .and_then(|r| r.get("browserResponse"))
        .or_else(|| value.get("browserResponse"))
        .filter(|b| b.is_object())
}

/// Every layer found in a frame, outermost first.
#[derive(Debug)]
pub struct Peeled<'a> {
    layers: Vec<(Layer, &'a Value)>,
}

impl<'a> Peeled<'a> {
    pub fn innermost(&self) -> &'a Value {
        self.layers[self.layers.len() - 1].1
    }

    pub fn has(&self, layer: Layer) -> bool {
        self.layers.iter().any(|(l, _)| *l == layer)
    }

    pub fn layers(&self) -> impl Iterator<Item = &(Layer, &'a Value)> {
        self.layers.iter()
    }

    /// The echoed `commandId`, from whichever layer carries it.
    pub fn command_id(&self) -> Option<&'a str> {
        self.layers.iter().find_map(|&(_, v)| {
            v.get("commandId")
                .or_else(|| v.get("command_id"))
                .and_then(|id| id.as_str())
        })
    }
}

pub fn peel(frame: &Value) -> Peeled<'_> {
    let mut layers = vec![(Layer::Frame, frame)];
    let mut current = frame;
    for (layer, peeler) in PEELERS {
        if let Some(inner) = peeler(current) {
            trace!(layer = ?layer, "Peeled envelope layer");
            layers.push((layer, inner));
            current = inner;
        }
    }
    Peeled { layers }
}

/// Unwrap a routed result frame into an outcome.
pub fn unwrap(frame: &Value) -> ExecutionOutcome {
    let peeled = peel(frame);
    // A bus acknowledgement without a browser payload is itself the reply body.
    let bus_reply = peeled.has(Layer::Bus) && !peeled.has(Layer::Browser);
    interpret(peeled.innermost(), bus_reply)
}

fn interpret(inner: &Value, bus_reply: bool) -> ExecutionOutcome {
    if !inner.is_object() {
        return ExecutionOutcome::protocol_failure("unrecognized envelope shape");
    }

    let side_output = extract_output(inner);
    let error = error_message(inner.get("error"));

    match inner.get("success").and_then(|s| s.as_bool()) {
        Some(true) => {
            // `undefined` results arrive with the key missing altogether.
            let value = match inner.get("result") {
                Some(result) => result.clone(),
                None if bus_reply => inner.clone(),
                None => Value::Null,
            };
            ExecutionOutcome::succeeded(value, side_output)
        }
        Some(false) => ExecutionOutcome::failed(
            error.unwrap_or_else(|| "remote execution failed".to_string()),
            side_output,
        ),
        None => match error {
            Some(message) => ExecutionOutcome::failed(message, side_output),
            None => ExecutionOutcome::protocol_failure("unrecognized envelope shape"),
        },
    }
}

fn error_message(error: Option<&Value>) -> Option<String> {
    let message = match error? {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(|m| m.as_str())
            .map(|m| m.to_string())
            .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
        other => other.to_string(),
    };
    if message.trim().is_empty() {
        None
    } else {
        Some(message)
    }
}

fn extract_output(inner: &Value) -> Vec<LogEntry> {
    inner
        .get("output")
        .and_then(|o| o.as_array())
        .map(|entries| entries.iter().filter_map(LogEntry::from_value).collect())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Log,
}

impl LogLevel {
    pub fn parse(level: &str) -> Self {
        match level.trim().to_lowercase().as_str() {
            "error" | "err" | "severe" => Self::Error,
            "warn" | "warning" => Self::Warn,
            "info" => Self::Info,
            "debug" | "verbose" | "trace" => Self::Debug,
            _ => Self::Log,
        }
    }
}

/// One console line captured during remote execution or forwarded by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub text: String,
    pub timestamp: Option<DateTime<Utc>>,
}

impl LogEntry {
    /// Normalise `{level, message|text, timestamp}` or a bare string.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(Self {
                level: LogLevel::Log,
                text: text.clone(),
                timestamp: None,
            }),
            Value::Object(obj) => {
                let text = ["message", "text", "msg"]
                    .iter()
                    .find_map(|k| obj.get(*k))
                    .map(|t| match t {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })?;
                let level = obj
                    .get("level")
                    .or_else(|| obj.get("type"))
                    .and_then(|l| l.as_str())
                    .map(LogLevel::parse)
                    .unwrap_or(LogLevel::Log);
                let timestamp = obj
                    .get("timestamp")
                    .or_else(|| obj.get("time"))
                    .and_then(parse_timestamp);
                Some(Self {
                    level,
                    text,
                    timestamp,
                })
            }
            _ => None,
        }
    }
}

/// Epoch milliseconds, epoch seconds (possibly fractional) or RFC 3339.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => from_epoch(n.as_f64()?),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .ok()
            .or_else(|| s.parse::<f64>().ok().and_then(from_epoch)),
        _ => None,
    }
}

fn from_epoch(n: f64) -> Option<DateTime<Utc>> {
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    // Anything past 1e11 cannot be seconds (year 5138); read it as millis.
    let millis = if n > 1e11 { n } else { n * 1000.0 };
    DateTime::from_timestamp_millis(millis.round() as i64)
}

/// Console output split by severity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsoleBuckets {
    pub errors: Vec<LogEntry>,
    pub warnings: Vec<LogEntry>,
    pub info: Vec<LogEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Remote(ExecutionErrorKind),
    Protocol,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeError {
    pub kind: FailureKind,
    pub message: String,
}

/// Fully unwrapped reply.
///
/// `success` implies no error; failure implies a null value.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub value: Value,
    pub side_output: Vec<LogEntry>,
    pub error: Option<OutcomeError>,
}

impl ExecutionOutcome {
    pub fn succeeded(value: Value, side_output: Vec<LogEntry>) -> Self {
        Self {
            success: true,
            value,
            side_output,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, side_output: Vec<LogEntry>) -> Self {
        let message = message.into();
        Self {
            success: false,
            value: Value::Null,
            side_output,
            error: Some(OutcomeError {
                kind: FailureKind::Remote(ExecutionErrorKind::classify(&message)),
                message,
            }),
        }
    }

    pub fn protocol_failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            value: Value::Null,
            side_output: Vec::new(),
            error: Some(OutcomeError {
                kind: FailureKind::Protocol,
                message: message.into(),
            }),
        }
    }

    /// Outcome of a frame sent without waiting for a reply.
    pub fn acknowledged() -> Self {
        Self::succeeded(Value::Null, Vec::new())
    }

    pub fn console(&self) -> ConsoleBuckets {
        let mut buckets = ConsoleBuckets::default();
        for entry in &self.side_output {
            match entry.level {
                LogLevel::Error => buckets.errors.push(entry.clone()),
                LogLevel::Warn => buckets.warnings.push(entry.clone()),
                LogLevel::Info | LogLevel::Debug | LogLevel::Log => buckets.info.push(entry.clone()),
            }
        }
        buckets
    }

    /// Turn a failed outcome into the matching error.
    pub fn into_result(self) -> Result<Self> {
        if self.success && self.error.is_none() {
            return Ok(self);
        }
        match self.error {
            Some(OutcomeError {
                kind: FailureKind::Protocol,
                message,
            }) => Err(Error::Protocol(message)),
            Some(OutcomeError {
                kind: FailureKind::Remote(kind),
                message,
            }) => Err(Error::Execution { kind, message }),
            None => Err(Error::Protocol("failure without an error".to_string())),
        }
    }
}
