//! Inbound demultiplexing.
//!
//! Every frame read from the connection goes through [`Router::dispatch`],
//! which classifies it and hands it to exactly one destination: an execution
//! waiter, a command waiter, the broadcast handlers registered for its type,
//! or the discard path. Observers see every frame whichever path it took.
//!
//! Nothing in here returns an error to the receive loop: a frame that cannot
//! be delivered is logged and dropped.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace, warn};

use continuum_core::{BridgeConfig, Result};

use crate::correlation::{CorrelationKey, CorrelationTable, Family};
use crate::envelope::{self, ExecutionOutcome, Layer, LogEntry};

/// Which path a frame took through the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Execution,
    Command,
    Broadcast,
    Discarded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoutedMessage {
    CommandResult {
        correlation_id: Option<String>,
        payload: Value,
    },
    ExecutionResult {
        correlation_id: Option<String>,
        outcome: ExecutionOutcome,
    },
    BroadcastEvent {
        kind: String,
        payload: Value,
    },
    Unclassified {
        raw: Value,
    },
}

impl RoutedMessage {
    pub fn route(&self) -> Route {
        match self {
            Self::CommandResult { .. } => Route::Command,
            Self::ExecutionResult { .. } => Route::Execution,
            Self::BroadcastEvent { .. } => Route::Broadcast,
            Self::Unclassified { .. } => Route::Discarded,
        }
    }
}

/// Classify one frame. First match wins:
/// execution result, then command result, then broadcast, then discard.
pub fn classify(frame: &Value, is_broadcast: impl Fn(&str) -> bool) -> RoutedMessage {
    let frame_type = frame.get("type").and_then(|t| t.as_str()).unwrap_or("");
    let peeled = envelope::peel(frame);
    let correlation_id = peeled.command_id().map(|id| id.to_string());

    if is_execution_result(frame_type, &peeled) {
        return RoutedMessage::ExecutionResult {
            correlation_id,
            outcome: envelope::unwrap(frame),
        };
    }

    if frame_type == "result" || peeled.has(Layer::Bus) {
        return RoutedMessage::CommandResult {
            correlation_id,
            payload: frame.clone(),
        };
    }

    if !frame_type.is_empty() && is_broadcast(frame_type) {
        return RoutedMessage::BroadcastEvent {
            kind: frame_type.to_string(),
            payload: frame.clone(),
        };
    }

    RoutedMessage::Unclassified { raw: frame.clone() }
}

fn is_execution_result(frame_type: &str, peeled: &envelope::Peeled<'_>) -> bool {
    if frame_type == "js_executed" || peeled.has(Layer::Browser) {
        return true;
    }
    if peeled
        .layers()
        .any(|(_, v)| v.get("type").and_then(|t| t.as_str()) == Some("js_executed"))
    {
        return true;
    }
    // `{type: "result", data: {result, output, success, error}}` without a bus
    // role. `output` is optional; `success` with a result or error is enough.
    let inner = peeled.innermost();
    peeled.has(Layer::Transport)
        && !peeled.has(Layer::Bus)
        && inner.get("success").is_some()
        && ["output", "result", "error"]
            .iter()
            .any(|k| inner.get(*k).is_some())
}

pub type BroadcastHandler = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;
pub type Observer = Arc<dyn Fn(Route, &Value) + Send + Sync>;

pub struct Router {
    table: Arc<CorrelationTable>,
    handlers: RwLock<HashMap<String, Vec<BroadcastHandler>>>,
    observers: RwLock<Vec<Observer>>,
    discard_types: HashSet<String>,
    subscription_buffer: usize,
}

impl Router {
    pub fn new(table: Arc<CorrelationTable>, config: &BridgeConfig) -> Self {
        Self {
            table,
            handlers: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            discard_types: config.discard_types.iter().cloned().collect(),
            subscription_buffer: config.subscription_buffer.max(1),
        }
    }

    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.table
    }

    /// Call `handler` for every frame whose `type` is `kind`.
    ///
    /// Handlers run on the receive loop and must not block; an error or a
    /// panic is logged and never reaches the loop.
    pub async fn on_broadcast<F>(&self, kind: &str, handler: F)
    where
        F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .await
            .entry(kind.to_string())
            .or_insert_with(Vec::new)
            .push(Arc::new(handler));
    }

    /// Receive every frame of type `kind` on a channel.
    ///
    /// A subscriber that falls behind loses events rather than stalling
    /// correlated deliveries.
    pub async fn subscribe(&self, kind: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(self.subscription_buffer);
        let kind_owned = kind.to_string();
        self.on_broadcast(kind, move |frame| {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(frame.clone()) {
                warn!(kind = %kind_owned, "Subscriber is full; dropping broadcast");
            }
            Ok(())
        })
        .await;
        rx
    }

    /// Like [`Router::subscribe`], normalised into console log entries.
    pub async fn subscribe_logs(&self, kind: &str) -> mpsc::Receiver<LogEntry> {
        let (tx, rx) = mpsc::channel(self.subscription_buffer);
        let kind_owned = kind.to_string();
        self.on_broadcast(kind, move |frame| {
            for entry in log_entries(frame) {
                if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(entry) {
                    warn!(kind = %kind_owned, "Log subscriber is full; dropping entry");
                }
            }
            Ok(())
        })
        .await;
        rx
    }

    /// Mirror every frame to `observer`, together with the route it took.
    pub async fn observe<F>(&self, observer: F)
    where
        F: Fn(Route, &Value) + Send + Sync + 'static,
    {
        self.observers.write().await.push(Arc::new(observer));
    }

    pub async fn dispatch(&self, frame: Value) {
        let routed = {
            let handlers = self.handlers.read().await;
            classify(&frame, |kind| handlers.contains_key(kind))
        };
        let route = routed.route();

        match routed {
            RoutedMessage::ExecutionResult {
                correlation_id,
                outcome,
            } => {
                self.deliver(Family::Execution, correlation_id, outcome).await;
            }
            RoutedMessage::CommandResult {
                correlation_id,
                payload,
            } => {
                let outcome = envelope::unwrap(&payload);
                self.deliver(Family::Command, correlation_id, outcome).await;
            }
            RoutedMessage::BroadcastEvent { kind, payload } => {
                self.broadcast(&kind, &payload).await;
            }
            RoutedMessage::Unclassified { raw } => {
                let frame_type = raw.get("type").and_then(|t| t.as_str()).unwrap_or("");
                if self.discard_types.contains(frame_type) {
                    trace!(frame_type = %frame_type, "Discarded frame");
                } else {
                    debug!(frame_type = %frame_type, "Discarded unclassified frame");
                }
            }
        }

        self.notify_observers(route, &frame).await;
    }

    async fn deliver(&self, family: Family, correlation_id: Option<String>, outcome: ExecutionOutcome) {
        let delivered = match &correlation_id {
            Some(id) => {
                self.table
                    .resolve(&CorrelationKey::Explicit(id.clone()), Ok(outcome))
                    .await
            }
            None => self.table.resolve_latest(family, Ok(outcome)).await,
        };
        if delivered {
            debug!(family = ?family, command_id = ?correlation_id, "Delivered result");
        } else {
            warn!(
                family = ?family,
                command_id = ?correlation_id,
                "Result matched no pending request (timed out or duplicate); dropped"
            );
        }
    }

    async fn broadcast(&self, kind: &str, payload: &Value) {
        let handlers = match self.handlers.read().await.get(kind) {
            Some(handlers) => handlers.clone(),
            None => return,
        };
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(kind = %kind, error = %e, "Broadcast handler failed"),
                Err(_) => warn!(kind = %kind, "Broadcast handler panicked"),
            }
        }
    }

    async fn notify_observers(&self, route: Route, frame: &Value) {
        let observers = self.observers.read().await.clone();
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(route, frame))).is_err() {
                warn!(route = ?route, "Observer panicked");
            }
        }
    }
}

/// Console entries carried by a forwarded-log frame.
fn log_entries(frame: &Value) -> Vec<LogEntry> {
    for key in ["output", "logs", "entries"] {
        if let Some(items) = frame.get(key).and_then(|v| v.as_array()) {
            return items.iter().filter_map(LogEntry::from_value).collect();
        }
    }
    let single = frame.get("data").filter(|d| d.is_object()).unwrap_or(frame);
    LogEntry::from_value(single).into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::RequestState;
    use continuum_core::{Error, ExecutionErrorKind};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn router() -> Router {
        Router::new(Arc::new(CorrelationTable::new()), &BridgeConfig::default())
    }

    #[test]
    fn test_classification_priority() {
        let none = |_: &str| false;

        let js = json!({"type": "js_executed", "result": 1, "success": true, "output": []});
        assert_eq!(classify(&js, none).route(), Route::Execution);

        let nested_js = json!({"type": "result", "data": {"result": 1, "success": true, "output": []}});
        assert_eq!(classify(&nested_js, none).route(), Route::Execution);

        let bus_js = json!({"type": "result", "data": {"role": "BusCommand",
            "result": {"result": {"browserResponse": {"success": true, "result": 2}}}}});
        assert_eq!(classify(&bus_js, none).route(), Route::Execution);

        let bus = json!({"type": "result", "data": {"role": "BusCommand",
            "result": {"commandId": "SCREENSHOT_1.5", "success": true}}});
        match classify(&bus, none) {
            RoutedMessage::CommandResult { correlation_id, .. } => {
                assert_eq!(correlation_id.as_deref(), Some("SCREENSHOT_1.5"))
            }
            other => panic!("unexpected route: {other:?}"),
        }

        let log = json!({"type": "console_log", "level": "info", "message": "hi"});
        assert_eq!(classify(&log, none).route(), Route::Discarded);
        assert_eq!(classify(&log, |k| k == "console_log").route(), Route::Broadcast);

        // A result frame is never handed to a broadcast handler.
        assert_eq!(classify(&bus, |_| true).route(), Route::Command);

        for discard in ["status", "connection_banner", "working", "banana"] {
            let frame = json!({"type": discard, "message": "x"});
            assert_eq!(classify(&frame, none).route(), Route::Discarded);
        }
    }

    #[tokio::test]
    async fn test_out_of_order_explicit_replies() {
        let router = router();
        let table = router.table().clone();
        let ids = ["SCREENSHOT_1.000001", "SCREENSHOT_1.000002", "SCREENSHOT_1.000003"];
        let mut pending = Vec::new();
        for id in ids {
            pending.push(
                table
                    .register(CorrelationKey::Explicit(id.to_string()), Family::Command, Duration::from_secs(5))
                    .await,
            );
        }

        for id in ids.iter().rev() {
            router
                .dispatch(json!({"type": "result", "data": {"role": "BusCommand",
                    "result": {"commandId": id, "success": true, "message": id}}}))
                .await;
        }

        for (id, request) in ids.iter().zip(pending) {
            let outcome = request.wait(&table).await.unwrap();
            assert_eq!(outcome.value["message"], *id);
        }
    }

    #[tokio::test]
    async fn test_discard_frames_leave_pending_untouched() {
        let router = router();
        let table = router.table().clone();
        let pending = table
            .register(CorrelationKey::Latest(Family::Execution), Family::Execution, Duration::from_secs(5))
            .await;

        for frame in [
            json!({"type": "status", "connected": true}),
            json!({"type": "connection_banner", "message": "welcome"}),
            json!({"type": "working", "message": "thinking"}),
            json!({"type": "banana"}),
            json!({"no_type": true}),
        ] {
            router.dispatch(frame).await;
        }
        assert_eq!(table.len().await, 1);
        assert!(table.contains(&CorrelationKey::Latest(Family::Execution)).await);

        router
            .dispatch(json!({"type": "js_executed", "success": false,
                "error": "ReferenceError: x is not defined"}))
            .await;
        let outcome = pending.wait(&table).await.unwrap();
        match outcome.into_result() {
            Err(Error::Execution { kind, message }) => {
                assert_eq!(kind, ExecutionErrorKind::Generic);
                assert_eq!(message, "ReferenceError: x is not defined");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_correlation_id_is_dropped() {
        let router = router();
        let table = router.table().clone();
        let pending = table
            .register(CorrelationKey::Explicit("SCREENSHOT_2.0".to_string()), Family::Command, Duration::from_millis(100))
            .await;

        router
            .dispatch(json!({"type": "result", "data": {"role": "BusCommand",
                "result": {"commandId": "SCREENSHOT_1.0", "success": true}}}))
            .await;

        assert!(matches!(pending.wait(&table).await, Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_broadcast_handlers_and_observers() {
        let router = router();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));

        router.on_broadcast("console_log", |_| panic!("bad handler")).await;
        router
            .on_broadcast("console_log", |_| Err(Error::Protocol("bad payload".to_string())))
            .await;
        let counter = hits.clone();
        router
            .on_broadcast("console_log", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        let observed = seen.clone();
        router
            .observe(move |_, _| {
                observed.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        let mut logs = router.subscribe_logs("console_log").await;

        router
            .dispatch(json!({"type": "console_log", "level": "warning", "message": "slow paint"}))
            .await;
        router.dispatch(json!({"type": "status"})).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        let entry = logs.recv().await.unwrap();
        assert_eq!(entry.text, "slow paint");
        assert_eq!(entry.level, crate::envelope::LogLevel::Warn);
    }

    #[tokio::test]
    async fn test_nested_execution_result_without_output() {
        let router = router();
        let table = router.table().clone();
        let pending = table
            .register(CorrelationKey::Latest(Family::Execution), Family::Execution, Duration::from_millis(500))
            .await;

        let frame = json!({"type": "result", "data": {"result": 5, "success": true}});
        assert_eq!(classify(&frame, |_| false).route(), Route::Execution);
        router.dispatch(frame).await;

        let outcome = pending.wait(&table).await.unwrap();
        assert_eq!(outcome.value, json!(5));

        let failed = json!({"type": "result", "data": {"success": false, "error": "SyntaxError: bad"}});
        assert_eq!(classify(&failed, |_| false).route(), Route::Execution);
    }

    #[tokio::test]
    async fn test_full_subscriber_never_blocks_delivery() {
        let mut config = BridgeConfig::default();
        config.subscription_buffer = 1;
        let router = Router::new(Arc::new(CorrelationTable::new()), &config);
        let table = router.table().clone();

        let mut events = router.subscribe("console_log").await;
        let key = CorrelationKey::Explicit("SCREENSHOT_3.0".to_string());
        let pending = table.register(key, Family::Command, Duration::from_secs(1)).await;

        for n in 0..2 {
            router
                .dispatch(json!({"type": "console_log", "level": "info", "message": format!("line {n}")}))
                .await;
        }
        router
            .dispatch(json!({"type": "result", "data": {"role": "BusCommand",
                "result": {"commandId": "SCREENSHOT_3.0", "success": true, "message": "ok"}}}))
            .await;

        let outcome = pending.wait(&table).await.unwrap();
        assert_eq!(outcome.value["message"], "ok");

        let kept = events.try_recv().unwrap();
        assert_eq!(kept["message"], "line 0");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_latest_reply_resolves_newest_waiter_only() {
        let router = router();
        let table = router.table().clone();
        let key = CorrelationKey::Latest(Family::Execution);
        let first = table.register(key.clone(), Family::Execution, Duration::from_millis(150)).await;
        let second = table.register(key.clone(), Family::Execution, Duration::from_secs(5)).await;
        assert_eq!(first.state(), RequestState::Created);

        router
            .dispatch(json!({"type": "js_executed", "result": "done", "success": true, "output": []}))
            .await;

        assert_eq!(second.wait(&table).await.unwrap().value, json!("done"));
        assert!(matches!(first.wait(&table).await, Err(Error::Timeout { .. })));
    }
}
