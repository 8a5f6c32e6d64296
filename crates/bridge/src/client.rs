//! Public entry point: submit a task, get back an unwrapped outcome.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use continuum_core::{BridgeConfig, Error, Result};

use crate::correlation::{CorrelationKey, CorrelationTable, Family};
use crate::envelope::ExecutionOutcome;
use crate::frame::{self, CommandIdGenerator, TaskFrame, BROWSER_JS};
use crate::router::Router;
use crate::transport::{Connection, ConnectionState};

/// How a reply is matched back to its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationScheme {
    /// Send a `commandId` and match on the echoed value.
    Explicit,
    /// Match the newest waiter of the family. Only one such request may be
    /// in flight per family; a second one supersedes the first.
    Latest,
}

#[derive(Debug, Clone, Copy)]
pub struct SubmitOptions {
    /// Falls back to the configured request timeout.
    pub timeout: Option<Duration>,
    /// When false the frame is written and no reply is awaited.
    pub expect_return: bool,
    pub scheme: CorrelationScheme,
    pub family: Family,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            expect_return: true,
            scheme: CorrelationScheme::Explicit,
            family: Family::Command,
        }
    }
}

impl SubmitOptions {
    /// Legacy `BROWSER_JS` tasks: no id on the wire, execution family.
    pub fn javascript() -> Self {
        Self {
            scheme: CorrelationScheme::Latest,
            family: Family::Execution,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_return(mut self) -> Self {
        self.expect_return = false;
        self
    }

    pub fn with_scheme(mut self, scheme: CorrelationScheme) -> Self {
        self.scheme = scheme;
        self
    }
}

/// Client for one Continuum connection.
///
/// Owns the connection, the router and the correlation table; a background
/// task reads frames and dispatches them. Once the connection is `Closed`
/// the client is spent and a new one has to be built.
pub struct RemoteExecutionClient {
    connection: Arc<Connection>,
    router: Arc<Router>,
    table: Arc<CorrelationTable>,
    ids: CommandIdGenerator,
    config: BridgeConfig,
    reader_handle: JoinHandle<()>,
}

impl RemoteExecutionClient {
    pub async fn connect(config: BridgeConfig) -> Result<Self> {
        let connection = Arc::new(Connection::connect(&config).await?);
        Ok(Self::with_connection(connection, config))
    }

    /// Start the receive loop over an already open connection.
    pub fn with_connection(connection: Arc<Connection>, config: BridgeConfig) -> Self {
        let table = Arc::new(CorrelationTable::new());
        let router = Arc::new(Router::new(table.clone(), &config));
        let reader_handle = tokio::spawn(receive_loop(connection.clone(), router.clone()));
        Self {
            connection,
            router,
            table,
            ids: CommandIdGenerator::new(),
            config,
            reader_handle,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn table(&self) -> &CorrelationTable {
        &self.table
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state_changes()
    }

    pub fn frames_sent(&self) -> u64 {
        self.connection.frames_sent()
    }

    /// Send a prepared task string and wait for its outcome.
    ///
    /// Remote failures come back as [`Error::Execution`], unreadable
    /// replies as [`Error::Protocol`]. The request's table entry is gone
    /// when this returns.
    pub async fn submit(&self, task: &str, options: SubmitOptions) -> Result<ExecutionOutcome> {
        let state = self.connection.state();
        if !state.is_open() {
            return Err(Error::Connection(format!(
                "Cannot submit on a {:?} connection",
                state
            )));
        }

        let name = frame::command_name(task).unwrap_or("task");
        let (key, task_frame) = match options.scheme {
            CorrelationScheme::Explicit => {
                let id = self.ids.next(name);
                (
                    CorrelationKey::Explicit(id.clone()),
                    TaskFrame::with_id(task, id),
                )
            }
            CorrelationScheme::Latest => (
                CorrelationKey::Latest(options.family),
                TaskFrame::without_id(task),
            ),
        };

        if !options.expect_return {
            self.connection.send(&task_frame).await?;
            debug!(command = %name, "Task sent without waiting for a reply");
            return Ok(ExecutionOutcome::acknowledged());
        }

        let timeout = options.timeout.unwrap_or_else(|| self.config.request_timeout());
        // Register first so a fast reply cannot arrive before its waiter.
        let mut pending = self.table.register(key.clone(), options.family, timeout).await;
        if let Err(e) = self.connection.send(&task_frame).await {
            self.table
                .cancel(&key, pending.ticket(), "frame was never written")
                .await;
            warn!(key = %key, error = %e, "Task not sent");
            return Err(e);
        }
        pending.mark_sent();
        debug!(key = %key, timeout_ms = timeout.as_millis() as u64, "Task sent");

        pending
            .wait(&self.table)
            .await
            .and_then(ExecutionOutcome::into_result)
    }

    /// Run JavaScript in the attached browser tab.
    ///
    /// The source is base64-encoded into a `[CMD:BROWSER_JS]` task. Replies
    /// to this command carry no id, so calls must not overlap.
    pub async fn execute_js(&self, source: &str, timeout: Option<Duration>) -> Result<ExecutionOutcome> {
        let task = frame::task_string(BROWSER_JS, &BASE64.encode(source.as_bytes()));
        let mut options = SubmitOptions::javascript();
        options.timeout = timeout;
        self.submit(&task, options).await
    }

    /// Run a named bus command with JSON params, correlated by id.
    pub async fn run_command(
        &self,
        name: &str,
        params: &Value,
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutcome> {
        let params = if params.is_null() {
            String::new()
        } else {
            params.to_string()
        };
        let task = frame::task_string(name, &params);
        let mut options = SubmitOptions::default();
        options.timeout = timeout;
        self.submit(&task, options).await
    }

    /// Chat round trip, allowed the longer configured chat window.
    pub async fn chat(&self, message: &str) -> Result<ExecutionOutcome> {
        let task = frame::task_string("CHAT", message);
        let options = SubmitOptions::default().with_timeout(self.config.chat_timeout());
        self.submit(&task, options).await
    }

    /// Write a frame whose acknowledgement nobody needs.
    pub async fn send_and_forget<T: Serialize + ?Sized>(&self, frame: &T) -> Result<()> {
        self.connection.send(frame).await?;
        Ok(())
    }

    /// Close the connection and fail anything still pending.
    pub async fn close(&self) {
        self.connection.close().await;
        self.reader_handle.abort();
        self.table.fail_all("client closed").await;
    }
}

impl Drop for RemoteExecutionClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

async fn receive_loop(connection: Arc<Connection>, router: Arc<Router>) {
    loop {
        match connection.receive().await {
            Ok(Some(frame)) => router.dispatch(frame).await,
            Ok(None) => {
                info!(url = %connection.url(), "Server closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Receive loop stopped");
                break;
            }
        }
    }
    router
        .table()
        .fail_all("connection closed before a reply arrived")
        .await;
}
