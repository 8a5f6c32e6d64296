//! Pending-request bookkeeping.
//!
//! Each in-flight request owns one single-use result slot (a oneshot
//! channel). The table holds the sending half; whoever removes the entry
//! first (a routed reply, the caller's timeout, a rollback or a connection
//! drop) completes the slot, and everyone after that is a no-op.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use continuum_core::{Error, Result};

use crate::envelope::ExecutionOutcome;

/// Which reply stream a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// Generic command-bus results.
    Command,
    /// JavaScript execution results.
    Execution,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    /// Caller-generated id the server echoes back.
    Explicit(String),
    /// "Most recent" sentinel for replies that carry no id.
    Latest(Family),
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit(id) => write!(f, "{}", id),
            Self::Latest(family) => write!(f, "latest:{:?}", family),
        }
    }
}

/// Per-request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Sent,
    Resolved,
    TimedOut,
    Failed,
}

type Slot = oneshot::Sender<Result<ExecutionOutcome>>;

struct Waiter {
    ticket: u64,
    family: Family,
    created_at: Instant,
    slot: Slot,
    /// Ticket of the waiter this one pushed into `superseded`.
    supersedes: Option<u64>,
}

#[derive(Default)]
struct Entries {
    active: HashMap<CorrelationKey, Waiter>,
    /// Latest-scheme waiters replaced by a newer registration. They can no
    /// longer be matched by a reply and only leave via expiry or fail-out.
    superseded: HashMap<u64, Waiter>,
}

#[derive(Default)]
pub struct CorrelationTable {
    entries: Mutex<Entries>,
    next_ticket: AtomicU64,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a waiter for `key`.
    ///
    /// An existing waiter under the same key is superseded: it stays alive
    /// but will never be resolved by a reply, so it runs into its timeout.
    pub async fn register(&self, key: CorrelationKey, family: Family, timeout: Duration) -> PendingRequest {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let created_at = Instant::now();
        let (slot, rx) = oneshot::channel();

        let mut entries = self.entries.lock().await;
        let supersedes = entries.active.get(&key).map(|w| w.ticket);
        let waiter = Waiter {
            ticket,
            family,
            created_at,
            slot,
            supersedes,
        };
        if let Some(previous) = entries.active.insert(key.clone(), waiter) {
            warn!(
                key = %key,
                superseded_ticket = previous.ticket,
                "Registration replaced a waiter that is still in flight; it will time out"
            );
            entries.superseded.insert(previous.ticket, previous);
        }
        debug!(key = %key, ticket, "Registered pending request");

        PendingRequest {
            key,
            ticket,
            created_at,
            timeout,
            state: RequestState::Created,
            rx,
        }
    }

    /// Complete the waiter under `key`. Absent keys are a no-op.
    pub async fn resolve(&self, key: &CorrelationKey, outcome: Result<ExecutionOutcome>) -> bool {
        let waiter = self.entries.lock().await.active.remove(key);
        match waiter {
            Some(waiter) => {
                debug!(key = %key, ticket = waiter.ticket, "Resolved pending request");
                let _ = waiter.slot.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Complete the most recently registered active waiter of `family`.
    pub async fn resolve_latest(&self, family: Family, outcome: Result<ExecutionOutcome>) -> bool {
        let waiter = {
            let mut entries = self.entries.lock().await;
            let key = entries
                .active
                .iter()
                .filter(|(_, w)| w.family == family)
                .max_by_key(|(_, w)| w.ticket)
                .map(|(k, _)| k.clone());
            key.and_then(|k| entries.active.remove(&k).map(|w| (k, w)))
        };
        match waiter {
            Some((key, waiter)) => {
                debug!(key = %key, ticket = waiter.ticket, "Resolved latest pending request");
                let _ = waiter.slot.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Time out the waiter identified by `key` and `ticket`.
    ///
    /// Returns false when something else already completed it.
    pub async fn expire(&self, key: &CorrelationKey, ticket: u64) -> bool {
        let waiter = self.take(key, ticket).await;
        match waiter {
            Some(waiter) => {
                let elapsed = waiter.created_at.elapsed();
                debug!(key = %key, ticket, elapsed_ms = elapsed.as_millis() as u64, "Pending request expired");
                let _ = waiter.slot.send(Err(Error::Timeout {
                    operation: key.to_string(),
                    elapsed,
                }));
                true
            }
            None => false,
        }
    }

    /// Withdraw a waiter whose frame never made it onto the wire.
    ///
    /// A waiter it superseded is put back under `key`, since the withdrawn
    /// request never reached the server and cannot claim its reply.
    pub async fn cancel(&self, key: &CorrelationKey, ticket: u64, reason: &str) -> bool {
        let waiter = {
            let mut entries = self.entries.lock().await;
            let (waiter, was_active) = take_locked(&mut entries, key, ticket);
            if was_active {
                let restored = waiter
                    .as_ref()
                    .and_then(|w| w.supersedes)
                    .and_then(|previous| entries.superseded.remove(&previous));
                if let Some(previous) = restored {
                    debug!(key = %key, ticket = previous.ticket, "Restored superseded waiter");
                    entries.active.insert(key.clone(), previous);
                }
            }
            waiter
        };
        match waiter {
            Some(waiter) => {
                let _ = waiter.slot.send(Err(Error::Connection(reason.to_string())));
                true
            }
            None => false,
        }
    }

    /// Fail every waiter, superseded ones included. Returns how many there were.
    pub async fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<Waiter> = {
            let mut entries = self.entries.lock().await;
            let mut drained: Vec<Waiter> = entries.active.drain().map(|(_, w)| w).collect();
            drained.extend(entries.superseded.drain().map(|(_, w)| w));
            drained
        };
        let count = drained.len();
        for waiter in drained {
            let _ = waiter.slot.send(Err(Error::Connection(reason.to_string())));
        }
        if count > 0 {
            warn!(count, reason = %reason, "Failed out pending requests");
        }
        count
    }

    /// Waiters that can still be completed, superseded ones included.
    pub async fn len(&self) -> usize {
        let entries = self.entries.lock().await;
        entries.active.len() + entries.superseded.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, key: &CorrelationKey) -> bool {
        self.entries.lock().await.active.contains_key(key)
    }

    async fn take(&self, key: &CorrelationKey, ticket: u64) -> Option<Waiter> {
        let mut entries = self.entries.lock().await;
        take_locked(&mut entries, key, ticket).0
    }
}

/// Remove the waiter holding `ticket`; the flag tells whether it was active.
fn take_locked(entries: &mut Entries, key: &CorrelationKey, ticket: u64) -> (Option<Waiter>, bool) {
    if entries.active.get(key).map(|w| w.ticket) == Some(ticket) {
        (entries.active.remove(key), true)
    } else {
        (entries.superseded.remove(&ticket), false)
    }
}

/// Caller-side handle of a registered request.
pub struct PendingRequest {
    key: CorrelationKey,
    ticket: u64,
    created_at: Instant,
    timeout: Duration,
    state: RequestState,
    rx: oneshot::Receiver<Result<ExecutionOutcome>>,
}

impl PendingRequest {
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn mark_sent(&mut self) {
        if self.state == RequestState::Created {
            self.state = RequestState::Sent;
        }
    }

    /// Wait for the slot to be completed, expiring the request at its deadline.
    ///
    /// The entry is gone from `table` when this returns, whatever the result.
    pub async fn wait(mut self, table: &CorrelationTable) -> Result<ExecutionOutcome> {
        let deadline = self.created_at + self.timeout;
        let completed = match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Connection(
                "Result slot dropped without completion".to_string(),
            )),
            Err(_) => {
                // Whoever removed the entry completes the slot right after,
                // so this second wait is immediate.
                table.expire(&self.key, self.ticket).await;
                match (&mut self.rx).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout {
                        operation: self.key.to_string(),
                        elapsed: self.created_at.elapsed(),
                    }),
                }
            }
        };

        self.state = match &completed {
            Ok(_) => RequestState::Resolved,
            Err(Error::Timeout { .. }) => RequestState::TimedOut,
            Err(_) => RequestState::Failed,
        };
        debug!(key = %self.key, ticket = self.ticket, state = ?self.state, "Pending request finished");
        completed
    }
}
