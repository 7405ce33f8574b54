//! Correlation of worker responses with the calls waiting for them
//!
//! The router task is the only consumer of the primary line queue and the
//! only place that resolves a pending call with a worker reply. Callers never
//! read the queue themselves; they wait on a per-call completion handle.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::protocol::{InboundMessage, MessageError, Reply};
use super::reader::preview;

/// Stand-in deadline for timeouts too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// In-flight call awaiting its response.
#[derive(Debug)]
pub struct PendingCall {
    pub id: u64,
    pub method: String,
    pub params: Value,
    pub created_at: Instant,
    pub deadline: Instant,
    slot: oneshot::Sender<Reply>,
}

impl PendingCall {
    /// Create the record and the receiving half of its completion slot.
    pub fn new(
        id: u64,
        method: impl Into<String>,
        params: Value,
        timeout: Duration,
    ) -> (Self, oneshot::Receiver<Reply>) {
        let (slot, receiver) = oneshot::channel();
        let created_at = Instant::now();
        let call = Self {
            id,
            method: method.into(),
            params,
            created_at,
            deadline: deadline_after(created_at, timeout),
            slot,
        };
        (call, receiver)
    }

    /// Resolve the call. Consumes the record so it can happen only once.
    fn resolve(self, reply: Reply) -> bool {
        self.slot.send(reply).is_ok()
    }
}

/// `start + timeout`, saturating to a far-future instant on overflow.
fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .filter(|_| timeout <= FAR_FUTURE)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Mapping from correlation id to the single call awaiting it.
///
/// The lock is held only for the insert or remove itself, never while a
/// caller waits.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<u64, PendingCall>>,
}

/// Error returned when registering an id that is already pending.
#[derive(Debug, thiserror::Error)]
#[error("correlation id {0} is already registered")]
pub struct DuplicateId(pub u64);

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingCall>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, call: PendingCall) -> Result<(), DuplicateId> {
        let mut pending = self.pending();
        if pending.contains_key(&call.id) {
            return Err(DuplicateId(call.id));
        }
        pending.insert(call.id, call);
        Ok(())
    }

    /// Remove an entry without resolving it (timeout or abandoned call).
    pub fn remove(&self, id: u64) -> Option<PendingCall> {
        self.pending().remove(&id)
    }

    /// Remove the entry for `id` and hand it `reply`.
    /// Returns false when no call is registered for `id`.
    pub fn deliver(&self, id: u64, reply: Reply) -> bool {
        let call = self.pending().remove(&id);
        match call {
            Some(call) => {
                let method = call.method.clone();
                let elapsed = call.created_at.elapsed();
                if call.resolve(reply) {
                    tracing::info!(
                        "Received response for ID {} ({}) after {:?}",
                        id,
                        method,
                        elapsed
                    );
                } else {
                    tracing::debug!("Caller for ID {} stopped waiting before delivery", id);
                }
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.pending().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }
}

/// Removes its id from the table when dropped, so a call that stops
/// waiting for any reason leaves nothing behind.
pub struct PendingGuard {
    table: Arc<CorrelationTable>,
    id: u64,
}

impl PendingGuard {
    pub fn new(table: Arc<CorrelationTable>, id: u64) -> Self {
        Self { table, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

/// What the router did with one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered(u64),
    /// Well-formed, but no call is waiting for this id
    Unmatched(u64),
    /// Not a response envelope; discarded
    Malformed,
}

/// Parse one line and deliver it to its waiting call, if any.
pub fn route_line(table: &CorrelationTable, line: &str) -> RouteOutcome {
    match InboundMessage::parse(line) {
        Ok(message) => {
            let id = message.id;
            if table.deliver(id, message.reply) {
                RouteOutcome::Delivered(id)
            } else {
                tracing::debug!(
                    "Ignoring response for unknown or expired ID {}: {}",
                    id,
                    preview(line)
                );
                RouteOutcome::Unmatched(id)
            }
        }
        Err(MessageError::Malformed(_)) => {
            tracing::warn!("Received non-JSON line from worker stdout: {}", preview(line));
            RouteOutcome::Malformed
        }
        Err(e) => {
            tracing::debug!("Ignoring non-response message ({}): {}", e, preview(line));
            RouteOutcome::Malformed
        }
    }
}

/// Drain the primary queue until every sender is gone.
pub async fn run_router(mut lines: mpsc::Receiver<String>, table: Arc<CorrelationTable>) {
    let mut delivered = 0usize;
    let mut discarded = 0usize;
    while let Some(line) = lines.recv().await {
        match route_line(&table, &line) {
            RouteOutcome::Delivered(_) => delivered += 1,
            RouteOutcome::Unmatched(_) | RouteOutcome::Malformed => discarded += 1,
        }
    }
    tracing::info!(
        "Response router finished ({} delivered, {} discarded)",
        delivered,
        discarded
    );
}

pub fn spawn_router(lines: mpsc::Receiver<String>, table: Arc<CorrelationTable>) -> JoinHandle<()> {
    tokio::spawn(run_router(lines, table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn register(table: &CorrelationTable, id: u64) -> oneshot::Receiver<Reply> {
        let (call, rx) = PendingCall::new(id, "echo", json!({}), Duration::from_secs(5));
        table.register(call).unwrap();
        rx
    }

    #[test]
    fn test_huge_timeout_saturates_deadline() {
        let (call, _rx) = PendingCall::new(1, "echo", json!({}), Duration::MAX);
        assert_eq!(call.deadline, call.created_at + FAR_FUTURE);

        let (call, _rx) = PendingCall::new(2, "echo", json!({}), Duration::from_secs(3));
        assert_eq!(call.deadline, call.created_at + Duration::from_secs(3));
    }

    #[test]
    fn test_route_delivers_to_matching_call() {
        let table = CorrelationTable::new();
        let mut rx = register(&table, 1);

        assert_eq!(
            route_line(&table, r#"{"id":1,"result":"hi"}"#),
            RouteOutcome::Delivered(1)
        );
        assert_eq!(rx.try_recv().unwrap(), Reply::Result(json!("hi")));
        assert!(table.is_empty());
    }

    #[test]
    fn test_out_of_order_responses_reach_their_own_callers() {
        let table = CorrelationTable::new();
        let mut first = register(&table, 1);
        let mut second = register(&table, 2);

        route_line(&table, r#"{"id":2,"result":"two"}"#);
        route_line(&table, r#"{"id":1,"result":"one"}"#);

        assert_eq!(first.try_recv().unwrap(), Reply::Result(json!("one")));
        assert_eq!(second.try_recv().unwrap(), Reply::Result(json!("two")));
    }

    #[test]
    fn test_unmatched_id_leaves_other_calls_pending() {
        let table = CorrelationTable::new();
        let mut rx = register(&table, 1);

        assert_eq!(
            route_line(&table, r#"{"id":99,"result":"stray"}"#),
            RouteOutcome::Unmatched(99)
        );
        assert!(table.contains(1));
        assert!(rx.try_recv().is_err());

        route_line(&table, r#"{"id":1,"result":"mine"}"#);
        assert_eq!(rx.try_recv().unwrap(), Reply::Result(json!("mine")));
    }

    #[test]
    fn test_malformed_line_is_discarded() {
        let table = CorrelationTable::new();
        let mut rx = register(&table, 1);

        assert_eq!(route_line(&table, "INFO starting up"), RouteOutcome::Malformed);
        assert_eq!(route_line(&table, r#"{"no":"id"}"#), RouteOutcome::Malformed);
        assert!(table.contains(1));

        route_line(&table, r#"{"id":1,"result":true}"#);
        assert_eq!(rx.try_recv().unwrap(), Reply::Result(json!(true)));
    }

    #[test]
    fn test_second_response_for_same_id_is_unmatched() {
        let table = CorrelationTable::new();
        let _rx = register(&table, 5);
        assert_eq!(
            route_line(&table, r#"{"id":5,"result":1}"#),
            RouteOutcome::Delivered(5)
        );
        assert_eq!(
            route_line(&table, r#"{"id":5,"result":2}"#),
            RouteOutcome::Unmatched(5)
        );
    }

    #[test]
    fn test_removed_id_discards_late_response() {
        let table = CorrelationTable::new();
        let _rx = register(&table, 3);
        assert!(table.remove(3).is_some());
        assert_eq!(
            route_line(&table, r#"{"id":3,"result":"late"}"#),
            RouteOutcome::Unmatched(3)
        );
    }

    #[test]
    fn test_register_rejects_duplicate_id() {
        let table = CorrelationTable::new();
        let _rx = register(&table, 8);
        let (dup, _dup_rx) = PendingCall::new(8, "echo", json!({}), Duration::from_secs(1));
        assert!(matches!(table.register(dup), Err(DuplicateId(8))));
    }

    #[test]
    fn test_guard_removes_entry_on_drop() {
        let table = Arc::new(CorrelationTable::new());
        let _rx = register(&table, 11);
        {
            let guard = PendingGuard::new(Arc::clone(&table), 11);
            assert_eq!(guard.id(), 11);
        }
        assert!(!table.contains(11));
    }

    #[test]
    fn test_delivery_to_abandoned_receiver_still_clears_entry() {
        let table = CorrelationTable::new();
        let rx = register(&table, 4);
        drop(rx);
        assert_eq!(
            route_line(&table, r#"{"id":4,"result":null}"#),
            RouteOutcome::Delivered(4)
        );
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_router_task_consumes_queue_until_closed() {
        let table = Arc::new(CorrelationTable::new());
        let rx = register(&table, 1);
        let (tx, lines) = mpsc::channel(8);
        let router = spawn_router(lines, Arc::clone(&table));

        tx.send("garbage".to_string()).await.unwrap();
        tx.send(r#"{"id":1,"result":"routed"}"#.to_string())
            .await
            .unwrap();

        assert_eq!(rx.await.unwrap(), Reply::Result(json!("routed")));
        drop(tx);
        router.await.unwrap();
    }
}
