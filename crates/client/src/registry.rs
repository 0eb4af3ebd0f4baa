//! Correlation registry
//!
//! Two waiter tables with the same shape: subscription acks and command-op
//! replies, each keyed by the client-generated request id. An entry holds a
//! single-use result slot, so at most one value ever reaches a waiter no
//! matter how notify and fail-all interleave: whoever removes the entry from
//! the table is the only one able to deliver.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{debug, trace};

use crate::error::ClientError;
use crate::frame::{Arg, EventFrame, OpReply, EVENT_ERROR, EVENT_SUBSCRIBE, EVENT_UNSUBSCRIBE};
use crate::shutdown;

/// What a correlation entry is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    Subscribe,
    Unsubscribe,
    Op,
}

impl WaitKind {
    fn describe(self) -> &'static str {
        match self {
            WaitKind::Subscribe => "subscribe ack",
            WaitKind::Unsubscribe => "unsubscribe ack",
            WaitKind::Op => "op reply",
        }
    }

    fn event(self) -> Option<&'static str> {
        match self {
            WaitKind::Subscribe => Some(EVENT_SUBSCRIBE),
            WaitKind::Unsubscribe => Some(EVENT_UNSUBSCRIBE),
            WaitKind::Op => None,
        }
    }
}

type Slot<T> = oneshot::Sender<Result<T, ClientError>>;

struct Entry<T> {
    kind: WaitKind,
    remaining: HashSet<String>,
    slot: Slot<T>,
}

struct Table<T> {
    entries: Mutex<HashMap<String, Entry<T>>>,
}

impl<T> Table<T> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(
        self: &Arc<Self>,
        id: String,
        kind: WaitKind,
        remaining: HashSet<String>,
    ) -> Result<Pending<T>, ClientError> {
        let (slot, rx) = oneshot::channel();
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return Err(ClientError::InvalidArgument(format!(
                "request id {} is already awaiting a reply",
                id
            )));
        }
        entries.insert(
            id.clone(),
            Entry {
                kind,
                remaining,
                slot,
            },
        );
        Ok(Pending {
            id,
            kind,
            table: Arc::clone(self),
            rx,
        })
    }

    fn remove(&self, id: &str) -> Option<Entry<T>> {
        self.lock().remove(id)
    }

    fn drain(&self) -> Vec<Entry<T>> {
        self.lock().drain().map(|(_, entry)| entry).collect()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Deliver without blocking. A closed receiver means the waiter already gave up.
fn deliver<T>(entry: Entry<T>, result: Result<T, ClientError>) {
    if entry.slot.send(result).is_err() {
        trace!(kind = ?entry.kind, "waiter gone before delivery");
    }
}

/// A registered waiter. Dropping it deregisters the entry.
pub struct Pending<T> {
    id: String,
    kind: WaitKind,
    table: Arc<Table<T>>,
    rx: oneshot::Receiver<Result<T, ClientError>>,
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl<T> Pending<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the result, racing `timeout` and the shutdown signal.
    pub async fn wait(
        mut self,
        timeout: Duration,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<T, ClientError> {
        tokio::select! {
            result = &mut self.rx => match result {
                Ok(result) => result,
                Err(_) => Err(ClientError::Disconnected(
                    "correlation entry discarded".to_string(),
                )),
            },
            _ = tokio::time::sleep(timeout) => {
                debug!(id = %self.id, kind = ?self.kind, "wait timed out");
                Err(ClientError::Timeout {
                    what: self.kind.describe(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            _ = shutdown::cancelled(shutdown_rx) => Err(ClientError::Shutdown),
        }
    }
}

impl<T> Drop for Pending<T> {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

/// Subscription-ack and op-reply waiter tables.
pub struct Registry {
    acks: Arc<Table<()>>,
    ops: Arc<Table<OpReply>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            acks: Arc::new(Table::new()),
            ops: Arc::new(Table::new()),
        }
    }

    /// Register a subscribe/unsubscribe waiter expecting one ack per arg.
    pub fn register_ack(
        &self,
        id: impl Into<String>,
        kind: WaitKind,
        args: &[Arg],
    ) -> Result<Pending<()>, ClientError> {
        if kind == WaitKind::Op {
            return Err(ClientError::InvalidArgument(
                "op replies are registered with register_op".to_string(),
            ));
        }
        let remaining = args.iter().map(Arg::key).collect();
        self.acks.insert(id.into(), kind, remaining)
    }

    pub fn register_op(&self, id: impl Into<String>) -> Result<Pending<OpReply>, ClientError> {
        self.ops.insert(id.into(), WaitKind::Op, HashSet::new())
    }

    /// Route an event to its waiter. Returns false if nothing was waiting on it.
    ///
    /// Acks tick off one topic at a time and resolve once every expected
    /// topic has been acknowledged. An error event resolves the waiter
    /// immediately, whichever table holds the id.
    pub fn notify_event(&self, event: &EventFrame) -> bool {
        if event.id.is_empty() {
            return false;
        }

        if event.event == EVENT_ERROR {
            let error = || ClientError::Server {
                code: event.code.clone(),
                msg: event.msg.clone(),
            };
            if let Some(entry) = self.acks.remove(&event.id) {
                deliver(entry, Err(error()));
                return true;
            }
            if let Some(entry) = self.ops.remove(&event.id) {
                deliver(entry, Err(error()));
                return true;
            }
            return false;
        }

        let resolved = {
            let mut entries = self.acks.lock();
            let Some(entry) = entries.get_mut(&event.id) else {
                return false;
            };
            if entry.kind.event() != Some(event.event.as_str()) {
                return false;
            }
            match &event.arg {
                Some(arg) => {
                    entry.remaining.remove(&arg.key());
                }
                None => entry.remaining.clear(),
            }
            if entry.remaining.is_empty() {
                entries.remove(&event.id)
            } else {
                None
            }
        };

        if let Some(entry) = resolved {
            deliver(entry, Ok(()));
        }
        true
    }

    /// Route an op reply to its waiter. Non-zero codes resolve as `OpFailed`.
    pub fn notify_op(&self, reply: OpReply) -> bool {
        let Some(entry) = self.ops.remove(&reply.id) else {
            return false;
        };
        let result = if reply.is_success() {
            Ok(reply)
        } else {
            Err(ClientError::OpFailed {
                op: reply.op.clone(),
                code: reply.code.clone(),
                msg: reply.msg.clone(),
                reply: Box::new(reply),
            })
        };
        deliver(entry, result);
        true
    }

    /// Fail every outstanding entry in both tables. Returns how many were failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let acks = self.acks.drain();
        let ops = self.ops.drain();
        let failed = acks.len() + ops.len();
        for entry in acks {
            deliver(entry, Err(ClientError::Disconnected(reason.to_string())));
        }
        for entry in ops {
            deliver(entry, Err(ClientError::Disconnected(reason.to_string())));
        }
        if failed > 0 {
            debug!(failed, reason, "failed outstanding correlation entries");
        }
        failed
    }

    pub fn pending(&self) -> usize {
        self.acks.len() + self.ops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, kind: &str, arg: Option<Arg>) -> EventFrame {
        EventFrame {
            id: id.to_string(),
            event: kind.to_string(),
            code: String::new(),
            msg: String::new(),
            arg,
            conn_id: String::new(),
        }
    }

    fn reply(id: &str, code: &str) -> OpReply {
        OpReply {
            id: id.to_string(),
            op: "order".to_string(),
            code: code.to_string(),
            msg: if code == "0" { String::new() } else { "rejected".to_string() },
            data: serde_json::json!([{"ordId": "1"}]),
            in_time: String::new(),
            out_time: String::new(),
        }
    }

    fn no_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn test_multi_topic_ack_resolves_after_last_topic() {
        let registry = Registry::new();
        let btc = Arg::new("books").with_inst_id("BTC-USDT");
        let eth = Arg::new("books").with_inst_id("ETH-USDT");
        let pending = registry
            .register_ack("1", WaitKind::Subscribe, &[btc.clone(), eth.clone()])
            .unwrap();

        assert!(registry.notify_event(&event("1", "subscribe", Some(btc))));
        assert_eq!(registry.pending(), 1);
        assert!(registry.notify_event(&event("1", "subscribe", Some(eth))));
        assert_eq!(registry.pending(), 0);

        let (_tx, mut rx) = no_shutdown();
        pending.wait(Duration::from_secs(1), &mut rx).await.unwrap();
    }

    #[tokio::test]
    async fn test_error_event_resolves_ack_with_server_error() {
        let registry = Registry::new();
        let pending = registry
            .register_ack("2", WaitKind::Subscribe, &[Arg::new("books").with_inst_id("X")])
            .unwrap();

        let mut err = event("2", "error", None);
        err.code = "60018".to_string();
        err.msg = "doesn't exist".to_string();
        assert!(registry.notify_event(&err));

        let (_tx, mut rx) = no_shutdown();
        match pending.wait(Duration::from_secs(1), &mut rx).await {
            Err(ClientError::Server { code, .. }) => assert_eq!(code, "60018"),
            other => panic!("expected Server error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mismatched_event_kind_is_ignored() {
        let registry = Registry::new();
        let _pending = registry
            .register_ack("3", WaitKind::Unsubscribe, &[Arg::new("books")])
            .unwrap();
        assert!(!registry.notify_event(&event("3", "subscribe", Some(Arg::new("books")))));
        assert!(!registry.notify_event(&event("", "unsubscribe", None)));
        assert_eq!(registry.pending(), 1);
    }

    #[tokio::test]
    async fn test_op_reply_success_and_failure() {
        let registry = Registry::new();
        let ok = registry.register_op("10").unwrap();
        let bad = registry.register_op("11").unwrap();

        assert!(registry.notify_op(reply("10", "0")));
        assert!(registry.notify_op(reply("11", "1")));
        assert!(!registry.notify_op(reply("12", "0")));

        let (_tx, mut rx) = no_shutdown();
        let reply = ok.wait(Duration::from_secs(1), &mut rx).await.unwrap();
        assert_eq!(reply.data[0]["ordId"], "1");
        match bad.wait(Duration::from_secs(1), &mut rx).await {
            Err(ClientError::OpFailed { op, code, reply, .. }) => {
                assert_eq!(op, "order");
                assert_eq!(code, "1");
                assert_eq!(reply.id, "11");
            }
            other => panic!("expected OpFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delivery_is_at_most_once() {
        let registry = Registry::new();
        let pending = registry.register_op("20").unwrap();

        assert!(registry.notify_op(reply("20", "0")));
        assert_eq!(registry.fail_all("late"), 0);
        assert!(!registry.notify_op(reply("20", "1")));

        let (_tx, mut rx) = no_shutdown();
        assert!(pending.wait(Duration::from_secs(1), &mut rx).await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_all_delivers_disconnected() {
        let registry = Registry::new();
        let ack = registry
            .register_ack("30", WaitKind::Subscribe, &[Arg::new("books")])
            .unwrap();
        let op = registry.register_op("31").unwrap();

        assert_eq!(registry.fail_all("connection lost"), 2);
        assert_eq!(registry.pending(), 0);

        let (_tx, mut rx) = no_shutdown();
        assert!(matches!(
            ack.wait(Duration::from_secs(1), &mut rx).await,
            Err(ClientError::Disconnected(_))
        ));
        assert!(matches!(
            op.wait(Duration::from_secs(1), &mut rx).await,
            Err(ClientError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_deregisters() {
        let registry = Registry::new();
        let pending = registry.register_op("40").unwrap();
        let (_tx, mut rx) = no_shutdown();

        let result = pending.wait(Duration::from_millis(10), &mut rx).await;
        assert!(matches!(result, Err(ClientError::Timeout { what: "op reply", .. })));
        assert_eq!(registry.pending(), 0);
        assert!(!registry.notify_op(reply("40", "0")));
    }

    #[tokio::test]
    async fn test_shutdown_deregisters() {
        let registry = Registry::new();
        let pending = registry.register_op("50").unwrap();
        let (tx, mut rx) = no_shutdown();
        tx.send(true).unwrap();

        let result = pending.wait(Duration::from_secs(5), &mut rx).await;
        assert!(matches!(result, Err(ClientError::Shutdown)));
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = Registry::new();
        let _first = registry.register_op("60").unwrap();
        assert!(matches!(
            registry.register_op("60"),
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_notify_and_fail_all_deliver_once() {
        let registry = Arc::new(Registry::new());
        let mut waiters = Vec::new();
        for i in 0..64 {
            waiters.push(registry.register_op(i.to_string()).unwrap());
        }

        let notifier = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for i in 0..64 {
                    registry.notify_op(reply(&i.to_string(), "0"));
                    tokio::task::yield_now().await;
                }
            })
        };
        let failer = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                registry.fail_all("race");
            })
        };
        notifier.await.unwrap();
        failer.await.unwrap();

        let (_tx, mut rx) = no_shutdown();
        for waiter in waiters {
            let result = waiter.wait(Duration::from_secs(1), &mut rx).await;
            assert!(matches!(result, Ok(_) | Err(ClientError::Disconnected(_))));
        }
        assert_eq!(registry.pending(), 0);
    }
}
