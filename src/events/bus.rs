use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::WebhookResult;
use crate::exec::ExecResult;

const BUS_DEPTH: usize = 256;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

enum BusEvent {
    Webhook(WebhookResult),
    Exec(ExecResult),
    WatchUuid(UuidWatch),
}

struct CommitWatch {
    id: u64,
    commit: String,
    tx: oneshot::Sender<WebhookResult>,
}

struct UuidWatch {
    id: u64,
    correlation_id: String,
    tx: oneshot::Sender<ExecResult>,
}

/// Correlation state shared between the dispatcher and waiters.
///
/// `outstanding` counts correlations in flight: it is taken when a commit
/// watch is registered and given back once that correlation ends, whether at
/// the commit stage or the uuid stage. Whoever removes the final table entry
/// gives it back.
#[derive(Default)]
struct Tables {
    commit_watches: Vec<CommitWatch>,
    uuid_watches: Vec<UuidWatch>,
    seen: Vec<ExecResult>,
    /// Uuid registrations whose waiter gave up before the dispatcher saw them.
    abandoned: HashSet<u64>,
    outstanding: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusSnapshot {
    pub commit_watches: usize,
    pub uuid_watches: usize,
    pub seen_ids: usize,
    pub outstanding_watches: usize,
}

/// Handle to the dispatcher. Clones share the same tables.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<BusEvent>,
    tables: Arc<Mutex<Tables>>,
    next_id: Arc<AtomicU64>,
}

// ---------------------------------------------------------------------------
// Table bookkeeping
// ---------------------------------------------------------------------------

impl Tables {
    fn release(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.outstanding == 0 {
            self.seen.clear();
        }
    }

    fn remove_commit(&mut self, id: u64) -> bool {
        let before = self.commit_watches.len();
        self.commit_watches.retain(|w| w.id != id);
        self.commit_watches.len() != before
    }

    fn remove_uuid(&mut self, id: u64) -> bool {
        let before = self.uuid_watches.len();
        self.uuid_watches.retain(|w| w.id != id);
        self.uuid_watches.len() != before
    }

    fn handle(&mut self, event: BusEvent) {
        match event {
            BusEvent::Webhook(result) => {
                let (matched, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.commit_watches)
                    .into_iter()
                    .partition(|w| result.commit_ids.contains(&w.commit));
                self.commit_watches = waiting;
                if matched.is_empty() {
                    tracing::debug!(
                        correlation_id = %result.correlation_id,
                        "webhook matched no commit watch"
                    );
                }
                for watch in matched {
                    tracing::debug!(commit = %watch.commit, correlation_id = %result.correlation_id, "commit watch matched");
                    // The correlation continues into the uuid stage.
                    let _ = watch.tx.send(result.clone());
                }
            }
            BusEvent::Exec(result) => {
                if self.outstanding == 0 {
                    return;
                }
                if let Some(pos) = self
                    .uuid_watches
                    .iter()
                    .position(|w| w.correlation_id == result.correlation_id)
                {
                    let watch = self.uuid_watches.remove(pos);
                    let _ = watch.tx.send(result);
                    self.release();
                } else {
                    self.seen.push(result);
                }
            }
            BusEvent::WatchUuid(watch) => {
                if self.abandoned.remove(&watch.id) {
                    return;
                }
                if let Some(pos) = self
                    .seen
                    .iter()
                    .position(|r| r.correlation_id == watch.correlation_id)
                {
                    let result = self.seen.remove(pos);
                    let _ = watch.tx.send(result);
                    self.release();
                } else {
                    self.uuid_watches.push(watch);
                }
            }
        }
    }
}

fn lock(tables: &Mutex<Tables>) -> MutexGuard<'_, Tables> {
    tables.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

impl EventBus {
    /// Spawn the dispatcher. It runs until every handle is dropped.
    pub fn start() -> Self {
        let (tx, mut rx) = mpsc::channel(BUS_DEPTH);
        let tables = Arc::new(Mutex::new(Tables::default()));

        let dispatch_tables = Arc::clone(&tables);
        tokio::spawn(async move {
            tracing::debug!("event bus dispatcher started");
            while let Some(event) = rx.recv().await {
                lock(&dispatch_tables).handle(event);
            }
            tracing::debug!("event bus dispatcher stopped");
        });

        Self {
            tx,
            tables,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn publish_webhook(&self, result: WebhookResult) {
        if self.tx.send(BusEvent::Webhook(result)).await.is_err() {
            tracing::warn!("event bus closed, webhook result dropped");
        }
    }

    pub async fn publish_exec(&self, result: ExecResult) {
        if self.tx.send(BusEvent::Exec(result)).await.is_err() {
            tracing::warn!("event bus closed, exec result dropped");
        }
    }

    /// Feed every result from an exec broadcast into the bus.
    pub fn forward_exec_results(&self, mut results: broadcast::Receiver<ExecResult>) {
        let bus = self.clone();
        tokio::spawn(async move {
            loop {
                match results.recv().await {
                    Ok(result) => bus.publish_exec(result).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "event bus fell behind exec results");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Start tracking a pushed commit.
    pub fn watch_commit(&self, commit: &str) -> CommitWait {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut tables = lock(&self.tables);
            tables.commit_watches.push(CommitWatch {
                id,
                commit: commit.to_owned(),
                tx,
            });
            tables.outstanding += 1;
        }
        CommitWait {
            bus: self.clone(),
            id,
            rx,
            armed: true,
        }
    }

    pub fn snapshot(&self) -> BusSnapshot {
        let tables = lock(&self.tables);
        BusSnapshot {
            commit_watches: tables.commit_watches.len(),
            uuid_watches: tables.uuid_watches.len(),
            seen_ids: tables.seen.len(),
            outstanding_watches: tables.outstanding,
        }
    }
}

// ---------------------------------------------------------------------------
// Waiter handles
// ---------------------------------------------------------------------------

/// A registered commit watch. Dropping it deregisters the watch.
pub struct CommitWait {
    bus: EventBus,
    id: u64,
    rx: oneshot::Receiver<WebhookResult>,
    armed: bool,
}

impl CommitWait {
    /// Wait for a webhook carrying the commit. On a match the correlation
    /// moves on to the uuid stage; `None` means the wait timed out.
    pub async fn wait(mut self, timeout: Duration) -> Option<(WebhookResult, Correlation)> {
        if let Ok(Ok(result)) = tokio::time::timeout(timeout, &mut self.rx).await {
            self.armed = false;
            return Some((result, Correlation::new(self.bus.clone())));
        }
        let late = self.abandon();
        late.map(|result| (result, Correlation::new(self.bus.clone())))
    }

    /// Deregister. A result delivered concurrently with the removal is
    /// returned and its correlation stays open for the caller.
    fn abandon(&mut self) -> Option<WebhookResult> {
        self.armed = false;
        let mut tables = lock(&self.bus.tables);
        if tables.remove_commit(self.id) {
            tables.release();
            return None;
        }
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(_) => {
                tables.release();
                None
            }
        }
    }
}

impl Drop for CommitWait {
    fn drop(&mut self) {
        if self.armed && self.abandon().is_some() {
            lock(&self.bus.tables).release();
        }
    }
}

/// An open correlation whose webhook has arrived.
pub struct Correlation {
    bus: EventBus,
    armed: bool,
}

impl Correlation {
    fn new(bus: EventBus) -> Self {
        Self { bus, armed: true }
    }

    /// Ask the dispatcher for the exec result carrying `correlation_id`,
    /// whether it already arrived or is still to come.
    pub async fn watch_uuid(mut self, correlation_id: &str) -> UuidWait {
        let id = self.bus.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.armed = false;
        let wait = UuidWait {
            bus: self.bus.clone(),
            id,
            rx,
            armed: true,
        };
        let registration = BusEvent::WatchUuid(UuidWatch {
            id,
            correlation_id: correlation_id.to_owned(),
            tx,
        });
        if self.bus.tx.send(registration).await.is_err() {
            tracing::warn!(%correlation_id, "event bus closed, uuid watch not registered");
        }
        wait
    }
}

impl Drop for Correlation {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.bus.tables).release();
        }
    }
}

/// A uuid watch on its way to, or inside, the dispatcher.
pub struct UuidWait {
    bus: EventBus,
    id: u64,
    rx: oneshot::Receiver<ExecResult>,
    armed: bool,
}

impl UuidWait {
    /// `None` means the wait timed out.
    pub async fn wait(mut self, timeout: Duration) -> Option<ExecResult> {
        if let Ok(Ok(result)) = tokio::time::timeout(timeout, &mut self.rx).await {
            self.armed = false;
            return Some(result);
        }
        self.abandon()
    }

    fn abandon(&mut self) -> Option<ExecResult> {
        self.armed = false;
        let mut tables = lock(&self.bus.tables);
        if tables.remove_uuid(self.id) {
            tables.release();
            return None;
        }
        if let Ok(result) = self.rx.try_recv() {
            return Some(result);
        }
        // Registration not dispatched yet.
        tables.abandoned.insert(self.id);
        tables.release();
        None
    }
}

impl Drop for UuidWait {
    fn drop(&mut self) {
        if self.armed {
            self.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(correlation_id: &str, exit_code: i32) -> ExecResult {
        ExecResult {
            task_name: "r10k".into(),
            correlation_id: correlation_id.into(),
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            message: format!("deploy {correlation_id} finished"),
        }
    }

    fn webhook(commits: &[&str], correlation_id: &str) -> WebhookResult {
        WebhookResult {
            event: "push".into(),
            commit_ids: commits.iter().map(|c| (*c).to_owned()).collect(),
            correlation_id: correlation_id.into(),
        }
    }

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn exec_before_uuid_registration_is_buffered_then_delivered() {
        let bus = EventBus::start();
        let commit = bus.watch_commit("c1");
        bus.publish_webhook(webhook(&["c0", "c1"], "u1")).await;
        let (hook, correlation) = commit.wait(WAIT).await.unwrap();
        assert_eq!(hook.correlation_id, "u1");

        // Same channel, so the dispatcher sees the result first.
        bus.publish_exec(exec("u1", 0)).await;
        let uuid = correlation.watch_uuid("u1").await;
        let result = uuid.wait(WAIT).await.unwrap();
        assert_eq!(result.correlation_id, "u1");
        assert_eq!(bus.snapshot(), BusSnapshot::default());
    }

    #[tokio::test]
    async fn exec_after_uuid_registration_is_delivered_once() {
        let bus = EventBus::start();
        let commit = bus.watch_commit("c1");
        bus.publish_webhook(webhook(&["c1"], "u1")).await;
        let (_, correlation) = commit.wait(WAIT).await.unwrap();
        let uuid = correlation.watch_uuid("u1").await;

        bus.publish_exec(exec("u1", 0)).await;
        assert!(uuid.wait(WAIT).await.is_some());

        // A duplicate finds no watcher and nothing outstanding.
        bus.publish_exec(exec("u1", 0)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.snapshot(), BusSnapshot::default());
    }

    #[tokio::test]
    async fn unrelated_exec_results_are_not_retained_without_watchers() {
        let bus = EventBus::start();
        bus.publish_exec(exec("nobody", 0)).await;
        bus.publish_exec(exec("nobody-else", 1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.snapshot().seen_ids, 0);
    }

    #[tokio::test]
    async fn seen_ids_cleared_when_last_correlation_ends() {
        let bus = EventBus::start();
        let commit = bus.watch_commit("c1");
        bus.publish_exec(exec("stray", 0)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.snapshot().seen_ids, 1);

        assert!(commit.wait(Duration::from_millis(10)).await.is_none());
        assert_eq!(bus.snapshot(), BusSnapshot::default());
    }

    #[tokio::test]
    async fn commit_timeout_removes_watch() {
        let bus = EventBus::start();
        let commit = bus.watch_commit("deadbeef");
        assert_eq!(bus.snapshot().commit_watches, 1);
        bus.publish_webhook(webhook(&["other"], "u9")).await;
        assert!(commit.wait(Duration::from_millis(30)).await.is_none());
        assert_eq!(bus.snapshot(), BusSnapshot::default());
    }

    #[tokio::test]
    async fn uuid_timeout_releases_correlation() {
        let bus = EventBus::start();
        let commit = bus.watch_commit("c1");
        bus.publish_webhook(webhook(&["c1"], "u1")).await;
        let (_, correlation) = commit.wait(WAIT).await.unwrap();
        let uuid = correlation.watch_uuid("u1").await;
        assert!(uuid.wait(Duration::from_millis(30)).await.is_none());
        assert_eq!(bus.snapshot(), BusSnapshot::default());
    }

    #[tokio::test]
    async fn one_webhook_can_satisfy_several_commit_watches() {
        let bus = EventBus::start();
        let first = bus.watch_commit("a");
        let second = bus.watch_commit("b");
        bus.publish_webhook(webhook(&["a", "b"], "u1")).await;
        let (_, c1) = first.wait(WAIT).await.unwrap();
        let (_, c2) = second.wait(WAIT).await.unwrap();
        assert_eq!(bus.snapshot().outstanding_watches, 2);
        drop(c1);
        drop(c2);
        assert_eq!(bus.snapshot(), BusSnapshot::default());
    }

    #[tokio::test]
    async fn dropped_commit_wait_deregisters() {
        let bus = EventBus::start();
        let commit = bus.watch_commit("c1");
        drop(commit);
        assert_eq!(bus.snapshot(), BusSnapshot::default());
    }

    #[test]
    fn abandoned_registration_is_discarded_on_arrival() {
        let mut tables = Tables::default();
        let (tx, _rx) = oneshot::channel();
        tables.abandoned.insert(7);
        tables.handle(BusEvent::WatchUuid(UuidWatch {
            id: 7,
            correlation_id: "u7".into(),
            tx,
        }));
        assert!(tables.uuid_watches.is_empty());
        assert!(tables.abandoned.is_empty());
    }

    #[test]
    fn buffered_result_matched_by_registration() {
        let mut tables = Tables {
            outstanding: 1,
            ..Tables::default()
        };
        tables.handle(BusEvent::Exec(exec("u1", 2)));
        assert_eq!(tables.seen.len(), 1);

        let (tx, mut rx) = oneshot::channel();
        tables.handle(BusEvent::WatchUuid(UuidWatch {
            id: 1,
            correlation_id: "u1".into(),
            tx,
        }));
        assert_eq!(rx.try_recv().unwrap().exit_code, 2);
        assert!(tables.seen.is_empty());
        assert_eq!(tables.outstanding, 0);
    }
}
