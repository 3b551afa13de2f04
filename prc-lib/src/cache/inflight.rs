use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::{DedupeKey, ErrorKind, RawResponse, Result};

/// Identifies one dispatched request across queue and registry
pub(crate) type ItemId = u64;

type Slot = Option<Result<RawResponse>>;

/// Receives the outcome of an in-flight request
#[derive(Debug, Clone)]
pub(crate) struct Waiter(watch::Receiver<Slot>);

impl Waiter {
    /// Wait until the outcome has been published
    pub(crate) async fn outcome(mut self) -> Result<RawResponse> {
        match self.0.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone().unwrap_or(Err(ErrorKind::Cancelled)),
            Err(_) => Err(ErrorKind::Cancelled),
        }
    }
}

#[derive(Debug)]
struct Entry {
    id: ItemId,
    waiter: Waiter,
    waiters: usize,
}

/// Result of [`InFlight::begin`]
#[derive(Debug)]
pub(crate) enum Flight {
    /// No identical request was pending; the caller must dispatch one and
    /// publish its outcome through the sink
    Leader(ResultSink, Waiter),
    /// An identical request is pending; its outcome will be shared
    Joiner(Waiter),
}

/// Registry of requests which have been submitted but not yet completed.
///
/// There is at most one entry per [`DedupeKey`]. It is removed when its
/// outcome is published, so the next identical submission starts afresh.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    entries: Mutex<HashMap<DedupeKey, Entry>>,
    next_id: AtomicU64,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashMap<DedupeKey, Entry>> {
        // Entries are only modified in single statements,
        // so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the pending request for `key` or become its leader
    pub(crate) fn begin(self: &Arc<Self>, key: &DedupeKey) -> (ItemId, Flight) {
        let mut entries = self.lock();

        if let Some(entry) = entries.get_mut(key) {
            entry.waiters += 1;
            return (entry.id, Flight::Joiner(entry.waiter.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(None);
        let waiter = Waiter(receiver);
        entries.insert(
            key.clone(),
            Entry {
                id,
                waiter: waiter.clone(),
                waiters: 1,
            },
        );

        let sink = ResultSink {
            registry: Arc::clone(self),
            key: key.clone(),
            id,
            sender: Some(sender),
        };
        (id, Flight::Leader(sink, waiter))
    }

    /// Stop waiting for the request `id` of `key`.
    ///
    /// When the last waiter leaves, `cancel` is asked to withdraw the
    /// request. If it succeeds the entry is removed and the withdrawn value
    /// is returned, to be dropped after the registry is unlocked.
    /// If the request was already dispatched the entry stays, so identical
    /// submissions still share its outcome.
    pub(crate) fn leave<T>(
        &self,
        key: &DedupeKey,
        id: ItemId,
        cancel: impl FnOnce() -> Option<T>,
    ) -> Option<T> {
        let mut entries = self.lock();
        let entry = entries.get_mut(key).filter(|entry| entry.id == id)?;
        entry.waiters = entry.waiters.saturating_sub(1);
        if entry.waiters > 0 {
            return None;
        }

        let withdrawn = cancel()?;
        entries.remove(key);
        Some(withdrawn)
    }

    /// Number of callers waiting on `key`
    #[cfg(test)]
    pub(crate) fn waiters(&self, key: &DedupeKey) -> usize {
        self.lock().get(key).map_or(0, |entry| entry.waiters)
    }

    fn remove(&self, key: &DedupeKey, id: ItemId) {
        let mut entries = self.lock();
        if entries.get(key).is_some_and(|entry| entry.id == id) {
            entries.remove(key);
        }
    }
}

/// Publishes the outcome of one in-flight request to all its waiters.
///
/// Dropping a sink without completing it publishes
/// [`ErrorKind::Cancelled`], so no waiter is left hanging.
#[derive(Debug)]
pub(crate) struct ResultSink {
    registry: Arc<InFlight>,
    key: DedupeKey,
    id: ItemId,
    sender: Option<watch::Sender<Slot>>,
}

impl ResultSink {
    pub(crate) fn key(&self) -> &DedupeKey {
        &self.key
    }

    /// Clear the in-flight entry and hand `outcome` to every waiter
    pub(crate) fn complete(mut self, outcome: Result<RawResponse>) {
        self.publish(outcome);
    }

    fn publish(&mut self, outcome: Result<RawResponse>) {
        if let Some(sender) = self.sender.take() {
            self.registry.remove(&self.key, self.id);
            sender.send_replace(Some(outcome));
        }
    }
}

impl Drop for ResultSink {
    fn drop(&mut self) {
        self.publish(Err(ErrorKind::Cancelled));
    }
}
