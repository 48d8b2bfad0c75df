// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Exclusive, per-resource, timeout-bounded locks over record ids and index
//! keys, used by executors to serialize conflicting operations before they
//! are applied locally.
//!
//! Each resource has a FIFO queue of tickets; the ticket at the front holds
//! the lock. Enqueueing is synchronous, so the order in which an executor
//! *asks* for locks (its log order) is the order in which they are granted,
//! even though the waiting itself happens in separate tasks. A request for
//! several resources enqueues on all of them at once, which is what keeps
//! two multi-resource requests from deadlocking each other.

use crate::{Error, RecordId};
use async_std::future;
use futures::channel::oneshot;
use parking_lot::Mutex;
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{trace, warn};

/// A lockable resource. Record ids and index keys live in separate
/// namespaces and never conflict with each other.
#[derive(Clone, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub enum LockKey {
    Record(RecordId),
    IndexKey { index: String, key: String },
}

impl std::fmt::Debug for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockKey::Record(rid) => rid.fmt(f),
            LockKey::IndexKey { index, key } => f.write_fmt(format_args!("{}[{}]", index, key)),
        }
    }
}

struct Waiter {
    ticket: u64,
    grant: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Table {
    queues: HashMap<LockKey, VecDeque<Waiter>>,
    next_ticket: u64,
}

impl Table {
    fn enqueue(&mut self, key: LockKey) -> (u64, oneshot::Receiver<()>) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let (tx, rx) = oneshot::channel();
        let queue = self.queues.entry(key).or_insert_with(VecDeque::new);
        let mut waiter = Waiter {
            ticket,
            grant: Some(tx),
        };
        if queue.is_empty() {
            if let Some(g) = waiter.grant.take() {
                let _ = g.send(());
            }
        }
        queue.push_back(waiter);
        (ticket, rx)
    }

    // Removes `ticket` from the queue for `key`, wherever it is. If it was at
    // the front, the next waiter is granted the lock.
    fn remove(&mut self, key: &LockKey, ticket: u64) {
        let now_empty = match self.queues.get_mut(key) {
            None => return,
            Some(queue) => {
                let was_front = queue.front().map(|w| w.ticket) == Some(ticket);
                queue.retain(|w| w.ticket != ticket);
                if was_front {
                    if let Some(next) = queue.front_mut() {
                        if let Some(g) = next.grant.take() {
                            trace!("lock on {:?} passes to ticket {}", key, next.ticket);
                            let _ = g.send(());
                        }
                    }
                }
                queue.is_empty()
            }
        };
        if now_empty {
            self.queues.remove(key);
        }
    }
}

#[derive(Clone)]
pub struct LockManager {
    table: Arc<Mutex<Table>>,
    timeout: Duration,
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        LockManager {
            table: Arc::new(Mutex::new(Table::default())),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn lock_record(&self, rid: RecordId) -> Result<LockGuard, Error> {
        self.lock(LockKey::Record(rid)).await
    }

    pub async fn lock_index_key(&self, index: &str, key: &str) -> Result<LockGuard, Error> {
        self.lock(LockKey::IndexKey {
            index: index.to_string(),
            key: key.to_string(),
        })
        .await
    }

    pub async fn lock(&self, key: LockKey) -> Result<LockGuard, Error> {
        let mut keys = BTreeSet::new();
        keys.insert(key);
        let mut guards = self.enqueue_all(keys).acquire().await?;
        guards.pop().ok_or(Error::Execution("no lock granted".to_string()))
    }

    /// Takes a place in the queue of every key right away; the returned
    /// request is then awaited (with the manager's timeout) to get the
    /// guards. Keys are queued in their sorted order.
    pub fn enqueue_all(&self, keys: BTreeSet<LockKey>) -> LockRequest {
        let mut table = self.table.lock();
        let waiting = keys
            .into_iter()
            .map(|key| {
                let (ticket, rx) = table.enqueue(key.clone());
                (key, ticket, rx)
            })
            .collect();
        LockRequest {
            manager: self.clone(),
            waiting,
        }
    }

    /// Number of resources currently held or waited on.
    pub fn contended(&self) -> usize {
        self.table.lock().queues.len()
    }
}

/// Queue positions for a set of keys, not yet granted. Dropping it gives up
/// every position that hasn't been turned into a [LockGuard].
pub struct LockRequest {
    manager: LockManager,
    waiting: VecDeque<(LockKey, u64, oneshot::Receiver<()>)>,
}

impl LockRequest {
    /// Waits for every lock in the request, all of them together bounded by
    /// the manager's timeout. On timeout, every lock already granted is
    /// released and the retryable [Error::LockTimeout] returned.
    pub async fn acquire(mut self) -> Result<Vec<LockGuard>, Error> {
        let deadline = Instant::now() + self.manager.timeout;
        let mut guards = Vec::new();
        while let Some((key, ticket, rx)) = self.waiting.pop_front() {
            let left = deadline.saturating_duration_since(Instant::now());
            let res = future::timeout(left, rx).await;
            let guard = LockGuard {
                manager: self.manager.clone(),
                key: key.clone(),
                ticket,
                released: false,
            };
            match res {
                Ok(Ok(())) => guards.push(guard),
                _ => {
                    // Granted right as the timeout fired is as good as timed
                    // out: releasing the ticket hands the lock on either way.
                    trace!("timed out waiting for {:?}", key);
                    guard.release();
                    for g in guards {
                        g.release();
                    }
                    return Err(Error::LockTimeout(format!("{:?}", key)));
                }
            }
        }
        Ok(guards)
    }
}

impl Drop for LockRequest {
    fn drop(&mut self) {
        if self.waiting.is_empty() {
            return;
        }
        let mut table = self.manager.table.lock();
        for (key, ticket, _) in self.waiting.drain(..) {
            table.remove(&key, ticket);
        }
    }
}

/// Ownership of one lock. Release it with [LockGuard::release] on every exit
/// path; a guard dropped without release still frees the lock, but complains.
pub struct LockGuard {
    manager: LockManager,
    key: LockKey,
    ticket: u64,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("LockGuard({:?}, {})", self.key, self.ticket))
    }
}

impl LockGuard {
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn release(mut self) {
        self.released = true;
        self.manager.table.lock().remove(&self.key, self.ticket);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!("lock on {:?} dropped without release", self.key);
            self.manager.table.lock().remove(&self.key, self.ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task;
    use std::time::Instant;

    fn rid(p: i64) -> RecordId {
        RecordId::new(9, p)
    }

    #[test]
    fn same_record_is_serialized() {
        task::block_on(async {
            let locks = LockManager::new(Duration::from_secs(5));
            let first = locks.lock_record(rid(1)).await.unwrap();
            let second = {
                let locks = locks.clone();
                task::spawn(async move {
                    let g = locks.lock_record(rid(1)).await;
                    (Instant::now(), g)
                })
            };
            task::sleep(Duration::from_millis(100)).await;
            let released_at = Instant::now();
            first.release();
            let (acquired_at, guard) = second.await;
            assert!(acquired_at >= released_at);
            guard.unwrap().release();
            assert_eq!(locks.contended(), 0);
        });
    }

    #[test]
    fn distinct_records_proceed_concurrently() {
        task::block_on(async {
            let locks = LockManager::new(Duration::from_millis(200));
            let a = locks.lock_record(rid(1)).await.unwrap();
            let b = locks.lock_record(rid(2)).await.unwrap();
            let k = locks.lock_index_key("person.name", "#9:1").await.unwrap();
            assert_eq!(locks.contended(), 3);
            a.release();
            b.release();
            k.release();
        });
    }

    #[test]
    fn namespaces_do_not_conflict() {
        task::block_on(async {
            let locks = LockManager::new(Duration::from_millis(100));
            let a = locks.lock_index_key("idx", "#9:1").await.unwrap();
            let b = locks.lock_index_key("idx#9", "1").await.unwrap();
            let c = locks.lock_record(rid(1)).await.unwrap();
            a.release();
            b.release();
            c.release();
        });
    }

    #[test]
    fn timeout_is_retryable() {
        task::block_on(async {
            let locks = LockManager::new(Duration::from_millis(50));
            let held = locks.lock_record(rid(7)).await.unwrap();
            let started = Instant::now();
            let err = locks.lock_record(rid(7)).await.unwrap_err();
            assert!(started.elapsed() >= Duration::from_millis(50));
            assert!(err.is_retryable());
            match err {
                Error::LockTimeout(_) => (),
                other => panic!("unexpected error {:?}", other),
            }
            held.release();
            // The timed-out waiter left the queue, so the lock is free again.
            locks.lock_record(rid(7)).await.unwrap().release();
        });
    }

    #[test]
    fn timeout_bounds_the_whole_request() {
        task::block_on(async {
            let locks = LockManager::new(Duration::from_millis(100));
            let a = locks.lock_record(rid(1)).await.unwrap();
            let b = locks.lock_record(rid(2)).await.unwrap();
            let keys: BTreeSet<LockKey> = vec![LockKey::Record(rid(1)), LockKey::Record(rid(2))]
                .into_iter()
                .collect();
            let started = Instant::now();
            let waiting = task::spawn(locks.enqueue_all(keys).acquire());
            // The first key frees up just before the deadline; the second
            // never does.
            task::sleep(Duration::from_millis(90)).await;
            a.release();
            let res = waiting.await;
            let waited = started.elapsed();
            assert!(matches!(res, Err(Error::LockTimeout(_))));
            assert!(waited >= Duration::from_millis(100));
            assert!(waited < Duration::from_millis(180), "waited {:?}", waited);
            b.release();
            assert_eq!(locks.contended(), 0);
        });
    }

    #[test]
    fn multi_key_requests_grant_in_enqueue_order() {
        task::block_on(async {
            let locks = LockManager::new(Duration::from_secs(5));
            let keys: BTreeSet<LockKey> = vec![LockKey::Record(rid(1)), LockKey::Record(rid(2))]
                .into_iter()
                .collect();
            let first = locks.enqueue_all(keys.clone());
            let second = locks.enqueue_all(keys);
            let later = task::spawn(second.acquire());
            let guards = first.acquire().await.unwrap();
            assert_eq!(guards.len(), 2);
            for g in guards {
                g.release();
            }
            for g in later.await.unwrap() {
                g.release();
            }
            assert_eq!(locks.contended(), 0);
        });
    }

    #[test]
    fn dropped_guard_frees_the_lock() {
        task::block_on(async {
            let locks = LockManager::new(Duration::from_millis(100));
            {
                let _g = locks.lock_record(rid(3)).await.unwrap();
            }
            locks.lock_record(rid(3)).await.unwrap().release();
        });
    }
}
