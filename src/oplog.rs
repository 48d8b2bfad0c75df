// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The operation log: an append-only sequence of node requests, one per
//! [LogId]. The coordinator appends with [OpLog::log] and is the only place
//! ids are minted; every executor mirrors the same entries with
//! [OpLog::log_received] so that replay and catch-up of a lagging member see
//! one consistent sequence.
//!
//! Entries hold the request as an encoded [Payload], not a decoded
//! [crate::NodeRequest]: a request that cannot be decoded still occupies its
//! slot in the sequence and only fails once somebody tries to execute it.

use crate::{Error, LogId, Payload};
use serde::{Deserialize, Serialize};
use std::{
    collections::{btree_map, BTreeMap},
    ops::Bound,
};
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub log_id: LogId,
    pub payload: Payload,
}

/// What [OpLog::log_received] did with an entry it accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Received {
    Appended,
    /// Same id and term already present; nothing written.
    Duplicate,
    /// The id was present under another term. The log head from that id on
    /// was dropped and the new entry appended in its place.
    Truncated { removed: usize },
}

/// Where a given [LogId] stands relative to this log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogIdStatus {
    Present,
    /// Beyond the last entry.
    Future,
    /// Older than the oldest entry kept.
    TooOld,
    /// In range, but the entry at that position has a different term.
    Invalid,
}

/// A lazy, finite iterator over a range of entries in id order. Calling
/// [OpLog::iterate] again with the same bounds starts a fresh pass over the
/// same range.
#[derive(Clone)]
pub struct LogIter<'a> {
    inner: btree_map::Range<'a, u64, LogEntry>,
}

impl<'a> Iterator for LogIter<'a> {
    type Item = &'a LogEntry;
    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(_, e)| e)
    }
}

impl<'a> DoubleEndedIterator for LogIter<'a> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|(_, e)| e)
    }
}

#[derive(Debug, Default)]
pub struct OpLog {
    entries: BTreeMap<u64, LogEntry>,

    /// The most recent entry, kept even after pruning so ids keep counting
    /// up from it.
    last: Option<LogId>,

    /// Entries with ids up to here have been pruned.
    keep_after: u64,

    leader: bool,
    term: u64,
}

impl OpLog {
    pub fn new() -> Self {
        OpLog::default()
    }

    pub fn set_leader(&mut self, leader: bool, term: u64) {
        self.leader = leader;
        self.term = term;
    }

    pub fn is_leader(&self) -> bool {
        self.leader
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn last_log_id(&self) -> Option<LogId> {
        self.last
    }

    /// The id the next appended entry must carry.
    pub fn next_id(&self) -> u64 {
        match self.last {
            None => 1,
            Some(l) => l.successor(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a new entry and mints its id. Ids returned by successive calls
    /// are strictly increasing and never repeat.
    pub fn log(&mut self, payload: Payload) -> LogId {
        let log_id = LogId::new(self.next_id(), self.term, self.last.map(|l| l.term));
        self.append(log_id, payload);
        log_id
    }

    /// Records an entry a coordinator already assigned an id to, keeping that
    /// id. Entries must arrive gap-free: the caller is responsible for
    /// ordering and for fetching anything missing.
    pub fn log_received(&mut self, log_id: LogId, payload: Payload) -> Result<Received, Error> {
        if self.leader {
            return Err(Error::NotFollower);
        }
        let next = self.next_id();
        if log_id.id > next {
            return Err(Error::LogGap {
                expected: next,
                received: log_id.id,
            });
        }
        if log_id.id < next {
            match self.entries.get(&log_id.id) {
                Some(existing) if existing.log_id.term == log_id.term => {
                    return Ok(Received::Duplicate);
                }
                // Pruned: nothing left to compare against, assume it's old news.
                None if log_id.id <= self.keep_after => return Ok(Received::Duplicate),
                _ => (),
            }
            let removed = self.truncate_from(log_id.id);
            warn!(
                "log head from {:?} written under another term, dropped {} entries",
                log_id, removed
            );
            self.term = log_id.term;
            self.append(log_id, payload);
            return Ok(Received::Truncated { removed });
        }
        if let (Some(prev_term), Some(last)) = (log_id.prev_term, self.last) {
            if prev_term != last.term {
                return Err(Error::LogTermMismatch(log_id));
            }
        }
        self.term = log_id.term;
        self.append(log_id, payload);
        Ok(Received::Appended)
    }

    fn append(&mut self, log_id: LogId, payload: Payload) {
        self.entries.insert(log_id.id, LogEntry { log_id, payload });
        self.last = Some(log_id);
    }

    // Removes every entry with id >= `id`, returning how many went.
    fn truncate_from(&mut self, id: u64) -> usize {
        let removed = self.entries.split_off(&id).len();
        self.last = self.entries.values().next_back().map(|e| e.log_id);
        if self.last.is_none() && self.keep_after > 0 {
            self.last = Some(LogId::new(self.keep_after, self.term, None));
        }
        removed
    }

    /// Entries with ids in `from..=to`, in id order. `None` on either end
    /// means unbounded.
    pub fn iterate(&self, from: Option<u64>, to: Option<u64>) -> LogIter<'_> {
        let lo = match from {
            None => Bound::Unbounded,
            Some(f) => Bound::Included(f),
        };
        let hi = match to {
            None => Bound::Unbounded,
            Some(t) => Bound::Included(t),
        };
        LogIter {
            inner: self.entries.range((lo, hi)),
        }
    }

    /// Entries strictly after `after`, or everything when `None`.
    pub fn entries_after(&self, after: Option<LogId>) -> LogIter<'_> {
        self.iterate(after.map(|l| l.successor()), None)
    }

    pub fn get(&self, id: u64) -> Option<&LogEntry> {
        self.entries.get(&id)
    }

    pub fn search_id(&self, log_id: &LogId) -> LogIdStatus {
        if log_id.id >= self.next_id() {
            return LogIdStatus::Future;
        }
        match self.entries.get(&log_id.id) {
            None => LogIdStatus::TooOld,
            Some(e) if e.log_id.term == log_id.term => LogIdStatus::Present,
            Some(_) => LogIdStatus::Invalid,
        }
    }

    /// Drops every entry after `log_id`, if `log_id` is present. Returns the
    /// status `log_id` had before anything was removed.
    pub fn remove_after(&mut self, log_id: &LogId) -> LogIdStatus {
        let status = self.search_id(log_id);
        if status == LogIdStatus::Present {
            let removed = self.truncate_from(log_id.successor());
            debug!("removed {} entries after {:?}", removed, log_id);
        }
        status
    }

    /// Prunes every entry up to and including `log_id`, returning how many
    /// were dropped. The id sequence carries on from where it was.
    pub fn cut_until(&mut self, log_id: &LogId) -> usize {
        let kept = self.entries.split_off(&log_id.successor());
        let removed = std::mem::replace(&mut self.entries, kept).len();
        self.keep_after = self.keep_after.max(log_id.id);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: u8) -> Payload {
        Payload {
            type_code: 1,
            body: vec![n],
        }
    }

    fn leader() -> OpLog {
        let mut log = OpLog::new();
        log.set_leader(true, 0);
        log
    }

    #[test]
    fn log_ids_strictly_increase() {
        let mut log = leader();
        let mut prev: Option<LogId> = None;
        for i in 0..100 {
            let id = log.log(payload(i));
            if let Some(p) = prev {
                assert!(id > p);
                assert_eq!(id.id, p.id + 1);
                assert_eq!(id.prev_term, Some(p.term));
            } else {
                assert_eq!(id.id, 1);
                assert_eq!(id.prev_term, None);
            }
            prev = Some(id);
        }
        assert_eq!(log.last_log_id(), prev);
    }

    #[test]
    fn iterate_ranges_are_inclusive_and_restartable() {
        let mut log = leader();
        for i in 0..50 {
            log.log(payload(i));
        }
        let it = log.iterate(Some(10), Some(19));
        let ids: Vec<u64> = it.clone().map(|e| e.log_id.id).collect();
        assert_eq!(ids, (10..=19).collect::<Vec<_>>());
        assert_eq!(it.count(), 10);
        // A second pass over the same bounds sees the same entries.
        let again: Vec<u64> = log.iterate(Some(10), Some(19)).map(|e| e.log_id.id).collect();
        assert_eq!(again, ids);
        assert_eq!(log.iterate(None, Some(3)).count(), 3);
        assert_eq!(log.iterate(Some(48), None).count(), 3);
        let after: Vec<u64> = log
            .entries_after(Some(LogId::new(47, 0, None)))
            .map(|e| e.log_id.id)
            .collect();
        assert_eq!(after, vec![48, 49, 50]);
    }

    #[test]
    fn received_entries_mirror_the_leader() {
        let mut lead = leader();
        let mut follower = OpLog::new();
        for i in 0..5 {
            let id = lead.log(payload(i));
            assert_eq!(
                follower.log_received(id, payload(i)),
                Ok(Received::Appended)
            );
        }
        assert_eq!(follower.last_log_id(), lead.last_log_id());

        let third = lead.get(3).unwrap().clone();
        assert_eq!(
            follower.log_received(third.log_id, third.payload),
            Ok(Received::Duplicate)
        );
    }

    #[test]
    fn gaps_and_term_mismatches_are_rejected() {
        let mut follower = OpLog::new();
        assert_eq!(
            follower.log_received(LogId::new(2, 0, Some(0)), payload(0)),
            Err(Error::LogGap {
                expected: 1,
                received: 2
            })
        );
        follower
            .log_received(LogId::new(1, 0, None), payload(0))
            .unwrap();
        let bad = LogId::new(2, 1, Some(7));
        assert_eq!(
            follower.log_received(bad, payload(1)),
            Err(Error::LogTermMismatch(bad))
        );
        assert_eq!(
            leader().log_received(LogId::new(1, 0, None), payload(0)),
            Err(Error::NotFollower)
        );
    }

    #[test]
    fn conflicting_term_truncates_head() {
        let mut follower = OpLog::new();
        for i in 1..=4 {
            let prev = if i == 1 { None } else { Some(0) };
            follower
                .log_received(LogId::new(i, 0, prev), payload(i as u8))
                .unwrap();
        }
        let replacement = LogId::new(3, 1, Some(0));
        assert_eq!(
            follower.log_received(replacement, payload(9)),
            Ok(Received::Truncated { removed: 2 })
        );
        assert_eq!(follower.last_log_id(), Some(replacement));
        assert_eq!(follower.next_id(), 4);
    }

    #[test]
    fn search_remove_and_prune() {
        let mut log = leader();
        let ids: Vec<LogId> = (0..10).map(|i| log.log(payload(i))).collect();
        assert_eq!(log.search_id(&ids[4]), LogIdStatus::Present);
        assert_eq!(
            log.search_id(&LogId::new(11, 0, None)),
            LogIdStatus::Future
        );
        assert_eq!(
            log.search_id(&LogId::new(4, 9, None)),
            LogIdStatus::Invalid
        );

        assert_eq!(log.remove_after(&ids[6]), LogIdStatus::Present);
        assert_eq!(log.last_log_id(), Some(ids[6]));
        assert_eq!(log.len(), 7);

        assert_eq!(log.cut_until(&ids[2]), 3);
        assert_eq!(log.search_id(&ids[1]), LogIdStatus::TooOld);
        assert_eq!(log.log(payload(42)).id, 8);
    }
}
