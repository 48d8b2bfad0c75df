// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    CommitResponse, CreatedRecord, Error, IndexChange, IndexOperation, RecordId,
    RecordOperation, SequenceAction, SequenceOutcome, UpdatedRecord,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, trace};

/// A transaction ready to be made durable: the operations as submitted, and
/// the final id for every temporary id among the created records.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitSet {
    pub records: Vec<RecordOperation>,
    pub indexes: Vec<IndexOperation>,
    pub allocations: Vec<(RecordId, RecordId)>,
}

/// A `LocalDatabase` is the local-execution capability an embedding server
/// provides: whatever actually stores records, indexes and sequences on this
/// member. Clients of the library pass an implementation in to the
/// constructor of [crate::Node].
///
/// The executor calls it from several tasks at once, but only ever for
/// operations whose locks it holds, so implementations need interior
/// mutability and not much else. Nothing here needs to know about the
/// cluster: validation against concurrent writers, id agreement and
/// ordering are all taken care of before a call reaches the database.
pub trait LocalDatabase: Send + Sync + 'static {
    /// Current version of a record, `None` if it doesn't exist.
    fn record_version(&self, rid: &RecordId) -> Option<u32>;

    fn read_record(&self, rid: &RecordId) -> Option<(u32, Vec<u8>)>;

    /// The record an index maps `key` to. Fails for an unknown index.
    fn index_lookup(&self, index: &str, key: &str) -> Result<Option<RecordId>, Error>;

    fn is_unique_index(&self, index: &str) -> bool;

    /// Reserves a fresh position in `cluster`.
    fn allocate_record_id(&self, cluster: i32) -> Result<RecordId, Error>;

    /// Makes sure later allocations in `rid`'s cluster come after `rid`.
    fn reserve_record_id(&self, rid: &RecordId) -> Result<(), Error>;

    fn commit(&self, set: &CommitSet) -> Result<CommitResponse, Error>;

    fn execute_ddl(&self, query: &str) -> Result<String, Error>;

    fn sequence_action(
        &self,
        sequence: &str,
        action: SequenceAction,
    ) -> Result<SequenceOutcome, Error>;
}

/// Reserves an id for every temporary id among `records`, and moves the
/// counters past any explicit id. Called in log order, whether or not the
/// transaction goes on to prepare, so every member hands out the same ids.
pub(crate) fn reserve<D: LocalDatabase>(
    db: &D,
    records: &[RecordOperation],
) -> Result<Vec<(RecordId, RecordId)>, Error> {
    let mut allocations = Vec::new();
    for op in records {
        if let RecordOperation::Create { rid, .. } = op {
            if rid.is_temporary() {
                allocations.push((*rid, db.allocate_record_id(rid.cluster)?));
            } else {
                db.reserve_record_id(rid)?;
            }
        }
    }
    Ok(allocations)
}

/// Checks a transaction against the current state of `db`. Must be called
/// with the transaction's locks held.
pub(crate) fn prepare<D: LocalDatabase>(
    db: &D,
    records: &[RecordOperation],
    indexes: &[IndexOperation],
) -> Result<(), Error> {
    let mut deleted = HashSet::new();
    for op in records {
        match op {
            RecordOperation::Create { rid, .. } => {
                if !rid.is_temporary() && db.record_version(rid).is_some() {
                    return Err(Error::Execution(format!("record {:?} already exists", rid)));
                }
            }
            RecordOperation::Update { rid, version, .. }
            | RecordOperation::Delete { rid, version } => {
                match db.record_version(rid) {
                    None => return Err(Error::ConcurrentCreate(*rid)),
                    Some(found) if found != *version => {
                        return Err(Error::ConcurrentModification {
                            rid: *rid,
                            expected: *version,
                            found,
                        })
                    }
                    Some(_) => (),
                }
                if let RecordOperation::Delete { .. } = op {
                    deleted.insert(*rid);
                }
            }
        }
    }
    let mut removed = HashSet::new();
    for op in indexes {
        match &op.change {
            IndexChange::Remove => {
                db.index_lookup(&op.index, &op.key)?;
                removed.insert((op.index.as_str(), op.key.as_str()));
            }
            IndexChange::Put(rid) => {
                let existing = db.index_lookup(&op.index, &op.key)?;
                if !db.is_unique_index(&op.index) {
                    continue;
                }
                match existing {
                    Some(existing)
                        if existing != *rid
                            && !deleted.contains(&existing)
                            && !removed.contains(&(op.index.as_str(), op.key.as_str())) =>
                    {
                        return Err(Error::DuplicateKey {
                            index: op.index.clone(),
                            key: op.key.clone(),
                            existing,
                        })
                    }
                    _ => (),
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug)]
struct Sequence {
    start: i64,
    increment: i64,
    limit: Option<i64>,
    value: i64,
}

#[derive(Debug)]
struct Index {
    unique: bool,
    entries: BTreeMap<String, RecordId>,
}

#[derive(Debug, Default)]
struct MemState {
    records: BTreeMap<RecordId, (u32, Vec<u8>)>,
    // Next free position per cluster.
    clusters: BTreeMap<i32, i64>,
    indexes: HashMap<String, Index>,
    sequences: HashMap<String, Sequence>,
}

/// An in-memory [LocalDatabase], for tests and for embedding servers that
/// keep their data elsewhere and only want the coordination.
///
/// Understands a small DDL vocabulary:
///
///   - `create cluster <id>`
///   - `create index <name> [unique]`, `drop index <name>`
///   - `create sequence <name> [start <n>] [increment <n>] [limit <n>]`,
///     `drop sequence <name>`
#[derive(Debug, Default)]
pub struct MemDatabase {
    state: Mutex<MemState>,
}

impl MemDatabase {
    pub fn new() -> Self {
        MemDatabase::default()
    }

    pub fn with_clusters(clusters: &[i32]) -> Self {
        let db = MemDatabase::new();
        {
            let mut state = db.state.lock();
            for c in clusters {
                state.clusters.insert(*c, 0);
            }
        }
        db
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn records(&self) -> Vec<(RecordId, u32, Vec<u8>)> {
        self.state
            .lock()
            .records
            .iter()
            .map(|(rid, (ver, content))| (*rid, *ver, content.clone()))
            .collect()
    }

    pub fn index_names(&self) -> BTreeSet<String> {
        self.state.lock().indexes.keys().cloned().collect()
    }
}

fn parse_number<T: std::str::FromStr>(word: Option<&str>, what: &str) -> Result<T, Error> {
    word.and_then(|w| w.parse().ok())
        .ok_or_else(|| Error::Execution(format!("expected a number after '{}'", what)))
}

fn parse_name<'a>(word: Option<&'a str>, what: &str) -> Result<&'a str, Error> {
    word.ok_or_else(|| Error::Execution(format!("expected a name after '{}'", what)))
}

impl LocalDatabase for MemDatabase {
    fn record_version(&self, rid: &RecordId) -> Option<u32> {
        self.state.lock().records.get(rid).map(|(v, _)| *v)
    }

    fn read_record(&self, rid: &RecordId) -> Option<(u32, Vec<u8>)> {
        self.state.lock().records.get(rid).cloned()
    }

    fn index_lookup(&self, index: &str, key: &str) -> Result<Option<RecordId>, Error> {
        match self.state.lock().indexes.get(index) {
            None => Err(Error::Execution(format!("no index named '{}'", index))),
            Some(ix) => Ok(ix.entries.get(key).cloned()),
        }
    }

    fn is_unique_index(&self, index: &str) -> bool {
        match self.state.lock().indexes.get(index) {
            None => false,
            Some(ix) => ix.unique,
        }
    }

    fn allocate_record_id(&self, cluster: i32) -> Result<RecordId, Error> {
        let mut state = self.state.lock();
        match state.clusters.get_mut(&cluster) {
            None => Err(Error::Execution(format!("no cluster {}", cluster))),
            Some(next) => {
                let rid = RecordId::new(cluster, *next);
                *next += 1;
                Ok(rid)
            }
        }
    }

    fn reserve_record_id(&self, rid: &RecordId) -> Result<(), Error> {
        let mut state = self.state.lock();
        match state.clusters.get_mut(&rid.cluster) {
            None => Err(Error::Execution(format!("no cluster {}", rid.cluster))),
            Some(next) => {
                *next = (*next).max(rid.position + 1);
                Ok(())
            }
        }
    }

    fn commit(&self, set: &CommitSet) -> Result<CommitResponse, Error> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let allocated: HashMap<RecordId, RecordId> = set.allocations.iter().cloned().collect();
        let mut out = CommitResponse::default();

        // Resolve every id first so a failure leaves nothing half-applied.
        // Positions taken here only reach the cluster counters on apply.
        let mut resolved = HashMap::new();
        let mut taken: HashMap<i32, i64> = HashMap::new();
        for op in set.records.iter() {
            if let RecordOperation::Create { rid, .. } = op {
                let real = match allocated.get(rid) {
                    Some(real) => *real,
                    None if rid.is_temporary() => {
                        let next = match taken.get(&rid.cluster) {
                            Some(next) => *next,
                            None => *state.clusters.get(&rid.cluster).ok_or_else(|| {
                                Error::Execution(format!("no cluster {}", rid.cluster))
                            })?,
                        };
                        taken.insert(rid.cluster, next + 1);
                        RecordId::new(rid.cluster, next)
                    }
                    None => *rid,
                };
                if state.records.contains_key(&real) {
                    return Err(Error::Execution(format!("record {:?} already exists", real)));
                }
                resolved.insert(*rid, real);
            }
        }
        for op in set.records.iter() {
            match op {
                RecordOperation::Update { rid, .. } | RecordOperation::Delete { rid, .. } => {
                    if !state.records.contains_key(rid) {
                        return Err(Error::ConcurrentCreate(*rid));
                    }
                }
                RecordOperation::Create { .. } => (),
            }
        }

        for op in set.records.iter() {
            match op {
                RecordOperation::Create { rid, content } => {
                    let real = resolved.get(rid).cloned().unwrap_or(*rid);
                    let next = state.clusters.entry(real.cluster).or_insert(0);
                    *next = (*next).max(real.position + 1);
                    state.records.insert(real, (1, content.clone()));
                    out.created.push(CreatedRecord {
                        temporary: *rid,
                        rid: real,
                        version: 1,
                    });
                }
                RecordOperation::Update { rid, content, .. } => {
                    if let Some(entry) = state.records.get_mut(rid) {
                        entry.0 += 1;
                        entry.1 = content.clone();
                        out.updated.push(UpdatedRecord {
                            rid: *rid,
                            version: entry.0,
                        });
                    }
                }
                RecordOperation::Delete { rid, .. } => {
                    state.records.remove(rid);
                    out.deleted.push(*rid);
                }
            }
        }
        for op in set.indexes.iter() {
            let index = match state.indexes.get_mut(&op.index) {
                Some(ix) => ix,
                None => continue,
            };
            match &op.change {
                IndexChange::Put(rid) => {
                    let real = resolved.get(rid).cloned().unwrap_or(*rid);
                    index.entries.insert(op.key.clone(), real);
                }
                IndexChange::Remove => {
                    index.entries.remove(&op.key);
                }
            }
        }
        trace!(
            "committed {} created, {} updated, {} deleted",
            out.created.len(),
            out.updated.len(),
            out.deleted.len()
        );
        Ok(out)
    }

    fn execute_ddl(&self, query: &str) -> Result<String, Error> {
        let lowered = query.trim().to_lowercase();
        let mut words = lowered.split_whitespace();
        let mut state = self.state.lock();
        let result = match (words.next(), words.next()) {
            (Some("create"), Some("cluster")) => {
                let id: i32 = parse_number(words.next(), "cluster")?;
                state.clusters.entry(id).or_insert(0);
                format!("cluster {}", id)
            }
            (Some("create"), Some("index")) => {
                let name = parse_name(words.next(), "index")?.to_string();
                let unique = words.next() == Some("unique");
                if state.indexes.contains_key(&name) {
                    return Err(Error::Execution(format!("index '{}' exists", name)));
                }
                state.indexes.insert(
                    name.clone(),
                    Index {
                        unique,
                        entries: BTreeMap::new(),
                    },
                );
                format!("index {}", name)
            }
            (Some("drop"), Some("index")) => {
                let name = parse_name(words.next(), "index")?;
                state
                    .indexes
                    .remove(name)
                    .ok_or_else(|| Error::Execution(format!("no index named '{}'", name)))?;
                format!("dropped index {}", name)
            }
            (Some("create"), Some("sequence")) => {
                let name = parse_name(words.next(), "sequence")?.to_string();
                let mut seq = Sequence {
                    start: 0,
                    increment: 1,
                    limit: None,
                    value: 0,
                };
                while let Some(word) = words.next() {
                    match word {
                        "start" => seq.start = parse_number(words.next(), word)?,
                        "increment" => seq.increment = parse_number(words.next(), word)?,
                        "limit" => seq.limit = Some(parse_number(words.next(), word)?),
                        other => {
                            return Err(Error::Execution(format!("unexpected '{}'", other)))
                        }
                    }
                }
                seq.value = seq.start;
                if state.sequences.contains_key(&name) {
                    return Err(Error::Execution(format!("sequence '{}' exists", name)));
                }
                state.sequences.insert(name.clone(), seq);
                format!("sequence {}", name)
            }
            (Some("drop"), Some("sequence")) => {
                let name = parse_name(words.next(), "sequence")?;
                state
                    .sequences
                    .remove(name)
                    .ok_or_else(|| Error::Execution(format!("no sequence named '{}'", name)))?;
                format!("dropped sequence {}", name)
            }
            _ => {
                return Err(Error::Execution(format!(
                    "unrecognized statement '{}'",
                    query
                )))
            }
        };
        debug!("executed '{}'", query);
        Ok(result)
    }

    fn sequence_action(
        &self,
        sequence: &str,
        action: SequenceAction,
    ) -> Result<SequenceOutcome, Error> {
        let mut state = self.state.lock();
        let seq = state
            .sequences
            .get_mut(sequence)
            .ok_or_else(|| Error::Execution(format!("no sequence named '{}'", sequence)))?;
        Ok(match action {
            SequenceAction::Current => SequenceOutcome::Value(seq.value),
            SequenceAction::Reset => {
                seq.value = seq.start;
                SequenceOutcome::Value(seq.value)
            }
            SequenceAction::Next => {
                let next = seq.value + seq.increment;
                match seq.limit {
                    Some(limit) if next > limit => SequenceOutcome::LimitReached,
                    _ => {
                        seq.value = next;
                        SequenceOutcome::Value(next)
                    }
                }
            }
        })
    }
}
