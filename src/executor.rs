// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The executor actor, one per member and database. It mirrors the
//! coordinator's log entries into a local follower [OpLog], strictly in
//! [LogId] order, and applies each one to the [LocalDatabase].
//!
//! Entries that arrive ahead of a gap wait in a reorder buffer. If the gap
//! doesn't close within the configured window, the executor asks whoever
//! sent the buffered entries to resend everything after its last logged
//! entry.
//!
//! Applying a transaction phase takes locks, which can take a while, so the
//! waiting happens in a spawned task. The locks themselves are *enqueued* on
//! the actor, in log order, so conflicting operations are still granted
//! their locks in the order the coordinator logged them.

use crate::{
    lockmgr::LockRequest,
    network::Envelope,
    storage::{self, CommitSet},
    Error, ExecutorConfig, IndexOperation, LocalDatabase, LockGuard, LockKey, LockManager,
    LogId, Member, MemberName, NodeRequest, NodeResponse, OpLog, Payload, PreparedResponse,
    Received, RecordId, RecordOperation, RolledBack, SessionOperationId, TxPhase1Request,
    TxPhase2Request,
};
use async_std::task;
use futures::{
    channel::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    future::{FutureExt, Shared},
    StreamExt,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, debug_span, error, trace, warn, Instrument};

pub(crate) enum Command {
    Request {
        from: Member,
        log_id: LogId,
        payload: Payload,
        propagated: bool,
    },
    GapTimeout {
        expected: u64,
    },
    Confirm(LogId),
    Status(oneshot::Sender<ExecutorStatus>),
    Shutdown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutorStatus {
    pub last_log_id: Option<LogId>,
    /// Entries received ahead of a gap, not yet applied.
    pub buffered: usize,
    /// Transactions prepared and holding locks, waiting for phase two.
    pub pending_transactions: usize,
    /// The last entry the coordinator confirmed this member caught up to.
    pub confirmed: Option<LogId>,
}

#[derive(Clone)]
pub struct Executor {
    name: MemberName,
    tx: UnboundedSender<Command>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Executor({:?})", self.name))
    }
}

impl Executor {
    pub fn spawn<D: LocalDatabase>(
        name: MemberName,
        database: &str,
        db: Arc<D>,
        config: ExecutorConfig,
    ) -> Executor {
        let (tx, rx) = mpsc::unbounded();
        let local = Arc::new(Local {
            db,
            locks: LockManager::new(config.lock_timeout()),
            pending: Mutex::new(HashMap::new()),
            preparing: Mutex::new(HashMap::new()),
            pending_timeout: config.pending_tx_timeout(),
        });
        let core = ExecutorCore {
            name: name.clone(),
            database: database.to_string(),
            config,
            log: OpLog::new(),
            buffer: BTreeMap::new(),
            gap_timer: false,
            confirmed: None,
            local,
            commands: tx.clone(),
        };
        let span = debug_span!("executor", member=?name, db=%database);
        task::spawn(core.run(rx).instrument(span));
        Executor { name, tx }
    }

    fn post(&self, cmd: Command) -> Result<(), Error> {
        self.tx.unbounded_send(cmd).map_err(|_| Error::Shutdown)
    }

    /// Accepts a node request sent by `from`, which gets the response.
    pub fn receive(&self, from: Member, log_id: LogId, payload: Payload) -> Result<(), Error> {
        self.post(Command::Request {
            from,
            log_id,
            payload,
            propagated: false,
        })
    }

    /// Accepts an entry resent for catch-up. It's applied like any other, but
    /// answered with an ack rather than a response.
    pub fn receive_propagated(
        &self,
        from: Member,
        log_id: LogId,
        payload: Payload,
    ) -> Result<(), Error> {
        self.post(Command::Request {
            from,
            log_id,
            payload,
            propagated: true,
        })
    }

    pub fn confirm(&self, log_id: LogId) -> Result<(), Error> {
        self.post(Command::Confirm(log_id))
    }

    pub async fn status(&self) -> Result<ExecutorStatus, Error> {
        let (tx, rx) = oneshot::channel();
        self.post(Command::Status(tx))?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    pub fn shutdown(&self) {
        let _ = self.post(Command::Shutdown);
    }
}

struct Buffered {
    from: Member,
    log_id: LogId,
    payload: Payload,
    propagated: bool,
}

// Where the outcome of one entry goes.
struct Reply {
    to: Member,
    database: String,
    log_id: LogId,
    propagated: bool,
}

impl Reply {
    fn send(self, response: NodeResponse) {
        if self.propagated {
            if let NodeResponse::Failure(e) = &response {
                warn!("propagated {:?} failed: {}", self.log_id, e);
            }
            return self.ack();
        }
        match Payload::encode(&response) {
            Ok(payload) => {
                let envelope = Envelope::NodeResponse {
                    database: self.database.clone(),
                    log_id: self.log_id,
                    payload,
                };
                self.deliver(envelope)
            }
            Err(e) => error!("cannot encode response to {:?}: {}", self.log_id, e),
        }
    }

    fn ack(self) {
        let envelope = Envelope::Ack {
            database: self.database.clone(),
            log_id: self.log_id,
        };
        self.deliver(envelope)
    }

    fn deliver(self, envelope: Envelope) {
        let sent = self.to.send(envelope);
        let (to, log_id) = (self.to.name, self.log_id);
        task::spawn(async move {
            if let Err(e) = sent.await {
                warn!("response to {:?} for {:?} undeliverable: {}", to, log_id, e);
            }
        });
    }
}

struct PreparedTx {
    // The phase-one entry that prepared it. Retries of an operation reuse its
    // id, so this tells attempts apart.
    token: LogId,
    guards: Vec<LockGuard>,
}

impl PreparedTx {
    fn release(self) {
        for g in self.guards {
            g.release();
        }
    }
}

// The part of the executor's state that spawned tasks share.
struct Local<D: LocalDatabase> {
    db: Arc<D>,
    locks: LockManager,
    pending: Mutex<HashMap<SessionOperationId, PreparedTx>>,
    // Phase one in progress, with its token; resolves (one way or another)
    // when it's done.
    preparing: Mutex<HashMap<SessionOperationId, (LogId, Shared<oneshot::Receiver<()>>)>>,
    pending_timeout: Duration,
}

fn lock_keys(records: &[RecordOperation], indexes: &[IndexOperation]) -> BTreeSet<LockKey> {
    let mut keys = BTreeSet::new();
    for op in records {
        match op {
            RecordOperation::Create { rid, .. } if rid.is_temporary() => (),
            _ => {
                keys.insert(LockKey::Record(op.rid()));
            }
        }
    }
    for op in indexes {
        keys.insert(LockKey::IndexKey {
            index: op.index.clone(),
            key: op.key.clone(),
        });
    }
    keys
}

fn commit_response<D: LocalDatabase>(db: &D, set: &CommitSet) -> NodeResponse {
    match db.commit(set) {
        Ok(done) => NodeResponse::TxCommitted(done),
        Err(e) => NodeResponse::Failure(e),
    }
}

impl<D: LocalDatabase> Local<D> {
    // Takes the prepared entry for `op_id` only if `token` prepared it.
    fn claim(&self, op_id: &SessionOperationId, token: LogId) -> Option<PreparedTx> {
        let mut pending = self.pending.lock();
        match pending.get(op_id) {
            Some(tx) if tx.token == token => pending.remove(op_id),
            _ => None,
        }
    }

    async fn prepare(
        self: Arc<Self>,
        p1: TxPhase1Request,
        token: LogId,
        request: LockRequest,
        allocations: Vec<(RecordId, RecordId)>,
    ) -> NodeResponse {
        let op_id = p1.op_id;
        let res = match request.acquire().await {
            Err(e) => Err(e),
            Ok(guards) => match storage::prepare(&*self.db, &p1.records, &p1.indexes) {
                Err(e) => {
                    for g in guards {
                        g.release();
                    }
                    Err(e)
                }
                Ok(()) => {
                    let prepared = PreparedTx { token, guards };
                    let replaced = self.pending.lock().insert(op_id.clone(), prepared);
                    if let Some(old) = replaced {
                        warn!("{:?} prepared again, releasing {:?}", op_id, old.token);
                        old.release();
                    }
                    self.expire_later(op_id.clone(), token);
                    Ok(())
                }
            },
        };
        {
            let mut preparing = self.preparing.lock();
            if preparing.get(&op_id).map(|(t, _)| *t) == Some(token) {
                preparing.remove(&op_id);
            }
        }
        match res {
            Ok(()) => {
                trace!("{:?} prepared", op_id);
                NodeResponse::TxPrepared(PreparedResponse { allocations })
            }
            Err(e) => {
                debug!("{:?} failed to prepare: {}", op_id, e);
                NodeResponse::Failure(e)
            }
        }
    }

    // Rolls back a prepared transaction if phase two hasn't come for it in
    // time.
    fn expire_later(self: &Arc<Self>, op_id: SessionOperationId, token: LogId) {
        let local = self.clone();
        task::spawn(async move {
            task::sleep(local.pending_timeout).await;
            if let Some(tx) = local.claim(&op_id, token) {
                warn!("{:?} abandoned after prepare at {:?}, rolling back", op_id, token);
                tx.release();
            }
        });
    }

    async fn finish(
        self: Arc<Self>,
        p2: TxPhase2Request,
        prepared: Option<PreparedTx>,
        direct: Option<LockRequest>,
    ) -> NodeResponse {
        let set = CommitSet {
            records: p2.records,
            indexes: p2.indexes,
            allocations: p2.allocations,
        };
        match (prepared, p2.success) {
            (Some(tx), true) => {
                let response = commit_response(&*self.db, &set);
                tx.release();
                response
            }
            (Some(tx), false) => {
                tx.release();
                NodeResponse::TxRolledBack(RolledBack(p2.op_id))
            }
            (None, false) => NodeResponse::TxRolledBack(RolledBack(p2.op_id)),
            (None, true) => {
                debug!("{:?} was never prepared here, applying directly", p2.op_id);
                let request = match direct {
                    Some(r) => r,
                    None => self.locks.enqueue_all(lock_keys(&set.records, &set.indexes)),
                };
                match request.acquire().await {
                    Err(e) => NodeResponse::Failure(e),
                    Ok(guards) => {
                        let response = commit_response(&*self.db, &set);
                        for g in guards {
                            g.release();
                        }
                        response
                    }
                }
            }
        }
    }
}

struct ExecutorCore<D: LocalDatabase> {
    name: MemberName,
    database: String,
    config: ExecutorConfig,
    log: OpLog,
    buffer: BTreeMap<u64, Buffered>,
    gap_timer: bool,
    confirmed: Option<LogId>,
    local: Arc<Local<D>>,
    commands: UnboundedSender<Command>,
}

impl<D: LocalDatabase> ExecutorCore<D> {
    async fn run(mut self, mut rx: UnboundedReceiver<Command>) {
        while let Some(cmd) = rx.next().await {
            match cmd {
                Command::Request {
                    from,
                    log_id,
                    payload,
                    propagated,
                } => self.handle_request(Buffered {
                    from,
                    log_id,
                    payload,
                    propagated,
                }),
                Command::GapTimeout { expected } => self.handle_gap_timeout(expected),
                Command::Confirm(log_id) => {
                    debug!("confirmed caught up to {:?}", log_id);
                    self.confirmed = Some(log_id);
                }
                Command::Status(reply) => {
                    let _ = reply.send(self.status());
                }
                Command::Shutdown => break,
            }
        }
        debug!("executor stopped at {:?}", self.log.last_log_id());
    }

    fn status(&self) -> ExecutorStatus {
        ExecutorStatus {
            last_log_id: self.log.last_log_id(),
            buffered: self.buffer.len(),
            pending_transactions: self.local.pending.lock().len(),
            confirmed: self.confirmed,
        }
    }

    fn handle_request(&mut self, entry: Buffered) {
        let next = self.log.next_id();
        if entry.log_id.id > next {
            trace!("{:?} arrived ahead of {}, buffering", entry.log_id, next);
            self.buffer.entry(entry.log_id.id).or_insert(entry);
            self.arm_gap_timer();
            return;
        }
        self.apply(entry);
        loop {
            let next = self.log.next_id();
            match self.buffer.remove(&next) {
                Some(entry) => self.apply(entry),
                None => break,
            }
        }
    }

    fn apply(&mut self, entry: Buffered) {
        let reply = Reply {
            to: entry.from,
            database: self.database.clone(),
            log_id: entry.log_id,
            propagated: entry.propagated,
        };
        match self.log.log_received(entry.log_id, entry.payload.clone()) {
            Ok(Received::Duplicate) => {
                trace!("{:?} already logged", entry.log_id);
                if reply.propagated {
                    reply.ack();
                }
                return;
            }
            Ok(Received::Appended) | Ok(Received::Truncated { .. }) => (),
            Err(e) => {
                warn!("cannot log {:?}: {}", entry.log_id, e);
                reply.send(NodeResponse::Failure(e));
                return;
            }
        }
        match entry.payload.decode::<NodeRequest>() {
            Err(e) => {
                warn!("{:?} is not a request we understand: {}", entry.log_id, e);
                reply.send(NodeResponse::Failure(e));
            }
            Ok(request) => self.execute(request, reply),
        }
    }

    fn execute(&mut self, request: NodeRequest, reply: Reply) {
        match request {
            NodeRequest::TxPhase1(p1) => self.phase_one(p1, reply),
            NodeRequest::TxPhase2(p2) => self.phase_two(p2, reply),
            NodeRequest::Ddl(ddl) => reply.send(match self.local.db.execute_ddl(&ddl.query) {
                Ok(result) => NodeResponse::Ddl(result),
                Err(e) => NodeResponse::Failure(e),
            }),
            NodeRequest::Sequence(seq) => {
                reply.send(match self.local.db.sequence_action(&seq.sequence, seq.action) {
                    Ok(outcome) => NodeResponse::Sequence(outcome),
                    Err(e) => NodeResponse::Failure(e),
                })
            }
        }
    }

    fn phase_one(&mut self, p1: TxPhase1Request, reply: Reply) {
        let token = reply.log_id;
        let allocations = match storage::reserve(&*self.local.db, &p1.records) {
            Ok(a) => a,
            Err(e) => return reply.send(NodeResponse::Failure(e)),
        };
        let request = self
            .local
            .locks
            .enqueue_all(lock_keys(&p1.records, &p1.indexes));
        let (done, waiter) = oneshot::channel::<()>();
        self.local
            .preparing
            .lock()
            .insert(p1.op_id.clone(), (token, waiter.shared()));
        let local = self.local.clone();
        let span = debug_span!("phase-one", op=?p1.op_id, log_id=?token);
        task::spawn(
            async move {
                let response = local.prepare(p1, token, request, allocations).await;
                drop(done);
                reply.send(response);
            }
            .instrument(span),
        );
    }

    fn phase_two(&mut self, p2: TxPhase2Request, reply: Reply) {
        // A prepared entry is claimed here, in log order, so a later retry
        // of the same operation can't have its own prepare rolled back.
        let waiting = self.local.preparing.lock().get(&p2.op_id).cloned();
        let prepared = match waiting {
            None => self.local.pending.lock().remove(&p2.op_id),
            Some(_) => None,
        };
        if waiting.is_none() && prepared.is_none() && !p2.success {
            return reply.send(NodeResponse::TxRolledBack(RolledBack(p2.op_id)));
        }
        let direct = if waiting.is_none() && prepared.is_none() {
            Some(
                self.local
                    .locks
                    .enqueue_all(lock_keys(&p2.records, &p2.indexes)),
            )
        } else {
            None
        };
        let local = self.local.clone();
        let span = debug_span!("phase-two", op=?p2.op_id, log_id=?reply.log_id);
        task::spawn(
            async move {
                let prepared = match waiting {
                    None => prepared,
                    Some((token, w)) => {
                        let _ = w.await;
                        local.claim(&p2.op_id, token)
                    }
                };
                let response = local.finish(p2, prepared, direct).await;
                reply.send(response);
            }
            .instrument(span),
        );
    }

    fn arm_gap_timer(&mut self) {
        if self.gap_timer {
            return;
        }
        self.gap_timer = true;
        let expected = self.log.next_id();
        let window = self.config.reorder_window();
        let commands = self.commands.clone();
        task::spawn(async move {
            task::sleep(window).await;
            let _ = commands.unbounded_send(Command::GapTimeout { expected });
        });
    }

    fn handle_gap_timeout(&mut self, expected: u64) {
        self.gap_timer = false;
        if self.buffer.is_empty() {
            return;
        }
        if self.log.next_id() == expected {
            if let Some(first) = self.buffer.values().next() {
                debug!(
                    "still missing {} with {} entries buffered, asking {:?} to resync",
                    expected,
                    self.buffer.len(),
                    first.from.name
                );
                let sent = first.from.send(Envelope::Resync {
                    database: self.database.clone(),
                    from: self.log.last_log_id(),
                });
                task::spawn(async move {
                    let _ = sent.await;
                });
            }
        }
        self.arm_gap_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        member::testing::{capture_member, Captured},
        DdlRequest, IndexChange, MemDatabase,
    };
    use async_std::future::timeout;

    fn setup(config: ExecutorConfig) -> (Executor, Arc<MemDatabase>, Member, Captured) {
        let _ = tracing_subscriber::fmt::try_init();
        let db = Arc::new(MemDatabase::with_clusters(&[9]));
        let exec = Executor::spawn(MemberName::from("n1"), "db", db.clone(), config);
        let (coord, captured) = capture_member("n0");
        (exec, db, coord, captured)
    }

    fn quick() -> ExecutorConfig {
        ExecutorConfig {
            lock_timeout_ms: 100,
            pending_tx_timeout_ms: 60_000,
            reorder_window_ms: 50,
        }
    }

    fn log_id(id: u64) -> LogId {
        LogId::new(id, 0, if id == 1 { None } else { Some(0) })
    }

    fn request(r: NodeRequest) -> Payload {
        Payload::encode(&r).unwrap()
    }

    fn ddl(query: &str) -> Payload {
        request(NodeRequest::Ddl(DdlRequest {
            query: query.to_string(),
        }))
    }

    fn op(seq: u64) -> SessionOperationId {
        SessionOperationId::new(MemberName::from("client"), seq)
    }

    fn update(rid: RecordId, version: u32) -> Vec<RecordOperation> {
        vec![RecordOperation::Update {
            rid,
            version,
            content: b"new".to_vec(),
        }]
    }

    fn phase1(seq: u64, records: Vec<RecordOperation>) -> Payload {
        request(NodeRequest::TxPhase1(TxPhase1Request {
            op_id: op(seq),
            records,
            indexes: vec![],
        }))
    }

    fn phase2(seq: u64, success: bool, records: Vec<RecordOperation>) -> Payload {
        request(NodeRequest::TxPhase2(TxPhase2Request {
            op_id: op(seq),
            success,
            records,
            indexes: vec![],
            allocations: vec![],
        }))
    }

    // Waits for the next response envelope, skipping nothing.
    async fn next_response(c: &mut Captured) -> (LogId, NodeResponse) {
        let env = timeout(Duration::from_secs(5), c.sent.next())
            .await
            .expect("no response in time")
            .expect("channel closed");
        match env {
            Envelope::NodeResponse {
                log_id, payload, ..
            } => (log_id, payload.decode::<NodeResponse>().unwrap()),
            other => panic!("unexpected {:?}", other),
        }
    }

    // Collects the next `n` responses, by log id.
    async fn responses(c: &mut Captured, n: usize) -> BTreeMap<u64, NodeResponse> {
        let mut out = BTreeMap::new();
        for _ in 0..n {
            let (id, r) = next_response(c).await;
            out.insert(id.id, r);
        }
        out
    }

    fn seed_record(db: &MemDatabase) -> RecordId {
        seed_at(db, 0)
    }

    fn seed_at(db: &MemDatabase, position: i64) -> RecordId {
        let temp = RecordId::new(9, -1);
        let rid = RecordId::new(9, position);
        db.commit(&CommitSet {
            records: vec![RecordOperation::Create {
                rid: temp,
                content: b"old".to_vec(),
            }],
            indexes: vec![],
            allocations: vec![(temp, rid)],
        })
        .unwrap();
        rid
    }

    #[test]
    fn entries_apply_in_log_order() {
        task::block_on(async {
            let (exec, db, coord, mut captured) = setup(quick());
            exec.receive(coord.clone(), log_id(2), ddl("create index b"))
                .unwrap();
            let status = exec.status().await.unwrap();
            assert_eq!(status.buffered, 1);
            assert_eq!(status.last_log_id, None);
            assert!(captured.drain().is_empty());

            exec.receive(coord.clone(), log_id(1), ddl("create index a"))
                .unwrap();
            let status = exec.status().await.unwrap();
            assert_eq!(status.buffered, 0);
            assert_eq!(status.last_log_id, Some(log_id(2)));
            let (first, _) = next_response(&mut captured).await;
            let (second, _) = next_response(&mut captured).await;
            assert_eq!((first.id, second.id), (1, 2));
            assert_eq!(db.index_names().len(), 2);
        });
    }

    #[test]
    fn stuck_gap_asks_for_resync() {
        task::block_on(async {
            let (exec, _db, coord, mut captured) = setup(quick());
            exec.receive(coord.clone(), log_id(1), ddl("create index a"))
                .unwrap();
            next_response(&mut captured).await;
            exec.receive(coord.clone(), log_id(3), ddl("create index c"))
                .unwrap();
            let env = timeout(Duration::from_secs(5), captured.sent.next())
                .await
                .unwrap()
                .unwrap();
            match env {
                Envelope::Resync { from, .. } => assert_eq!(from, Some(log_id(1))),
                other => panic!("unexpected {:?}", other),
            }
            // The missing entry closes the gap and drains the buffer.
            exec.receive(coord.clone(), log_id(2), ddl("create index b"))
                .unwrap();
            let status = exec.status().await.unwrap();
            assert_eq!(status.buffered, 0);
            assert_eq!(status.last_log_id, Some(log_id(3)));
        });
    }

    #[test]
    fn prepare_then_commit() {
        task::block_on(async {
            let (exec, db, coord, mut captured) = setup(quick());
            let rid = seed_record(&db);
            exec.receive(coord.clone(), log_id(1), phase1(1, update(rid, 1)))
                .unwrap();
            match next_response(&mut captured).await {
                (_, NodeResponse::TxPrepared(_)) => (),
                other => panic!("unexpected {:?}", other),
            }
            assert_eq!(exec.status().await.unwrap().pending_transactions, 1);

            exec.receive(coord.clone(), log_id(2), phase2(1, true, update(rid, 1)))
                .unwrap();
            match next_response(&mut captured).await {
                (_, NodeResponse::TxCommitted(done)) => {
                    assert_eq!(done.updated[0].rid, rid);
                    assert_eq!(done.updated[0].version, 2);
                }
                other => panic!("unexpected {:?}", other),
            }
            assert_eq!(exec.status().await.unwrap().pending_transactions, 0);
            assert_eq!(db.read_record(&rid).unwrap(), (2, b"new".to_vec()));
        });
    }

    #[test]
    fn conflicting_prepare_times_out_until_rollback() {
        task::block_on(async {
            let (exec, db, coord, mut captured) = setup(quick());
            let rid = seed_record(&db);
            exec.receive(coord.clone(), log_id(1), phase1(1, update(rid, 1)))
                .unwrap();
            assert!(matches!(
                next_response(&mut captured).await.1,
                NodeResponse::TxPrepared(_)
            ));
            exec.receive(coord.clone(), log_id(2), phase1(2, update(rid, 1)))
                .unwrap();
            match next_response(&mut captured).await {
                (id, NodeResponse::Failure(e)) => {
                    assert_eq!(id, log_id(2));
                    assert!(e.is_retryable());
                }
                other => panic!("unexpected {:?}", other),
            }

            exec.receive(coord.clone(), log_id(3), phase2(1, false, update(rid, 1)))
                .unwrap();
            assert!(matches!(
                next_response(&mut captured).await.1,
                NodeResponse::TxRolledBack(_)
            ));
            // The record is free again and untouched.
            exec.receive(coord.clone(), log_id(4), phase1(3, update(rid, 1)))
                .unwrap();
            assert!(matches!(
                next_response(&mut captured).await.1,
                NodeResponse::TxPrepared(_)
            ));
            assert_eq!(db.read_record(&rid).unwrap().0, 1);
        });
    }

    #[test]
    fn unprepared_commit_applies_directly() {
        task::block_on(async {
            let (exec, db, coord, mut captured) = setup(quick());
            let rid = seed_record(&db);
            exec.receive(coord.clone(), log_id(1), phase2(1, true, update(rid, 1)))
                .unwrap();
            assert!(matches!(
                next_response(&mut captured).await.1,
                NodeResponse::TxCommitted(_)
            ));
            assert_eq!(db.read_record(&rid).unwrap().0, 2);
        });
    }

    #[test]
    fn abandoned_prepare_is_rolled_back() {
        task::block_on(async {
            let config = ExecutorConfig {
                pending_tx_timeout_ms: 50,
                ..quick()
            };
            let (exec, db, coord, mut captured) = setup(config);
            let rid = seed_record(&db);
            exec.receive(coord.clone(), log_id(1), phase1(1, update(rid, 1)))
                .unwrap();
            next_response(&mut captured).await;
            task::sleep(Duration::from_millis(300)).await;
            assert_eq!(exec.status().await.unwrap().pending_transactions, 0);
            exec.receive(coord.clone(), log_id(2), phase1(2, update(rid, 1)))
                .unwrap();
            assert!(matches!(
                next_response(&mut captured).await.1,
                NodeResponse::TxPrepared(_)
            ));
        });
    }

    #[test]
    fn stale_expiry_leaves_a_retry_prepared() {
        task::block_on(async {
            let config = ExecutorConfig {
                pending_tx_timeout_ms: 600,
                ..quick()
            };
            let (exec, db, coord, mut captured) = setup(config);
            let rid = seed_record(&db);
            exec.receive(coord.clone(), log_id(1), phase1(1, update(rid, 1)))
                .unwrap();
            assert!(matches!(
                next_response(&mut captured).await.1,
                NodeResponse::TxPrepared(_)
            ));
            exec.receive(coord.clone(), log_id(2), phase2(1, false, update(rid, 1)))
                .unwrap();
            assert!(matches!(
                next_response(&mut captured).await.1,
                NodeResponse::TxRolledBack(_)
            ));

            // The retry prepares under the same operation id, then the first
            // attempt's expiry comes due.
            task::sleep(Duration::from_millis(350)).await;
            exec.receive(coord.clone(), log_id(3), phase1(1, update(rid, 1)))
                .unwrap();
            assert!(matches!(
                next_response(&mut captured).await.1,
                NodeResponse::TxPrepared(_)
            ));
            task::sleep(Duration::from_millis(350)).await;
            assert_eq!(exec.status().await.unwrap().pending_transactions, 1);

            // The retry still holds the record.
            exec.receive(coord.clone(), log_id(4), phase1(2, update(rid, 1)))
                .unwrap();
            match next_response(&mut captured).await.1 {
                NodeResponse::Failure(Error::LockTimeout(_)) => (),
                other => panic!("unexpected {:?}", other),
            }
            exec.receive(coord.clone(), log_id(5), phase2(1, true, update(rid, 1)))
                .unwrap();
            match next_response(&mut captured).await.1 {
                NodeResponse::TxCommitted(done) => assert_eq!(done.updated[0].version, 2),
                other => panic!("unexpected {:?}", other),
            }
            assert_eq!(exec.status().await.unwrap().pending_transactions, 0);
        });
    }

    #[test]
    fn late_attempt_keeps_the_retry_waiting() {
        task::block_on(async {
            let config = ExecutorConfig {
                lock_timeout_ms: 5_000,
                ..quick()
            };
            let (exec, db, coord, mut captured) = setup(config);
            let (a, b) = (seed_at(&db, 0), seed_at(&db, 1));
            let both = || {
                let mut ops = update(a, 1);
                ops.extend(update(b, 1));
                ops
            };
            // Two unrelated transactions hold a and b.
            exec.receive(coord.clone(), log_id(1), phase1(9, update(a, 1)))
                .unwrap();
            exec.receive(coord.clone(), log_id(2), phase1(8, update(b, 1)))
                .unwrap();
            // The first attempt queues behind a and is rolled back; the retry
            // queues behind both.
            exec.receive(coord.clone(), log_id(3), phase1(1, update(a, 1)))
                .unwrap();
            exec.receive(coord.clone(), log_id(4), phase2(1, false, update(a, 1)))
                .unwrap();
            exec.receive(coord.clone(), log_id(5), phase1(1, both()))
                .unwrap();
            exec.receive(coord.clone(), log_id(6), phase2(9, false, update(a, 1)))
                .unwrap();
            let seen = responses(&mut captured, 5).await;
            assert!(matches!(seen.get(&3), Some(NodeResponse::TxPrepared(_))));
            assert!(matches!(seen.get(&4), Some(NodeResponse::TxRolledBack(_))));
            assert!(matches!(seen.get(&6), Some(NodeResponse::TxRolledBack(_))));

            // The first attempt is done; the retry is still preparing.
            let commit = request(NodeRequest::TxPhase2(TxPhase2Request {
                op_id: op(1),
                success: true,
                records: both(),
                indexes: vec![],
                allocations: vec![],
            }));
            exec.receive(coord.clone(), log_id(7), commit).unwrap();
            exec.receive(coord.clone(), log_id(8), phase2(8, false, update(b, 1)))
                .unwrap();
            let seen = responses(&mut captured, 3).await;
            assert!(matches!(seen.get(&5), Some(NodeResponse::TxPrepared(_))));
            match seen.get(&7) {
                Some(NodeResponse::TxCommitted(done)) => assert_eq!(done.updated.len(), 2),
                other => panic!("unexpected {:?}", other),
            }
            assert_eq!(db.read_record(&a).unwrap().0, 2);
            assert_eq!(db.read_record(&b).unwrap().0, 2);
            assert_eq!(exec.status().await.unwrap().pending_transactions, 0);
        });
    }

    #[test]
    fn ids_are_reserved_in_log_order() {
        task::block_on(async {
            let (exec, db, coord, mut captured) = setup(quick());
            db.execute_ddl("create index email unique").unwrap();
            let owner = seed_at(&db, 50);
            db.commit(&CommitSet {
                indexes: vec![IndexOperation {
                    index: "email".into(),
                    key: "taken".into(),
                    change: IndexChange::Put(owner),
                }],
                ..Default::default()
            })
            .unwrap();
            let create = |seq: u64, key: &str| {
                let temp = RecordId::new(9, -1);
                request(NodeRequest::TxPhase1(TxPhase1Request {
                    op_id: op(seq),
                    records: vec![RecordOperation::Create {
                        rid: temp,
                        content: vec![],
                    }],
                    indexes: vec![IndexOperation {
                        index: "email".into(),
                        key: key.into(),
                        change: IndexChange::Put(temp),
                    }],
                }))
            };
            // The first fails validation here but still uses up an id, as it
            // does on members where it prepares.
            exec.receive(coord.clone(), log_id(1), create(1, "taken"))
                .unwrap();
            exec.receive(coord.clone(), log_id(2), create(2, "b"))
                .unwrap();
            exec.receive(coord.clone(), log_id(3), create(3, "c"))
                .unwrap();
            let seen = responses(&mut captured, 3).await;
            assert!(matches!(
                seen.get(&1),
                Some(NodeResponse::Failure(Error::DuplicateKey { .. }))
            ));
            let allocated = |id: u64| match seen.get(&id) {
                Some(NodeResponse::TxPrepared(p)) => p.allocations[0].1,
                other => panic!("unexpected {:?}", other),
            };
            assert_eq!(allocated(2), RecordId::new(9, 52));
            assert_eq!(allocated(3), RecordId::new(9, 53));
        });
    }

    #[test]
    fn malformed_entry_fails_alone() {
        task::block_on(async {
            let (exec, _db, coord, mut captured) = setup(quick());
            let junk = Payload {
                type_code: 9999,
                body: vec![1, 2, 3],
            };
            exec.receive(coord.clone(), log_id(1), junk).unwrap();
            assert!(matches!(
                next_response(&mut captured).await.1,
                NodeResponse::Failure(_)
            ));
            exec.receive(coord.clone(), log_id(2), ddl("create index a"))
                .unwrap();
            assert!(matches!(
                next_response(&mut captured).await.1,
                NodeResponse::Ddl(_)
            ));
        });
    }

    #[test]
    fn propagated_entries_are_acked() {
        task::block_on(async {
            let (exec, db, coord, mut captured) = setup(quick());
            exec.receive_propagated(coord.clone(), log_id(1), ddl("create index a"))
                .unwrap();
            // A repeat is acked again but not applied twice.
            exec.receive_propagated(coord.clone(), log_id(1), ddl("create index a"))
                .unwrap();
            exec.status().await.unwrap();
            let acks: Vec<LogId> = captured
                .drain()
                .into_iter()
                .map(|env| match env {
                    Envelope::Ack { log_id, .. } => log_id,
                    other => panic!("unexpected {:?}", other),
                })
                .collect();
            assert_eq!(acks, vec![log_id(1), log_id(1)]);
            assert_eq!(db.index_names().len(), 1);
            exec.confirm(log_id(1)).unwrap();
            assert_eq!(exec.status().await.unwrap().confirmed, Some(log_id(1)));
        });
    }
}
