// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The coordinator actor. One task per coordinated database owns the leader
//! [OpLog], the joined members and the map of active [RequestContext]s, and
//! processes every protocol transition for every in-flight operation one at
//! a time off its command queue.
//!
//! Operations move through
//!
//!   `Submitted -> Phase1-Pending -> Phase1-Quorum -> Phase2-Pending ->
//!    Phase2-Quorum -> Replied`
//!
//! (single-phase requests skip the middle), with a timeout reachable from
//! either pending state. The phases themselves are driven by the
//! [ResponseHandler] each request kind binds to its contexts; this module
//! only does the logging, fan-out, routing, timers and replies.

use crate::{
    ddl, failures_tolerated, network::Envelope, resolve_quorum, sequence, transaction,
    CoordinatorConfig, Error, LogEntry, LogId, Member, MemberName, NodeRequest, NodeResponse,
    OpLog, Origin, Payload, RequestContext, ResponseHandler, SessionOperationId, SubmitRequest,
    SubmitResponse,
};
use async_std::task;
use futures::{
    channel::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    StreamExt,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::Arc,
};
use tracing::{debug, debug_span, error, instrument, trace, warn, Instrument};

pub(crate) enum Command {
    Submit {
        origin: Member,
        op_id: SessionOperationId,
        request: Payload,
    },
    Response {
        from: MemberName,
        log_id: LogId,
        response: NodeResponse,
    },
    Ack {
        from: MemberName,
        log_id: LogId,
    },
    Join(Member),
    Leave(MemberName),
    Timeout(LogId),
    Sync {
        member: Member,
        from: Option<LogId>,
    },
    Status(oneshot::Sender<CoordinatorStatus>),
    Iterate {
        from: Option<u64>,
        to: Option<u64>,
        reply: oneshot::Sender<Vec<LogEntry>>,
    },
    Shutdown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub last_log_id: Option<LogId>,
    pub active_contexts: usize,
    pub in_flight: usize,
    pub members: Vec<MemberName>,
}

/// Handle to a running coordinator actor. Cheap to clone; every method just
/// posts a command and (for queries) waits for the answer.
#[derive(Clone)]
pub struct Coordinator {
    name: MemberName,
    tx: UnboundedSender<Command>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Coordinator({:?})", self.name))
    }
}

impl Coordinator {
    /// Starts a coordinator for `database`, run by the member called `name`.
    pub fn spawn(name: MemberName, database: &str, config: CoordinatorConfig) -> Coordinator {
        let (tx, rx) = mpsc::unbounded();
        let core = CoordinatorCore::new(name.clone(), database, config, tx.clone());
        let span = debug_span!("coordinator", member=?name, db=%database);
        task::spawn(core.run(rx).instrument(span));
        Coordinator { name, tx }
    }

    pub fn name(&self) -> &MemberName {
        &self.name
    }

    fn post(&self, cmd: Command) -> Result<(), Error> {
        self.tx.unbounded_send(cmd).map_err(|_| Error::Shutdown)
    }

    /// Schedules the `begin` logic of an encoded [SubmitRequest]. The answer
    /// goes to `origin` as a [SubmitResponse] envelope.
    pub fn submit(
        &self,
        origin: Member,
        op_id: SessionOperationId,
        request: Payload,
    ) -> Result<(), Error> {
        self.post(Command::Submit {
            origin,
            op_id,
            request,
        })
    }

    pub fn submit_request(
        &self,
        origin: Member,
        op_id: SessionOperationId,
        request: &SubmitRequest,
    ) -> Result<(), Error> {
        self.submit(origin, op_id, Payload::encode(request)?)
    }

    /// Routes a member's response to the context for `log_id`. A payload
    /// that can't be decoded counts as a failure response from that member.
    pub fn receive(&self, from: MemberName, log_id: LogId, payload: &Payload) -> Result<(), Error> {
        let response = match payload.decode::<NodeResponse>() {
            Ok(r) => r,
            Err(e) => NodeResponse::Failure(e),
        };
        self.post(Command::Response {
            from,
            log_id,
            response,
        })
    }

    /// Admits a member to future fan-outs. Contexts already in flight keep
    /// the members they were sent to.
    pub fn join(&self, member: Member) -> Result<(), Error> {
        self.post(Command::Join(member))
    }

    pub fn leave(&self, name: MemberName) -> Result<(), Error> {
        self.post(Command::Leave(name))
    }

    pub fn ack(&self, from: MemberName, log_id: LogId) -> Result<(), Error> {
        self.post(Command::Ack { from, log_id })
    }

    /// Sends `member` every logged entry after `from` (everything, if
    /// `None`) as propagate envelopes, and a confirm once it has acked them.
    pub fn sync_member(&self, member: Member, from: Option<LogId>) -> Result<(), Error> {
        self.post(Command::Sync { member, from })
    }

    pub async fn status(&self) -> Result<CoordinatorStatus, Error> {
        let (tx, rx) = oneshot::channel();
        self.post(Command::Status(tx))?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// The logged entries with ids in `from..=to`.
    pub async fn iterate(
        &self,
        from: Option<u64>,
        to: Option<u64>,
    ) -> Result<Vec<LogEntry>, Error> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Iterate { from, to, reply })?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    pub fn shutdown(&self) {
        let _ = self.post(Command::Shutdown);
    }
}

struct Active {
    context: RequestContext,
    handler: Box<dyn ResponseHandler>,
}

/// The state owned by the coordinator actor. Handlers get `&mut` access to
/// it while they run, to start further phases and to reply.
pub struct CoordinatorCore {
    name: MemberName,
    database: String,
    config: CoordinatorConfig,
    log: OpLog,
    members: BTreeMap<MemberName, Member>,
    contexts: HashMap<LogId, Active>,

    // Operations begun and not yet answered.
    in_flight: HashSet<SessionOperationId>,

    // Final answers to recently completed operations, oldest first.
    completed: HashMap<SessionOperationId, SubmitResponse>,
    completed_order: VecDeque<SessionOperationId>,

    // Members being caught up, and the last entry sent to each.
    syncing: HashMap<MemberName, (Member, LogId)>,

    commands: UnboundedSender<Command>,
}

impl CoordinatorCore {
    fn new(
        name: MemberName,
        database: &str,
        config: CoordinatorConfig,
        commands: UnboundedSender<Command>,
    ) -> Self {
        let mut log = OpLog::new();
        log.set_leader(true, config.term);
        CoordinatorCore {
            name,
            database: database.to_string(),
            config,
            log,
            members: BTreeMap::new(),
            contexts: HashMap::new(),
            in_flight: HashSet::new(),
            completed: HashMap::new(),
            completed_order: VecDeque::new(),
            syncing: HashMap::new(),
            commands,
        }
    }

    async fn run(mut self, mut rx: UnboundedReceiver<Command>) {
        debug!("coordinator started, term {}", self.log.term());
        while let Some(cmd) = rx.next().await {
            match cmd {
                Command::Submit {
                    origin,
                    op_id,
                    request,
                } => self.handle_submit(origin, op_id, request),
                Command::Response {
                    from,
                    log_id,
                    response,
                } => self.handle_response(from, log_id, response),
                Command::Ack { from, log_id } => self.handle_ack(from, log_id),
                Command::Join(member) => {
                    self.members.insert(member.name.clone(), member.clone());
                    let n = self.members.len();
                    debug!(
                        "member {:?} joined, {} members tolerate {} failures",
                        member.name,
                        n,
                        failures_tolerated(n)
                    );
                }
                Command::Leave(name) => {
                    debug!("member {:?} left", name);
                    self.members.remove(&name);
                    self.syncing.remove(&name);
                }
                Command::Timeout(log_id) => self.handle_timeout(log_id),
                Command::Sync { member, from } => self.handle_sync(member, from),
                Command::Status(reply) => {
                    let _ = reply.send(self.status());
                }
                Command::Iterate { from, to, reply } => {
                    let _ = reply.send(self.log.iterate(from, to).cloned().collect());
                }
                Command::Shutdown => break,
            }
        }
        debug!(
            "coordinator stopped with {} contexts still active",
            self.contexts.len()
        );
    }

    pub fn name(&self) -> &MemberName {
        &self.name
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            last_log_id: self.log.last_log_id(),
            active_contexts: self.contexts.len(),
            in_flight: self.in_flight.len(),
            members: self.members.keys().cloned().collect(),
        }
    }

    #[instrument(skip(self, origin, request))]
    fn handle_submit(&mut self, origin: Member, op_id: SessionOperationId, request: Payload) {
        if self.in_flight.contains(&op_id) {
            debug!("{:?} is already in flight, ignoring resubmission", op_id);
            return;
        }
        if let Some(done) = self.completed.get(&op_id) {
            debug!("{:?} already completed, answering from cache", op_id);
            let done = done.clone();
            self.send_reply(&origin, op_id, &done);
            return;
        }
        let origin = Origin {
            member: origin,
            op_id: op_id.clone(),
        };
        self.in_flight.insert(op_id);
        let res = match request.decode::<SubmitRequest>() {
            Err(e) => Err(e),
            Ok(submit) => self.begin(origin.clone(), Arc::new(submit)),
        };
        if let Err(e) = res {
            warn!("{:?} failed to begin: {}", origin.op_id, e);
            self.reply(&origin, SubmitResponse::Failed(e));
        }
    }

    fn begin(&mut self, origin: Origin, submit: Arc<SubmitRequest>) -> Result<(), Error> {
        match &*submit {
            SubmitRequest::Transaction(tx) => {
                let tx = tx.clone();
                transaction::begin(self, origin, submit, tx)
            }
            SubmitRequest::Ddl(ddl) => {
                let ddl = ddl.clone();
                ddl::begin(self, origin, submit, ddl)
            }
            SubmitRequest::Sequence(seq) => {
                let seq = seq.clone();
                sequence::begin(self, origin, submit, seq)
            }
        }
    }

    /// Logs `request`, registers a context for it bound to `handler`, and
    /// sends it to every joined member. The quorum is fixed here, against
    /// the members the request actually goes to.
    pub fn send_operation(
        &mut self,
        origin: Origin,
        submit: Arc<SubmitRequest>,
        request: NodeRequest,
        handler: Box<dyn ResponseHandler>,
    ) -> Result<LogId, Error> {
        if self.members.is_empty() {
            return Err(Error::QuorumTimeout {
                quorum: 1,
                received: 0,
            });
        }
        let payload = Payload::encode(&request)?;
        let log_id = self.log.log(payload.clone());
        let involved: Vec<MemberName> = self.members.keys().cloned().collect();
        let quorum = resolve_quorum(self.config.quorum, involved.len());
        debug!(
            "sending {:?} for {:?} to {} members, quorum {}",
            log_id,
            origin.op_id,
            involved.len(),
            quorum
        );
        let context = RequestContext {
            log_id,
            origin,
            submit,
            request,
            responses: Vec::new(),
            quorum,
            involved,
        };
        self.contexts.insert(log_id, Active { context, handler });

        for member in self.members.values() {
            let envelope = Envelope::NodeRequest {
                database: self.database.clone(),
                log_id,
                payload: payload.clone(),
            };
            let sent = member.send(envelope);
            let to = member.name.clone();
            let commands = self.commands.clone();
            task::spawn(async move {
                if let Err(e) = sent.await {
                    trace!("{:?} undeliverable to {:?}: {}", log_id, to, e);
                    let _ = commands.unbounded_send(Command::Response {
                        from: to,
                        log_id,
                        response: NodeResponse::Failure(e),
                    });
                }
            });
        }

        let commands = self.commands.clone();
        let window = self.config.response_timeout();
        task::spawn(async move {
            task::sleep(window).await;
            let _ = commands.unbounded_send(Command::Timeout(log_id));
        });
        Ok(log_id)
    }

    fn handle_response(&mut self, from: MemberName, log_id: LogId, response: NodeResponse) {
        let mut active = match self.contexts.remove(&log_id) {
            None => {
                trace!(
                    "response from {:?} for {:?} has no active context, dropped",
                    from,
                    log_id
                );
                return;
            }
            Some(a) => a,
        };
        if !active.context.is_involved(&from) || active.context.has_response_from(&from) {
            trace!("duplicate or stray response from {:?} for {:?}", from, log_id);
            self.contexts.insert(log_id, active);
            return;
        }
        trace!("response from {:?} for {:?}: {:?}", from, log_id, response);
        active.context.responses.push((from.clone(), response.clone()));
        let Active { context, handler } = &mut active;
        if handler.receive(self, context, &from, &response) {
            debug!("{:?} resolved", log_id);
        } else {
            self.contexts.insert(log_id, active);
        }
    }

    fn handle_timeout(&mut self, log_id: LogId) {
        let mut active = match self.contexts.remove(&log_id) {
            None => return,
            Some(a) => a,
        };
        let Active { context, handler } = &mut active;
        debug!(
            "{:?} timed out with {} of {} responses, missing {:?}",
            log_id,
            context.responses.len(),
            context.involved.len(),
            context.missing()
        );
        if !handler.timeout(self, context) {
            let escalated = Error::QuorumTimeout {
                quorum: context.quorum,
                received: context.responses.len(),
            };
            warn!("{:?} escalated: {}", log_id, escalated);
            self.reply(&context.origin, SubmitResponse::Failed(escalated));
        }
    }

    /// The quorum a phase sent now would get.
    pub fn quorum(&self) -> usize {
        resolve_quorum(self.config.quorum, self.members.len())
    }

    pub fn has_replied(&self, op_id: &SessionOperationId) -> bool {
        !self.in_flight.contains(op_id)
    }

    /// Sends the final response for an operation. Only the first reply for
    /// a given operation goes out; later ones are dropped.
    pub fn reply(&mut self, origin: &Origin, response: SubmitResponse) {
        if !self.in_flight.remove(&origin.op_id) {
            trace!("{:?} already answered", origin.op_id);
            return;
        }
        debug!("answering {:?}", origin.op_id);
        if !response.is_retryable_failure() {
            self.remember(origin.op_id.clone(), response.clone());
        }
        self.send_reply(&origin.member, origin.op_id.clone(), &response);
    }

    fn remember(&mut self, op_id: SessionOperationId, response: SubmitResponse) {
        if self.config.completed_cache_size == 0 {
            return;
        }
        if self.completed.insert(op_id.clone(), response).is_none() {
            self.completed_order.push_back(op_id);
        }
        while self.completed_order.len() > self.config.completed_cache_size {
            if let Some(old) = self.completed_order.pop_front() {
                self.completed.remove(&old);
            }
        }
    }

    fn send_reply(&self, member: &Member, op_id: SessionOperationId, response: &SubmitResponse) {
        let payload = match Payload::encode(response) {
            Ok(p) => p,
            Err(e) => {
                error!("cannot encode answer to {:?}: {}", op_id, e);
                return;
            }
        };
        let sent = member.send(Envelope::SubmitResponse {
            database: self.database.clone(),
            op_id,
            payload,
        });
        let to = member.name.clone();
        task::spawn(async move {
            if let Err(e) = sent.await {
                warn!("answer to {:?} undeliverable: {}", to, e);
            }
        });
    }

    fn handle_sync(&mut self, member: Member, from: Option<LogId>) {
        let mut last = None;
        for entry in self.log.entries_after(from) {
            let sent = member.send(Envelope::Propagate {
                database: self.database.clone(),
                log_id: entry.log_id,
                payload: entry.payload.clone(),
            });
            task::spawn(async move {
                let _ = sent.await;
            });
            last = Some(entry.log_id);
        }
        match last {
            Some(last) => {
                debug!("propagating up to {:?} to {:?}", last, member.name);
                self.syncing.insert(member.name.clone(), (member, last));
            }
            None => {
                if let Some(last) = self.log.last_log_id() {
                    self.confirm(&member, last);
                }
            }
        }
    }

    fn handle_ack(&mut self, from: MemberName, log_id: LogId) {
        let done = match self.syncing.get(&from) {
            Some((_, last)) => *last == log_id,
            None => false,
        };
        if done {
            if let Some((member, last)) = self.syncing.remove(&from) {
                debug!("{:?} caught up to {:?}", from, last);
                self.confirm(&member, last);
            }
        }
    }

    fn confirm(&self, member: &Member, log_id: LogId) {
        let sent = member.send(Envelope::Confirm {
            database: self.database.clone(),
            log_id,
        });
        task::spawn(async move {
            let _ = sent.await;
        });
    }
}
