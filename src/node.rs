// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    network, Coordinator, Directory, Envelope, Error, Executor, LocalDatabase, LoopbackChannel,
    Member, MemberName, NodeConfig, Payload, SubmitContext, SubmitRequest, SubmitResponse,
};
use async_std::{
    sync::{Arc, RwLock},
    task,
};
use futures::{
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
    StreamExt,
};
use std::collections::BTreeMap;
use tracing::{debug, instrument, trace, warn};

type Inbox = UnboundedReceiver<(MemberName, Envelope)>;

/// Main object that clients instantiate: one member's share of one
/// database. Every node runs an [Executor] over the [LocalDatabase] it's
/// given; the one chosen to coordinate also runs the [Coordinator]. Clients
/// need to provide the database and either in-process peers (see
/// [Node::loopback]) or async IO connections to other members.
pub struct Node<D: LocalDatabase> {
    name: MemberName,
    database: String,
    config: NodeConfig,
    db: Arc<D>,

    /// Every member this node can address, itself included.
    directory: Directory,

    executor: Executor,
    submit: SubmitContext,

    /// Present while this node coordinates the database.
    coordinator: Arc<parking_lot::RwLock<Option<Coordinator>>>,

    /// Envelopes from every peer, tagged with the sender, drained by the
    /// dispatch task once workers are launched.
    inbox: UnboundedSender<(MemberName, Envelope)>,
    inbox_rx: Arc<parking_lot::Mutex<Option<Inbox>>>,

    /// The map of network connections, served by network service loops.
    pub(crate) connections: Arc<RwLock<BTreeMap<MemberName, network::Connection>>>,
}

impl<D: LocalDatabase> Clone for Node<D> {
    fn clone(&self) -> Self {
        Node {
            name: self.name.clone(),
            database: self.database.clone(),
            config: self.config.clone(),
            db: self.db.clone(),
            directory: self.directory.clone(),
            executor: self.executor.clone(),
            submit: self.submit.clone(),
            coordinator: self.coordinator.clone(),
            inbox: self.inbox.clone(),
            inbox_rx: self.inbox_rx.clone(),
            connections: self.connections.clone(),
        }
    }
}

impl<D: LocalDatabase> std::fmt::Debug for Node<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Node({:?}, {})", self.name, self.database))
    }
}

impl<D: LocalDatabase> Node<D> {
    /// Construct a new Node. The [MemberName] should be unique among the
    /// members of a cluster.
    pub fn new(name: MemberName, database: &str, db: D, config: NodeConfig) -> Self {
        let db = Arc::new(db);
        let (inbox, inbox_rx) = mpsc::unbounded();
        let executor = Executor::spawn(name.clone(), database, db.clone(), config.executor.clone());
        let submit = SubmitContext::new(name.clone(), database, config.submit.clone());
        let directory = Directory::default();
        let me = LoopbackChannel::new(name.clone(), name.clone(), inbox.clone());
        directory.insert(Member::new(name.clone(), Arc::new(me)));
        Node {
            name,
            database: database.to_string(),
            config,
            db,
            directory,
            executor,
            submit,
            coordinator: Arc::new(parking_lot::RwLock::new(None)),
            inbox,
            inbox_rx: Arc::new(parking_lot::Mutex::new(Some(inbox_rx))),
            connections: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn name(&self) -> &MemberName {
        &self.name
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn local_database(&self) -> &D {
        &self.db
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn submit_context(&self) -> &SubmitContext {
        &self.submit
    }

    pub fn coordinator(&self) -> Option<Coordinator> {
        self.coordinator.read().clone()
    }

    pub fn members(&self) -> Vec<MemberName> {
        self.directory.members().into_iter().map(|m| m.name).collect()
    }

    /// A [Member] that other nodes in the same process can add with
    /// [Node::add_peer] to reach this one. `from` names the node that will
    /// be sending.
    pub fn loopback(&self, from: &MemberName) -> Member {
        let chan = LoopbackChannel::new(from.clone(), self.name.clone(), self.inbox.clone());
        Member::new(self.name.clone(), Arc::new(chan))
    }

    /// Makes `member` addressable from this node. If this node coordinates,
    /// the member also joins future fan-outs.
    pub fn add_peer(&self, member: Member) {
        debug!("{:?} adding peer {:?}", self.name, member.name);
        self.directory.insert(member.clone());
        if let Some(c) = self.coordinator() {
            if let Err(e) = c.join(member) {
                warn!("coordinator refused join: {}", e);
            }
        }
    }

    pub fn remove_peer(&self, name: &MemberName) {
        self.directory.remove(name);
        if let Some(c) = self.coordinator() {
            let _ = c.leave(name.clone());
        }
    }

    /// Starts coordinating the database here, with every known member
    /// (this node included) joined, and points this node's submissions at
    /// it.
    pub fn become_coordinator(&self) -> Result<Coordinator, Error> {
        let coordinator = Coordinator::spawn(
            self.name.clone(),
            &self.database,
            self.config.coordinator.clone(),
        );
        for member in self.directory.members() {
            coordinator.join(member)?;
        }
        if let Some(old) = self.coordinator.write().replace(coordinator.clone()) {
            old.shutdown();
        }
        self.set_coordinator(&self.name)?;
        Ok(coordinator)
    }

    /// Points this node's submissions at the member called `name`. Stops
    /// any coordinator running here if that's someone else.
    pub fn set_coordinator(&self, name: &MemberName) -> Result<(), Error> {
        let member = match self.directory.get(name) {
            Some(m) => m,
            None => return Err(Error::NodeOffline(name.clone())),
        };
        if *name != self.name {
            if let Some(old) = self.coordinator.write().take() {
                debug!("{:?} handing coordination to {:?}", self.name, name);
                old.shutdown();
            }
        }
        self.submit.set_coordinator(member);
        Ok(())
    }

    /// Submits a request through this node's [SubmitContext].
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, Error> {
        self.submit.submit(request).await
    }

    pub(crate) fn take_inbox(&self) -> Option<Inbox> {
        self.inbox_rx.lock().take()
    }

    pub(crate) fn inbox_sender(&self) -> UnboundedSender<(MemberName, Envelope)> {
        self.inbox.clone()
    }

    pub(crate) async fn run_dispatch(&self, mut inbox: Inbox) {
        while let Some((from, envelope)) = inbox.next().await {
            if let Err(e) = self.dispatch(from, envelope) {
                warn!("dispatch failed: {}", e);
            }
        }
        debug!("dispatch on {:?} exited", self.name);
    }

    fn member(&self, name: &MemberName) -> Result<Member, Error> {
        match self.directory.get(name) {
            Some(m) => Ok(m),
            None => Err(Error::NodeOffline(name.clone())),
        }
    }

    /// Routes one inbound envelope to the executor, the coordinator or the
    /// submit context.
    #[instrument(skip(self, envelope))]
    pub(crate) fn dispatch(&self, from: MemberName, envelope: Envelope) -> Result<(), Error> {
        if envelope.database() != self.database {
            warn!("dropping envelope for unknown database {}", envelope.database());
            return Ok(());
        }
        match envelope {
            Envelope::NodeRequest {
                log_id, payload, ..
            } => self.executor.receive(self.member(&from)?, log_id, payload),
            Envelope::Propagate {
                log_id, payload, ..
            } => self
                .executor
                .receive_propagated(self.member(&from)?, log_id, payload),
            Envelope::Confirm { log_id, .. } => self.executor.confirm(log_id),
            Envelope::NodeResponse {
                log_id, payload, ..
            } => match self.coordinator() {
                Some(c) => c.receive(from, log_id, &payload),
                None => {
                    trace!("not coordinating, dropping response to {:?}", log_id);
                    Ok(())
                }
            },
            Envelope::Ack { log_id, .. } => match self.coordinator() {
                Some(c) => c.ack(from, log_id),
                None => Ok(()),
            },
            Envelope::Resync { from: after, .. } => match self.coordinator() {
                Some(c) => c.sync_member(self.member(&from)?, after),
                None => Ok(()),
            },
            Envelope::SubmitRequest { op_id, payload, .. } => {
                let origin = self.member(&from)?;
                match self.coordinator() {
                    Some(c) => c.submit(origin, op_id, payload),
                    None => {
                        let refusal = SubmitResponse::Failed(Error::NotCoordinator);
                        let sent = origin.send(Envelope::SubmitResponse {
                            database: self.database.clone(),
                            op_id,
                            payload: Payload::encode(&refusal)?,
                        });
                        task::spawn(async move {
                            let _ = sent.await;
                        });
                        Ok(())
                    }
                }
            }
            Envelope::SubmitResponse { op_id, payload, .. } => {
                let response = match payload.decode::<SubmitResponse>() {
                    Ok(r) => r,
                    Err(e) => SubmitResponse::Failed(e),
                };
                self.submit.receive(&op_id, response);
                Ok(())
            }
        }
    }
}
