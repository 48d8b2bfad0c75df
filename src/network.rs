// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! This module glues a node's peer connections and their IO service loops,
//! provided by edelcrantz, to the node's inbox. Everything protocol-level
//! travels as one-way [Envelope]s; the only request/response exchange on a
//! connection is a liveness probe.

use crate::{
    Channel, Error, LocalDatabase, LogId, Member, MemberName, Node, Payload, SendFuture,
    SessionOperationId,
};
use async_std::{
    future::timeout,
    sync::{Arc, Mutex},
    task,
};
use futures::{
    channel::{
        mpsc::{self, UnboundedSender},
        oneshot,
    },
    future::{self, BoxFuture},
    StreamExt,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, debug_span, trace, warn, Instrument};

/// Everything one member sends another. Each names the database it concerns;
/// requests and responses are correlated by [LogId] (between coordinator and
/// executors) or [SessionOperationId] (between clients and coordinator).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// An encoded [crate::NodeRequest], from coordinator to executor.
    NodeRequest {
        database: String,
        log_id: LogId,
        payload: Payload,
    },
    /// An encoded [crate::NodeResponse], from executor to coordinator.
    NodeResponse {
        database: String,
        log_id: LogId,
        payload: Payload,
    },
    /// An encoded [crate::SubmitRequest], from client to coordinator.
    SubmitRequest {
        database: String,
        op_id: SessionOperationId,
        payload: Payload,
    },
    /// An encoded [crate::SubmitResponse], from coordinator to client.
    SubmitResponse {
        database: String,
        op_id: SessionOperationId,
        payload: Payload,
    },
    /// A logged entry resent to a member catching up.
    Propagate {
        database: String,
        log_id: LogId,
        payload: Payload,
    },
    /// A member has applied a propagated entry.
    Ack { database: String, log_id: LogId },
    /// The coordinator considers the member caught up to `log_id`.
    Confirm { database: String, log_id: LogId },
    /// A member asks for every entry after `from` to be propagated to it.
    Resync {
        database: String,
        from: Option<LogId>,
    },
}

impl Envelope {
    pub fn database(&self) -> &str {
        match self {
            Envelope::NodeRequest { database, .. }
            | Envelope::NodeResponse { database, .. }
            | Envelope::SubmitRequest { database, .. }
            | Envelope::SubmitResponse { database, .. }
            | Envelope::Propagate { database, .. }
            | Envelope::Ack { database, .. }
            | Envelope::Confirm { database, .. }
            | Envelope::Resync { database, .. } => database,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Probe;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ProbeAck(pub MemberName);

type Conn = edelcrantz::Connection<Envelope, Probe, ProbeAck>;
type Queue = edelcrantz::Queue<Envelope, Probe, ProbeAck>;

pub(crate) type Connection = (Arc<Mutex<Conn>>, Queue);

/// A [Channel] over an edelcrantz connection. Envelopes are handed to an
/// outbox task at `send` time, which enqueues them on the connection in the
/// order they were sent.
pub struct StreamChannel {
    to: MemberName,
    outbox: UnboundedSender<(Envelope, oneshot::Sender<Result<(), Error>>)>,
    queue: Queue,
    probe_timeout: Duration,
}

impl StreamChannel {
    pub(crate) fn new(to: MemberName, queue: Queue, probe_timeout: Duration) -> Self {
        let (outbox, mut pending) =
            mpsc::unbounded::<(Envelope, oneshot::Sender<Result<(), Error>>)>();
        let span = debug_span!("outbox", remote=?to);
        let q = queue.clone();
        task::spawn(
            async move {
                while let Some((envelope, done)) = pending.next().await {
                    let res = q.enqueue_oneway(envelope).await.map_err(Error::from);
                    let _ = done.send(res);
                }
                trace!("outbox closed");
            }
            .instrument(span),
        );
        StreamChannel {
            to,
            outbox,
            queue,
            probe_timeout,
        }
    }
}

impl Channel for StreamChannel {
    fn send(&self, envelope: Envelope) -> SendFuture {
        let (done, res) = oneshot::channel();
        if self.outbox.unbounded_send((envelope, done)).is_err() {
            return Box::pin(future::ready(Err(Error::NodeOffline(self.to.clone()))));
        }
        let to = self.to.clone();
        Box::pin(async move {
            match res.await {
                Ok(res) => res,
                Err(_) => Err(Error::NodeOffline(to)),
            }
        })
    }

    fn is_online(&self) -> BoxFuture<'static, bool> {
        let probe = self.queue.enqueue_request(Probe);
        let wait = self.probe_timeout;
        Box::pin(async move { matches!(timeout(wait, probe).await, Ok(Ok(_))) })
    }
}

impl<D: LocalDatabase> Node<D> {
    /// Adds a connection to a remote member. The `io` handle should be a
    /// full-duplex `AsyncRead+AsyncWrite` type. Connections must be added
    /// before [Node::launch_workers] is called.
    pub async fn connect<IO: edelcrantz::AsyncReadWrite>(&self, peer: MemberName, io: IO) {
        debug!("connecting {:?} to {:?}", self.name(), peer);
        let conn = edelcrantz::Connection::new(io);
        let queue = conn.queue.clone();
        let probe_timeout = self.config().coordinator.response_timeout();
        let channel = StreamChannel::new(peer.clone(), queue.clone(), probe_timeout);
        self.connections
            .write()
            .await
            .insert(peer.clone(), (Arc::new(Mutex::new(conn)), queue));
        self.add_peer(Member::new(peer, Arc::new(channel)));
    }

    /// Starts the node's dispatch task and a service task for every
    /// connection. Should be called once, after the connections are added.
    pub async fn launch_workers(&self) {
        let inbox = match self.take_inbox() {
            Some(inbox) => inbox,
            None => {
                warn!("workers already launched on {:?}", self.name());
                return;
            }
        };
        task::spawn({
            let this = self.clone();
            let span = debug_span!("dispatch", member=?this.name());
            async move { this.run_dispatch(inbox).await }.instrument(span)
        });
        for (id, conn) in self.connections.read().await.iter() {
            let id = id.clone();
            let conn = conn.0.clone();
            let inbox = self.inbox_sender();
            let me = self.name().clone();
            task::spawn(async move {
                let mut n: usize = 0;
                loop {
                    n += 1;
                    let sreq = {
                        let me = me.clone();
                        let span = debug_span!("probe", member=?me, remote=?id, ?n);
                        move |_: Probe| task::spawn(async move { ProbeAck(me) }.instrument(span))
                    };
                    let sow = {
                        let inbox = inbox.clone();
                        let id = id.clone();
                        move |envelope: Envelope| {
                            if inbox.unbounded_send((id.clone(), envelope)).is_err() {
                                warn!("inbox closed, dropping envelope from {:?}", id);
                            }
                        }
                    };
                    let mut guard = conn.lock().await;
                    let span = debug_span!("service", member=?me, remote=?id);
                    let res = guard.advance(sreq, sow).instrument(span).await;
                    trace!("service task talking to {:?} advanced (step {:?}): {:?}", id, n, res);
                    match res {
                        Ok(()) => (),
                        // A prober that gave up waiting isn't our problem.
                        Err(edelcrantz::Error::ResponseChannelDropped(_)) => (),
                        Err(_) => break,
                    }
                }
                warn!("service task on {:?} talking to {:?} exited", me, id);
            });
        }
    }
}
