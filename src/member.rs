// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Members are named cluster participants, each paired with a [Channel] the
//! local node uses to address it. Channels only ever carry one-way
//! [Envelope]s: a request and its response are independent messages, and
//! nothing blocks across members waiting for a reply.

use crate::{network::Envelope, Error};
use futures::{
    channel::mpsc::UnboundedSender,
    future::{self, BoxFuture},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};

/// The name of a cluster member. Unique within a cluster and stable across
/// restarts of that member.
#[derive(Clone, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberName(pub String);

impl std::fmt::Debug for MemberName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("@{}", self.0))
    }
}

impl std::fmt::Display for MemberName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberName {
    fn from(s: &str) -> Self {
        MemberName(s.to_string())
    }
}

/// Resolves once a send has been handed to the transport, or failed to be.
pub type SendFuture = BoxFuture<'static, Result<(), Error>>;

/// Transport-agnostic contract for addressing one member.
///
/// Implementations should enqueue the envelope when `send` is called, not
/// when the returned future is first polled: actors call `send` in protocol
/// order and only await the returned futures later, off their own queue.
pub trait Channel: Send + Sync + 'static {
    fn send(&self, envelope: Envelope) -> SendFuture;

    /// Whether the member is currently reachable. Callers check this instead
    /// of assuming delivery.
    fn is_online(&self) -> BoxFuture<'static, bool>;
}

#[derive(Clone)]
pub struct Member {
    pub name: MemberName,
    pub channel: Arc<dyn Channel>,
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.name.fmt(f)
    }
}

impl Member {
    pub fn new(name: MemberName, channel: Arc<dyn Channel>) -> Self {
        Member { name, channel }
    }

    pub fn send(&self, envelope: Envelope) -> SendFuture {
        self.channel.send(envelope)
    }
}

/// Every member a node knows how to address, by name. Inbound envelopes only
/// carry the sender's name; this is how a reply finds its way back.
#[derive(Clone, Default)]
pub struct Directory {
    members: Arc<RwLock<BTreeMap<MemberName, Member>>>,
}

impl Directory {
    pub fn insert(&self, member: Member) {
        self.members.write().insert(member.name.clone(), member);
    }

    pub fn remove(&self, name: &MemberName) -> Option<Member> {
        self.members.write().remove(name)
    }

    pub fn get(&self, name: &MemberName) -> Option<Member> {
        self.members.read().get(name).cloned()
    }

    pub fn members(&self) -> Vec<Member> {
        self.members.read().values().cloned().collect()
    }
}

/// In-process channel delivering straight into a node's inbox, tagged with
/// the name of the sending member. Also used for a node addressing itself
/// when coordinator and executor co-reside.
pub struct LoopbackChannel {
    from: MemberName,
    to: MemberName,
    inbox: UnboundedSender<(MemberName, Envelope)>,
}

impl LoopbackChannel {
    pub fn new(
        from: MemberName,
        to: MemberName,
        inbox: UnboundedSender<(MemberName, Envelope)>,
    ) -> Self {
        LoopbackChannel { from, to, inbox }
    }
}

impl Channel for LoopbackChannel {
    fn send(&self, envelope: Envelope) -> SendFuture {
        let res = self
            .inbox
            .unbounded_send((self.from.clone(), envelope))
            .map_err(|_| Error::NodeOffline(self.to.clone()));
        Box::pin(future::ready(res))
    }

    fn is_online(&self) -> BoxFuture<'static, bool> {
        Box::pin(future::ready(!self.inbox.is_closed()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A channel that records every envelope instead of delivering it, so
    //! tests can play the part of the remote member by hand.

    use super::*;
    use futures::channel::mpsc::{self, UnboundedReceiver};
    use std::sync::atomic::{AtomicBool, Ordering};

    pub(crate) struct CaptureChannel {
        to: MemberName,
        online: Arc<AtomicBool>,
        sent: UnboundedSender<Envelope>,
    }

    pub(crate) struct Captured {
        pub online: Arc<AtomicBool>,
        pub sent: UnboundedReceiver<Envelope>,
    }

    impl Captured {
        /// Everything sent so far, without waiting for more.
        pub fn drain(&mut self) -> Vec<Envelope> {
            let mut out = Vec::new();
            while let Ok(Some(env)) = self.sent.try_next() {
                out.push(env);
            }
            out
        }
    }

    pub(crate) fn capture_member(name: &str) -> (Member, Captured) {
        let (tx, rx) = mpsc::unbounded();
        let online = Arc::new(AtomicBool::new(true));
        let chan = CaptureChannel {
            to: MemberName::from(name),
            online: online.clone(),
            sent: tx,
        };
        let member = Member::new(MemberName::from(name), Arc::new(chan));
        (member, Captured { online, sent: rx })
    }

    impl Channel for CaptureChannel {
        fn send(&self, envelope: Envelope) -> SendFuture {
            let res = if self.online.load(Ordering::SeqCst) {
                self.sent
                    .unbounded_send(envelope)
                    .map_err(|_| Error::NodeOffline(self.to.clone()))
            } else {
                Err(Error::NodeOffline(self.to.clone()))
            };
            Box::pin(future::ready(res))
        }

        fn is_online(&self) -> BoxFuture<'static, bool> {
            Box::pin(future::ready(self.online.load(Ordering::SeqCst)))
        }
    }
}
