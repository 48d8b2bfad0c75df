// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    quorum_unreachable, CoordinatorCore, LogId, Member, MemberName, NodeRequest, NodeResponse,
    SessionOperationId, SubmitRequest,
};
use std::sync::Arc;

/// Who asked for an operation, and where its [crate::SubmitResponse] goes.
#[derive(Clone, Debug)]
pub struct Origin {
    pub member: Member,
    pub op_id: SessionOperationId,
}

/// Coordinator-side bookkeeping for one logged [NodeRequest] in flight. At
/// most one exists per [LogId]; it only changes when a response for it is
/// processed on the coordinator's actor.
#[derive(Debug)]
pub struct RequestContext {
    pub log_id: LogId,
    pub origin: Origin,
    pub submit: Arc<SubmitRequest>,
    pub request: NodeRequest,
    /// Responses in arrival order, at most one per involved member.
    pub responses: Vec<(MemberName, NodeResponse)>,
    pub quorum: usize,
    pub involved: Vec<MemberName>,
}

impl RequestContext {
    pub fn has_response_from(&self, member: &MemberName) -> bool {
        self.responses.iter().any(|(m, _)| m == member)
    }

    pub fn is_involved(&self, member: &MemberName) -> bool {
        self.involved.contains(member)
    }

    /// Every involved member has answered.
    pub fn resolved(&self) -> bool {
        self.responses.len() >= self.involved.len()
    }

    pub fn count<F: Fn(&NodeResponse) -> bool>(&self, pred: F) -> usize {
        self.responses.iter().filter(|(_, r)| pred(r)).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &crate::Error> {
        self.responses.iter().filter_map(|(_, r)| r.failure())
    }

    /// Whether `failures` non-positive responses already mean the quorum
    /// can't be reached by the members yet to answer.
    pub fn quorum_unreachable(&self, failures: usize) -> bool {
        quorum_unreachable(self.quorum, self.involved.len(), failures)
    }

    /// Involved members with no response yet.
    pub fn missing(&self) -> Vec<MemberName> {
        self.involved
            .iter()
            .filter(|m| !self.has_response_from(m))
            .cloned()
            .collect()
    }
}

/// The policy bound to a [RequestContext]: decides when a phase has its
/// quorum, what happens next, and what a timeout means for it.
///
/// Handlers run on the coordinator's actor, with the context detached from
/// the active map for the duration of the call, so they're free to send
/// further phases or reply through the [CoordinatorCore].
pub trait ResponseHandler: Send + 'static {
    /// Called for every response to the context, after it's been appended to
    /// `context.responses`. Returns true once every involved member has
    /// answered, whether or not the quorum logic already fired; the context
    /// is then dropped.
    fn receive(
        &mut self,
        coordinator: &mut CoordinatorCore,
        context: &RequestContext,
        member: &MemberName,
        response: &NodeResponse,
    ) -> bool;

    /// Called if the response window closes before every member answered.
    /// Returns true if the handler concluded the operation itself, false to
    /// have the coordinator escalate with a quorum timeout.
    fn timeout(&mut self, coordinator: &mut CoordinatorCore, context: &RequestContext) -> bool;
}

/// Picks the failure to report when a phase can't succeed: a retryable one
/// if there is any, so the client gets a chance to resubmit.
pub(crate) fn most_relevant_failure(context: &RequestContext) -> Option<crate::Error> {
    let mut first = None;
    for e in context.failures() {
        if e.is_retryable() {
            return Some(e.clone());
        }
        if first.is_none() {
            first = Some(e.clone());
        }
    }
    first
}
