// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Sequence actions run on every member, and the answer reports how each of
//! them fared: the client gets the value its own node produced plus the
//! members where the action failed or hit the sequence's limit, and decides
//! for itself whether that's good enough.

use crate::{
    CoordinatorCore, Error, MemberName, NodeRequest, NodeResponse, Origin, RequestContext,
    ResponseHandler, SequenceOutcome, SequenceRequest, SequenceResponse, SubmitRequest,
    SubmitResponse,
};
use std::sync::Arc;

pub(crate) fn begin(
    coordinator: &mut CoordinatorCore,
    origin: Origin,
    submit: Arc<SubmitRequest>,
    seq: SequenceRequest,
) -> Result<(), Error> {
    let handler = Box::new(SequenceHandler { replied: false });
    coordinator.send_operation(origin, submit, NodeRequest::Sequence(seq), handler)?;
    Ok(())
}

struct SequenceHandler {
    replied: bool,
}

fn summarize(context: &RequestContext) -> SequenceResponse {
    let mut out = SequenceResponse {
        involved: context.involved.len(),
        ..Default::default()
    };
    let mut any_value = None;
    for (member, response) in context.responses.iter() {
        match response {
            NodeResponse::Sequence(SequenceOutcome::Value(v)) => {
                if *member == context.origin.member.name {
                    out.result_of_sender = Some(*v);
                }
                any_value = any_value.or(Some(*v));
            }
            NodeResponse::Sequence(SequenceOutcome::LimitReached) => {
                out.limit_reached_on.push(member.clone())
            }
            _ => out.failed_on.push(member.clone()),
        }
    }
    // A client that isn't a member itself takes whatever the members agreed on.
    if out.result_of_sender.is_none() && !context.is_involved(&context.origin.member.name) {
        out.result_of_sender = any_value;
    }
    out
}

impl ResponseHandler for SequenceHandler {
    fn receive(
        &mut self,
        coordinator: &mut CoordinatorCore,
        context: &RequestContext,
        _member: &MemberName,
        _response: &NodeResponse,
    ) -> bool {
        let resolved = context.resolved();
        if resolved && !self.replied {
            self.replied = true;
            coordinator.reply(&context.origin, SubmitResponse::Sequence(summarize(context)));
        }
        resolved
    }

    fn timeout(&mut self, coordinator: &mut CoordinatorCore, context: &RequestContext) -> bool {
        if !self.replied {
            self.replied = true;
            let mut summary = summarize(context);
            summary.failed_on.extend(context.missing());
            coordinator.reply(&context.origin, SubmitResponse::Sequence(summary));
        }
        true
    }
}
