// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Structural changes (DDL) go out in a single phase. The first quorum of
//! successes answers the client; a response window closing with nothing
//! answered is escalated to the coordinator rather than concluded here,
//! since a half-applied schema change is something an operator has to see.

use crate::{
    context::most_relevant_failure, CoordinatorCore, DdlRequest, Error, MemberName, NodeRequest,
    NodeResponse, Origin, RequestContext, ResponseHandler, SubmitRequest, SubmitResponse,
};
use std::sync::Arc;
use tracing::warn;

pub(crate) fn begin(
    coordinator: &mut CoordinatorCore,
    origin: Origin,
    submit: Arc<SubmitRequest>,
    ddl: DdlRequest,
) -> Result<(), Error> {
    let handler = Box::new(DdlHandler { replied: false });
    coordinator.send_operation(origin, submit, NodeRequest::Ddl(ddl), handler)?;
    Ok(())
}

struct DdlHandler {
    replied: bool,
}

impl ResponseHandler for DdlHandler {
    fn receive(
        &mut self,
        coordinator: &mut CoordinatorCore,
        context: &RequestContext,
        member: &MemberName,
        response: &NodeResponse,
    ) -> bool {
        if let NodeResponse::Failure(e) = response {
            warn!("{:?} failed on {:?}: {}", context.log_id, member, e);
        }
        if !self.replied {
            let first_success = context.responses.iter().find_map(|(_, r)| match r {
                NodeResponse::Ddl(result) => Some(result.clone()),
                _ => None,
            });
            let successes = context.count(|r| matches!(r, NodeResponse::Ddl(_)));
            if successes >= context.quorum {
                self.replied = true;
                let result = first_success.unwrap_or_default();
                coordinator.reply(&context.origin, SubmitResponse::Ddl(result));
            } else if context.quorum_unreachable(context.responses.len() - successes) {
                self.replied = true;
                let failure = most_relevant_failure(context).unwrap_or(Error::ReplicationFailed);
                coordinator.reply(&context.origin, SubmitResponse::Failed(failure));
            }
        }
        context.resolved()
    }

    fn timeout(&mut self, _coordinator: &mut CoordinatorCore, _context: &RequestContext) -> bool {
        self.replied
    }
}
