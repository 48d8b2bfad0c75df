// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A transaction submit runs in two phases.
//!
//! Phase one asks every member to lock what the transaction touches,
//! validate record versions and unique keys, and reserve ids for created
//! records. Once a quorum has prepared, phase two tells every member to
//! commit, using the id reservations of the first member that prepared so
//! all replicas agree on the new records' ids. If the quorum can't be
//! reached, phase two tells every member to roll back instead.
//!
//! Phase two is sent to every member, not just the ones that prepared: a
//! member that failed (or missed) phase one applies the commit directly.

use crate::{
    context::most_relevant_failure, CommitResponse, CoordinatorCore, Error, MemberName,
    NodeRequest, NodeResponse, Origin, RecordId, RequestContext, ResponseHandler,
    SubmitRequest, SubmitResponse, TransactionSubmit, TxPhase1Request, TxPhase2Request,
};
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) fn begin(
    coordinator: &mut CoordinatorCore,
    origin: Origin,
    submit: Arc<SubmitRequest>,
    tx: TransactionSubmit,
) -> Result<(), Error> {
    if tx.is_empty() {
        let nothing = SubmitResponse::Transaction(CommitResponse::default());
        coordinator.reply(&origin, nothing);
        return Ok(());
    }
    let request = NodeRequest::TxPhase1(TxPhase1Request {
        op_id: origin.op_id.clone(),
        records: tx.records,
        indexes: tx.indexes,
    });
    coordinator.send_operation(origin, submit, request, Box::new(FirstPhase::default()))?;
    Ok(())
}

fn send_second_phase(
    coordinator: &mut CoordinatorCore,
    context: &RequestContext,
    success: bool,
    allocations: Vec<(RecordId, RecordId)>,
) {
    let (records, indexes) = match &*context.submit {
        SubmitRequest::Transaction(tx) => (tx.records.clone(), tx.indexes.clone()),
        _ => (vec![], vec![]),
    };
    let request = NodeRequest::TxPhase2(TxPhase2Request {
        op_id: context.origin.op_id.clone(),
        success,
        records,
        indexes,
        allocations,
    });
    let handler = Box::new(SecondPhase {
        reply: success,
        advanced: false,
    });
    if let Err(e) = coordinator.send_operation(
        context.origin.clone(),
        context.submit.clone(),
        request,
        handler,
    ) {
        warn!("could not send phase two of {:?}: {}", context.origin.op_id, e);
        coordinator.reply(&context.origin, SubmitResponse::Failed(e));
    }
}

#[derive(Default)]
struct FirstPhase {
    advanced: bool,
}

impl ResponseHandler for FirstPhase {
    fn receive(
        &mut self,
        coordinator: &mut CoordinatorCore,
        context: &RequestContext,
        _member: &MemberName,
        _response: &NodeResponse,
    ) -> bool {
        if !self.advanced {
            let prepared: Vec<&Vec<(RecordId, RecordId)>> = context
                .responses
                .iter()
                .filter_map(|(_, r)| match r {
                    NodeResponse::TxPrepared(p) => Some(&p.allocations),
                    _ => None,
                })
                .collect();
            if prepared.len() >= context.quorum {
                self.advanced = true;
                debug!(
                    "{:?} prepared on {} members, committing",
                    context.origin.op_id,
                    prepared.len()
                );
                let allocations = prepared[0].clone();
                send_second_phase(coordinator, context, true, allocations);
            } else if context.quorum_unreachable(context.responses.len() - prepared.len()) {
                self.advanced = true;
                let failure =
                    most_relevant_failure(context).unwrap_or(Error::ReplicationFailed);
                debug!(
                    "{:?} cannot prepare ({}), rolling back",
                    context.origin.op_id, failure
                );
                coordinator.reply(&context.origin, SubmitResponse::Failed(failure));
                send_second_phase(coordinator, context, false, vec![]);
            }
        }
        context.resolved()
    }

    fn timeout(&mut self, coordinator: &mut CoordinatorCore, context: &RequestContext) -> bool {
        if !self.advanced {
            self.advanced = true;
            let prepared = context.count(|r| matches!(r, NodeResponse::TxPrepared(_)));
            coordinator.reply(
                &context.origin,
                SubmitResponse::Failed(Error::QuorumTimeout {
                    quorum: context.quorum,
                    received: prepared,
                }),
            );
            send_second_phase(coordinator, context, false, vec![]);
        }
        true
    }
}

struct SecondPhase {
    // Rollbacks are fire-and-forget; the client already has its answer.
    reply: bool,
    advanced: bool,
}

impl ResponseHandler for SecondPhase {
    fn receive(
        &mut self,
        coordinator: &mut CoordinatorCore,
        context: &RequestContext,
        _member: &MemberName,
        _response: &NodeResponse,
    ) -> bool {
        if self.reply && !self.advanced {
            let committed: Vec<&CommitResponse> = context
                .responses
                .iter()
                .filter_map(|(_, r)| match r {
                    NodeResponse::TxCommitted(c) => Some(c),
                    _ => None,
                })
                .collect();
            if committed.len() >= context.quorum {
                self.advanced = true;
                let answer = committed[0].clone();
                coordinator.reply(&context.origin, SubmitResponse::Transaction(answer));
            } else if context.quorum_unreachable(context.responses.len() - committed.len()) {
                self.advanced = true;
                warn!(
                    "{:?} committed on too few members: {:?}",
                    context.origin.op_id,
                    context.failures().collect::<Vec<_>>()
                );
                let failed = SubmitResponse::Failed(Error::ReplicationFailed);
                coordinator.reply(&context.origin, failed);
            }
        }
        context.resolved()
    }

    fn timeout(&mut self, coordinator: &mut CoordinatorCore, context: &RequestContext) -> bool {
        if self.reply && !self.advanced {
            self.advanced = true;
            let committed = context.count(|r| matches!(r, NodeResponse::TxCommitted(_)));
            coordinator.reply(
                &context.origin,
                SubmitResponse::Failed(Error::QuorumTimeout {
                    quorum: context.quorum,
                    received: committed,
                }),
            );
        }
        true
    }
}
