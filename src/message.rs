// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The four payload families exchanged by the protocol, each a closed set of
//! variants with stable type codes (see [crate::Tagged]).
//!
//!   - [SubmitRequest] / [SubmitResponse]: between a client's submit context
//!     and the coordinator.
//!   - [NodeRequest] / [NodeResponse]: between the coordinator and the
//!     executor on each member.

use crate::{Error, MemberName, SessionOperationId};
use serde::{Deserialize, Serialize};

/// Identity of a stored record: a cluster and a position within it.
/// Records not yet created carry a temporary id with a negative position.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId {
    pub cluster: i32,
    pub position: i64,
}

impl std::fmt::Debug for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("#{}:{}", self.cluster, self.position))
    }
}

impl RecordId {
    pub fn new(cluster: i32, position: i64) -> Self {
        RecordId { cluster, position }
    }

    pub fn is_temporary(&self) -> bool {
        self.position < 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordOperation {
    Create { rid: RecordId, content: Vec<u8> },
    Update {
        rid: RecordId,
        version: u32,
        content: Vec<u8>,
    },
    Delete { rid: RecordId, version: u32 },
}

impl RecordOperation {
    pub fn rid(&self) -> RecordId {
        match self {
            RecordOperation::Create { rid, .. }
            | RecordOperation::Update { rid, .. }
            | RecordOperation::Delete { rid, .. } => *rid,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexChange {
    Put(RecordId),
    Remove,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexOperation {
    pub index: String,
    pub key: String,
    pub change: IndexChange,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CreatedRecord {
    /// The temporary id the client used.
    pub temporary: RecordId,
    pub rid: RecordId,
    pub version: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdatedRecord {
    pub rid: RecordId,
    pub version: u32,
}

// Submit-side payloads.

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionSubmit {
    pub records: Vec<RecordOperation>,
    pub indexes: Vec<IndexOperation>,
}

impl TransactionSubmit {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.indexes.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DdlRequest {
    pub query: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceAction {
    Next,
    Current,
    Reset,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceRequest {
    pub sequence: String,
    pub action: SequenceAction,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubmitRequest {
    Transaction(TransactionSubmit),
    Ddl(DdlRequest),
    Sequence(SequenceRequest),
}

tagged_payload!(SubmitRequest {
    1 => Transaction(TransactionSubmit),
    2 => Ddl(DdlRequest),
    3 => Sequence(SequenceRequest),
});

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitResponse {
    pub created: Vec<CreatedRecord>,
    pub updated: Vec<UpdatedRecord>,
    pub deleted: Vec<RecordId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceResponse {
    /// What the sequence returned on the member that submitted the action.
    pub result_of_sender: Option<i64>,
    pub failed_on: Vec<MemberName>,
    pub limit_reached_on: Vec<MemberName>,
    pub involved: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubmitResponse {
    Transaction(CommitResponse),
    Ddl(String),
    Sequence(SequenceResponse),
    Failed(Error),
}

tagged_payload!(SubmitResponse {
    1 => Transaction(CommitResponse),
    2 => Ddl(String),
    3 => Sequence(SequenceResponse),
    4 => Failed(Error),
});

impl SubmitResponse {
    pub fn is_retryable_failure(&self) -> bool {
        match self {
            SubmitResponse::Failed(e) => e.is_retryable(),
            _ => false,
        }
    }
}

// Node-side payloads.

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxPhase1Request {
    pub op_id: SessionOperationId,
    pub records: Vec<RecordOperation>,
    pub indexes: Vec<IndexOperation>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxPhase2Request {
    pub op_id: SessionOperationId,
    pub success: bool,
    /// The operations again, so a member that never prepared the transaction
    /// can still apply it.
    pub records: Vec<RecordOperation>,
    pub indexes: Vec<IndexOperation>,
    /// Temporary id to allocated id, chosen once for every member.
    pub allocations: Vec<(RecordId, RecordId)>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRequest {
    TxPhase1(TxPhase1Request),
    TxPhase2(TxPhase2Request),
    Ddl(DdlRequest),
    Sequence(SequenceRequest),
}

tagged_payload!(NodeRequest {
    1 => TxPhase1(TxPhase1Request),
    2 => TxPhase2(TxPhase2Request),
    3 => Ddl(DdlRequest),
    4 => Sequence(SequenceRequest),
});

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PreparedResponse {
    pub allocations: Vec<(RecordId, RecordId)>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RolledBack(pub SessionOperationId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceOutcome {
    Value(i64),
    LimitReached,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeResponse {
    TxPrepared(PreparedResponse),
    TxCommitted(CommitResponse),
    TxRolledBack(RolledBack),
    Ddl(String),
    Sequence(SequenceOutcome),
    Failure(Error),
}

tagged_payload!(NodeResponse {
    1 => TxPrepared(PreparedResponse),
    2 => TxCommitted(CommitResponse),
    3 => TxRolledBack(RolledBack),
    4 => Ddl(String),
    5 => Sequence(SequenceOutcome),
    6 => Failure(Error),
});

impl NodeResponse {
    pub fn failure(&self) -> Option<&Error> {
        match self {
            NodeResponse::Failure(e) => Some(e),
            _ => None,
        }
    }
}
