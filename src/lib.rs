// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! # Overview
//!
//! This crate implements the coordination core of a clustered database: a
//! single coordinator per database drives multi-phase operations across the
//! replicas of that database, collects quorum-sized acknowledgments, and
//! advances each operation through its phases until it can be reported back
//! to the client that submitted it.
//!
//! ## Summary
//!
//!   - Clients hand a [SubmitRequest] to a [SubmitContext], tagged with a
//!     client-chosen [SessionOperationId] that stays stable across retries.
//!
//!   - The [Coordinator] calls the request's `begin` logic, which logs a
//!     [NodeRequest] in the coordinator's [OpLog] (assigning it a [LogId]),
//!     registers a [RequestContext] bound to a [ResponseHandler], and fans the
//!     request out to every joined [Member].
//!
//!   - Each member's [Executor] mirrors the entry into its own log (strictly
//!     in [LogId] order), applies it to its [LocalDatabase] under record and
//!     index-key locks from its [LockManager], and sends a [NodeResponse]
//!     back.
//!
//!   - Responses are routed to their context; once the handler sees a
//!     quorum it either starts the next phase or replies with the final
//!     [SubmitResponse].
//!
//! Transactions use two phases: a prepare phase that validates and locks on
//! every member, then a commit (or rollback) phase. DDL statements and
//! sequence actions are single-phase.
//!
//! ## Concurrency
//!
//! Coordinators and executors are actors: each is a task owning all of its
//! mutable state and draining a queue of commands, so the map of in-flight
//! contexts and the operation logs are never touched by two tasks at once.
//! The only waits are lock acquisition (bounded by a timeout) and waiting for
//! responses (event-driven, bounded by a response timeout).
//!
//! ## Caveats
//!
//!  - There's no leader election here. Some other membership service has to
//!    decide which [Node] runs the [Coordinator] for a database and tell the
//!    others.
//!
//!  - Delivery is assumed to be at-least-once. Duplicate and late responses
//!    are dropped; duplicate submissions are recognized by their
//!    [SessionOperationId].
//!
//!  - Storage, query languages and byte-level formats are someone else's
//!    problem: the embedding server provides a [LocalDatabase] and, if it
//!    wants more than in-process loopback, byte streams between members.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Error {
    #[error("Member {0} is offline")]
    NodeOffline(MemberName),
    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),
    #[error("Quorum of {quorum} not reached, {received} responses received")]
    QuorumTimeout { quorum: usize, received: usize },
    #[error("Record {rid:?} was modified concurrently: expected version {expected}, found {found}")]
    ConcurrentModification {
        rid: RecordId,
        expected: u32,
        found: u32,
    },
    #[error("Record {0:?} does not exist yet")]
    ConcurrentCreate(RecordId),
    #[error("Duplicate key '{key}' in unique index '{index}', held by {existing:?}")]
    DuplicateKey {
        index: String,
        key: String,
        existing: RecordId,
    },
    #[error("Replication failed")]
    ReplicationFailed,
    #[error("Execution failed: {0}")]
    Execution(String),
    #[error("Unknown request type {0}")]
    UnknownRequestType(u32),
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("Log gap: expected id {expected}, received {received}")]
    LogGap { expected: u64, received: u64 },
    #[error("Log term mismatch at {0:?}")]
    LogTermMismatch(LogId),
    #[error("Leader log cannot accept received entries")]
    NotFollower,
    #[error("No response to {0:?} in time")]
    SubmitTimeout(SessionOperationId),
    #[error("Not the coordinator for this database")]
    NotCoordinator,
    #[error("Networking error")]
    NetworkingError,
    #[error("Shut down")]
    Shutdown,
}

impl Error {
    /// Transient conditions that the session layer is expected to retry,
    /// after rolling back any local partial effects.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout(_)
                | Error::NodeOffline(_)
                | Error::QuorumTimeout { .. }
                | Error::ConcurrentCreate(_)
                | Error::SubmitTimeout(_)
                | Error::NetworkingError
        )
    }
}

impl From<edelcrantz::Error> for Error {
    fn from(_: edelcrantz::Error) -> Self {
        Error::NetworkingError
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::MalformedPayload(e.to_string())
    }
}

#[macro_use]
mod codec;
mod config;
mod context;
mod coordinator;
mod ddl;
mod executor;
mod lockmgr;
mod logid;
mod member;
mod message;
mod network;
mod node;
mod oplog;
mod quorum;
mod sequence;
mod storage;
mod submit;
mod transaction;

pub use codec::{Payload, Tagged};
pub use config::{CoordinatorConfig, ExecutorConfig, NodeConfig, SubmitConfig};
pub use context::{Origin, RequestContext, ResponseHandler};
pub use coordinator::{Coordinator, CoordinatorCore, CoordinatorStatus};
pub use executor::{Executor, ExecutorStatus};
pub use lockmgr::{LockGuard, LockKey, LockManager, LockRequest};
pub use logid::{LogId, SessionOperationId};
pub use member::{Channel, Directory, LoopbackChannel, Member, MemberName, SendFuture};
pub use message::{
    CommitResponse, CreatedRecord, DdlRequest, IndexChange, IndexOperation, NodeRequest,
    NodeResponse, PreparedResponse, RecordId, RecordOperation, RolledBack, SequenceAction,
    SequenceOutcome, SequenceRequest, SequenceResponse, SubmitRequest, SubmitResponse,
    TransactionSubmit, TxPhase1Request, TxPhase2Request, UpdatedRecord,
};
pub use network::{Envelope, StreamChannel};
pub use node::Node;
pub use oplog::{LogEntry, LogIdStatus, LogIter, OpLog, Received};
pub(crate) use quorum::{failures_tolerated, quorum_unreachable, resolve_quorum};
pub use storage::{CommitSet, LocalDatabase, MemDatabase};
pub use submit::SubmitContext;
