// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::MemberName;
use serde::{Deserialize, Serialize};

/// LogIds identify one logged node-operation. They are the sole key that
/// correlates a [crate::NodeRequest], the [crate::RequestContext] tracking it
/// on the coordinator and every [crate::NodeResponse] sent back for it.
///
/// They have a few properties worth spelling out:
///
///   - They are assigned only by the coordinator's [crate::OpLog], at the
///     moment the request is logged, and never reused.
///   - They are totally ordered by `id`, which increases by exactly one per
///     logged entry. Followers mirror the same ids so replay sees a single
///     consistent sequence.
///   - They carry the `term` of the coordinator that issued them and the term
///     of the entry before them, which lets a follower notice that its log
///     head was written under a different coordinator and must be truncated.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogId {
    pub id: u64,
    pub term: u64,
    pub prev_term: Option<u64>,
}

impl std::fmt::Debug for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}.{}", self.id, self.term))
    }
}

impl LogId {
    pub fn new(id: u64, term: u64, prev_term: Option<u64>) -> LogId {
        LogId {
            id,
            term,
            prev_term,
        }
    }

    /// The id that has to follow this one in a gap-free log.
    pub fn successor(&self) -> u64 {
        self.id + 1
    }
}

/// Client-generated token correlating a submitted operation with its
/// eventual response. Retries of the same logical operation reuse it, which
/// is what lets the submit context and the coordinator recognize duplicates.
#[derive(Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionOperationId {
    pub member: MemberName,
    pub seq: u64,
}

impl std::fmt::Debug for SessionOperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}/{}", self.member.0, self.seq))
    }
}

impl SessionOperationId {
    pub fn new(member: MemberName, seq: u64) -> SessionOperationId {
        SessionOperationId { member, seq }
    }
}

#[test]
fn test_log_id_ordering() {
    let a = LogId::new(1, 3, None);
    let b = LogId::new(2, 1, Some(3));
    assert!(a < b);
    assert_eq!(a.successor(), b.id);
    assert_eq!(format!("{:?}", b), "2.1");
}
