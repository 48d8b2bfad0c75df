// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Quorum arithmetic for the coordinator: how many positive responses a
//! phase needs, and when enough members have failed that it can never get
//! them. Small, but easy to get off by one.

// Thresholds are derived from the number of members a request was actually
// sent to, not from some ideal cluster size. Members join and leave, and a
// request's quorum is fixed when its context is created; a member joining
// mid-flight must not move the goalposts for requests already out.
//
// An operator may pin the quorum in configuration. A pinned quorum larger
// than the number of involved members is clamped down to it: asking for
// more answers than there are members would just mean waiting for the
// timeout every time.
//
//  involved     | failures   | majority     |
//  members `n`  | tolerated  | quorum       |
//               | `(n-1)/2`  | `(n/2) + 1`  |
//  -------------|------------|--------------|
//  1            |  0         |  1           |
//  2            |  0         |  2           |
//  3            |  1         |  2           |
//  4            |  1         |  3           |
//  5            |  2         |  3           |
//  6            |  2         |  4           |
//  7            |  3         |  4           |

pub(crate) fn failures_tolerated(member_count: usize) -> usize {
    if member_count == 0 {
        0
    } else {
        (member_count - 1) / 2
    }
}

pub(crate) fn majority_quorum(member_count: usize) -> usize {
    (member_count / 2) + 1
}

/// The quorum for a request sent to `involved` members, given an optional
/// configured override. Never zero, never more than `involved` (when there
/// is anyone involved at all).
pub(crate) fn resolve_quorum(configured: Option<usize>, involved: usize) -> usize {
    let q = match configured {
        Some(q) => q,
        None => majority_quorum(involved),
    };
    q.min(involved).max(1)
}

/// Whether `failures` negative or missing responses already rule out ever
/// collecting `quorum` positive ones out of `involved`.
pub(crate) fn quorum_unreachable(quorum: usize, involved: usize, failures: usize) -> bool {
    failures > involved.saturating_sub(quorum)
}

#[test]
fn test_quorums() {
    assert_eq!(failures_tolerated(0), 0);
    assert_eq!(failures_tolerated(1), 0);
    assert_eq!(failures_tolerated(2), 0);
    assert_eq!(failures_tolerated(3), 1);
    assert_eq!(failures_tolerated(4), 1);
    assert_eq!(failures_tolerated(5), 2);
    assert_eq!(failures_tolerated(7), 3);

    assert_eq!(majority_quorum(1), 1);
    assert_eq!(majority_quorum(2), 2);
    assert_eq!(majority_quorum(3), 2);
    assert_eq!(majority_quorum(4), 3);
    assert_eq!(majority_quorum(5), 3);
    assert_eq!(majority_quorum(6), 4);
    assert_eq!(majority_quorum(7), 4);
}

#[test]
fn test_resolved_quorums() {
    assert_eq!(resolve_quorum(None, 3), 2);
    assert_eq!(resolve_quorum(Some(3), 3), 3);
    assert_eq!(resolve_quorum(Some(5), 3), 3);
    assert_eq!(resolve_quorum(Some(0), 3), 1);
    assert_eq!(resolve_quorum(None, 0), 1);
}

#[test]
fn test_unreachable_quorums() {
    // With 3 members and quorum 2, one failure is survivable, two are not.
    assert!(!quorum_unreachable(2, 3, 0));
    assert!(!quorum_unreachable(2, 3, 1));
    assert!(quorum_unreachable(2, 3, 2));
    // Unanimity tolerates nothing.
    assert!(quorum_unreachable(3, 3, 1));
    for n in 1..10 {
        let q = majority_quorum(n);
        assert!(!quorum_unreachable(q, n, failures_tolerated(n)));
        assert!(quorum_unreachable(q, n, failures_tolerated(n) + 1));
    }
}
