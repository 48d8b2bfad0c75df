// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

pub use ordinance::*;


// These tests live outside the library so they can only reach the public
// API, the way an embedding server would.

#[test]
fn loopback_two_phase_test() {
    test::loopback_two_phase_test();
}

#[test]
fn unresponsive_member_test() {
    test::unresponsive_member_test();
}

#[test]
fn late_joiner_resync_test() {
    test::late_joiner_resync_test();
}

#[test]
fn sequence_test() {
    test::sequence_test();
}

#[test]
fn not_coordinator_test() {
    test::not_coordinator_test();
}

#[test]
fn stream_transport_test() {
    test::stream_transport_test();
}

pub fn main() {
    println!("please run `cargo test` instead");
}
