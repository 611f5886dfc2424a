//! End-to-end tests for the relay-forwarder binary.
//!
//! Each test starts fake cache nodes in-process, writes a TOML config
//! pointing at them and runs the real binary against it.

#![cfg(test)]

mod helpers;

mod forwarding;
mod lifecycle;
