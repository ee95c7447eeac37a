//! Integration tests for myqueue.
//!
//! These tests drive the queue through whole task lifecycles against the
//! in-memory backend and the LSF backend with a scripted `CommandRunner`.
//!
//! # Test Categories
//!
//! - `lifecycle`: submit, change files, sync, remove and resubmit
//! - `recovery`: timeouts, memory failures and `kick`
//! - `workflows`: collecting workflows and submitting them twice
//! - `lsf_backend`: the LSF backend behind a real queue

mod fixtures;

mod lifecycle;
mod lsf_backend;
mod recovery;
mod workflows;
