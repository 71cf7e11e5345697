//! Jobwright - process execution on Kubernetes Jobs
//!
//! Maps an asynchronous "submit job, poll status, fetch result, cancel"
//! process-execution contract (as used by OGC API - Processes) onto
//! Kubernetes Jobs and Pods. Kubernetes Jobs are fire-and-forget batch
//! units with coarse status; this crate synthesizes fine-grained progress
//! and rich result payloads by piggybacking on Job annotations and
//! container exit codes.
//!
//! # Modules
//!
//! - [`annotations`] - codec for engine-owned Job annotations
//! - [`config`] - static processor configuration
//! - [`fragment`] - composable pod-spec fragments (volumes, sidecars)
//! - [`processor`] - processors that compile requests into pod specs
//! - [`manager`] - Job lifecycle management and status translation
//! - [`progress`] - in-workload progress reporting hook
//! - [`results`] - result artifact extraction
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod annotations;
pub mod config;
pub mod error;
pub mod fragment;
pub mod manager;
pub mod processor;
pub mod progress;
pub mod results;

pub use error::Error;
pub use manager::{DeleteOutcome, ExecutionMode, JobStatus, KubernetesManager, ProcessJob};
pub use processor::{JobPodSpec, KubernetesProcessor, ProcessRequest};
