//! Processors compile process requests into Kubernetes pod specs
//!
//! A processor owns the static configuration for one process (image,
//! volumes, output directory) and turns each request into a `JobPodSpec`:
//! the pod template plus the logical annotations the manager stamps onto
//! the Job object. Processors never talk to the cluster themselves; the
//! manager owns submission and lifecycle.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PodSpec;
use serde::Deserialize;

use crate::error::Error;

pub mod notebook;

pub use notebook::NotebookProcessor;

/// A declarative request to execute a process
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProcessRequest {
    /// Input notebook path, relative to the container home or absolute
    pub notebook: String,
    /// Execution parameters as base64-encoded YAML
    #[serde(default)]
    pub parameters: Option<String>,
    /// Execution parameters as structured JSON (alternative to `parameters`)
    #[serde(default)]
    pub parameters_json: Option<serde_json::Value>,
    /// Kernel override; defaults to the kernel derived from the image
    #[serde(default)]
    pub kernel: Option<String>,
    /// Explicit output filename under the configured output directory
    #[serde(default)]
    pub output_filename: Option<String>,
    /// CPU limit, e.g. "2"
    #[serde(default)]
    pub cpu_limit: Option<String>,
    /// Memory limit, e.g. "4Gi"
    #[serde(default)]
    pub mem_limit: Option<String>,
    /// CPU request
    #[serde(default)]
    pub cpu_requests: Option<String>,
    /// Memory request
    #[serde(default)]
    pub mem_requests: Option<String>,
}

/// A compiled pod specification plus the Job metadata that travels with it
#[derive(Clone, Debug)]
pub struct JobPodSpec {
    /// Pod template for the Job; the primary workload container is index 0
    pub pod_spec: PodSpec,
    /// Logical (unprefixed) annotations; the manager namespaces them
    pub annotations: BTreeMap<String, String>,
}

/// A processor that compiles process requests into Kubernetes pod specs
pub trait KubernetesProcessor: Send + Sync {
    /// Stable identifier of the process this processor implements
    fn process_id(&self) -> &str;

    /// Compile a request into the pod spec and annotations for a named Job.
    ///
    /// This is a control-plane-side operation: it also claims the output
    /// artifact path on disk, failing with [`Error::Conflict`] if the file
    /// already exists.
    fn create_job_pod_spec(
        &self,
        request: &ProcessRequest,
        job_name: &str,
    ) -> Result<JobPodSpec, Error>;
}
