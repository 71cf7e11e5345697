//! Job lifecycle against the cluster
//!
//! The manager owns every Kubernetes interaction: submitting Jobs compiled
//! by a processor, deriving execution status from Job and pod state,
//! listing managed jobs, fetching results and deleting a job together with
//! its output artifact. Job names carry a fixed prefix plus a UUID so the
//! manager can tell its own jobs apart from everything else in the
//! namespace.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, PostParams, PropagationPolicy};
use kube::{Api, Client};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::annotations::{
    self, format_annotation_key, JOB_START_KEY, PROCESS_ID_KEY, PROGRESS_KEY, RESULT_LINK_KEY,
    RESULT_LOCATION_KEY,
};
use crate::error::Error;
use crate::processor::{KubernetesProcessor, ProcessRequest};
use crate::results::{self, ExtractedResult};

/// Prefix of every Job name the manager owns
pub const JOB_NAME_PREFIX: &str = "jobwright-job-";

/// Finished Jobs are garbage-collected by the cluster after this TTL
const JOB_TTL_SECONDS: i32 = 60 * 60 * 24 * 100;

/// Poll interval for synchronous execution
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Timestamp format for the submission annotation
const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Whether to block until the job finishes
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutionMode {
    /// Submit and poll until the job reaches a terminal status
    Sync,
    /// Submit and return immediately with [`JobStatus::Accepted`]
    Async,
}

/// Lifecycle status of a managed job
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Submitted, no pod active yet
    Accepted,
    /// A pod is running
    Running,
    /// Finished with a zero exit code
    Successful,
    /// Finished with a failure
    Failed,
    /// Deleted on request before finishing
    Dismissed,
}

impl JobStatus {
    /// True for statuses no further transition can leave
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Successful | JobStatus::Failed | JobStatus::Dismissed)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(JobStatus::Accepted),
            "running" => Ok(JobStatus::Running),
            "successful" => Ok(JobStatus::Successful),
            "failed" => Ok(JobStatus::Failed),
            "dismissed" => Ok(JobStatus::Dismissed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Point-in-time view of a managed job
#[derive(Clone, Debug, Serialize)]
pub struct ProcessJob {
    /// Manager-assigned job identifier (the UUID part of the Job name)
    pub job_id: String,
    /// Identifier of the process that produced the job
    pub process_id: Option<String>,
    /// Current lifecycle status
    pub status: JobStatus,
    /// Completion fraction in percent, 0 to 100
    pub progress: f64,
    /// Sanitized status message, present for failed jobs
    pub message: Option<String>,
    /// Human-facing link to the result artifact
    pub result_link: Option<String>,
    /// Absolute path of the result artifact
    pub result_location: Option<String>,
    /// Submission timestamp
    pub started: Option<String>,
    /// Completion timestamp, set once terminal
    pub completed: Option<String>,
}

/// Outcome of a delete request
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeleteOutcome {
    /// The job existed and was deleted
    Deleted,
    /// No such job; deletion is idempotent
    AlreadyGone,
}

/// Executes processes as Kubernetes Jobs in a single namespace
pub struct KubernetesManager {
    jobs: Api<Job>,
    pods: Api<Pod>,
    namespace: String,
}

impl KubernetesManager {
    /// Build a manager bound to the client's default namespace
    pub fn new(client: Client) -> Self {
        let namespace = client.default_namespace().to_string();
        Self {
            jobs: Api::namespaced(client.clone(), &namespace),
            pods: Api::namespaced(client, &namespace),
            namespace,
        }
    }

    /// The namespace this manager operates in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Submit a request as a new Job and return its identifier.
    ///
    /// The processor compiles the pod spec (and claims the output file);
    /// the manager stamps identity and submission annotations onto the Job
    /// and creates it. Returns as soon as the API server accepts the Job.
    pub async fn submit(
        &self,
        processor: &dyn KubernetesProcessor,
        request: &ProcessRequest,
    ) -> Result<String, Error> {
        let job_id = Uuid::new_v4().to_string();
        let job_name = job_name(&job_id);

        let spec = processor.create_job_pod_spec(request, &job_name)?;

        let mut job_annotations: BTreeMap<String, String> = spec
            .annotations
            .into_iter()
            .map(|(k, v)| (format_annotation_key(&k), v))
            .collect();
        job_annotations.insert(
            format_annotation_key(PROCESS_ID_KEY),
            processor.process_id().to_string(),
        );
        job_annotations.insert(
            format_annotation_key(JOB_START_KEY),
            chrono::Utc::now().format(DATETIME_FORMAT).to_string(),
        );

        let job = Job {
            metadata: ObjectMeta {
                name: Some(job_name.clone()),
                namespace: Some(self.namespace.clone()),
                annotations: Some(job_annotations),
                ..Default::default()
            },
            spec: Some(JobSpec {
                template: PodTemplateSpec {
                    spec: Some(spec.pod_spec),
                    ..Default::default()
                },
                // a failed run is never retried; the output file is
                // already claimed and the parameters may not be idempotent
                backoff_limit: Some(0),
                ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.jobs.create(&PostParams::default(), &job).await?;
        info!(job = %job_name, namespace = %self.namespace, "job submitted");
        Ok(job_id)
    }

    /// Submit and, in [`ExecutionMode::Sync`], poll until terminal
    pub async fn execute(
        &self,
        processor: &dyn KubernetesProcessor,
        request: &ProcessRequest,
        mode: ExecutionMode,
    ) -> Result<ProcessJob, Error> {
        let job_id = self.submit(processor, request).await?;
        match mode {
            ExecutionMode::Async => self.get_job(&job_id).await,
            ExecutionMode::Sync => loop {
                let job = self.get_job(&job_id).await?;
                if job.status.is_terminal() {
                    return Ok(job);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            },
        }
    }

    /// Fetch the current view of a managed job
    pub async fn get_job(&self, job_id: &str) -> Result<ProcessJob, Error> {
        let job_name = job_name(job_id);
        let job = self
            .jobs
            .get_opt(&job_name)
            .await?
            .ok_or_else(|| Error::NotFound(job_id.to_string()))?;
        let pod = self.find_job_pod(&job).await?;
        Ok(build_process_job(job_id, &job, pod.as_ref()))
    }

    /// List managed jobs in the namespace, optionally filtered by the
    /// owning process and by lifecycle status.
    ///
    /// Foreign Jobs (names without the manager prefix) are skipped even
    /// when they live in the same namespace.
    pub async fn get_jobs(
        &self,
        process_id: Option<&str>,
        status: Option<JobStatus>,
    ) -> Result<Vec<ProcessJob>, Error> {
        let jobs = self.jobs.list(&ListParams::default()).await?;
        let mut result = Vec::new();
        for job in jobs {
            let Some(id) = job
                .metadata
                .name
                .as_deref()
                .and_then(|name| name.strip_prefix(JOB_NAME_PREFIX))
            else {
                continue;
            };
            let pod = self.find_job_pod(&job).await?;
            let view = build_process_job(id, &job, pod.as_ref());
            if process_id.is_some_and(|p| view.process_id.as_deref() != Some(p)) {
                continue;
            }
            if status.is_some_and(|s| view.status != s) {
                continue;
            }
            result.push(view);
        }
        Ok(result)
    }

    /// Fetch the result of a successfully finished job.
    ///
    /// Reads the output artifact named by the job's result-location
    /// annotation and extracts the recorded result from it.
    pub async fn get_job_result(&self, job_id: &str) -> Result<ExtractedResult, Error> {
        let job = self.get_job(job_id).await?;
        match job.status {
            JobStatus::Successful => {}
            JobStatus::Failed | JobStatus::Dismissed => {
                return Err(Error::Workload {
                    code: "E-WORKLOAD",
                    message: job
                        .message
                        .unwrap_or_else(|| "process execution failed".to_string()),
                })
            }
            JobStatus::Accepted | JobStatus::Running => {
                return Err(Error::NotFinished(job_id.to_string()))
            }
        }

        let location = job
            .result_location
            .ok_or_else(|| Error::artifact("job has no recorded result location"))?;
        let contents = tokio::fs::read_to_string(&location)
            .await
            .map_err(|e| Error::io(Path::new(&location), e))?;
        results::extract(&contents, job.result_link.as_deref())
    }

    /// Delete a job and its output artifact as one logical operation.
    ///
    /// Idempotent: deleting an unknown job succeeds with
    /// [`DeleteOutcome::AlreadyGone`]. Artifact removal is best-effort; a
    /// failure there is logged but does not fail the delete.
    pub async fn delete_job(&self, job_id: &str) -> Result<DeleteOutcome, Error> {
        let job_name = job_name(job_id);
        let job = self.jobs.get_opt(&job_name).await?;

        let DeletePlan::Delete { artifact } = plan_delete(job.as_ref()) else {
            debug!(job = %job_name, "delete requested for unknown job");
            return Ok(DeleteOutcome::AlreadyGone);
        };

        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        self.jobs.delete(&job_name, &params).await?;
        info!(job = %job_name, "job deleted");

        if let Some(location) = artifact {
            remove_artifact(&job_name, &location).await;
        }
        Ok(DeleteOutcome::Deleted)
    }

    /// The pod belonging to a Job, if one exists yet.
    ///
    /// Looks the pod up via the Job's controller-assigned selector; with
    /// `backoff_limit: 0` there is at most one.
    async fn find_job_pod(&self, job: &Job) -> Result<Option<Pod>, Error> {
        let Some(selector) = job
            .spec
            .as_ref()
            .and_then(|s| s.selector.as_ref())
            .and_then(|s| s.match_labels.as_ref())
        else {
            return Ok(None);
        };
        let label_selector = selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let pods = self
            .pods
            .list(&ListParams::default().labels(&label_selector))
            .await?;
        Ok(pods.items.into_iter().next())
    }
}

/// What a delete request should do, given the current cluster view
#[derive(Clone, Debug, Eq, PartialEq)]
enum DeletePlan {
    /// No such Job; deletion already happened or never applied
    AlreadyGone,
    /// Delete the Job, then remove its artifact if one is recorded
    Delete {
        /// Result artifact path from the Job's annotations
        artifact: Option<String>,
    },
}

/// Decide the delete plan from the looked-up Job.
///
/// A missing Job means the deletion is already complete, never an error;
/// the artifact path must be read before the Job object is gone.
fn plan_delete(job: Option<&Job>) -> DeletePlan {
    match job {
        None => DeletePlan::AlreadyGone,
        Some(job) => DeletePlan::Delete {
            artifact: annotations::decode(job).remove(RESULT_LOCATION_KEY),
        },
    }
}

/// Remove a deleted job's artifact, best-effort.
///
/// The Job is already gone at this point, so a removal failure is logged
/// as a partial-deletion warning and swallowed.
async fn remove_artifact(job_name: &str, location: &str) {
    if let Err(e) = tokio::fs::remove_file(location).await {
        warn!(job = %job_name, path = %location, error = %e, "could not remove result artifact");
    }
}

/// Full Job name for a manager-assigned identifier
pub fn job_name(job_id: &str) -> String {
    format!("{JOB_NAME_PREFIX}{job_id}")
}

/// Whether a Job name belongs to this manager
pub fn is_managed_job_name(name: &str) -> bool {
    name.strip_prefix(JOB_NAME_PREFIX)
        .is_some_and(|id| !id.is_empty())
}

/// Derive the lifecycle status from Job counters, disambiguated by the
/// primary container's exit code when the pod is available.
///
/// Job-level `failed` counts pod deletions as failures, so the primary
/// container (index 0) exit code is authoritative when present: sidecars
/// may fail without affecting the process outcome.
fn derive_status(job: &Job, pod: Option<&Pod>) -> JobStatus {
    let status = job.status.as_ref();
    let succeeded = status.and_then(|s| s.succeeded).unwrap_or(0);
    let failed = status.and_then(|s| s.failed).unwrap_or(0);
    let active = status.and_then(|s| s.active).unwrap_or(0);

    if let Some(exit_code) = pod.and_then(primary_exit_code) {
        return if exit_code == 0 {
            JobStatus::Successful
        } else {
            JobStatus::Failed
        };
    }

    if succeeded > 0 {
        JobStatus::Successful
    } else if failed > 0 {
        JobStatus::Failed
    } else if active > 0 {
        JobStatus::Running
    } else {
        JobStatus::Accepted
    }
}

/// Exit code of the terminated primary container, if it has terminated
fn primary_exit_code(pod: &Pod) -> Option<i32> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .first()?
        .state
        .as_ref()?
        .terminated
        .as_ref()
        .map(|t| t.exit_code)
}

/// Sanitized failure message for a failed job.
///
/// The raw container message can leak workload internals, so the exposed
/// message carries only a stable code and the termination reason; the raw
/// message goes to the log.
fn failure_message(job: &Job, pod: Option<&Pod>) -> String {
    let terminated = pod
        .and_then(|p| p.status.as_ref())
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.first())
        .and_then(|c| c.state.as_ref())
        .and_then(|s| s.terminated.as_ref());

    if let Some(t) = terminated {
        if let Some(raw) = &t.message {
            debug!(job = ?job.metadata.name, message = %raw, "raw container termination message");
        }
        let reason = t.reason.as_deref().unwrap_or("Error");
        format!("E-WORKLOAD: process execution failed ({reason})")
    } else {
        "E-WORKLOAD: process execution failed".to_string()
    }
}

/// Reason of a primary container stuck in the waiting state, e.g.
/// "ImagePullBackOff". The accompanying raw message is logged, not exposed.
fn waiting_reason(pod: &Pod) -> Option<String> {
    let waiting = pod
        .status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .first()?
        .state
        .as_ref()?
        .waiting
        .as_ref()?;
    if let Some(raw) = &waiting.message {
        debug!(message = %raw, "raw container waiting message");
    }
    waiting.reason.clone()
}

/// Completion timestamp of a Job, covering the failed case.
///
/// `completion_time` is only set for successful Jobs; failed ones record
/// the transition time on their `Failed` condition instead.
fn completion_time(job: &Job) -> Option<String> {
    let status = job.status.as_ref()?;
    if let Some(t) = &status.completion_time {
        return Some(t.0.format(DATETIME_FORMAT).to_string());
    }
    status
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "Failed" && c.status == "True")
        .and_then(|c| c.last_transition_time.as_ref())
        .map(|t| t.0.format(DATETIME_FORMAT).to_string())
}

fn build_process_job(job_id: &str, job: &Job, pod: Option<&Pod>) -> ProcessJob {
    let mut annotations = annotations::decode(job);
    let status = derive_status(job, pod);

    let progress = match status {
        JobStatus::Successful => 100.0,
        _ => annotations
            .get(PROGRESS_KEY)
            .and_then(|p| p.parse::<f64>().ok())
            .map(|fraction| fraction * 100.0)
            .unwrap_or(0.0),
    };

    let message = match status {
        JobStatus::Failed => Some(failure_message(job, pod)),
        JobStatus::Accepted | JobStatus::Running => pod
            .and_then(waiting_reason)
            .map(|reason| format!("container is waiting ({reason})")),
        _ => None,
    };

    ProcessJob {
        job_id: job_id.to_string(),
        process_id: annotations.remove(PROCESS_ID_KEY),
        status,
        progress,
        message,
        result_link: annotations.remove(RESULT_LINK_KEY),
        result_location: annotations.remove(RESULT_LOCATION_KEY),
        started: annotations.remove(JOB_START_KEY),
        completed: completion_time(job),
    }
}
