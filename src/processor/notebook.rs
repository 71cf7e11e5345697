//! Papermill notebook processor
//!
//! Compiles a notebook-execution request into a pod spec: the papermill
//! container at index 0, optional home volume / extra PVC / object-storage
//! fragments, GPU scheduling derived from the image, and the output
//! artifact pre-created on the control-plane side so the workload's
//! unprivileged user can write it via a supplemental group.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, LocalObjectReference, NodeAffinity, NodeSelector,
    NodeSelectorRequirement, NodeSelectorTerm, PodSecurityContext, PodSpec, ResourceRequirements,
    Toleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::debug;

use crate::annotations::{
    format_annotation_key, truncate_parameters, PARAMETERS_KEY, PROGRESS_KEY, RESULT_LINK_KEY,
    RESULT_LOCATION_KEY,
};
use crate::config::NotebookProcessorConfig;
use crate::error::Error;
use crate::fragment::{extra_pvc, home_volume, s3_sidecar, ExtraConfig};
use crate::processor::{JobPodSpec, KubernetesProcessor, ProcessRequest};

/// Home directory inside the execution image
pub const CONTAINER_HOME: &str = "/home/jovyan";

/// Executable name of the primary workload process.
///
/// The object-storage sidecar watches the shared process table for this
/// name to detect workload completion.
const WORKLOAD_COMM: &str = "papermill";

/// Node label selecting GPU nodes
const GPU_NODE_LABEL: &str = "jobwright.dev/node-purpose";
const GPU_NODE_VALUE: &str = "gpu";

/// Taint tolerated by GPU workloads
const GPU_TAINT_KEY: &str = "jobwright.dev/gpu";

/// Service account the job pods run under
const SERVICE_ACCOUNT: &str = "jobwright-job";

/// Environment variable carrying the execution image identifier.
///
/// Provided in interactive worker containers as well; the workload uses it
/// for compatibility checks.
pub const IMAGE_ENV: &str = "JUPYTER_IMAGE";

/// Process identifier exposed upward
pub const PROCESS_ID: &str = "execute-notebook";

/// Derive the kernel name from the execution image.
///
/// Fixed lookup on the image repository (tag stripped); images not in the
/// table run the default kernel.
fn kernel_for_image(image: &str) -> Option<&'static str> {
    match image.split(':').next().unwrap_or(image) {
        "jobwright/worker" => Some("worker"),
        "jobwright/worker-gpu" => Some("worker-gpu"),
        _ => None,
    }
}

/// Executes notebooks on Kubernetes with papermill
pub struct NotebookProcessor {
    config: NotebookProcessorConfig,
}

impl NotebookProcessor {
    /// Create a processor, validating its static configuration.
    ///
    /// Missing or invalid required settings fail here, never at request
    /// time.
    pub fn new(config: NotebookProcessorConfig) -> Result<Self, Error> {
        if config.default_image.is_empty() {
            return Err(Error::config("default_image must not be empty"));
        }
        if config.base_url.is_empty() {
            return Err(Error::config("base_url must not be empty"));
        }
        if !config.output_directory.is_absolute() {
            return Err(Error::config(format!(
                "output_directory must be an absolute path, got {}",
                config.output_directory.display()
            )));
        }
        Ok(Self { config })
    }

    /// Resolve the output artifact's final path.
    ///
    /// An explicit output filename lands under the configured output
    /// directory; otherwise the name is synthesized from the input stem
    /// plus a microsecond timestamp so concurrent submissions of the same
    /// input never collide.
    fn resolve_output_path(&self, request: &ProcessRequest) -> PathBuf {
        match &request.output_filename {
            Some(name) => self.config.output_directory.join(name),
            None => {
                let stem = Path::new(&request.notebook)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "notebook".to_string());
                let stem = stem.trim_end_matches(".ipynb");
                let now = chrono::Utc::now().format("%Y%m%d-%H%M%S-%6f");
                self.config
                    .output_directory
                    .join(format!("{stem}_result_{now}.ipynb"))
            }
        }
    }

    /// Pre-create the output artifact, group-writable for the job runner.
    ///
    /// Happens exactly once per submission, before the pod is scheduled.
    /// An existing file at the path is a conflict, never silently reused.
    fn prepare_output_file(&self, path: &Path) -> Result<(), Error> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    Error::Conflict(path.to_path_buf())
                } else {
                    Error::io(path, e)
                }
            })?;

        fs::set_permissions(path, fs::Permissions::from_mode(0o664))
            .map_err(|e| Error::io(path, e))?;

        if let Some(gid) = self.config.job_runner_group {
            std::os::unix::fs::chown(path, None, Some(gid)).map_err(|e| Error::io(path, e))?;
        }

        Ok(())
    }

    /// The base64-encoded parameter blob passed to papermill's `-b` flag
    fn encoded_parameters(request: &ProcessRequest) -> Result<String, Error> {
        match (&request.parameters, &request.parameters_json) {
            (Some(p), _) if !p.is_empty() => Ok(p.clone()),
            (_, Some(json)) => Ok(BASE64.encode(serde_json::to_vec(json)?)),
            _ => Ok(String::new()),
        }
    }

    fn fragments(&self) -> ExtraConfig {
        let mut fragments = Vec::new();
        if let Some(claim) = &self.config.home_volume_claim_name {
            fragments.push(home_volume(claim, CONTAINER_HOME));
        }
        fragments.extend(
            self.config
                .extra_volume_claims
                .iter()
                .enumerate()
                .map(|(ordinal, claim)| extra_pvc(claim, ordinal)),
        );
        if let Some(s3) = &self.config.s3 {
            fragments.push(s3_sidecar(s3, CONTAINER_HOME, WORKLOAD_COMM));
        }
        ExtraConfig::combine(fragments)
    }
}

impl KubernetesProcessor for NotebookProcessor {
    fn process_id(&self) -> &str {
        PROCESS_ID
    }

    fn create_job_pod_spec(
        &self,
        request: &ProcessRequest,
        job_name: &str,
    ) -> Result<JobPodSpec, Error> {
        if request.notebook.is_empty() {
            return Err(Error::invalid_request("notebook must not be empty"));
        }
        debug!(notebook = %request.notebook, job = %job_name, "compiling pod spec");

        let image = self.config.default_image.clone();
        let image_kernel = kernel_for_image(&image);
        let is_gpu = image_kernel == Some("worker-gpu");
        let kernel = request.kernel.as_deref().or(image_kernel);

        let notebook_dir = working_dir(Path::new(&request.notebook));
        let output_path = self.resolve_output_path(request);
        self.prepare_output_file(&output_path)?;
        let output = output_path.to_string_lossy();

        let parameters = Self::encoded_parameters(request)?;
        let decoded_parameters = if parameters.is_empty() {
            String::new()
        } else {
            let bytes = BASE64.decode(parameters.trim()).map_err(|e| {
                Error::invalid_request(format!("parameters are not valid base64: {e}"))
            })?;
            String::from_utf8_lossy(&bytes).into_owned()
        };

        // The shell runs interactively so the image's profile puts the
        // default environment (and papermill) on PATH.
        let mut command = format!(
            "papermill \"{}\" \"{}\" --engine kubernetes_job_progress --cwd \"{}\"",
            request.notebook,
            output,
            notebook_dir.display(),
        );
        if let Some(kernel) = kernel {
            command.push_str(&format!(" -k {kernel}"));
        }
        if !parameters.is_empty() {
            command.push_str(&format!(" -b \"{parameters}\""));
        }

        let extra = self.fragments();

        // index 0: liveness and exit detection rely on this position
        let workload = Container {
            name: "notebook".to_string(),
            image: Some(image.clone()),
            command: Some(vec![
                "bash".to_string(),
                "-i".to_string(),
                "-c".to_string(),
                command,
            ]),
            working_dir: Some(CONTAINER_HOME.to_string()),
            volume_mounts: (!extra.volume_mounts.is_empty()).then_some(extra.volume_mounts),
            resources: resource_requirements(request),
            env: Some(vec![
                env(IMAGE_ENV, &image),
                env(crate::progress::JOB_NAME_ENV, job_name),
                env(
                    crate::progress::PROGRESS_ANNOTATION_ENV,
                    &format_annotation_key(PROGRESS_KEY),
                ),
            ]),
            ..Default::default()
        };

        let mut containers = vec![workload];
        containers.extend(extra.containers);

        let (affinity, tolerations) = if is_gpu {
            let (a, t) = gpu_scheduling();
            (Some(a), Some(t))
        } else {
            (None, None)
        };

        let pod_spec = PodSpec {
            containers,
            volumes: (!extra.volumes.is_empty()).then_some(extra.volumes),
            restart_policy: Some("Never".to_string()),
            // lets the sidecar observe the workload's process table
            share_process_namespace: Some(true),
            service_account_name: Some(SERVICE_ACCOUNT.to_string()),
            image_pull_secrets: self.config.image_pull_secret.as_ref().map(|name| {
                vec![LocalObjectReference {
                    name: name.clone(),
                }]
            }),
            affinity,
            tolerations,
            security_context: self.config.job_runner_group.map(|gid| PodSecurityContext {
                supplemental_groups: Some(vec![i64::from(gid)]),
                ..Default::default()
            }),
            ..Default::default()
        };

        // the hub redirects to the user's own server before resolving the
        // artifact path
        let result_link = format!(
            "{}/hub/user-redirect/lab/tree/{}",
            self.config.base_url.trim_end_matches('/'),
            urlencoding::encode(&output),
        );

        let mut annotations = BTreeMap::new();
        annotations.insert(
            PARAMETERS_KEY.to_string(),
            truncate_parameters(&decoded_parameters),
        );
        annotations.insert(RESULT_LINK_KEY.to_string(), result_link);
        annotations.insert(RESULT_LOCATION_KEY.to_string(), output.into_owned());

        Ok(JobPodSpec {
            pod_spec,
            annotations,
        })
    }
}

/// The workload's working directory: the input notebook's directory,
/// absolute under the container home
fn working_dir(notebook_path: &Path) -> PathBuf {
    let absolute = if notebook_path.is_absolute() {
        notebook_path.to_path_buf()
    } else {
        Path::new(CONTAINER_HOME).join(notebook_path)
    };
    absolute
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(CONTAINER_HOME))
}

/// GPU scheduling fragment: required-during-scheduling node affinity on the
/// GPU node label plus the matching toleration. Applied all-or-nothing.
fn gpu_scheduling() -> (Affinity, Vec<Toleration>) {
    let affinity = Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: GPU_NODE_LABEL.to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![GPU_NODE_VALUE.to_string()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let tolerations = vec![Toleration {
        key: Some(GPU_TAINT_KEY.to_string()),
        operator: Some("Exists".to_string()),
        effect: Some("NoSchedule".to_string()),
        ..Default::default()
    }];
    (affinity, tolerations)
}

/// Build resource requirements from the optional per-request fields.
///
/// Absent fields are omitted entirely, never defaulted to zero: Kubernetes
/// treats omission (unbounded) and explicit zero (throttled) differently.
fn resource_requirements(request: &ProcessRequest) -> Option<ResourceRequirements> {
    let limits = quantity_map(&request.cpu_limit, &request.mem_limit);
    let requests = quantity_map(&request.cpu_requests, &request.mem_requests);
    if limits.is_none() && requests.is_none() {
        return None;
    }
    Some(ResourceRequirements {
        limits,
        requests,
        ..Default::default()
    })
}

fn quantity_map(
    cpu: &Option<String>,
    memory: &Option<String>,
) -> Option<BTreeMap<String, Quantity>> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    (!map.is_empty()).then_some(map)
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}
