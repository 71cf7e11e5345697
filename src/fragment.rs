//! Composable pod-spec fragments
//!
//! Each optional feature (home volume, extra PVCs, object-storage sidecar)
//! contributes an independent fragment of containers, volume mounts and
//! volumes. Fragments concatenate associatively and never inspect each
//! other's contents; the processor folds them in a fixed order and prepends
//! the primary workload container at index 0.

use std::collections::BTreeMap;
use std::ops::Add;

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, PersistentVolumeClaimVolumeSource,
    ResourceRequirements, SecretKeySelector, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::config::{ExtraVolumeClaim, S3Config};

/// Image of the object-storage mount helper
const S3_MOUNTER_IMAGE: &str = "efs/s3fs:0.4.0-1.86";

/// Name of the object-storage sidecar container
pub const S3_MOUNTER_NAME: &str = "s3mounter";

/// Volume name shared between the sidecar and the workload mount
const S3_VOLUME_NAME: &str = "s3-user-bucket";

/// An independently-addable fragment of pod configuration
#[derive(Clone, Debug, Default)]
pub struct ExtraConfig {
    /// Sidecar containers contributed by this fragment
    pub containers: Vec<Container>,
    /// Volume mounts for the primary workload container
    pub volume_mounts: Vec<VolumeMount>,
    /// Volumes registered on the pod
    pub volumes: Vec<Volume>,
}

impl Add for ExtraConfig {
    type Output = ExtraConfig;

    fn add(mut self, other: ExtraConfig) -> ExtraConfig {
        self.containers.extend(other.containers);
        self.volume_mounts.extend(other.volume_mounts);
        self.volumes.extend(other.volumes);
        self
    }
}

impl ExtraConfig {
    /// Fold a sequence of fragments left-to-right into one aggregate
    pub fn combine(fragments: impl IntoIterator<Item = ExtraConfig>) -> ExtraConfig {
        fragments
            .into_iter()
            .fold(ExtraConfig::default(), ExtraConfig::add)
    }
}

/// Home-directory volume backed by a persistent volume claim
pub fn home_volume(claim_name: &str, container_home: &str) -> ExtraConfig {
    ExtraConfig {
        containers: vec![],
        volume_mounts: vec![VolumeMount {
            name: "home".to_string(),
            mount_path: container_home.to_string(),
            ..Default::default()
        }],
        volumes: vec![Volume {
            name: "home".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim_name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }],
    }
}

/// Additional PVC mount.
///
/// The volume name is synthesized from the ordinal position so multiple
/// claims never collide, regardless of their claim names.
pub fn extra_pvc(claim: &ExtraVolumeClaim, ordinal: usize) -> ExtraConfig {
    let volume_name = format!("extra-{ordinal}");
    ExtraConfig {
        containers: vec![],
        volume_mounts: vec![VolumeMount {
            name: volume_name.clone(),
            mount_path: claim.mount_path.clone(),
            ..Default::default()
        }],
        volumes: vec![Volume {
            name: volume_name,
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.claim_name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }],
    }
}

/// Object-storage sidecar fragment.
///
/// The sidecar has no natural termination signal, but the Job is only
/// Complete once every container has exited. It therefore delays its start
/// to let the primary container begin, then polls the shared process table
/// for the workload's executable name and exits once the process is gone.
/// Requires `shareProcessNamespace: true` on the pod.
pub fn s3_sidecar(s3: &S3Config, container_home: &str, workload_comm: &str) -> ExtraConfig {
    let wait_script = format!(
        "echo \"`date` waiting for job start\"; \
         sleep 5; \
         echo \"`date` job start assumed\"; \
         while pgrep -x {workload_comm} > /dev/null; do sleep 1; done; \
         echo \"`date` job end detected\";"
    );

    ExtraConfig {
        volume_mounts: vec![VolumeMount {
            name: S3_VOLUME_NAME.to_string(),
            mount_path: format!("{container_home}/s3"),
            mount_propagation: Some("HostToContainer".to_string()),
            ..Default::default()
        }],
        volumes: vec![Volume {
            name: S3_VOLUME_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }],
        containers: vec![Container {
            name: S3_MOUNTER_NAME.to_string(),
            image: Some(S3_MOUNTER_IMAGE.to_string()),
            args: Some(vec!["sh".to_string(), "-c".to_string(), wait_script]),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            volume_mounts: Some(vec![VolumeMount {
                name: S3_VOLUME_NAME.to_string(),
                mount_path: "/opt/s3fs/bucket".to_string(),
                mount_propagation: Some("Bidirectional".to_string()),
                ..Default::default()
            }]),
            resources: Some(ResourceRequirements {
                limits: Some(quantities(&[("cpu", "0.1"), ("memory", "128Mi")])),
                requests: Some(quantities(&[("cpu", "0.05"), ("memory", "32Mi")])),
                ..Default::default()
            }),
            env: Some(vec![
                env_literal("S3FS_ARGS", "-oallow_other"),
                env_literal("UID", "1000"),
                env_literal("GID", "2014"),
                env_from_secret("AWS_S3_ACCESS_KEY_ID", &s3.secret_name, "username"),
                env_from_secret("AWS_S3_SECRET_ACCESS_KEY", &s3.secret_name, "password"),
                env_literal("AWS_S3_BUCKET", &s3.bucket_name),
                // shared process namespace means tini is not PID 1
                env_literal("TINI_SUBREAPER", "1"),
                env_literal("AWS_S3_URL", &s3.s3_url),
            ]),
            ..Default::default()
        }],
    }
}

fn quantities(entries: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
        .collect()
}

fn env_literal(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn env_from_secret(name: &str, secret_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
