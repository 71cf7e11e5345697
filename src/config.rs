//! Static processor configuration
//!
//! Settings that do not vary per request: execution image, volume claims,
//! object-storage bucket, output directory. Deserializable from the
//! processor's YAML config block. Validation happens when a processor is
//! constructed, never at request time.

use std::path::PathBuf;

use serde::Deserialize;

/// Default supplemental group granted write access to output artifacts
pub const JOB_RUNNER_GROUP_ID: u32 = 20200;

fn default_job_runner_group() -> Option<u32> {
    Some(JOB_RUNNER_GROUP_ID)
}

/// Object-storage bucket mounted into the workload via a sidecar
#[derive(Clone, Debug, Deserialize)]
pub struct S3Config {
    /// Bucket name
    pub bucket_name: String,
    /// Secret holding the bucket credentials (`username`/`password` keys)
    pub secret_name: String,
    /// Endpoint URL of the object store
    pub s3_url: String,
}

/// An additional persistent volume claim mounted into the workload
#[derive(Clone, Debug, Deserialize)]
pub struct ExtraVolumeClaim {
    /// Name of the persistent volume claim
    pub claim_name: String,
    /// Mount path inside the workload container
    pub mount_path: String,
}

/// Static configuration for the notebook processor
#[derive(Clone, Debug, Deserialize)]
pub struct NotebookProcessorConfig {
    /// Execution image used when the request does not override it
    pub default_image: String,
    /// Image pull secret attached to the pod, if the registry is private
    #[serde(default)]
    pub image_pull_secret: Option<String>,
    /// Claim backing the home directory volume
    #[serde(default)]
    pub home_volume_claim_name: Option<String>,
    /// Additional claims mounted into the workload
    #[serde(default)]
    pub extra_volume_claims: Vec<ExtraVolumeClaim>,
    /// Object-storage bucket served to the workload by a sidecar
    #[serde(default)]
    pub s3: Option<S3Config>,
    /// Base URL for human-facing result links
    pub base_url: String,
    /// Pre-provisioned directory where output artifacts are created
    pub output_directory: PathBuf,
    /// Supplemental group that owns output artifacts.
    ///
    /// `None` disables the ownership change (used in tests and on hosts
    /// where the control plane does not run as root).
    #[serde(default = "default_job_runner_group")]
    pub job_runner_group: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_config() {
        let yaml = r#"
default_image: "jobwright/worker:1.0"
base_url: "https://hub.example.org"
output_directory: "/outputs"
"#;
        let config: NotebookProcessorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.default_image, "jobwright/worker:1.0");
        assert!(config.image_pull_secret.is_none());
        assert!(config.home_volume_claim_name.is_none());
        assert!(config.extra_volume_claims.is_empty());
        assert!(config.s3.is_none());
        assert_eq!(config.job_runner_group, Some(JOB_RUNNER_GROUP_ID));
    }

    #[test]
    fn deserializes_full_config() {
        let yaml = r#"
default_image: "jobwright/worker-gpu:2.1"
image_pull_secret: "registry-creds"
home_volume_claim_name: "user-home"
extra_volume_claims:
  - claim_name: "shared-data"
    mount_path: "/mnt/data"
s3:
  bucket_name: "results"
  secret_name: "bucket-creds"
  s3_url: "https://s3.eu-central-1.example.org"
base_url: "https://hub.example.org"
output_directory: "/outputs"
job_runner_group: 31000
"#;
        let config: NotebookProcessorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.image_pull_secret.as_deref(), Some("registry-creds"));
        assert_eq!(config.extra_volume_claims.len(), 1);
        assert_eq!(config.s3.as_ref().unwrap().bucket_name, "results");
        assert_eq!(config.job_runner_group, Some(31000));
    }

    #[test]
    fn negative_job_runner_group_is_rejected() {
        let yaml = r#"
default_image: "jobwright/worker:1.0"
base_url: "https://hub.example.org"
output_directory: "/outputs"
job_runner_group: -1
"#;
        assert!(serde_yaml::from_str::<NotebookProcessorConfig>(yaml).is_err());
    }
}
