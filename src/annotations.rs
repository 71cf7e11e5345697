//! Codec for engine-owned Job annotations
//!
//! Kubernetes Jobs have no structured-metadata field, so per-job metadata
//! (process id, result location, result link, truncated input parameters,
//! progress) travels as string-valued annotations on the Job object. All
//! engine-owned keys live under a fixed prefix so third-party tooling does
//! not collide with them; decoding reads back only namespaced keys.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;

/// Prefix under which all engine-owned annotations are namespaced
pub const ANNOTATION_PREFIX: &str = "jobwright.dev/";

/// Logical key for the progress fraction (decimal string "0" to "1")
pub const PROGRESS_KEY: &str = "progress";

/// Logical key for the truncated input-parameter echo
pub const PARAMETERS_KEY: &str = "parameters";

/// Logical key for the human-facing result link (URL-escaped path)
pub const RESULT_LINK_KEY: &str = "result-link";

/// Logical key for the absolute result-artifact path
pub const RESULT_LOCATION_KEY: &str = "result-location";

/// Logical key for the owning process identifier
pub const PROCESS_ID_KEY: &str = "process-id";

/// Logical key for the submission timestamp
pub const JOB_START_KEY: &str = "job-start-datetime";

/// Maximum stored length (in characters) for the `parameters` value.
///
/// Annotation values are capped by the API server at a few KB, so stored
/// parameters are truncated to this bound. The truncation is lossy and the
/// value is display-only; it is never used to replay a job.
pub const PARAMETERS_MAX_CHARS: usize = 8000;

/// Namespace a logical key under the engine prefix
pub fn format_annotation_key(key: &str) -> String {
    format!("{ANNOTATION_PREFIX}{key}")
}

/// Strip the engine prefix from an annotation key.
///
/// Returns `None` for keys owned by other tooling.
pub fn parse_annotation_key(key: &str) -> Option<&str> {
    key.strip_prefix(ANNOTATION_PREFIX)
}

/// Read back the engine-owned annotations of a Job, keyed by logical name
pub fn decode(job: &Job) -> BTreeMap<String, String> {
    job.metadata
        .annotations
        .iter()
        .flatten()
        .filter_map(|(k, v)| parse_annotation_key(k).map(|key| (key.to_string(), v.clone())))
        .collect()
}

/// Truncate free-form parameter text to the annotation bound.
///
/// Lossy and display-only; callers must not rely on the stored value for
/// anything but presentation.
pub fn truncate_parameters(text: &str) -> String {
    text.chars().take(PARAMETERS_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn job_with_annotations(annotations: &[(&str, &str)]) -> Job {
        Job {
            metadata: ObjectMeta {
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn format_and_parse_round_trip() {
        let key = format_annotation_key(PROGRESS_KEY);
        assert_eq!(key, "jobwright.dev/progress");
        assert_eq!(parse_annotation_key(&key), Some(PROGRESS_KEY));
    }

    #[test]
    fn foreign_keys_are_rejected() {
        assert_eq!(parse_annotation_key("kubectl.kubernetes.io/last-applied"), None);
    }

    #[test]
    fn decode_reads_only_namespaced_keys() {
        let job = job_with_annotations(&[
            ("jobwright.dev/progress", "0.5"),
            ("jobwright.dev/result-location", "/out/a.ipynb"),
            ("batch.kubernetes.io/job-tracking", ""),
        ]);
        let decoded = decode(&job);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.get("progress").map(String::as_str), Some("0.5"));
        assert_eq!(
            decoded.get("result-location").map(String::as_str),
            Some("/out/a.ipynb")
        );
    }

    #[test]
    fn decode_handles_missing_annotations() {
        let job = Job::default();
        assert!(decode(&job).is_empty());
    }

    #[test]
    fn parameters_are_truncated_to_bound() {
        let long = "x".repeat(PARAMETERS_MAX_CHARS + 100);
        assert_eq!(truncate_parameters(&long).len(), PARAMETERS_MAX_CHARS);
        assert_eq!(truncate_parameters("short"), "short");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "ä".repeat(PARAMETERS_MAX_CHARS + 1);
        let truncated = truncate_parameters(&text);
        assert_eq!(truncated.chars().count(), PARAMETERS_MAX_CHARS);
    }
}
