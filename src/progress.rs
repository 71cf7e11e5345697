//! In-workload progress reporting
//!
//! Runs inside the job pod, next to the workload. After each completed unit
//! of work it patches the owning Job's progress annotation so pollers see a
//! fraction between "0" and "1" without a second data channel. The reporter
//! discovers its own Job through environment variables injected by the
//! processor at submission time.

use std::env;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use tracing::debug;

use crate::error::Error;

/// Environment variable naming the owning Job
pub const JOB_NAME_ENV: &str = "JOB_NAME";

/// Environment variable carrying the fully-prefixed progress annotation key
pub const PROGRESS_ANNOTATION_ENV: &str = "PROGRESS_ANNOTATION";

/// Callback invoked after each completed unit of work
#[async_trait]
pub trait UnitCompleteHandler {
    /// `completed` units out of `total` are done
    async fn unit_complete(&mut self, completed: usize, total: usize) -> Result<(), Error>;
}

/// Patches the owning Job's progress annotation as work completes
pub struct ProgressReporter {
    jobs: Api<Job>,
    job_name: String,
    annotation_key: String,
    last: f64,
}

impl ProgressReporter {
    /// Build a reporter from the pod environment.
    ///
    /// Requires [`JOB_NAME_ENV`] and [`PROGRESS_ANNOTATION_ENV`]; the
    /// namespace comes from the in-cluster service account.
    pub async fn from_env() -> Result<Self, Error> {
        let job_name = env::var(JOB_NAME_ENV)
            .map_err(|_| Error::config(format!("{JOB_NAME_ENV} is not set")))?;
        let annotation_key = env::var(PROGRESS_ANNOTATION_ENV)
            .map_err(|_| Error::config(format!("{PROGRESS_ANNOTATION_ENV} is not set")))?;
        let client = Client::try_default()
            .await
            .map_err(|e| Error::config(format!("cannot build kubernetes client: {e}")))?;
        Ok(Self::new(client, job_name, annotation_key))
    }

    /// Build a reporter for a named Job in the client's default namespace
    pub fn new(client: Client, job_name: impl Into<String>, annotation_key: impl Into<String>) -> Self {
        let namespace = client.default_namespace().to_string();
        Self {
            jobs: Api::namespaced(client, &namespace),
            job_name: job_name.into(),
            annotation_key: annotation_key.into(),
            last: 0.0,
        }
    }

    async fn patch_progress(&self, fraction: f64) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    &self.annotation_key: format_fraction(fraction),
                }
            }
        });
        self.jobs
            .patch(&self.job_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(job = %self.job_name, progress = fraction, "progress patched");
        Ok(())
    }
}

#[async_trait]
impl UnitCompleteHandler for ProgressReporter {
    /// Patch the new fraction, skipping no-op and regressive updates.
    ///
    /// Reported progress is monotonic: concurrent or out-of-order unit
    /// completions never move the annotation backwards.
    async fn unit_complete(&mut self, completed: usize, total: usize) -> Result<(), Error> {
        let Some(fraction) = next_progress(self.last, completed, total) else {
            return Ok(());
        };
        self.patch_progress(fraction).await?;
        self.last = fraction;
        Ok(())
    }
}

/// The next progress fraction to report, or `None` when nothing should be
/// patched (zero total, no advance, or a regression).
fn next_progress(last: f64, completed: usize, total: usize) -> Option<f64> {
    if total == 0 {
        return None;
    }
    let fraction = (completed.min(total) as f64) / (total as f64);
    (fraction > last).then_some(fraction)
}

/// The annotation value for a fraction: a decimal string "0.0" to "1.0",
/// always carrying a decimal point
fn format_fraction(fraction: f64) -> String {
    if fraction.fract() == 0.0 {
        format!("{fraction:.1}")
    } else {
        fraction.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_advances_monotonically() {
        assert_eq!(next_progress(0.0, 1, 4), Some(0.25));
        assert_eq!(next_progress(0.25, 2, 4), Some(0.5));
        assert_eq!(next_progress(0.5, 4, 4), Some(1.0));
    }

    #[test]
    fn regressions_and_no_ops_are_skipped() {
        assert_eq!(next_progress(0.5, 1, 4), None);
        assert_eq!(next_progress(0.5, 2, 4), None);
    }

    #[test]
    fn zero_total_reports_nothing() {
        assert_eq!(next_progress(0.0, 0, 0), None);
        assert_eq!(next_progress(0.0, 3, 0), None);
    }

    #[test]
    fn completed_is_clamped_to_total() {
        assert_eq!(next_progress(0.0, 7, 4), Some(1.0));
    }

    #[test]
    fn fractions_serialize_as_decimal_strings() {
        assert_eq!(format_fraction(0.0), "0.0");
        assert_eq!(format_fraction(0.25), "0.25");
        assert_eq!(format_fraction(0.5), "0.5");
    }

    #[test]
    fn full_progress_serializes_as_one_point_zero() {
        let fraction = next_progress(0.0, 4, 4).unwrap();
        assert_eq!(format_fraction(fraction), "1.0");
    }
}
