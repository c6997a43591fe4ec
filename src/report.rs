//! Per-entry outcomes and the batch report handed back to the host.

use std::fmt;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::error::Error;
use crate::range::IndexRange;
use crate::remote::TransferStats;
use crate::store::PutReceipt;

/// Number of per-entry lines in the default log summary.
pub const SUMMARY_LIMIT: usize = 20;

/// What one entry task was asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryParams {
    pub index: u64,
    /// Entry name inside the archive.
    pub name: String,
    /// Destination key.
    pub key: String,
    pub size: u64,
    pub is_directory: bool,
}

/// Outcome of one entry, recorded once by the worker that ran it.
#[derive(Debug)]
pub struct TaskResult {
    pub params: EntryParams,
    pub outcome: Result<PutReceipt, Error>,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error(&self) -> Option<&Error> {
        self.outcome.as_ref().err()
    }
}

impl Serialize for TaskResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("TaskResult", 3)?;
        state.serialize_field("params", &self.params)?;
        match &self.outcome {
            Ok(receipt) => {
                state.serialize_field("result", receipt)?;
                state.serialize_field("error", &Option::<String>::None)?;
            }
            Err(e) => {
                state.serialize_field("result", &Option::<PutReceipt>::None)?;
                state.serialize_field("error", &e.to_string())?;
            }
        }
        state.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchStatus {
    /// Every selected entry was uploaded.
    Success,
    /// At least one entry failed or was cancelled.
    PartialFailure,
}

/// Result of one scheduler run.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// `bucket/key` of the archive.
    pub source: String,
    /// Range actually processed; `None` when the requested range selects no entry.
    pub running_range: Option<IndexRange>,
    /// Range the host should run next, if entries remain.
    pub next_range: Option<IndexRange>,
    pub entry_count: u64,
    pub results: Vec<TaskResult>,
    /// Set when the batch was short-circuited without extracting anything.
    pub skipped: Option<String>,
    /// Cancellation reason, when the batch was cancelled.
    pub cancelled: Option<String>,
    pub transfer: TransferStats,
}

impl BatchReport {
    pub fn status(&self) -> BatchStatus {
        if self.cancelled.is_none() && self.results.iter().all(TaskResult::is_success) {
            BatchStatus::Success
        } else {
            BatchStatus::PartialFailure
        }
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    /// Human-readable lines for the run log.
    ///
    /// The first line carries the totals. Up to `limit` detail lines follow;
    /// when the results do not all fit and some failed, only failures are
    /// listed.
    pub fn summary(&self, limit: usize) -> Vec<String> {
        let total = self.results.len();
        let success = self.succeeded();
        let verdict = if success == total { "success" } else { "fail" };
        let mut lines = vec![format!(
            "{} {verdict}: success {success} / total {total}",
            self.source
        )];

        let truncated = total > limit;
        let has_error = success < total;
        for result in &self.results {
            if lines.len() > limit {
                break;
            }
            let params = serde_json::to_string(&result.params).unwrap_or_default();
            match &result.outcome {
                Err(e) => lines.push(format!("fail {params}: {e}")),
                Ok(_) if truncated && has_error => {}
                Ok(receipt) => lines.push(format!("success {params}: {}", receipt.location)),
            }
        }
        lines
    }
}

/// The stage a batch failed at before any entry was extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureStage {
    /// The archive could not be opened.
    Open,
    /// The archive opened but its entries could not be listed.
    Listing,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureStage::Open => f.write_str("archive open"),
            FailureStage::Listing => f.write_str("entry listing"),
        }
    }
}

/// A batch that extracted nothing.
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {error}")]
pub struct BatchFailure {
    pub stage: FailureStage,
    #[source]
    pub error: Error,
}

impl BatchFailure {
    pub fn open(error: Error) -> Self {
        Self {
            stage: FailureStage::Open,
            error,
        }
    }

    pub fn listing(error: Error) -> Self {
        Self {
            stage: FailureStage::Listing,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(index: u64, ok: bool) -> TaskResult {
        let params = EntryParams {
            index,
            name: format!("f{index}"),
            key: format!("out/f{index}"),
            size: 1,
            is_directory: false,
        };
        let outcome = if ok {
            Ok(PutReceipt {
                request_id: None,
                location: format!("memory://b/out/f{index}"),
                etag: None,
            })
        } else {
            Err(Error::Http {
                status: 403,
                url: "memory://b".into(),
            })
        };
        TaskResult { params, outcome }
    }

    fn report(results: Vec<TaskResult>) -> BatchReport {
        BatchReport {
            source: "b/a.zip".into(),
            running_range: IndexRange::new(0, results.len() as u64 - 1).ok(),
            next_range: None,
            entry_count: results.len() as u64,
            results,
            skipped: None,
            cancelled: None,
            transfer: TransferStats::default(),
        }
    }

    #[test]
    fn serializes_result_or_error() {
        let report = report(vec![result(0, true), result(1, false)]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["results"][0]["error"], serde_json::Value::Null);
        assert_eq!(
            json["results"][0]["result"]["location"],
            "memory://b/out/f0"
        );
        assert_eq!(json["results"][1]["result"], serde_json::Value::Null);
        assert!(json["results"][1]["error"].as_str().unwrap().contains("403"));
        assert_eq!(json["results"][1]["params"]["key"], "out/f1");
        assert_eq!(report.status(), BatchStatus::PartialFailure);
    }

    #[test]
    fn summary_prefers_failures_when_truncated() {
        let results = (0..30).map(|i| result(i, i % 10 != 3)).collect();
        let lines = report(results).summary(SUMMARY_LIMIT);
        assert_eq!(lines[0], "b/a.zip fail: success 27 / total 30");
        assert_eq!(lines.len(), 4);
        assert!(lines[1..].iter().all(|l| l.starts_with("fail")));
    }

    #[test]
    fn summary_lists_everything_that_fits() {
        let results = (0..5).map(|i| result(i, true)).collect();
        let report = report(results);
        assert_eq!(report.status(), BatchStatus::Success);
        let lines = report.summary(SUMMARY_LIMIT);
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "b/a.zip success: success 5 / total 5");
    }
}
