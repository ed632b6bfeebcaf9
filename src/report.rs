use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::dispatch::{Outcome, outcome_is_success};

/// Errors listed verbatim before the rest are summarized.
pub const ERROR_PREVIEW_LIMIT: usize = 10;

/// Aggregate view of a finished batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failure counts keyed by kind ("timeout", "remote", ...).
    pub failures_by_kind: BTreeMap<&'static str, usize>,
    /// First [`ERROR_PREVIEW_LIMIT`] failure lines.
    pub error_preview: Vec<String>,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn from_outcomes(outcomes: &[Outcome], elapsed: Duration) -> Self {
        let mut succeeded = 0;
        let mut failures_by_kind = BTreeMap::new();
        let mut error_preview = Vec::new();
        let mut failed = 0;

        for (i, outcome) in outcomes.iter().enumerate() {
            if outcome_is_success(outcome) {
                succeeded += 1;
                continue;
            }
            failed += 1;
            let (kind, line) = match outcome {
                Err(f) => (f.kind.as_str(), f.to_string()),
                // Ok but without `choices`.
                Ok(v) => ("malformed", format!("Request {i} failed: {v}")),
            };
            *failures_by_kind.entry(kind).or_insert(0) += 1;
            if error_preview.len() < ERROR_PREVIEW_LIMIT {
                error_preview.push(line);
            }
        }

        Self {
            total: outcomes.len(),
            succeeded,
            failed,
            failures_by_kind,
            error_preview,
            elapsed,
        }
    }

    /// Fraction of requests that succeeded, 0.0 for an empty batch.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.total as f64
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn requests_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { self.total as f64 / secs } else { 0.0 }
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Completed {} requests.", self.total)?;
        writeln!(
            f,
            "Success rate: {}/{} ({:.1}%)",
            self.succeeded,
            self.total,
            self.success_rate() * 100.0
        )?;
        writeln!(
            f,
            "Elapsed: {:.2}s ({:.1} req/s)",
            self.elapsed.as_secs_f64(),
            self.requests_per_second()
        )?;
        if self.failed > 0 {
            let kinds: Vec<String> = self
                .failures_by_kind
                .iter()
                .map(|(k, n)| format!("{k}={n}"))
                .collect();
            writeln!(f, "Failures by kind: {}", kinds.join(", "))?;
            writeln!(f, "\nErrors encountered:")?;
            for line in &self.error_preview {
                writeln!(f, "{line}")?;
            }
            if self.failed > self.error_preview.len() {
                writeln!(f, "...and {} more errors.", self.failed - self.error_preview.len())?;
            }
        }
        Ok(())
    }
}
