//! Per-worker dispositions and the optional progress stream.

use serde::Serialize;

use crate::error::FailureKind;
use crate::state::IfState;

/// Final (or interrupted) outcome of one worker's plan.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "disposition")]
pub enum Disposition {
    Done,
    Failed {
        kind: FailureKind,
        /// Abstract call name of the last action in flight, if any.
        last_call: Option<String>,
    },
    /// The process was interrupted before the worker settled.
    Pending { last_call: Option<String> },
}

/// One line of the final report.
#[derive(Clone, Debug, Serialize)]
pub struct WorkerReport {
    pub name: String,
    pub state: IfState,
    pub disposition: Disposition,
}

/// Everything the caller gets back from a run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunSummary {
    pub reports: Vec<WorkerReport>,
}

impl RunSummary {
    pub fn report(&self, name: &str) -> Option<&WorkerReport> {
        self.reports.iter().find(|r| r.name == name)
    }

    pub fn failed_count(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.disposition, Disposition::Failed { .. }))
            .count()
    }

    pub fn all_done(&self) -> bool {
        self.reports
            .iter()
            .all(|r| r.disposition == Disposition::Done)
    }
}

/// Progress notifications streamed to an optional subscriber.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    StateReached { worker: String, state: IfState },
    Parked { worker: String, on: String },
    Completed { worker: String },
    Failed { worker: String, kind: FailureKind },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_failures() {
        let summary = RunSummary {
            reports: vec![
                WorkerReport {
                    name: "eth0".into(),
                    state: IfState::AddrconfUp,
                    disposition: Disposition::Done,
                },
                WorkerReport {
                    name: "br0".into(),
                    state: IfState::DeviceDown,
                    disposition: Disposition::Failed {
                        kind: FailureKind::Timeout,
                        last_call: Some("addrconfUp".into()),
                    },
                },
            ],
        };
        assert_eq!(summary.failed_count(), 1);
        assert!(!summary.all_done());
        assert_eq!(summary.report("eth0").unwrap().disposition, Disposition::Done);
    }
}
