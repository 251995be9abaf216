use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::parse_task_name;

/// Where a migration task currently is. Declaration order is step order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Step {
    Pending,
    GetInfo,
    Skipped,
    Snapshot,
    WaitSnapshot,
    CreateVolume,
    WaitVolume,
    CreatePV,
    Cleanup,
    CreatePVC,
    Done,
    Failed,
}

impl Step {
    pub const ALL: [Step; 12] = [
        Step::Pending,
        Step::GetInfo,
        Step::Skipped,
        Step::Snapshot,
        Step::WaitSnapshot,
        Step::CreateVolume,
        Step::WaitVolume,
        Step::CreatePV,
        Step::Cleanup,
        Step::CreatePVC,
        Step::Done,
        Step::Failed,
    ];

    pub fn from_index(i: usize) -> Option<Step> {
        Self::ALL.get(i).copied()
    }

    pub fn label(&self) -> &'static str {
        match self {
            Step::Pending => "Pending",
            Step::GetInfo => "Getting Info",
            Step::Skipped => "Skipped",
            Step::Snapshot => "Creating Snapshot",
            Step::WaitSnapshot => "Snapshot Progress",
            Step::CreateVolume => "Creating Volume",
            Step::WaitVolume => "Volume Creating",
            Step::CreatePV => "Creating PV",
            Step::Cleanup => "Cleaning Up",
            Step::CreatePVC => "Creating PVC",
            Step::Done => "Completed",
            Step::Failed => "Failed",
        }
    }

    /// Label for a raw step index; out-of-range renders as `"Unknown"`.
    pub fn label_for_index(i: usize) -> &'static str {
        Self::from_index(i).map(|s| s.label()).unwrap_or("Unknown")
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Step::Done | Step::Skipped | Step::Failed)
    }

    /// Steps whose progress field carries meaning.
    pub fn reports_progress(&self) -> bool {
        matches!(self, Step::WaitSnapshot | Step::WaitVolume)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Observable state of one migration task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskStatus {
    /// Full name, `"<namespace>/<claim>"`.
    pub name: String,
    pub namespace: String,
    pub claim: String,
    pub step: Step,
    pub progress: u8,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub old_volume_id: Option<String>,
    pub new_volume_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub current_zone: Option<String>,
    pub volume_name: Option<String>,
    pub capacity: Option<String>,
}

impl TaskStatus {
    pub fn pending(full_name: &str) -> Self {
        let (namespace, claim) = parse_task_name(full_name);
        Self {
            name: full_name.to_string(),
            namespace: namespace.to_string(),
            claim: claim.to_string(),
            step: Step::Pending,
            progress: 0,
            error: None,
            started_at: None,
            finished_at: None,
            old_volume_id: None,
            new_volume_id: None,
            snapshot_id: None,
            current_zone: None,
            volume_name: None,
            capacity: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.step.is_terminal()
    }

    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        Some(self.finished_at.unwrap_or_else(Utc::now) - start)
    }
}

/// Outcome counts over a set of task statuses.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub unfinished: usize,
}

impl RunSummary {
    pub fn from_statuses<'a>(statuses: impl IntoIterator<Item = &'a TaskStatus>) -> Self {
        let mut s = RunSummary::default();
        for st in statuses {
            match st.step {
                Step::Done => s.succeeded += 1,
                Step::Skipped => s.skipped += 1,
                Step::Failed => s.failed += 1,
                _ => s.unfinished += 1,
            }
        }
        s
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.skipped + self.failed + self.unfinished
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.unfinished > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_labels_fall_back_to_unknown() {
        assert_eq!(Step::label_for_index(0), "Pending");
        assert_eq!(Step::label_for_index(7), "Creating PV");
        assert_eq!(Step::label_for_index(11), "Failed");
        assert_eq!(Step::label_for_index(12), "Unknown");
        assert_eq!(Step::label_for_index(usize::MAX), "Unknown");
    }

    #[test]
    fn create_pv_precedes_cleanup() {
        assert!(Step::CreatePV < Step::Cleanup);
        assert!(Step::Cleanup < Step::CreatePVC);
    }

    #[test]
    fn terminal_steps() {
        let terminal: Vec<_> = Step::ALL.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![&Step::Skipped, &Step::Done, &Step::Failed]);
    }

    #[test]
    fn pending_status_carries_identity() {
        let s = TaskStatus::pending("prod/data");
        assert_eq!(s.namespace, "prod");
        assert_eq!(s.claim, "data");
        assert_eq!(s.step, Step::Pending);
        assert!(s.elapsed().is_none());
    }

    #[test]
    fn summary_counts_outcomes() {
        let mut a = TaskStatus::pending("n/a");
        a.step = Step::Done;
        let mut b = TaskStatus::pending("n/b");
        b.step = Step::Skipped;
        let mut c = TaskStatus::pending("n/c");
        c.step = Step::Failed;
        let d = TaskStatus::pending("n/d");
        let s = RunSummary::from_statuses([&a, &b, &c, &d]);
        assert_eq!((s.succeeded, s.skipped, s.failed, s.unfinished), (1, 1, 1, 1));
        assert_eq!(s.total(), 4);
        assert!(s.has_failures());
    }
}
