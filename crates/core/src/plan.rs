use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PlanAction {
    Migrate,
    Skip,
    Error,
}

impl PlanAction {
    pub const ALL: [PlanAction; 3] = [PlanAction::Migrate, PlanAction::Skip, PlanAction::Error];

    pub fn label(&self) -> &'static str {
        match self {
            PlanAction::Migrate => "Migrate",
            PlanAction::Skip => "Skip",
            PlanAction::Error => "Error",
        }
    }

    pub fn label_for_index(i: usize) -> &'static str {
        Self::ALL.get(i).map(|a| a.label()).unwrap_or("Unknown")
    }
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One row of a migration plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanItem {
    pub name: String,
    pub namespace: String,
    pub claim: String,
    pub volume_name: Option<String>,
    pub volume_id: Option<String>,
    pub capacity: Option<String>,
    pub current_zone: Option<String>,
    pub target_zone: String,
    pub action: PlanAction,
    /// Why a row is skipped or errored.
    pub reason: Option<String>,
}

/// Read-only preview of a run, with the run configuration echoed back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationPlan {
    pub items: Vec<PlanItem>,
    pub target_zone: String,
    pub storage_class: String,
    pub dry_run: bool,
    pub namespaces: Vec<String>,
    pub concurrency: usize,
}

impl MigrationPlan {
    pub fn count(&self, action: PlanAction) -> usize {
        self.items.iter().filter(|i| i.action == action).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_action_labels() {
        assert_eq!(PlanAction::Migrate.to_string(), "Migrate");
        assert_eq!(PlanAction::label_for_index(2), "Error");
        assert_eq!(PlanAction::label_for_index(3), "Unknown");
    }
}
