//! Plan and apply result types

use crate::state::StateRecord;
use serde::{Deserialize, Serialize};
use stackflow_core::{ResourceAddress, ResourceDescriptor, ResourceKind};
use std::fmt;

/// Planned action for a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Create a new resource
    Create,
    /// Update an existing resource in place
    Update,
    /// Destroy and re-create the resource
    Replace,
    /// Destroy a resource that is no longer declared
    Destroy,
    /// No changes needed
    NoOp,
}

impl Action {
    /// Marker used in plan output
    pub fn symbol(&self) -> &'static str {
        match self {
            Action::Create => "+",
            Action::Update => "~",
            Action::Replace => "-/+",
            Action::Destroy => "-",
            Action::NoOp => " ",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => write!(f, "create"),
            Action::Update => write!(f, "update"),
            Action::Replace => write!(f, "replace"),
            Action::Destroy => write!(f, "destroy"),
            Action::NoOp => write!(f, "no-op"),
        }
    }
}

/// Planned change for a single resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub address: ResourceAddress,

    pub kind: ResourceKind,

    pub action: Action,

    /// Human-readable reason for the action
    pub reason: String,

    /// Top-level config fields that differ from the applied config
    #[serde(default)]
    pub changed_fields: Vec<String>,

    /// A `NoOp` whose recorded dependencies must be rewritten
    #[serde(default)]
    pub refresh_dependencies: bool,

    /// Recorded state, if any
    pub prior: Option<StateRecord>,

    /// Desired declaration, absent for destroys
    pub desired: Option<ResourceDescriptor>,
}

/// Provider operation performed by a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOp {
    Create,
    Update,
    Destroy,
    NoOp,
}

impl fmt::Display for StepOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOp::Create => write!(f, "create"),
            StepOp::Update => write!(f, "update"),
            StepOp::Destroy => write!(f, "destroy"),
            StepOp::NoOp => write!(f, "no-op"),
        }
    }
}

/// Executable unit of a plan
///
/// A `Replace` change expands into a destroy step and a create step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub address: ResourceAddress,

    pub op: StepOp,

    /// Index into `Plan::changes`
    pub change: usize,

    /// Indices of steps that must succeed first
    pub after: Vec<usize>,
}

/// Plan containing all changes to be applied
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Destroys first, then desired resources in topological order
    pub changes: Vec<Change>,

    /// Executable steps with their ordering constraints
    pub steps: Vec<Step>,

    /// Whether the plan has any changes
    pub has_changes: bool,
}

impl Plan {
    pub fn new(changes: Vec<Change>, steps: Vec<Step>) -> Self {
        let has_changes = changes
            .iter()
            .any(|c| c.action != Action::NoOp || c.refresh_dependencies);
        Self {
            changes,
            steps,
            has_changes,
        }
    }

    pub fn empty() -> Self {
        Self {
            changes: Vec::new(),
            steps: Vec::new(),
            has_changes: false,
        }
    }

    pub fn change(&self, address: &ResourceAddress) -> Option<&Change> {
        self.changes.iter().find(|c| &c.address == address)
    }

    /// Get changes by action
    pub fn changes_by_action(&self, action: Action) -> Vec<&Change> {
        self.changes.iter().filter(|c| c.action == action).collect()
    }

    /// Summary of the plan
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            create: self.changes_by_action(Action::Create).len(),
            update: self.changes_by_action(Action::Update).len(),
            replace: self.changes_by_action(Action::Replace).len(),
            destroy: self.changes_by_action(Action::Destroy).len(),
            no_change: self.changes_by_action(Action::NoOp).len(),
            refresh: self
                .changes
                .iter()
                .filter(|c| c.refresh_dependencies)
                .count(),
        }
    }
}

/// Summary of planned changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub destroy: usize,
    pub no_change: usize,
    /// Unchanged resources whose recorded dependencies are rewritten
    pub refresh: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to destroy, {} unchanged",
            self.create, self.update, self.replace, self.destroy, self.no_change
        )?;
        if self.refresh > 0 {
            write!(f, " ({} dependency refresh)", self.refresh)?;
        }
        Ok(())
    }
}

/// Lifecycle of a step during apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    /// An upstream step failed, or the run stopped before this step started
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::InProgress => write!(f, "in progress"),
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of a single step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Index into `Plan::steps`
    pub step: usize,

    pub address: ResourceAddress,

    pub op: StepOp,

    pub status: StepStatus,

    /// Provider attempts made for the mutating call
    pub attempts: u32,

    /// Success message or skip reason
    pub message: String,

    /// Error message if failed
    pub error: Option<String>,
}

/// Result of applying a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    /// One outcome per plan step, in step order
    pub outcomes: Vec<StepOutcome>,

    /// Total execution time in milliseconds
    pub duration_ms: u64,

    /// Whether the run was cancelled
    pub cancelled: bool,
}

impl ApplyReport {
    fn with_status(&self, status: StepStatus) -> Vec<&StepOutcome> {
        self.outcomes.iter().filter(|o| o.status == status).collect()
    }

    pub fn succeeded(&self) -> Vec<&StepOutcome> {
        self.with_status(StepStatus::Succeeded)
    }

    pub fn failed(&self) -> Vec<&StepOutcome> {
        self.with_status(StepStatus::Failed)
    }

    pub fn skipped(&self) -> Vec<&StepOutcome> {
        self.with_status(StepStatus::Skipped)
    }

    pub fn outcome(&self, address: &ResourceAddress, op: StepOp) -> Option<&StepOutcome> {
        self.outcomes
            .iter()
            .find(|o| &o.address == address && o.op == op)
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self
                .outcomes
                .iter()
                .all(|o| o.status == StepStatus::Succeeded)
    }

    pub fn is_partial_failure(&self) -> bool {
        !self.is_success()
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped in {}ms",
            self.succeeded().len(),
            self.failed().len(),
            self.skipped().len(),
            self.duration_ms
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(resource: &str, action: Action) -> Change {
        Change {
            address: ResourceAddress::new("s", resource),
            kind: ResourceKind::Bucket,
            action,
            reason: String::new(),
            changed_fields: Vec::new(),
            refresh_dependencies: false,
            prior: None,
            desired: None,
        }
    }

    #[test]
    fn test_plan_summary() {
        let plan = Plan::new(
            vec![
                change("a", Action::Create),
                change("b", Action::Create),
                change("c", Action::Replace),
                change("d", Action::NoOp),
            ],
            Vec::new(),
        );
        assert!(plan.has_changes);
        assert_eq!(
            plan.summary().to_string(),
            "2 to create, 0 to update, 1 to replace, 0 to destroy, 1 unchanged"
        );
    }

    #[test]
    fn test_dependency_refresh_counts_as_change() {
        let mut refresh = change("a", Action::NoOp);
        refresh.refresh_dependencies = true;
        let plan = Plan::new(vec![refresh, change("b", Action::NoOp)], Vec::new());

        assert!(plan.has_changes);
        assert_eq!(plan.summary().refresh, 1);
        assert_eq!(
            plan.summary().to_string(),
            "0 to create, 0 to update, 0 to replace, 0 to destroy, \
             2 unchanged (1 dependency refresh)"
        );
    }

    #[test]
    fn test_noop_plan_has_no_changes() {
        let plan = Plan::new(vec![change("a", Action::NoOp)], Vec::new());
        assert!(!plan.has_changes);
        assert!(!Plan::empty().has_changes);
    }

    #[test]
    fn test_report_status() {
        let outcome = |status| StepOutcome {
            step: 0,
            address: ResourceAddress::new("s", "a"),
            op: StepOp::Create,
            status,
            attempts: 1,
            message: String::new(),
            error: None,
        };
        let report = ApplyReport {
            outcomes: vec![outcome(StepStatus::Succeeded), outcome(StepStatus::Skipped)],
            duration_ms: 12,
            cancelled: false,
        };
        assert!(report.is_partial_failure());
        assert_eq!(report.to_string(), "1 succeeded, 0 failed, 1 skipped in 12ms");

        let empty = ApplyReport {
            outcomes: Vec::new(),
            duration_ms: 0,
            cancelled: false,
        };
        assert!(empty.is_success());
    }
}
