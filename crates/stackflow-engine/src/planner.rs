//! Plan synthesis
//!
//! Compares the desired dependency graph with the recorded state and decides,
//! per resource, whether to create, update, replace, destroy or leave it alone.
//! Planning never calls a provider and never writes state.

use crate::action::{Action, Change, Plan, Step, StepOp};
use crate::error::{EngineError, Result};
use crate::provider::ResolvedConfig;
use crate::state::{StateRecord, StateSnapshot};
use serde_json::Value;
use stackflow_core::{
    DependencyGraph, OutputReference, ResourceAddress, ResourceDescriptor, ResourceKind, toposort,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument};

/// Hash of a resolved configuration
///
/// BLAKE3 over a canonical JSON rendering (sorted keys) of the kind and config.
pub fn config_hash(kind: ResourceKind, config: &ResolvedConfig) -> String {
    let mut canonical = String::new();
    canonical.push_str(kind.as_str());
    canonical.push('\n');
    write_canonical_map(config, &mut canonical);
    blake3::hash(canonical.as_bytes()).to_hex().to_string()
}

fn write_canonical_map(map: &serde_json::Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(&map[key], out);
    }
    out.push('}');
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_canonical_map(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Top-level fields whose values differ between two configurations
pub fn changed_fields(applied: &ResolvedConfig, desired: &ResolvedConfig) -> Vec<String> {
    let keys: BTreeSet<&String> = applied.keys().chain(desired.keys()).collect();
    keys.into_iter()
        .filter(|key| applied.get(*key) != desired.get(*key))
        .cloned()
        .collect()
}

/// Fields to send to `update`: changed values, with removed fields as `null`
pub fn config_delta(applied: &ResolvedConfig, desired: &ResolvedConfig) -> ResolvedConfig {
    changed_fields(applied, desired)
        .into_iter()
        .map(|key| {
            let value = desired.get(&key).cloned().unwrap_or(Value::Null);
            (key, value)
        })
        .collect()
}

/// Compute the plan that moves `snapshot` to the desired `graph`
#[instrument(skip_all, fields(resources = graph.len(), recorded = snapshot.len()))]
pub fn plan(graph: &DependencyGraph, snapshot: &StateSnapshot) -> Result<Plan> {
    let prior_dependents = prior_dependents(snapshot);

    // Recorded dependents of a replaced resource are replaced with it. Each
    // round can only add to `forced`, so this settles.
    let mut forced: BTreeMap<ResourceAddress, String> = BTreeMap::new();
    let desired_changes = loop {
        let changes = classify_all(graph, snapshot, &forced);
        let actions: BTreeMap<ResourceAddress, Action> = changes
            .iter()
            .map(|c| (c.address.clone(), c.action))
            .collect();

        let mut grew = false;
        for change in changes.iter().filter(|c| c.action == Action::Replace) {
            for dependent in prior_dependents.get(&change.address).into_iter().flatten() {
                let keeps_instance =
                    matches!(actions.get(dependent), Some(Action::NoOp | Action::Update));
                if keeps_instance && !forced.contains_key(dependent) {
                    forced.insert(
                        dependent.clone(),
                        format!("depends on {}, which is being replaced", change.address),
                    );
                    grew = true;
                }
            }
        }
        if !grew {
            break changes;
        }
    };

    let destroys: Vec<Change> = snapshot
        .iter()
        .filter(|record| !graph.contains(&record.address))
        .map(|record| destroy_change(record, "no longer declared".to_string()))
        .collect();

    assemble(snapshot, destroys, desired_changes, |address| {
        graph.dependencies(address).cloned().collect()
    })
}

/// Classify every desired resource in topological order
fn classify_all(
    graph: &DependencyGraph,
    snapshot: &StateSnapshot,
    forced: &BTreeMap<ResourceAddress, String>,
) -> Vec<Change> {
    let mut actions: BTreeMap<ResourceAddress, Action> = BTreeMap::new();
    let mut changes = Vec::with_capacity(graph.len());

    for descriptor in graph.descriptors() {
        let address = descriptor.address();

        // Targets that keep their instance already have outputs to show.
        let lookup = |reference: &OutputReference| match actions.get(&reference.target) {
            Some(Action::NoOp) | Some(Action::Update) => snapshot
                .output(&reference.target, &reference.attribute)
                .map(str::to_string),
            _ => None,
        };
        let resolved = descriptor.resolve_config_or_placeholder(&lookup);
        let dependencies: Vec<ResourceAddress> = graph.dependencies(address).cloned().collect();

        let mut change = classify(descriptor, snapshot.get(address), &resolved, &dependencies);

        if let Some(reason) = forced.get(address) {
            if change.prior.is_some() && change.action != Action::Replace {
                change.action = Action::Replace;
                change.reason = reason.clone();
                change.refresh_dependencies = false;
            }
        } else if change.action == Action::NoOp {
            // An updated target may report new outputs, which are only known
            // once its update has run.
            let updated_target = descriptor
                .references()
                .into_iter()
                .map(|reference| &reference.target)
                .find(|target| actions.get(*target) == Some(&Action::Update));
            if let Some(target) = updated_target {
                change.action = Action::Update;
                change.reason = format!("outputs of {} are known after apply", target);
                change.refresh_dependencies = false;
            }
        }

        debug!(%address, action = %change.action, reason = %change.reason, "Planned change");
        actions.insert(address.clone(), change.action);
        changes.push(change);
    }

    changes
}

/// Compute a teardown plan for the selected records
///
/// Records that depend on a selected record are torn down as well.
#[instrument(skip_all, fields(recorded = snapshot.len()))]
pub fn plan_destroy<F>(snapshot: &StateSnapshot, selection: F) -> Result<Plan>
where
    F: Fn(&StateRecord) -> bool,
{
    let prior_dependents = prior_dependents(snapshot);

    let mut reasons: BTreeMap<ResourceAddress, String> = snapshot
        .iter()
        .filter(|record| selection(record))
        .map(|record| (record.address.clone(), "destroy requested".to_string()))
        .collect();

    let mut pending: Vec<ResourceAddress> = reasons.keys().cloned().collect();
    while let Some(address) = pending.pop() {
        for dependent in prior_dependents.get(&address).into_iter().flatten() {
            if !reasons.contains_key(dependent) {
                reasons.insert(
                    dependent.clone(),
                    format!("depends on {}, which is being destroyed", address),
                );
                pending.push(dependent.clone());
            }
        }
    }

    let destroys = reasons
        .into_iter()
        .filter_map(|(address, reason)| {
            snapshot
                .get(&address)
                .map(|record| destroy_change(record, reason))
        })
        .collect();

    assemble(snapshot, destroys, Vec::new(), |_| Vec::new())
}

fn destroy_change(record: &StateRecord, reason: String) -> Change {
    Change {
        address: record.address.clone(),
        kind: record.kind,
        action: Action::Destroy,
        reason,
        changed_fields: Vec::new(),
        refresh_dependencies: false,
        prior: Some(record.clone()),
        desired: None,
    }
}

fn classify(
    descriptor: &ResourceDescriptor,
    prior: Option<&StateRecord>,
    resolved: &ResolvedConfig,
    dependencies: &[ResourceAddress],
) -> Change {
    let kind = descriptor.kind();
    let hash = config_hash(kind, resolved);
    let dependencies_differ = prior.is_some_and(|prior| {
        let mut recorded = prior.dependencies.clone();
        recorded.sort();
        recorded.as_slice() != dependencies
    });

    let (action, reason, fields) = match prior {
        None => (Action::Create, "not in state".to_string(), Vec::new()),
        Some(prior) if prior.kind != kind => (
            Action::Replace,
            format!("kind changed from {} to {}", prior.kind, kind),
            Vec::new(),
        ),
        Some(prior) if prior.config_hash == hash => {
            let reason = if dependencies_differ {
                "dependencies changed"
            } else {
                "up to date"
            };
            (Action::NoOp, reason.to_string(), Vec::new())
        }
        Some(prior) => {
            let fields = changed_fields(&prior.applied_config, resolved);
            let immutable: Vec<&str> = fields
                .iter()
                .map(String::as_str)
                .filter(|f| kind.requires_replacement(f))
                .collect();
            if !immutable.is_empty() {
                let reason = format!("{} cannot be changed in place", immutable.join(", "));
                (Action::Replace, reason, fields)
            } else if fields.is_empty() {
                (
                    Action::Update,
                    "configuration hash changed".to_string(),
                    fields,
                )
            } else {
                let reason = format!("{} changed", fields.join(", "));
                (Action::Update, reason, fields)
            }
        }
    };

    Change {
        address: descriptor.address().clone(),
        kind,
        action,
        reason,
        changed_fields: fields,
        refresh_dependencies: action == Action::NoOp && dependencies_differ,
        prior: prior.cloned(),
        desired: Some(descriptor.clone()),
    }
}

/// Invert the recorded dependencies
fn prior_dependents(
    snapshot: &StateSnapshot,
) -> BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>> {
    let mut dependents: BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>> = BTreeMap::new();
    for (address, deps) in snapshot.dependency_map() {
        for dep in deps {
            dependents.entry(dep).or_default().insert(address.clone());
        }
    }
    dependents
}

/// Order changes and expand them into steps
fn assemble<D>(
    snapshot: &StateSnapshot,
    destroys: Vec<Change>,
    desired: Vec<Change>,
    desired_dependencies: D,
) -> Result<Plan>
where
    D: Fn(&ResourceAddress) -> Vec<ResourceAddress>,
{
    // Everything whose prior instance goes away: pure destroys and replacements.
    let teardown: BTreeSet<ResourceAddress> = destroys
        .iter()
        .chain(desired.iter().filter(|c| c.action == Action::Replace))
        .map(|c| c.address.clone())
        .collect();

    let prior_deps = snapshot.dependency_map();
    let teardown_deps: BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>> = teardown
        .iter()
        .map(|address| {
            let deps = prior_deps
                .get(address)
                .map(|deps| deps.intersection(&teardown).cloned().collect())
                .unwrap_or_default();
            (address.clone(), deps)
        })
        .collect();
    let teardown_order: Vec<ResourceAddress> = toposort(&teardown_deps)
        .map_err(|e| EngineError::StateError(format!("recorded dependencies are invalid: {}", e)))?
        .into_iter()
        .rev()
        .collect();

    let mut destroys: BTreeMap<ResourceAddress, Change> = destroys
        .into_iter()
        .map(|c| (c.address.clone(), c))
        .collect();

    let mut changes = Vec::with_capacity(destroys.len() + desired.len());
    for address in &teardown_order {
        if let Some(change) = destroys.remove(address) {
            changes.push(change);
        }
    }
    changes.extend(desired);

    let mut change_index: BTreeMap<ResourceAddress, usize> = BTreeMap::new();
    for (index, change) in changes.iter().enumerate() {
        if change_index.insert(change.address.clone(), index).is_some() {
            return Err(EngineError::PlanConflict(format!(
                "{} appears more than once",
                change.address
            )));
        }
    }

    let mut steps = Vec::with_capacity(changes.len() + teardown.len());

    // Destroy phase: dependents go first.
    let mut destroy_steps: BTreeMap<ResourceAddress, usize> = BTreeMap::new();
    for address in &teardown_order {
        let after: Vec<usize> = teardown
            .iter()
            .filter(|other| {
                teardown_deps
                    .get(*other)
                    .is_some_and(|deps| deps.contains(address))
            })
            .filter_map(|other| destroy_steps.get(other).copied())
            .collect();

        destroy_steps.insert(address.clone(), steps.len());
        steps.push(Step {
            address: address.clone(),
            op: StepOp::Destroy,
            change: change_index[address],
            after,
        });
    }

    // Apply phase in topological order.
    let mut apply_steps: BTreeMap<ResourceAddress, usize> = BTreeMap::new();
    for (index, change) in changes.iter().enumerate() {
        let op = match change.action {
            Action::Create | Action::Replace => StepOp::Create,
            Action::Update => StepOp::Update,
            Action::NoOp => StepOp::NoOp,
            Action::Destroy => continue,
        };

        let mut after: Vec<usize> = desired_dependencies(&change.address)
            .iter()
            .filter_map(|dep| apply_steps.get(dep).copied())
            .collect();
        if change.action == Action::Replace {
            let destroy = destroy_steps.get(&change.address).copied().ok_or_else(|| {
                EngineError::PlanConflict(format!("{} has no destroy step", change.address))
            })?;
            after.push(destroy);
        }
        after.sort_unstable();

        apply_steps.insert(change.address.clone(), steps.len());
        steps.push(Step {
            address: change.address.clone(),
            op,
            change: index,
            after,
        });
    }

    let plan = Plan::new(changes, steps);
    debug!(summary = %plan.summary(), steps = plan.steps.len(), "Plan assembled");
    Ok(plan)
}
