//! Dependency graph validation
//!
//! Adding a task never validates its dependencies, so a queue can hold tasks
//! that will never become eligible: dependencies on unknown ids, on cancelled
//! or exhausted tasks, or dependency cycles. These helpers find them so they
//! can be surfaced to operators.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::Serialize;
use tracing::debug;

use crate::record::TaskRecord;

/// Result of [`Store::validate_dependencies`](crate::Store::validate_dependencies)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    /// Each cycle as a path that starts and ends on the same id
    pub cycles: Vec<Vec<String>>,

    /// Non-terminal task id -> dependency ids that do not exist
    pub missing: BTreeMap<String, BTreeSet<String>>,

    /// Non-terminal task id -> dependencies that are cancelled or failed with no retries left
    pub dead: BTreeMap<String, BTreeSet<String>>,

    /// Tasks awaiting dispatch that can never become eligible
    pub blocked: BTreeSet<String>,
}

impl DependencyReport {
    pub fn build(tasks: &BTreeMap<String, TaskRecord>) -> Self {
        debug!(task_count = tasks.len(), "DependencyReport::build: called");
        let mut report = Self {
            cycles: find_cycles(tasks),
            blocked: blocked_tasks(tasks),
            ..Default::default()
        };

        for record in tasks.values().filter(|r| !r.is_terminal()) {
            for dep in &record.dependencies {
                match tasks.get(dep) {
                    None => {
                        report.missing.entry(record.id.clone()).or_default().insert(dep.clone());
                    }
                    Some(dep_record) if dep_record.is_dead() => {
                        report.dead.entry(record.id.clone()).or_default().insert(dep.clone());
                    }
                    Some(_) => {}
                }
            }
        }

        debug!(
            cycles = report.cycles.len(),
            missing = report.missing.len(),
            dead = report.dead.len(),
            blocked = report.blocked.len(),
            "DependencyReport::build: complete"
        );
        report
    }

    pub fn is_healthy(&self) -> bool {
        self.cycles.is_empty() && self.missing.is_empty() && self.dead.is_empty()
    }
}

/// Find dependency cycles with a DFS over known ids
pub fn find_cycles(tasks: &BTreeMap<String, TaskRecord>) -> Vec<Vec<String>> {
    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    let mut path = Vec::new();
    let mut cycles = Vec::new();

    for id in tasks.keys() {
        if !visited.contains(id.as_str()) {
            cycle_dfs(id, tasks, &mut visited, &mut on_stack, &mut path, &mut cycles);
        }
    }

    cycles
}

fn cycle_dfs<'a>(
    node: &'a str,
    graph: &'a BTreeMap<String, TaskRecord>,
    visited: &mut HashSet<&'a str>,
    on_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
    cycles: &mut Vec<Vec<String>>,
) {
    visited.insert(node);
    on_stack.insert(node);
    path.push(node);

    if let Some(record) = graph.get(node) {
        for dep in &record.dependencies {
            let dep = dep.as_str();
            if !graph.contains_key(dep) {
                continue;
            }
            if on_stack.contains(dep) {
                // back edge
                let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(dep.to_string());
                debug!(?cycle, "cycle_dfs: cycle detected");
                cycles.push(cycle);
            } else if !visited.contains(dep) {
                cycle_dfs(dep, graph, visited, on_stack, path, cycles);
            }
        }
    }

    path.pop();
    on_stack.remove(node);
}

/// Ids of Pending/Queued tasks whose dependencies can never all complete.
///
/// A dependency can never complete when it is unknown, cancelled, failed with
/// no retries left, part of a cycle, or itself blocked.
pub fn blocked_tasks(tasks: &BTreeMap<String, TaskRecord>) -> BTreeSet<String> {
    let mut memo = HashMap::new();
    let mut visiting = HashSet::new();

    tasks
        .values()
        .filter(|r| r.status.is_awaiting_dispatch())
        .filter(|r| {
            r.dependencies
                .iter()
                .any(|dep| never_completes(dep, tasks, &mut memo, &mut visiting))
        })
        .map(|r| r.id.clone())
        .collect()
}

fn never_completes<'a>(
    id: &'a str,
    tasks: &'a BTreeMap<String, TaskRecord>,
    memo: &mut HashMap<&'a str, bool>,
    visiting: &mut HashSet<&'a str>,
) -> bool {
    if let Some(&known) = memo.get(id) {
        return known;
    }
    let Some(record) = tasks.get(id) else {
        return true;
    };
    if record.status == crate::record::TaskStatus::Completed {
        memo.insert(id, false);
        return false;
    }
    if record.is_dead() || visiting.contains(id) {
        return true;
    }

    visiting.insert(id);
    let result = record
        .dependencies
        .iter()
        .any(|dep| never_completes(dep, tasks, memo, visiting));
    visiting.remove(id);

    memo.insert(id, result);
    result
}
