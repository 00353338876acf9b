//! Module dependency resolution
//!
//! Kahn's algorithm over the requested closure. The ready set is ordered,
//! so independent modules come out in lexical order and identical inputs
//! always give identical load orders.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::{HatchError, Result};
use crate::module::descriptor::ModuleDescriptor;

/// Requested modules plus their transitive dependencies, dependencies
/// first.
pub fn resolve_load_order<S: AsRef<str>>(
    available: &BTreeMap<String, ModuleDescriptor>,
    requested: &[S],
) -> Result<Vec<String>> {
    let closure = collect_closure(available, requested)?;

    // in-degree = number of dependencies inside the closure
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for name in &closure {
        let descriptor = &available[name.as_str()];
        in_degree.insert(name.as_str(), descriptor.dependencies.len());
        for dep in &descriptor.dependencies {
            dependents.entry(dep.as_str()).or_default().push(name.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(&name, _)| name)
        .collect();
    let mut order = Vec::with_capacity(closure.len());

    while let Some(name) = ready.pop_first() {
        order.push(name.to_string());
        for &dependent in dependents.get(name).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() != closure.len() {
        let stuck: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(&name, _)| name)
            .collect();
        return Err(HatchError::CyclicDependency {
            cycle: find_cycle(available, &stuck),
        });
    }

    debug!("Load order: {:?}", order);
    Ok(order)
}

/// Every module reachable from `requested`, failing on unknown names
fn collect_closure<S: AsRef<str>>(
    available: &BTreeMap<String, ModuleDescriptor>,
    requested: &[S],
) -> Result<BTreeSet<String>> {
    let mut closure = BTreeSet::new();
    let mut stack: Vec<&str> = Vec::new();

    for name in requested {
        let name = name.as_ref();
        if !available.contains_key(name) {
            return Err(HatchError::UnknownModule(name.to_string()));
        }
        stack.push(name);
    }
    // Visit requested names in the order given
    stack.reverse();

    while let Some(name) = stack.pop() {
        if !closure.insert(name.to_string()) {
            continue;
        }
        let descriptor = &available[name];
        for dep in descriptor.dependencies.iter().rev() {
            if !available.contains_key(dep) {
                return Err(HatchError::MissingDependency {
                    missing: dep.clone(),
                    requester: name.to_string(),
                });
            }
            if !closure.contains(dep) {
                stack.push(dep.as_str());
            }
        }
    }

    Ok(closure)
}

/// Report one cycle among modules Kahn could not order, as a closed path
/// starting at its lexically smallest member.
fn find_cycle(
    available: &BTreeMap<String, ModuleDescriptor>,
    stuck: &BTreeSet<&str>,
) -> Vec<String> {
    let Some(&start) = stuck.iter().next() else {
        return Vec::new();
    };

    // Every stuck node has a stuck dependency, so walking them must revisit
    // a node.
    let mut path: Vec<&str> = vec![start];
    let mut current = start;
    loop {
        let next = available[current]
            .dependencies
            .iter()
            .map(String::as_str)
            .find(|d| stuck.contains(d));
        let Some(next) = next else {
            return path.iter().map(|s| s.to_string()).collect();
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(next.to_string());
            return rotate_to_smallest(cycle);
        }
        path.push(next);
        current = next;
    }
}

fn rotate_to_smallest(mut cycle: Vec<String>) -> Vec<String> {
    // cycle is closed: first == last
    cycle.pop();
    let min = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    cycle.rotate_left(min);
    if let Some(first) = cycle.first().cloned() {
        cycle.push(first);
    }
    cycle
}
