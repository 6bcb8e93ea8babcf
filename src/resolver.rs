//! Dependency resolution: turns a target formula into an install order.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use crate::error::{FarrierError, Result};
use crate::formula::Formula;
use crate::formulary::FormulaLookup;

/// Resolves the full dependency closure of `target`.
///
/// The result lists every formula exactly once, dependencies before their
/// dependents, the target last. Formulas that do not depend on each other are
/// ordered by name so the same input always gives the same order.
///
/// # Errors
///
/// * [`FarrierError::NotFound`] if the target or any dependency is unknown.
/// * [`FarrierError::Cycle`] if the dependency graph has a cycle.
///
/// # Example
///
/// ```no_run
/// use farrier::{resolve, Formulary};
///
/// let formulary = Formulary::load_dir("Formula").unwrap();
/// let order = resolve("horse", &formulary).unwrap();
/// assert_eq!(order.last().unwrap().name, "horse");
/// ```
pub fn resolve<'a, L>(target: &str, lookup: &'a L) -> Result<Vec<&'a Formula>>
where
    L: FormulaLookup + ?Sized,
{
    resolve_with(target, lookup, |_| false)
}

/// Like [`resolve`], but dependencies for which `satisfied` returns `true`
/// are left out together with everything only they pull in. The target is
/// always part of the result.
pub fn resolve_with<'a, L, F>(target: &str, lookup: &'a L, satisfied: F) -> Result<Vec<&'a Formula>>
where
    L: FormulaLookup + ?Sized,
    F: Fn(&Formula) -> bool,
{
    let root = lookup.get(target).ok_or_else(|| FarrierError::NotFound {
        name: target.to_string(),
        required_by: None,
    })?;

    let mut nodes = BTreeMap::new();
    let mut stack = Vec::new();
    visit(root, lookup, &satisfied, &mut stack, &mut nodes)?;

    let order = topological_order(&nodes)?;
    debug!(
        "resolved {} -> [{}]",
        target,
        order.iter().map(|f| f.name.as_str()).collect::<Vec<_>>().join(", ")
    );
    Ok(order)
}

/// Names of `formula`'s dependencies that are part of `plan`, sorted.
pub fn dependencies_in<'p>(formula: &Formula, plan: &BTreeSet<&'p str>) -> Vec<&'p str> {
    let mut deps: Vec<&str> = formula
        .dependency_names()
        .filter_map(|name| plan.get(name).copied())
        .collect();
    deps.sort_unstable();
    deps.dedup();
    deps
}

fn visit<'a, L, F>(
    formula: &'a Formula,
    lookup: &'a L,
    satisfied: &F,
    stack: &mut Vec<&'a str>,
    nodes: &mut BTreeMap<&'a str, &'a Formula>,
) -> Result<()>
where
    L: FormulaLookup + ?Sized,
    F: Fn(&Formula) -> bool,
{
    let name = formula.name.as_str();
    if nodes.contains_key(name) {
        return Ok(());
    }
    if let Some(pos) = stack.iter().position(|n| *n == name) {
        let mut cycle: Vec<String> = stack[pos..].iter().map(|n| n.to_string()).collect();
        cycle.push(name.to_string());
        return Err(FarrierError::Cycle { cycle });
    }

    stack.push(name);
    let deps: BTreeSet<&str> = formula.dependency_names().collect();
    for dep in deps {
        let dep_formula = lookup.get(dep).ok_or_else(|| FarrierError::NotFound {
            name: dep.to_string(),
            required_by: Some(name.to_string()),
        })?;
        if satisfied(dep_formula) {
            debug!("{} already satisfied, not expanding", dep);
            continue;
        }
        visit(dep_formula, lookup, satisfied, stack, nodes)?;
    }
    stack.pop();
    nodes.insert(name, formula);
    Ok(())
}

/// Kahn's algorithm with a sorted ready set.
fn topological_order<'a>(nodes: &BTreeMap<&'a str, &'a Formula>) -> Result<Vec<&'a Formula>> {
    let plan: BTreeSet<&str> = nodes.keys().copied().collect();
    let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (&name, &formula) in nodes {
        let deps = dependencies_in(formula, &plan);
        pending.insert(name, deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(name);
        }
    }

    let mut ready: BTreeSet<&str> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(name) = ready.pop_first() {
        order.push(nodes[name]);
        for dependent in dependents.get(name).into_iter().flatten() {
            if let Some(count) = pending.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if order.len() != nodes.len() {
        let cycle = pending
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(name, _)| name.to_string())
            .collect();
        return Err(FarrierError::Cycle { cycle });
    }
    Ok(order)
}
