use std::collections::BTreeSet;

use super::compiler::CompiledFormula;
use super::names::NameKey;

/// Names of other known attributes referenced by a formula.
///
/// Only whole identifier tokens count, so `AB` never matches an attribute named `A`.
/// An attribute is never its own dependency.
pub fn extract_dependencies<F>(owner: &NameKey, formula: &CompiledFormula, is_known: F) -> BTreeSet<NameKey>
where
    F: Fn(&NameKey) -> bool,
{
    formula
        .identifiers()
        .iter()
        .map(|id| NameKey::new(id))
        .filter(|key| key != owner && is_known(key))
        .collect()
}

/// Follows dependency edges from `start` and reports the first cycle found, as the
/// list of names forming it.
pub fn find_cycle<F>(start: &NameKey, dependencies_of: F) -> Option<Vec<NameKey>>
where
    F: Fn(&NameKey) -> BTreeSet<NameKey>,
{
    fn visit<F>(
        node: &NameKey,
        dependencies_of: &F,
        path: &mut Vec<NameKey>,
        done: &mut BTreeSet<NameKey>,
    ) -> Option<Vec<NameKey>>
    where
        F: Fn(&NameKey) -> BTreeSet<NameKey>,
    {
        if let Some(pos) = path.iter().position(|n| n == node) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(node.clone());
            return Some(cycle);
        }
        if done.contains(node) {
            return None;
        }
        path.push(node.clone());
        for next in dependencies_of(node) {
            if let Some(cycle) = visit(&next, dependencies_of, path, done) {
                return Some(cycle);
            }
        }
        path.pop();
        done.insert(node.clone());
        None
    }

    visit(start, &dependencies_of, &mut Vec::new(), &mut BTreeSet::new())
}
