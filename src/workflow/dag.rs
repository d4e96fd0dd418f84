//! DAG validation, run before any persistent state exists.
//!
//! Rules enforced:
//! 1. Step names are unique and every dependency names a declared step.
//! 2. The dependency graph is acyclic; when it is not, one offending cycle is
//!    reported as a path of step names.
//!
//! A dependency listed twice counts as one edge.
//!
//! Returns step indices in a deterministic topological order: ties are broken by
//! declaration order.

use std::collections::{HashMap, HashSet, VecDeque};

use super::definition::DefinitionError;

/// Validate `(name, dependencies)` pairs and return indices in execution order.
pub(crate) fn topological_order<S: AsRef<str>>(
    steps: &[(S, Vec<S>)],
) -> Result<Vec<usize>, DefinitionError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
    for (position, (name, _)) in steps.iter().enumerate() {
        if index.insert(name.as_ref(), position).is_some() {
            return Err(DefinitionError::DuplicateStep(name.as_ref().to_string()));
        }
    }

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    let mut in_degree: Vec<usize> = vec![0; steps.len()];

    for (position, (name, dependencies)) in steps.iter().enumerate() {
        let mut seen: HashSet<&str> = HashSet::with_capacity(dependencies.len());
        for dependency in dependencies {
            let dependency = dependency.as_ref();
            let Some(&upstream) = index.get(dependency) else {
                return Err(DefinitionError::UnknownDependency {
                    step: name.as_ref().to_string(),
                    dependency: dependency.to_string(),
                });
            };
            if !seen.insert(dependency) {
                continue;
            }
            dependents[upstream].push(position);
            in_degree[position] += 1;
        }
    }

    // Kahn's algorithm, seeded in declaration order
    let mut queue: VecDeque<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted: Vec<usize> = Vec::with_capacity(steps.len());

    while let Some(position) = queue.pop_front() {
        sorted.push(position);
        for &dependent in &dependents[position] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if sorted.len() != steps.len() {
        let path = find_cycle(steps, &index, &in_degree);
        return Err(DefinitionError::CycleDetected { path });
    }

    Ok(sorted)
}

/// Walk "depends on" edges among the steps Kahn's algorithm could not order.
///
/// Every such step has at least one unordered dependency, so the walk must revisit a
/// step; the segment from its first visit is a cycle.
fn find_cycle<S: AsRef<str>>(
    steps: &[(S, Vec<S>)],
    index: &HashMap<&str, usize>,
    in_degree: &[usize],
) -> Vec<String> {
    let unresolved = |i: usize| in_degree[i] > 0;

    let Some(start) = (0..steps.len()).find(|&i| unresolved(i)) else {
        return Vec::new();
    };

    let mut path: Vec<usize> = Vec::new();
    let mut visited_at: HashMap<usize, usize> = HashMap::new();
    let mut current = start;

    loop {
        if let Some(&first) = visited_at.get(&current) {
            let mut cycle: Vec<String> = path[first..]
                .iter()
                .map(|&i| steps[i].0.as_ref().to_string())
                .collect();
            cycle.push(steps[current].0.as_ref().to_string());
            return cycle;
        }
        visited_at.insert(current, path.len());
        path.push(current);

        let next = steps[current]
            .1
            .iter()
            .filter_map(|dependency| index.get(dependency.as_ref()).copied())
            .find(|&upstream| unresolved(upstream));

        match next {
            Some(upstream) => current = upstream,
            None => return path.iter().map(|&i| steps[i].0.as_ref().to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&'static str, &[&'static str])]) -> Vec<(&'static str, Vec<&'static str>)> {
        edges.iter().map(|(name, deps)| (*name, deps.to_vec())).collect()
    }

    fn names(steps: &[(&'static str, Vec<&'static str>)], order: Vec<usize>) -> Vec<&'static str> {
        order.into_iter().map(|i| steps[i].0).collect()
    }

    #[test]
    fn valid_linear_dag_returns_sorted_order() {
        let steps = graph(&[("c", &["b"]), ("b", &["a"]), ("a", &[])]);
        let order = topological_order(&steps).expect("should be valid");
        assert_eq!(names(&steps, order), vec!["a", "b", "c"]);
    }

    #[test]
    fn valid_diamond_dag() {
        let steps = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        let order = names(&steps, topological_order(&steps).expect("should be valid"));
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn duplicate_step_is_rejected() {
        let steps = graph(&[("a", &[]), ("a", &[])]);
        assert!(matches!(
            topological_order(&steps),
            Err(DefinitionError::DuplicateStep(name)) if name == "a"
        ));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let steps = graph(&[("a", &["ghost"])]);
        assert!(matches!(
            topological_order(&steps),
            Err(DefinitionError::UnknownDependency { step, dependency }) if step == "a" && dependency == "ghost"
        ));
    }

    #[test]
    fn repeated_dependency_counts_once() {
        let steps = graph(&[("b", &["a", "a"]), ("a", &[])]);
        let order = topological_order(&steps).expect("should be valid");
        assert_eq!(names(&steps, order), vec!["a", "b"]);
    }

    #[test]
    fn cycle_is_reported_as_path() {
        // a depends on c, c on b, b on a; root r hangs off to the side
        let steps = graph(&[("r", &[]), ("a", &["c", "r"]), ("b", &["a"]), ("c", &["b"])]);
        let Err(DefinitionError::CycleDetected { path }) = topological_order(&steps) else {
            panic!("expected a cycle");
        };
        assert_eq!(path.first(), path.last());
        assert_eq!(path.len(), 4);
        for step in ["a", "b", "c"] {
            assert!(path.iter().any(|p| p == step), "{step} missing from {path:?}");
        }
        assert!(!path.iter().any(|p| p == "r"));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let steps = graph(&[("a", &["a"])]);
        assert!(matches!(
            topological_order(&steps),
            Err(DefinitionError::CycleDetected { path }) if path == vec!["a".to_string(), "a".to_string()]
        ));
    }
}
