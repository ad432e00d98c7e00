//! Wave partitioning: Kahn-style topological layering of a convoy DAG.
//!
//! Wave 1 is the dispatchable set at launch. Each later wave becomes
//! dispatchable once every item in the preceding waves has closed. Waves
//! are sorted lexicographically by id for determinism.

use std::collections::BTreeMap;

use thiserror::Error;

use super::dag::ConvoyDag;

#[derive(Debug, Error)]
#[error("cycle detected among: {}", .remaining.join(", "))]
pub struct CycleError {
    /// Ids still carrying positive in-degree after layering exhausted.
    pub remaining: Vec<String>,
}

/// Partition the DAG into waves.
///
/// Every dependency of an item in wave `i` lives in waves `0..i`. An
/// empty DAG yields no waves.
pub fn compute_waves(dag: &ConvoyDag) -> Result<Vec<Vec<String>>, CycleError> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    for node in dag.nodes.values() {
        in_degree.insert(&node.id, node.blocked_by.len());
    }

    let mut waves: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| id.to_string())
        .collect();
    current.sort();

    while !current.is_empty() {
        for id in &current {
            in_degree.remove(id.as_str());
            if let Some(node) = dag.nodes.get(id) {
                for successor in &node.blocks {
                    if let Some(deg) = in_degree.get_mut(successor.as_str()) {
                        *deg = deg.saturating_sub(1);
                    }
                }
            }
        }
        let mut next: Vec<String> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| id.to_string())
            .collect();
        next.sort();
        waves.push(std::mem::replace(&mut current, next));
    }

    if !in_degree.is_empty() {
        let remaining: Vec<String> = in_degree.keys().map(|id| id.to_string()).collect();
        return Err(CycleError { remaining });
    }

    Ok(waves)
}

#[cfg(test)]
mod tests {
    use super::super::dag::Node;
    use super::*;
    use crate::beads::BeadType;

    fn node(id: &str, blocked_by: &[&str], blocks: &[&str]) -> Node {
        Node {
            id: id.to_string(),
            title: id.to_string(),
            bead_type: BeadType::Task,
            rig: Some("gastown".into()),
            blocked_by: blocked_by.iter().map(|s| s.to_string()).collect(),
            blocks: blocks.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn dag(nodes: Vec<Node>) -> ConvoyDag {
        ConvoyDag {
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
        }
    }

    #[test]
    fn test_layering_with_independent_item() {
        // A blocks B; C independent → [[A, C], [B]]
        let dag = dag(vec![
            node("gt-a", &[], &["gt-b"]),
            node("gt-b", &["gt-a"], &[]),
            node("gt-c", &[], &[]),
        ]);
        let waves = compute_waves(&dag).unwrap();
        assert_eq!(waves, vec![vec!["gt-a", "gt-c"], vec!["gt-b"]]);
    }

    #[test]
    fn test_every_edge_crosses_waves_forward() {
        let dag = dag(vec![
            node("gt-a", &[], &["gt-c", "gt-d"]),
            node("gt-b", &[], &["gt-d"]),
            node("gt-c", &["gt-a"], &["gt-e"]),
            node("gt-d", &["gt-a", "gt-b"], &["gt-e"]),
            node("gt-e", &["gt-c", "gt-d"], &[]),
        ]);
        let waves = compute_waves(&dag).unwrap();

        let wave_of = |id: &str| waves.iter().position(|w| w.iter().any(|i| i == id)).unwrap();
        for n in dag.nodes.values() {
            for dep in &n.blocked_by {
                assert!(wave_of(dep) < wave_of(&n.id), "{dep} must precede {}", n.id);
            }
        }
        assert_eq!(waves[0], vec!["gt-a", "gt-b"]);
    }

    #[test]
    fn test_cycle_reports_remaining_ids() {
        let dag = dag(vec![
            node("gt-a", &["gt-b"], &["gt-b"]),
            node("gt-b", &["gt-a"], &["gt-a"]),
            node("gt-c", &[], &[]),
        ]);
        let err = compute_waves(&dag).unwrap_err();
        let mut remaining = err.remaining;
        remaining.sort();
        assert_eq!(remaining, vec!["gt-a", "gt-b"]);
    }

    #[test]
    fn test_self_cycle() {
        let dag = dag(vec![node("gt-a", &["gt-a"], &["gt-a"])]);
        assert!(compute_waves(&dag).is_err());
    }

    #[test]
    fn test_empty_dag_yields_no_waves() {
        assert!(compute_waves(&ConvoyDag::default()).unwrap().is_empty());
    }
}
