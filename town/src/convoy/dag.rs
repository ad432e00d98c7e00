//! Collection: resolve a user-supplied mix of convoys, epics, and tasks
//! into a dependency DAG over work items.
//!
//! Convoys expand to their tracked set plus the full transitive
//! dependency closure. Epics expand to their children. Tasks stand for
//! themselves. Edges are the `blocked_by` relations among the collected
//! set; closed dependencies are dropped, and open dependencies outside
//! the set are a hard error.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use thiserror::Error;

use crate::beads::{Bead, BeadFilter, BeadStore, BeadType, StoreError};
use crate::config::TownConfig;

#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub title: String,
    pub bead_type: BeadType,
    /// Resolved via the prefix routing table; `None` when no rig claims
    /// the id's prefix.
    pub rig: Option<String>,
    pub blocked_by: Vec<String>,
    pub blocks: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConvoyDag {
    pub nodes: BTreeMap<String, Node>,
}

impl ConvoyDag {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }
}

/// Collection output: the DAG plus non-fatal observations for staging.
#[derive(Debug, Default)]
pub struct DagReport {
    pub dag: ConvoyDag,
    pub warnings: Vec<String>,
    /// Node ids whose prefix no configured rig claims.
    pub unresolved_rigs: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("open external dependencies: {}", format_deps(.0))]
    OpenExternalDeps(Vec<(String, String)>),
    #[error("input not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn format_deps(deps: &[(String, String)]) -> String {
    deps.iter()
        .map(|(node, dep)| format!("{node} → {dep}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Collect the work-item set and edges for `inputs`.
pub fn collect(
    store: &dyn BeadStore,
    config: &TownConfig,
    inputs: &[String],
) -> Result<DagReport, CollectError> {
    let mut warnings: Vec<String> = Vec::new();
    let mut seeds: Vec<Bead> = Vec::new();
    let mut transitive = false;

    for input in inputs {
        let bead = match store.show(input) {
            Ok(b) => b,
            Err(StoreError::NotFound(_)) => return Err(CollectError::NotFound(input.clone())),
            Err(e) => return Err(e.into()),
        };
        match bead.bead_type {
            BeadType::Convoy => {
                // Tracked set: `tracks:` labels union parent links.
                let mut ids: BTreeSet<String> = bead.tracked_ids().into_iter().collect();
                for child in store.list(&BeadFilter {
                    parent: Some(bead.id.clone()),
                    ..Default::default()
                })? {
                    ids.insert(child.id);
                }
                for id in ids {
                    match store.show(&id) {
                        Ok(b) => seeds.push(b),
                        Err(StoreError::NotFound(_)) => {
                            warnings.push(format!("{} tracks missing bead {id}; ignored", bead.id));
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                transitive = true;
            }
            BeadType::Epic => {
                for child in store.list(&BeadFilter {
                    parent: Some(bead.id.clone()),
                    ..Default::default()
                })? {
                    seeds.push(child);
                }
            }
            BeadType::Task | BeadType::Agent => seeds.push(bead),
        }
    }

    let mut set: BTreeMap<String, Bead> = BTreeMap::new();
    let mut queue: VecDeque<Bead> = VecDeque::new();

    for seed in seeds {
        if seed.is_closed() {
            warnings.push(format!("{} is already closed; excluded from the plan", seed.id));
            continue;
        }
        queue.push_back(seed);
    }

    // For convoys, chase the dependency closure; open deps join the set,
    // closed deps are dropped.
    while let Some(bead) = queue.pop_front() {
        if set.contains_key(&bead.id) {
            continue;
        }
        if transitive {
            for dep in &bead.blocked_by {
                if set.contains_key(dep) {
                    continue;
                }
                match store.show(dep) {
                    Ok(d) if d.is_closed() => {}
                    Ok(d) => queue.push_back(d),
                    Err(StoreError::NotFound(_)) => {
                        warnings.push(format!("dependency {dep} of {} not found; ignored", bead.id));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        set.insert(bead.id.clone(), bead);
    }

    let mut report = DagReport { warnings, ..Default::default() };

    // Build edges among the set; classify external deps.
    let mut open_external: Vec<(String, String)> = Vec::new();
    for bead in set.values() {
        let mut internal = Vec::new();
        for dep in &bead.blocked_by {
            if set.contains_key(dep) {
                internal.push(dep.clone());
                continue;
            }
            match store.show(dep) {
                Ok(d) if d.is_closed() => {}
                Ok(_) => open_external.push((bead.id.clone(), dep.clone())),
                Err(StoreError::NotFound(_)) => {
                    report
                        .warnings
                        .push(format!("dependency {dep} of {} not found; ignored", bead.id));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let rig = config.rig_for_bead(&bead.id).map(String::from);
        if rig.is_none() {
            report.unresolved_rigs.push(bead.id.clone());
        }
        report.dag.nodes.insert(
            bead.id.clone(),
            Node {
                id: bead.id.clone(),
                title: bead.title.clone(),
                bead_type: bead.bead_type,
                rig,
                blocked_by: internal,
                blocks: Vec::new(),
            },
        );
    }

    if !open_external.is_empty() {
        open_external.sort();
        return Err(CollectError::OpenExternalDeps(open_external));
    }

    // Fill in the reverse edges.
    let edges: Vec<(String, String)> = report
        .dag
        .nodes
        .values()
        .flat_map(|n| n.blocked_by.iter().map(|d| (d.clone(), n.id.clone())))
        .collect();
    for (dep, dependent) in edges {
        if let Some(node) = report.dag.nodes.get_mut(&dep) {
            node.blocks.push(dependent);
        }
    }

    Ok(report)
}
