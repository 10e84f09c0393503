// src/chain/graph.rs

use std::collections::BTreeMap;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::StageConfig;

/// Order the stages of one chain by their `after` links.
///
/// Edge direction: dep -> stage. For
///
/// ```toml
/// [chain.c.stage.model]
/// after = "prepare"
/// ```
///
/// we add edge `prepare -> model`. The result must be a single path: one
/// root, no stage with two successors, no cycle. Returns stage names from
/// first to last.
pub fn linear_order(stages: &BTreeMap<String, StageConfig>) -> Result<Vec<String>, String> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in stages.keys() {
        graph.add_node(name.as_str());
    }

    for (name, stage) in stages.iter() {
        if let Some(dep) = stage.after.as_deref() {
            if dep == name {
                return Err(format!("stage '{name}' cannot depend on itself in `after`"));
            }
            if !stages.contains_key(dep) {
                return Err(format!(
                    "stage '{name}' has unknown dependency '{dep}' in `after`"
                ));
            }
            graph.add_edge(dep, name.as_str(), ());
        }
    }

    // A topological sort will fail if there is a cycle.
    let order = toposort(&graph, None).map_err(|cycle| {
        format!(
            "cycle detected in stage chain involving stage '{}'",
            cycle.node_id()
        )
    })?;

    let roots: Vec<&str> = graph
        .nodes()
        .filter(|n| graph.neighbors_directed(*n, Direction::Incoming).next().is_none())
        .collect();
    if roots.len() != 1 {
        return Err(format!(
            "stages must form a single chain; found {} stages without `after`: {:?}",
            roots.len(),
            roots
        ));
    }

    for node in graph.nodes() {
        let successors: Vec<&str> = graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        if successors.len() > 1 {
            return Err(format!(
                "stage '{node}' is the `after` of several stages {:?}; chains are linear",
                successors
            ));
        }
    }

    Ok(order.into_iter().map(str::to_string).collect())
}
