use std::collections::HashMap;

use council_core::graph::{GraphDecl, PositionedNode};

/// A pure positioning function for declarative graphs.
///
/// The projection treats implementations as black boxes; the only
/// requirement is determinism for a given input.
pub trait LayoutEngine: Send + Sync {
    fn layout(&self, graph: &GraphDecl) -> Vec<PositionedNode>;
}

/// Deterministic layered placement.
///
/// Each node's column is its longest-path depth from the graph's roots;
/// nodes stack within a column in declaration order. Cycles are tolerated:
/// rank relaxation is bounded by the node count.
pub struct LayeredLayout {
    pub column_gap: f64,
    pub row_gap: f64,
}

impl Default for LayeredLayout {
    fn default() -> Self {
        Self {
            column_gap: 220.0,
            row_gap: 120.0,
        }
    }
}

impl LayoutEngine for LayeredLayout {
    fn layout(&self, graph: &GraphDecl) -> Vec<PositionedNode> {
        let mut rank: HashMap<&str, usize> = graph
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), 0usize))
            .collect();

        for _ in 0..graph.nodes.len() {
            let mut changed = false;
            for edge in &graph.edges {
                let from_rank = match rank.get(edge.from.as_str()) {
                    Some(r) => *r,
                    None => continue,
                };
                match rank.get_mut(edge.to.as_str()) {
                    Some(to_rank) if *to_rank < from_rank + 1 => {
                        *to_rank = from_rank + 1;
                        changed = true;
                    }
                    _ => {}
                }
            }
            if !changed {
                break;
            }
        }

        let mut rows: HashMap<usize, usize> = HashMap::new();
        graph
            .nodes
            .iter()
            .map(|n| {
                let column = rank[n.id.as_str()];
                let row = rows.entry(column).or_insert(0);
                let position = PositionedNode {
                    id: n.id.clone(),
                    name: n.name.clone(),
                    node_type: n.node_type,
                    x: column as f64 * self.column_gap,
                    y: *row as f64 * self.row_gap,
                };
                *row += 1;
                position
            })
            .collect()
    }
}
