//! Per-vertex turn-cost tables.

use crate::error::{GraphError, Result};
use crate::model::EdgeId;

/// An N x N cost matrix over the ordered incident edges of one vertex.
///
/// Row = edge arrived by, column = edge departed by. `costs` is row-major
/// with `edges.len() * edges.len()` entries.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnCostTable {
    pub turn_cost_type: u32,
    pub edges: Vec<EdgeId>,
    pub costs: Vec<u32>,
}

impl TurnCostTable {
    pub fn new(turn_cost_type: u32, edges: Vec<EdgeId>, costs: Vec<u32>) -> Result<Self> {
        if costs.len() != edges.len() * edges.len() {
            return Err(GraphError::InvalidArgument(format!(
                "turn-cost table needs {} entries for {} edges, got {}",
                edges.len() * edges.len(),
                edges.len(),
                costs.len()
            )));
        }
        Ok(Self {
            turn_cost_type,
            edges,
            costs,
        })
    }

    /// Cost of turning from `from` onto `to`, when both participate in this
    /// table.
    pub fn cost_between(&self, from: EdgeId, to: EdgeId) -> Option<u32> {
        let row = self.edges.iter().position(|&e| e == from)?;
        let column = self.edges.iter().position(|&e| e == to)?;
        Some(self.costs[row * self.edges.len() + column])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_matrix() {
        let edges = vec![EdgeId::new(0, 0), EdgeId::new(0, 1)];
        assert!(TurnCostTable::new(0, edges, vec![1, 2, 3]).is_err());
    }

    #[test]
    fn looks_up_row_major() {
        let a = EdgeId::new(0, 0);
        let b = EdgeId::new(0, 1);
        let table = TurnCostTable::new(0, vec![a, b], vec![0, 10, 20, 0]).expect("table");
        assert_eq!(table.cost_between(a, b), Some(10));
        assert_eq!(table.cost_between(b, a), Some(20));
        assert_eq!(table.cost_between(a, a), Some(0));
        assert_eq!(table.cost_between(a, EdgeId::new(0, 9)), None);
    }
}
