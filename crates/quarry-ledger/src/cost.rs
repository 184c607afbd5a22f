//! Cost attribution.

use quarry_core::usage::CostBreakdown;
use serde::{Deserialize, Serialize};

/// Externally configured unit costs.
///
/// The ledger records cost, it does not measure it: the computing path
/// reports how many warehouse queries and generative calls it issued, and
/// those counts are priced here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostModel {
    /// Cost per warehouse query issued.
    pub warehouse_query_cost: f64,
    /// Cost per generative-model call issued.
    pub generative_call_cost: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            warehouse_query_cost: 0.05,
            generative_call_cost: 0.02,
        }
    }
}

impl CostModel {
    pub fn attribute(&self, warehouse_queries: u32, generative_calls: u32) -> CostBreakdown {
        CostBreakdown::new(
            self.warehouse_query_cost * warehouse_queries as f64,
            self.generative_call_cost * generative_calls as f64,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribution_multiplies_unit_costs() {
        let model = CostModel {
            warehouse_query_cost: 0.10,
            generative_call_cost: 0.25,
        };
        let cost = model.attribute(4, 2);
        assert_eq!(cost.warehouse_cost, 0.40);
        assert_eq!(cost.generative_cost, 0.50);
        assert_eq!(cost.total, 0.90);
    }

    #[test]
    fn test_hit_attributes_zero() {
        let cost = CostModel::default().attribute(0, 0);
        assert_eq!(cost.total, 0.0);
    }
}
