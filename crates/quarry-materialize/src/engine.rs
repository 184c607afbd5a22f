//! In-memory table engine.
//!
//! Tables are vectors of JSON rows. Visible versions live behind `Arc`s
//! that are replaced wholesale on swap, so a reader holding a snapshot
//! keeps one consistent version no matter what the refresher does.

use async_trait::async_trait;
use quarry_core::materialize::{AggregationDef, MaterializationNode, MeasureOp, TableVersion};
use quarry_core::ports::TableEngine;
use quarry_core::{Error, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

pub type Row = BTreeMap<String, Value>;

/// In-memory [`TableEngine`] for local development and tests.
pub struct MemoryTableEngine {
    raw: RwLock<HashMap<String, Vec<Row>>>,
    definitions: RwLock<HashMap<String, MaterializationNode>>,
    visible: RwLock<HashMap<String, Arc<Vec<Row>>>>,
    side: Mutex<HashMap<String, Vec<Row>>>,
    poisoned: Mutex<HashSet<String>>,
    version_counter: AtomicU64,
}

impl Default for MemoryTableEngine {
    fn default() -> Self {
        Self {
            raw: RwLock::new(HashMap::new()),
            definitions: RwLock::new(HashMap::new()),
            visible: RwLock::new(HashMap::new()),
            side: Mutex::new(HashMap::new()),
            poisoned: Mutex::new(HashSet::new()),
            version_counter: AtomicU64::new(0),
        }
    }
}

impl MemoryTableEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load or replace a raw source table (an upstream change).
    pub async fn load_source(&self, name: impl Into<String>, rows: Vec<Row>) {
        self.raw.write().await.insert(name.into(), rows);
    }

    /// Register node definitions so reconciliation can recompute derived
    /// inputs transitively from raw sources.
    pub async fn register_nodes(&self, nodes: Vec<MaterializationNode>) {
        let mut definitions = self.definitions.write().await;
        for node in nodes {
            definitions.insert(node.name.clone(), node);
        }
    }

    /// Snapshot of a node's visible version. The returned `Arc` stays
    /// internally consistent across concurrent swaps.
    pub async fn snapshot(&self, node_name: &str) -> Option<Arc<Vec<Row>>> {
        self.visible.read().await.get(node_name).cloned()
    }

    /// Make the next builds of a node produce output that cannot pass
    /// reconciliation, until cleared. Test hook for cascade-abort paths.
    pub async fn poison(&self, node_name: impl Into<String>) {
        self.poisoned.lock().await.insert(node_name.into());
    }

    pub async fn clear_poison(&self, node_name: &str) {
        self.poisoned.lock().await.remove(node_name);
    }

    /// Resolve a node input from the current visible state: raw tables as
    /// loaded, derived tables as their visible version.
    async fn input_rows(&self, node: &str, source: &str) -> Result<Vec<Row>> {
        if let Some(rows) = self.visible.read().await.get(source) {
            return Ok(rows.as_ref().clone());
        }
        if let Some(rows) = self.raw.read().await.get(source) {
            return Ok(rows.clone());
        }
        Err(Error::UnknownSource {
            node: node.to_string(),
            source_name: source.to_string(),
        })
    }

    /// Recompute a table from raw sources only, recursing through derived
    /// inputs. This is the independent path validation compares against.
    async fn recompute_from_raw(
        &self,
        node: &MaterializationNode,
        definitions: &HashMap<String, MaterializationNode>,
    ) -> Result<Vec<Row>> {
        let mut inputs = Vec::new();
        for source in &node.sources {
            if let Some(upstream) = definitions.get(source) {
                let rows = Box::pin(self.recompute_from_raw(upstream, definitions)).await?;
                inputs.extend(rows);
            } else if let Some(rows) = self.raw.read().await.get(source) {
                inputs.extend(rows.clone());
            } else {
                return Err(Error::UnknownSource {
                    node: node.name.clone(),
                    source_name: source.clone(),
                });
            }
        }
        Ok(aggregate(&node.aggregation, &inputs))
    }
}

#[async_trait]
impl TableEngine for MemoryTableEngine {
    async fn build_version(&self, node: &MaterializationNode) -> Result<TableVersion> {
        let mut inputs = Vec::new();
        for source in &node.sources {
            inputs.extend(self.input_rows(&node.name, source).await?);
        }
        let mut rows = aggregate(&node.aggregation, &inputs);

        if self.poisoned.lock().await.contains(&node.name) {
            rows.push(Row::from([(
                "__corrupt".to_string(),
                Value::Bool(true),
            )]));
        }

        let version_id = format!(
            "{}__v{}",
            node.name,
            self.version_counter.fetch_add(1, Ordering::Relaxed)
        );
        self.side.lock().await.insert(version_id.clone(), rows);
        Ok(TableVersion {
            node: node.name.clone(),
            version_id,
        })
    }

    async fn version_row_count(&self, version: &TableVersion) -> Result<u64> {
        let side = self.side.lock().await;
        side.get(&version.version_id)
            .map(|rows| rows.len() as u64)
            .ok_or_else(|| Error::Internal(format!("unknown side version {}", version.version_id)))
    }

    async fn version_checksum(&self, version: &TableVersion) -> Result<String> {
        let side = self.side.lock().await;
        side.get(&version.version_id)
            .map(|rows| checksum(rows))
            .ok_or_else(|| Error::Internal(format!("unknown side version {}", version.version_id)))
    }

    async fn reconcile(&self, node: &MaterializationNode) -> Result<(u64, String)> {
        let definitions = self.definitions.read().await.clone();
        let rows = self.recompute_from_raw(node, &definitions).await?;
        Ok((rows.len() as u64, checksum(&rows)))
    }

    async fn swap(&self, version: &TableVersion) -> Result<()> {
        let rows = self
            .side
            .lock()
            .await
            .remove(&version.version_id)
            .ok_or_else(|| {
                Error::Internal(format!("unknown side version {}", version.version_id))
            })?;
        self.visible
            .write()
            .await
            .insert(version.node.clone(), Arc::new(rows));
        Ok(())
    }

    async fn discard(&self, version: &TableVersion) -> Result<()> {
        self.side.lock().await.remove(&version.version_id);
        Ok(())
    }

    async fn visible_row_count(&self, node_name: &str) -> Result<Option<u64>> {
        Ok(self
            .visible
            .read()
            .await
            .get(node_name)
            .map(|rows| rows.len() as u64))
    }
}

/// Apply a deterministic aggregation: group by keys, fold measures.
pub fn aggregate(def: &AggregationDef, rows: &[Row]) -> Vec<Row> {
    let mut groups: BTreeMap<String, (Row, Vec<&Row>)> = BTreeMap::new();

    for row in rows {
        let mut key_row = Row::new();
        for key in &def.group_by {
            key_row.insert(key.clone(), row.get(key).cloned().unwrap_or(Value::Null));
        }
        // Canonical string of the key columns; BTreeMap keeps it stable.
        let group_key = serde_json::to_string(&key_row).unwrap_or_default();
        groups
            .entry(group_key)
            .or_insert_with(|| (key_row, Vec::new()))
            .1
            .push(row);
    }

    groups
        .into_values()
        .map(|(mut out, members)| {
            for measure in &def.measures {
                let value = match measure.op {
                    MeasureOp::Count => numeric(members.len() as f64),
                    MeasureOp::Sum => numeric(fold(&members, &measure.column).iter().sum()),
                    MeasureOp::Min => numeric(
                        fold(&members, &measure.column)
                            .into_iter()
                            .fold(f64::INFINITY, f64::min),
                    ),
                    MeasureOp::Max => numeric(
                        fold(&members, &measure.column)
                            .into_iter()
                            .fold(f64::NEG_INFINITY, f64::max),
                    ),
                    MeasureOp::Avg => {
                        let values = fold(&members, &measure.column);
                        if values.is_empty() {
                            Value::Null
                        } else {
                            numeric(values.iter().sum::<f64>() / values.len() as f64)
                        }
                    }
                };
                out.insert(measure.name.clone(), value);
            }
            out
        })
        .collect()
}

fn fold(members: &[&Row], column: &str) -> Vec<f64> {
    members
        .iter()
        .filter_map(|row| row.get(column).and_then(Value::as_f64))
        .collect()
}

fn numeric(f: f64) -> Value {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Value::from(f as i64)
    } else if f.is_finite() {
        Value::from(f)
    } else {
        Value::Null
    }
}

/// Order-independent content checksum over serialized rows.
pub fn checksum(rows: &[Row]) -> String {
    let mut serialized: Vec<String> = rows
        .iter()
        .map(|row| serde_json::to_string(row).unwrap_or_default())
        .collect();
    serialized.sort_unstable();

    let mut hasher = Sha256::new();
    for row in &serialized {
        hasher.update(row.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::materialize::Measure;
    use serde_json::json;

    fn loan(tract: &str, county: &str, amount: i64) -> Row {
        Row::from([
            ("tract".to_string(), json!(tract)),
            ("county".to_string(), json!(county)),
            ("amount".to_string(), json!(amount)),
        ])
    }

    fn tract_node() -> MaterializationNode {
        MaterializationNode::new(
            "tract_volume",
            vec!["loans".to_string()],
            AggregationDef {
                group_by: vec!["tract".to_string(), "county".to_string()],
                measures: vec![Measure::sum("total_amount", "amount"), Measure::count("loans")],
            },
        )
    }

    #[tokio::test]
    async fn test_aggregate_groups_and_sums() {
        let engine = MemoryTableEngine::new();
        engine
            .load_source(
                "loans",
                vec![
                    loan("t1", "c1", 100),
                    loan("t1", "c1", 50),
                    loan("t2", "c1", 25),
                ],
            )
            .await;

        let version = engine.build_version(&tract_node()).await.unwrap();
        assert_eq!(engine.version_row_count(&version).await.unwrap(), 2);
        engine.swap(&version).await.unwrap();

        let rows = engine.snapshot("tract_volume").await.unwrap();
        let t1 = rows
            .iter()
            .find(|r| r.get("tract") == Some(&json!("t1")))
            .unwrap();
        assert_eq!(t1.get("total_amount"), Some(&json!(150)));
        assert_eq!(t1.get("loans"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_checksum_is_row_order_independent() {
        let a = vec![loan("t1", "c1", 100), loan("t2", "c1", 25)];
        let b = vec![loan("t2", "c1", 25), loan("t1", "c1", 100)];
        assert_eq!(checksum(&a), checksum(&b));
    }

    #[tokio::test]
    async fn test_reconcile_matches_clean_build() {
        let engine = MemoryTableEngine::new();
        engine
            .load_source("loans", vec![loan("t1", "c1", 100), loan("t2", "c2", 40)])
            .await;

        let node = tract_node();
        let version = engine.build_version(&node).await.unwrap();
        let built = (
            engine.version_row_count(&version).await.unwrap(),
            engine.version_checksum(&version).await.unwrap(),
        );
        assert_eq!(engine.reconcile(&node).await.unwrap(), built);
    }

    #[tokio::test]
    async fn test_poisoned_build_fails_reconciliation() {
        let engine = MemoryTableEngine::new();
        engine.load_source("loans", vec![loan("t1", "c1", 100)]).await;
        engine.poison("tract_volume").await;

        let node = tract_node();
        let version = engine.build_version(&node).await.unwrap();
        let (expected_rows, expected_checksum) = engine.reconcile(&node).await.unwrap();
        assert_ne!(
            engine.version_row_count(&version).await.unwrap(),
            expected_rows
        );
        assert_ne!(
            engine.version_checksum(&version).await.unwrap(),
            expected_checksum
        );
    }

    #[tokio::test]
    async fn test_snapshot_survives_swap() {
        let engine = MemoryTableEngine::new();
        engine.load_source("loans", vec![loan("t1", "c1", 100)]).await;
        let node = tract_node();

        let v1 = engine.build_version(&node).await.unwrap();
        engine.swap(&v1).await.unwrap();
        let before = engine.snapshot("tract_volume").await.unwrap();

        engine
            .load_source("loans", vec![loan("t1", "c1", 100), loan("t1", "c1", 900)])
            .await;
        let v2 = engine.build_version(&node).await.unwrap();
        engine.swap(&v2).await.unwrap();

        // The reader's snapshot is still the old version, fully consistent.
        let t1 = before
            .iter()
            .find(|r| r.get("tract") == Some(&json!("t1")))
            .unwrap();
        assert_eq!(t1.get("total_amount"), Some(&json!(100)));

        let after = engine.snapshot("tract_volume").await.unwrap();
        let t1_after = after
            .iter()
            .find(|r| r.get("tract") == Some(&json!("t1")))
            .unwrap();
        assert_eq!(t1_after.get("total_amount"), Some(&json!(1000)));
    }

    #[tokio::test]
    async fn test_discard_leaves_visible_untouched() {
        let engine = MemoryTableEngine::new();
        engine.load_source("loans", vec![loan("t1", "c1", 100)]).await;
        let node = tract_node();

        let v1 = engine.build_version(&node).await.unwrap();
        engine.swap(&v1).await.unwrap();

        let v2 = engine.build_version(&node).await.unwrap();
        engine.discard(&v2).await.unwrap();
        assert_eq!(engine.visible_row_count("tract_volume").await.unwrap(), Some(1));
    }
}
