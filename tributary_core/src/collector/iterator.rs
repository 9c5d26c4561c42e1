use crate::Result;
use crate::storage::cursor::{RawCursor, RecordCursor};
use crate::storage::traits::{RawRecord, Record};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;

/// Source of per-request inputs, e.g. parent ids to fetch children for.
///
/// Implementations must release any held cursor in `close`, which the
/// collector calls on every exit path.
#[async_trait]
pub trait InputIterator: Send + Sync {
    async fn next(&mut self) -> Result<Option<Value>>;

    fn close(&mut self) {}
}

/// Inputs known up front.
pub struct VecInput {
    items: VecDeque<Value>,
}

impl VecInput {
    pub fn new(items: impl IntoIterator<Item = Value>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }
}

#[async_trait]
impl InputIterator for VecInput {
    async fn next(&mut self) -> Result<Option<Value>> {
        Ok(self.items.pop_front())
    }

    fn close(&mut self) {
        self.items.clear();
    }
}

type RecordMap = Box<dyn Fn(&Record) -> Option<Value> + Send + Sync>;
type RawMap = Box<dyn Fn(&RawRecord) -> Option<Value> + Send + Sync>;

/// Inputs drawn from a tool table; rows mapped to `None` are skipped.
pub struct RecordInput {
    cursor: RecordCursor,
    map: RecordMap,
}

impl RecordInput {
    pub fn new(cursor: RecordCursor, map: impl Fn(&Record) -> Option<Value> + Send + Sync + 'static) -> Self {
        Self {
            cursor,
            map: Box::new(map),
        }
    }
}

#[async_trait]
impl InputIterator for RecordInput {
    async fn next(&mut self) -> Result<Option<Value>> {
        while let Some(rec) = self.cursor.next().await? {
            if let Some(v) = (self.map)(&rec) {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        self.cursor.close();
    }
}

/// Inputs drawn from another raw table.
pub struct RawInput {
    cursor: RawCursor,
    map: RawMap,
}

impl RawInput {
    pub fn new(cursor: RawCursor, map: impl Fn(&RawRecord) -> Option<Value> + Send + Sync + 'static) -> Self {
        Self {
            cursor,
            map: Box::new(map),
        }
    }
}

#[async_trait]
impl InputIterator for RawInput {
    async fn next(&mut self) -> Result<Option<Value>> {
        while let Some(raw) = self.cursor.next().await? {
            if let Some(v) = (self.map)(&raw) {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        self.cursor.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lineage::RawDataOrigin;
    use crate::storage::memory::MemoryStore;
    use crate::storage::traits::{RecordFilter, RecordStore};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn record_input_skips_unmapped_rows() {
        let store = MemoryStore::new();
        store.ensure_record_table("_tool_x_runs").await.unwrap();
        let recs: Vec<Record> = (1..=4)
            .map(|i| Record {
                key: format!("{i}"),
                data: json!({"id": i, "status": if i % 2 == 0 { "completed" } else { "queued" }}),
                origin: RawDataOrigin::new("_raw_x_runs", "p", i),
            })
            .collect();
        store.upsert_records("_tool_x_runs", &recs).await.unwrap();

        let cursor = RecordCursor::new(Arc::new(store), "_tool_x_runs", RecordFilter::default());
        let mut input = RecordInput::new(cursor, |r| {
            (r.data["status"] != "completed").then(|| json!({"id": r.data["id"]}))
        });
        let mut ids = Vec::new();
        while let Some(v) = input.next().await.unwrap() {
            ids.push(v["id"].as_u64().unwrap());
        }
        assert_eq!(ids, vec![1, 3]);
    }
}
