use crate::domain::lineage::{RawDataOrigin, validate_table_name};
use crate::storage::traits::{Record, RecordFilter, RecordStore};
use crate::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

pub const DEFAULT_BATCH_SIZE: usize = 500;

/// One row emitted by an extractor, converter or enricher.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRow {
    pub table: String,
    pub key: String,
    pub data: Value,
}

impl OutputRow {
    pub fn new(table: impl Into<String>, key: impl Into<String>, data: impl Serialize) -> Result<Self> {
        let data = serde_json::to_value(data).map_err(|e| Error::backend("encode output row", e))?;
        Ok(Self {
            table: table.into(),
            key: key.into(),
            data,
        })
    }
}

/// Buffers rows per table and upserts them in batches.
///
/// The first row for a table clears that table's rows matching `filter`, so
/// rows that disappeared upstream do not survive a re-run.
pub struct BatchSaver {
    store: Arc<dyn RecordStore>,
    filter: Option<RecordFilter>,
    batch_size: usize,
    cleared: HashSet<String>,
    buffers: BTreeMap<String, Vec<Record>>,
    written: u64,
}

impl BatchSaver {
    pub fn new(store: Arc<dyn RecordStore>, filter: Option<RecordFilter>, batch_size: usize) -> Self {
        Self {
            store,
            filter,
            batch_size: batch_size.max(1),
            cleared: HashSet::new(),
            buffers: BTreeMap::new(),
            written: 0,
        }
    }

    /// Prepare `table` up front so it is cleared even when no row is emitted for it.
    pub async fn prepare(&mut self, table: &str) -> Result<()> {
        if self.cleared.contains(table) {
            return Ok(());
        }
        validate_table_name(table)?;
        self.store.ensure_record_table(table).await?;
        if let Some(f) = &self.filter {
            let deleted = self.store.delete_records(table, f).await?;
            tracing::debug!(table, deleted, "cleared previous rows");
        }
        self.cleared.insert(table.to_string());
        Ok(())
    }

    pub async fn add(&mut self, row: OutputRow, origin: RawDataOrigin) -> Result<()> {
        self.prepare(&row.table).await?;
        let full = {
            let buf = self.buffers.entry(row.table.clone()).or_default();
            buf.push(Record {
                key: row.key,
                data: row.data,
                origin,
            });
            buf.len() >= self.batch_size
        };
        if full {
            self.flush_table(&row.table).await?;
        }
        Ok(())
    }

    async fn flush_table(&mut self, table: &str) -> Result<()> {
        let Some(buf) = self.buffers.get_mut(table) else {
            return Ok(());
        };
        if buf.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(buf);
        self.written += self.store.upsert_records(table, &batch).await?;
        Ok(())
    }

    /// Flush every buffer; returns the number of rows written overall.
    pub async fn close(mut self) -> Result<u64> {
        let tables: Vec<String> = self.buffers.keys().cloned().collect();
        for t in tables {
            self.flush_table(&t).await?;
        }
        Ok(self.written)
    }
}
