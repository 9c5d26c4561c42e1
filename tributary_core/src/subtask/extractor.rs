use crate::collector::raw::RawDataArgs;
use crate::storage::cursor::RawCursor;
use crate::storage::traits::RawRecord;
use crate::subtask::batch::{BatchSaver, DEFAULT_BATCH_SIZE, OutputRow};
use crate::subtask::context::SubTaskContext;
use crate::{Error, Result};

pub type ExtractFn = Box<dyn Fn(&RawRecord) -> Result<Vec<OutputRow>> + Send + Sync>;

/// Parses staged payloads of one scope into tool-layer rows.
///
/// Output rows carry the raw row's origin; previous rows of the same origin
/// are replaced.
pub struct ApiExtractor {
    raw: RawDataArgs,
    extract: ExtractFn,
    tables: Vec<String>,
    batch_size: usize,
}

impl ApiExtractor {
    pub fn new(raw: RawDataArgs, extract: ExtractFn) -> Self {
        Self {
            raw,
            extract,
            tables: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Tables cleared for this scope even if no row ends up in them.
    pub fn tables(mut self, tables: &[&str]) -> Self {
        self.tables = tables.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[tracing::instrument(level = "debug", skip_all, fields(table = %self.raw.table()))]
    pub async fn execute(self, ctx: &SubTaskContext) -> Result<u64> {
        let store = ctx.records().clone();
        store.ensure_raw_table(self.raw.table()).await?;
        let total = store.count_raw(self.raw.table(), self.raw.params_string()).await?;
        ctx.set_progress(0, Some(total)).await;

        let mut saver = BatchSaver::new(store.clone(), Some(self.raw.filter()), self.batch_size);
        for t in &self.tables {
            saver.prepare(t).await?;
        }
        let mut cursor = RawCursor::new(store, self.raw.table(), self.raw.params_string())
            .with_batch_size(self.batch_size);

        let res = async {
            while let Some(raw) = cursor.next().await? {
                ctx.check_cancelled()?;
                let rows = (self.extract)(&raw)
                    .map_err(|e| e.context(format!("extract raw row {}", raw.id)))?;
                for row in rows {
                    saver.add(row, self.raw.origin(raw.id)).await?;
                }
                ctx.inc_progress(1).await;
            }
            Ok::<(), Error>(())
        }
        .await;
        cursor.close();
        res?;

        let written = saver.close().await?;
        ctx.flush_progress().await;
        tracing::info!(rows = written, "extraction finished");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::traits::{NewRawRecord, RecordFilter, RecordStore};
    use crate::test_support;
    use serde_json::json;

    #[tokio::test]
    async fn extracts_rows_with_lineage() {
        let (ctx, store) = test_support::subtask_ctx(json!({})).await;
        let raw = RawDataArgs::new("fixture", "_api_items", json!({"ConnectionId": 1, "Name": "a"})).unwrap();
        store.ensure_raw_table(raw.table()).await.unwrap();
        let rows: Vec<NewRawRecord> = (1..=3)
            .map(|i| NewRawRecord {
                data: json!({"id": i, "title": format!("t{i}")}),
                url: "u".into(),
                input: None,
            })
            .collect();
        store.insert_raw(raw.table(), raw.params_string(), &rows).await.unwrap();

        let extractor = ApiExtractor::new(
            raw.clone(),
            Box::new(|r: &RawRecord| {
                let id = r.data["id"].as_u64().unwrap_or_default();
                Ok(vec![OutputRow::new("_tool_fixture_items", format!("1:{id}"), &r.data)?])
            }),
        );
        assert_eq!(extractor.execute(&ctx).await.unwrap(), 3);

        let rec = store.get_record("_tool_fixture_items", "1:2").await.unwrap().unwrap();
        assert_eq!(rec.origin.raw_data_table, raw.table());
        assert_eq!(rec.origin.raw_data_params, raw.params_string());
        assert_eq!(
            store
                .count_records("_tool_fixture_items", &RecordFilter::default())
                .await
                .unwrap(),
            3
        );
    }
}
