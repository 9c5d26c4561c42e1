use crate::collector::raw::RawDataArgs;
use crate::domain::lineage::validate_table_name;
use crate::storage::cursor::RecordCursor;
use crate::storage::traits::Record;
use crate::subtask::batch::{BatchSaver, DEFAULT_BATCH_SIZE, OutputRow};
use crate::subtask::context::SubTaskContext;
use crate::{Error, Result};

pub type ConvertFn = Box<dyn Fn(&Record) -> Result<Vec<OutputRow>> + Send + Sync>;

/// Maps tool-layer rows of one scope into domain rows.
///
/// Domain rows are upserted by their generated id and inherit the lineage of
/// the tool row they came from, so converting twice yields the same rows.
pub struct DataConverter {
    raw: RawDataArgs,
    input_table: String,
    convert: ConvertFn,
    tables: Vec<String>,
    batch_size: usize,
}

impl DataConverter {
    pub fn new(raw: RawDataArgs, input_table: impl Into<String>, convert: ConvertFn) -> Result<Self> {
        let input_table = input_table.into();
        validate_table_name(&input_table)?;
        Ok(Self {
            raw,
            input_table,
            convert,
            tables: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    pub fn tables(mut self, tables: &[&str]) -> Self {
        self.tables = tables.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[tracing::instrument(level = "debug", skip_all, fields(input = %self.input_table))]
    pub async fn execute(self, ctx: &SubTaskContext) -> Result<u64> {
        let store = ctx.records().clone();
        let filter = self.raw.filter();
        store.ensure_record_table(&self.input_table).await?;
        let total = store.count_records(&self.input_table, &filter).await?;
        ctx.set_progress(0, Some(total)).await;

        let mut saver = BatchSaver::new(store.clone(), Some(filter.clone()), self.batch_size);
        for t in &self.tables {
            saver.prepare(t).await?;
        }
        let mut cursor = RecordCursor::new(store, &self.input_table, filter).with_batch_size(self.batch_size);

        let res = async {
            while let Some(rec) = cursor.next().await? {
                ctx.check_cancelled()?;
                let rows = (self.convert)(&rec).map_err(|e| e.context(format!("convert {}", rec.key)))?;
                for row in rows {
                    saver.add(row, rec.origin.clone()).await?;
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
        tracing::info!(rows = written, "conversion finished");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lineage::RawDataOrigin;
    use crate::storage::traits::{RecordFilter, RecordStore};
    use crate::test_support;
    use serde_json::json;

    #[tokio::test]
    async fn converting_twice_is_idempotent() {
        let (ctx, store) = test_support::subtask_ctx(json!({})).await;
        let raw = RawDataArgs::new("fixture", "_api_items", json!({"ConnectionId": 1, "Name": "a"})).unwrap();
        store.ensure_record_table("_tool_fixture_items").await.unwrap();
        let tool_rows: Vec<Record> = (1..=3)
            .map(|i| Record {
                key: format!("1:{i}"),
                data: json!({"id": i, "state": "open"}),
                origin: raw.origin(i),
            })
            .collect();
        store.upsert_records("_tool_fixture_items", &tool_rows).await.unwrap();
        // another scope's row must be left alone
        store
            .upsert_records(
                "_tool_fixture_items",
                &[Record {
                    key: "2:1".into(),
                    data: json!({"id": 1, "state": "open"}),
                    origin: RawDataOrigin::new(raw.table(), "{\"other\":1}", 9),
                }],
            )
            .await
            .unwrap();

        let run = || {
            DataConverter::new(
                raw.clone(),
                "_tool_fixture_items",
                Box::new(|r: &Record| {
                    let id = r.data["id"].as_u64().unwrap_or_default();
                    Ok(vec![OutputRow::new(
                        "issues",
                        format!("fixture:Item:1:{id}"),
                        json!({"status": r.data["state"]}),
                    )?])
                }),
            )
            .unwrap()
        };
        assert_eq!(run().execute(&ctx).await.unwrap(), 3);
        let first = store
            .fetch_records("issues", &RecordFilter::default(), None, 100)
            .await
            .unwrap();
        assert_eq!(run().execute(&ctx).await.unwrap(), 3);
        let second = store
            .fetch_records("issues", &RecordFilter::default(), None, 100)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.len(), 3);
        assert_eq!(second[0].origin.raw_data_params, raw.params_string());
    }
}
