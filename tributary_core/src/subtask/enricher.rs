use crate::domain::lineage::validate_table_name;
use crate::storage::cursor::RecordCursor;
use crate::storage::traits::{Record, RecordFilter};
use crate::subtask::context::SubTaskContext;
use crate::subtask::batch::DEFAULT_BATCH_SIZE;
use crate::{Error, Result};
use serde_json::Value;

/// Returns the new payload for a row, or `None` to leave it unchanged.
pub type EnrichFn = Box<dyn Fn(&Record) -> Result<Option<Value>> + Send + Sync>;

/// Rewrites rows of one table in place, e.g. to derive fields from others.
pub struct DataEnricher {
    table: String,
    filter: RecordFilter,
    enrich: EnrichFn,
    batch_size: usize,
}

impl DataEnricher {
    pub fn new(table: impl Into<String>, filter: RecordFilter, enrich: EnrichFn) -> Result<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self {
            table,
            filter,
            enrich,
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    #[tracing::instrument(level = "debug", skip_all, fields(table = %self.table))]
    pub async fn execute(self, ctx: &SubTaskContext) -> Result<u64> {
        let store = ctx.records().clone();
        store.ensure_record_table(&self.table).await?;
        let total = store.count_records(&self.table, &self.filter).await?;
        ctx.set_progress(0, Some(total)).await;

        let mut cursor =
            RecordCursor::new(store.clone(), &self.table, self.filter.clone()).with_batch_size(self.batch_size);
        let mut pending: Vec<Record> = Vec::new();
        let mut updated = 0u64;

        let res = async {
            while let Some(mut rec) = cursor.next().await? {
                ctx.check_cancelled()?;
                if let Some(data) = (self.enrich)(&rec).map_err(|e| e.context(format!("enrich {}", rec.key)))? {
                    if data != rec.data {
                        rec.data = data;
                        pending.push(rec);
                    }
                }
                if pending.len() >= self.batch_size {
                    updated += store.upsert_records(&self.table, &std::mem::take(&mut pending)).await?;
                }
                ctx.inc_progress(1).await;
            }
            if !pending.is_empty() {
                updated += store.upsert_records(&self.table, &pending).await?;
            }
            Ok::<(), Error>(())
        }
        .await;
        cursor.close();
        res?;

        ctx.flush_progress().await;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lineage::RawDataOrigin;
    use crate::storage::traits::RecordStore;
    use crate::test_support;
    use serde_json::json;

    #[tokio::test]
    async fn only_changed_rows_are_written() {
        let (ctx, store) = test_support::subtask_ctx(json!({})).await;
        store.ensure_record_table("issues").await.unwrap();
        let origin = RawDataOrigin::new("_raw_fixture_items", "p", 1);
        store
            .upsert_records(
                "issues",
                &[
                    Record {
                        key: "a".into(),
                        data: json!({"priority": "P1"}),
                        origin: origin.clone(),
                    },
                    Record {
                        key: "b".into(),
                        data: json!({"priority": "low", "severity": "LOW"}),
                        origin: origin.clone(),
                    },
                ],
            )
            .await
            .unwrap();

        let enricher = DataEnricher::new(
            "issues",
            RecordFilter::default(),
            Box::new(|r: &Record| {
                let severity = match r.data["priority"].as_str() {
                    Some("P1") => "HIGH",
                    _ => "LOW",
                };
                let mut data = r.data.clone();
                data["severity"] = json!(severity);
                Ok(Some(data))
            }),
        )
        .unwrap();
        assert_eq!(enricher.execute(&ctx).await.unwrap(), 1);
        let a = store.get_record("issues", "a").await.unwrap().unwrap();
        assert_eq!(a.data["severity"], "HIGH");
    }
}
