use crate::domain::lineage::{RawDataOrigin, canonical_params, raw_table_name, validate_table_name};
use crate::storage::traits::RecordFilter;
use crate::{Error, Result};
use serde_json::Value;

/// Where a subtask stages (or reads) payloads: one raw table plus the scope
/// params that fingerprint every row it owns.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDataArgs {
    table: String,
    params: Value,
    params_string: String,
}

impl RawDataArgs {
    /// `suffix` is appended to `_raw_<plugin>`, e.g. `_api_issues`.
    pub fn new(plugin: &str, suffix: &str, params: Value) -> Result<Self> {
        let table = raw_table_name(plugin, suffix);
        validate_table_name(&table)?;
        let empty = match &params {
            Value::Null => true,
            Value::Object(m) => m.is_empty(),
            _ => false,
        };
        if empty {
            return Err(Error::InvalidInput(format!("raw data params for {table} are empty")));
        }
        let params_string = canonical_params(&params);
        Ok(Self {
            table,
            params,
            params_string,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Canonical fingerprint of the params.
    pub fn params_string(&self) -> &str {
        &self.params_string
    }

    pub fn origin(&self, raw_id: u64) -> RawDataOrigin {
        RawDataOrigin::new(&self.table, &self.params_string, raw_id)
    }

    /// Records produced from this raw table for these params.
    pub fn filter(&self) -> RecordFilter {
        RecordFilter::by_origin(&self.table, &self.params_string)
    }
}
