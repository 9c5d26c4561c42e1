//! Table naming and back-references from tool/domain rows to the raw rows
//! that produced them.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RAW_TABLE_PREFIX: &str = "_raw_";
pub const TOOL_TABLE_PREFIX: &str = "_tool_";
/// Engine bookkeeping tables. Never targeted by scope purges.
pub const META_TABLE_PREFIX: &str = "_tributary_";

/// Back-reference carried by every extracted or converted row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDataOrigin {
    #[serde(rename = "_raw_data_table")]
    pub raw_data_table: String,
    #[serde(rename = "_raw_data_params")]
    pub raw_data_params: String,
    #[serde(rename = "_raw_data_id")]
    pub raw_data_id: u64,
    #[serde(rename = "_raw_data_remark", default)]
    pub raw_data_remark: String,
}

impl RawDataOrigin {
    pub fn new(table: impl Into<String>, params: impl Into<String>, id: u64) -> Self {
        Self {
            raw_data_table: table.into(),
            raw_data_params: params.into(),
            raw_data_id: id,
            raw_data_remark: String::new(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TableKind {
    Raw,
    Tool,
    Domain,
    Meta,
}

pub fn table_kind(name: &str) -> TableKind {
    if name.starts_with(RAW_TABLE_PREFIX) {
        TableKind::Raw
    } else if name.starts_with(TOOL_TABLE_PREFIX) {
        TableKind::Tool
    } else if name.starts_with(META_TABLE_PREFIX) {
        TableKind::Meta
    } else {
        TableKind::Domain
    }
}

/// `_raw_<plugin><suffix>`, e.g. `raw_table_name("github", "_api_issues")`.
pub fn raw_table_name(plugin: &str, suffix: &str) -> String {
    format!("{RAW_TABLE_PREFIX}{plugin}{suffix}")
}

/// `_tool_<plugin><suffix>`.
pub fn tool_table_name(plugin: &str, suffix: &str) -> String {
    format!("{TOOL_TABLE_PREFIX}{plugin}{suffix}")
}

/// Prefix shared by every raw table a plugin writes.
pub fn raw_table_prefix(plugin: &str) -> String {
    format!("{RAW_TABLE_PREFIX}{plugin}")
}

/// Table names are interpolated into SQL, so only `[A-Za-z0-9_]` is accepted.
pub fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(Error::InvalidInput(format!("invalid table name: {name:?}")));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::InvalidInput(format!("invalid table name: {name:?}")));
    }
    Ok(())
}

/// Canonical compact JSON with sorted object keys, used as the scope fingerprint.
pub fn canonical_params(params: &Value) -> String {
    let mut out = String::new();
    write_canonical(params, &mut out);
    out
}

fn write_canonical(v: &Value, out: &mut String) {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*k).clone()).to_string());
                out.push(':');
                write_canonical(&map[k.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_params_sorts_keys() {
        let a = json!({"Name": "octo/repo", "ConnectionId": 1});
        let b = json!({"ConnectionId": 1, "Name": "octo/repo"});
        assert_eq!(canonical_params(&a), canonical_params(&b));
        assert_eq!(canonical_params(&a), r#"{"ConnectionId":1,"Name":"octo/repo"}"#);
    }

    #[test]
    fn table_kinds_follow_prefixes() {
        assert_eq!(table_kind(&raw_table_name("github", "_api_issues")), TableKind::Raw);
        assert_eq!(table_kind(&tool_table_name("github", "_issues")), TableKind::Tool);
        assert_eq!(table_kind("issues"), TableKind::Domain);
        assert_eq!(table_kind("_tributary_tasks"), TableKind::Meta);
    }

    #[test]
    fn table_names_are_restricted() {
        assert!(validate_table_name("_raw_github_api_issues").is_ok());
        assert!(validate_table_name("issues; DROP TABLE x").is_err());
        assert!(validate_table_name("").is_err());
    }

    #[test]
    fn origin_serializes_with_underscored_names() {
        let o = RawDataOrigin::new("_raw_github_api_issues", "{}", 7);
        let v = serde_json::to_value(&o).unwrap();
        assert_eq!(v["_raw_data_id"], 7);
        assert_eq!(v["_raw_data_table"], "_raw_github_api_issues");
    }
}
