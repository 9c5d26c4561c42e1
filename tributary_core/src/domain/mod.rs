//! Domain layer: deterministic ids, lineage back-references, domain tables
//! and state classification.

pub mod ids;
pub mod lineage;
pub mod models;
pub mod status;

pub use ids::DomainIdGenerator;
pub use lineage::{RawDataOrigin, canonical_params, raw_table_name, tool_table_name};
pub use status::{CicdResult, CicdStatus, ResultRule, StatusRule, classify_result, classify_status};
