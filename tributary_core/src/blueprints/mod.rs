//! Blueprints: reusable pipeline definitions, manual or cron-scheduled.

pub mod models;
pub mod schedule;
pub mod service;

pub use models::{
    Blueprint, BlueprintConnection, BlueprintList, BlueprintMode, BlueprintPatch, BlueprintQuery, BlueprintScope,
    MANUAL_CRON, NewBlueprint,
};
pub use schedule::{BlueprintScheduler, CronExpr};
pub use service::BlueprintService;
