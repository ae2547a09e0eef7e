//! Handlers for the non-sync job kinds.
//!
//! - **analysis**: AI analysis delegate の呼び出しと通知
//! - **maintenance**: 終了済み job の削除と stuck job の救出
//!
//! Sync の handler は [`crate::sync::SyncOrchestrator`] にあります。

pub mod analysis;
pub mod maintenance;

pub use analysis::{AnalysisHandler, HttpAnalysisService};
pub use maintenance::{MaintenanceHandler, MaintenanceReport, RetentionPolicy};
