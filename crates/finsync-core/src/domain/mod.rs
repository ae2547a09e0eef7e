//! Domain model
//!
//! - **ids**: ULID ベースの型付き ID
//! - **job**: JobRecord と状態遷移
//! - **connection**: プロバイダ接続と暗号化済み認証情報
//! - **finance**: 口座・取引・SyncCursor
//! - **payload**: ジョブ種別ごとの型付き引数

pub mod connection;
pub mod finance;
pub mod ids;
pub mod job;
pub mod payload;

pub use connection::{Connection, ConnectionStatus, SealedCredentials};
pub use finance::{
    DateRange, ProviderAccount, ProviderTransaction, StoredAccount, StoredTransaction,
    SyncCursor, UpsertOutcome, UpsertSummary,
};
pub use ids::{AccountId, ConnectionId, JobId, OrganizationId, TransactionId};
pub use job::{JobFailure, JobKind, JobRecord, JobState, NewJob, Transition};
pub use payload::{
    AnalysisArgs, AnalysisType, JobArgs, MaintenanceArgs, MaintenanceTask, NotifyChannel,
    RangePreset, SyncArgs, SyncMode,
};
