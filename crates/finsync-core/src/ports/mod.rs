//! Ports - 抽象化レイヤー
//!
//! - **JobStore**: ジョブの永続化と CAS claim
//! - **ConnectionStore / LedgerRepository**: 接続と台帳データ
//! - **ProviderClient**: 外部プロバイダ
//! - **AnalysisService / Notifier**: analysis handler の協調者
//! - **Clock / IdGenerator**: テスト容易性のための抽象化

pub mod analysis;
pub mod clock;
pub mod id_generator;
pub mod job_store;
pub mod ledger;
pub mod provider;

pub use analysis::{
    AnalysisError, AnalysisReport, AnalysisRequest, AnalysisService, Notification, Notifier,
    NotifyError, Priority,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use id_generator::{IdGenerator, UlidGenerator};
pub use job_store::{CancelOutcome, ClaimRequest, InsertOutcome, JobFilter, JobStore};
pub use ledger::{ConnectionStore, LedgerRepository};
pub use provider::{ProviderClient, ProviderError, ProviderErrorKind, ProviderRegistry};
