//! finsync-core
//!
//! Job queue and provider synchronization core for the finance tracker.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job, connection, finance, payload）
//! - **ports**: 抽象化レイヤー（JobStore, ConnectionStore, LedgerRepository, ProviderClient, Clock, ...）
//! - **storage**: ports の実装（InMemoryStore, SqliteStore）
//! - **queue**: QueueEngine と RetryPolicy
//! - **worker**: WorkerPool, HandlerRegistry, JobContext
//! - **sync**: Sync ジョブの handler（SyncOrchestrator）
//! - **handlers**: Analysis / Maintenance ジョブの handler
//! - **vault**: 認証情報の暗号化（CredentialVault）
//! - **providers**: ProviderClient の実装（SimpleFIN）
//! - **service**: API 層向けの facade（JobService）
//!
//! The data flow is enqueue → claim → dispatch → report: `QueueEngine::enqueue`
//! writes a job row, an executor in the `WorkerPool` claims it, the handler
//! registered for the job's kind runs, and the outcome is written back through
//! the engine.

pub mod config;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod notify;
pub mod observability;
pub mod ports;
pub mod providers;
pub mod queue;
pub mod service;
pub mod storage;
pub mod sync;
pub mod vault;
pub mod worker;
