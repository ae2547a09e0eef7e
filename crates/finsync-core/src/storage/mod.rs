//! Storage - ports の実装
//!
//! - **InMemoryStore**: テストと `database.backend: memory` 用
//! - **SqliteStore**: 本番用（単一ファイル、複数プロセスで共有可能）
//!
//! どちらも JobStore / ConnectionStore / LedgerRepository を実装します。

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
