//! IdGenerator port - ID 生成の抽象化
//!
//! ULID は同一ミリ秒内でもランダム部をインクリメントする monotonic generator で
//! 生成します。これにより「作成順 == id 順」が保証され、claim の FIFO tie-break
//! がそのまま成立します。

use std::sync::Mutex;
use std::time::SystemTime;

use ulid::{Generator, Ulid};

use crate::domain::ids::{AccountId, ConnectionId, JobId, OrganizationId, TransactionId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn next_ulid(&self) -> Ulid;

    fn job_id(&self) -> JobId {
        JobId::from_ulid(self.next_ulid())
    }

    fn connection_id(&self) -> ConnectionId {
        ConnectionId::from_ulid(self.next_ulid())
    }

    fn organization_id(&self) -> OrganizationId {
        OrganizationId::from_ulid(self.next_ulid())
    }

    fn account_id(&self) -> AccountId {
        AccountId::from_ulid(self.next_ulid())
    }

    fn transaction_id(&self) -> TransactionId {
        TransactionId::from_ulid(self.next_ulid())
    }
}

/// UlidGenerator は Clock を使って時刻ベースの ULID を生成
pub struct UlidGenerator<C> {
    clock: C,
    inner: Mutex<Generator>,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            inner: Mutex::new(Generator::new()),
        }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn next_ulid(&self) -> Ulid {
        let at = SystemTime::from(self.clock.now());
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        // overflow は同一ミリ秒に 2^80 個生成した場合のみ
        inner.generate_from_datetime(at).unwrap_or_else(|_| {
            let ms = self.clock.now().timestamp_millis().max(0) as u64;
            Ulid::from_parts(ms, rand::random())
        })
    }
}
