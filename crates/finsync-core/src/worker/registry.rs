//! Handler trait と HandlerRegistry
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<A>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<A, H> → DynHandler)
//!
//! JobKind ごとに handler はちょうど一つ。payload は dispatch 時に
//! `A: JobArgs` へデコードされ、失敗は `JobError::Validation`（permanent）。

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use super::context::JobContext;
use crate::domain::{JobArgs, JobKind};
use crate::error::JobError;

/// Handler は型付き引数を受け取って job を実行する
///
/// # 使用例
/// ```ignore
/// struct PurgeHandler;
///
/// #[async_trait]
/// impl Handler<MaintenanceArgs> for PurgeHandler {
///     async fn handle(&self, ctx: &JobContext, args: MaintenanceArgs) -> Result<(), JobError> {
///         ctx.checkpoint()?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<A: JobArgs>: Send + Sync {
    async fn handle(&self, ctx: &JobContext, args: A) -> Result<(), JobError>;
}

#[async_trait]
impl<A: JobArgs, H: Handler<A> + ?Sized> Handler<A> for Arc<H> {
    async fn handle(&self, ctx: &JobContext, args: A) -> Result<(), JobError> {
        (**self).handle(ctx, args).await
    }
}

/// DynHandler は object-safe な Handler の抽象化
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        ctx: &JobContext,
        payload: serde_json::Value,
    ) -> Result<(), JobError>;

    fn kind(&self) -> JobKind;
}

pub struct TypedHandler<A: JobArgs, H: Handler<A>> {
    handler: H,
    _marker: PhantomData<fn(A)>,
}

impl<A: JobArgs, H: Handler<A>> TypedHandler<A, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<A: JobArgs, H: Handler<A>> DynHandler for TypedHandler<A, H> {
    async fn handle_dyn(
        &self,
        ctx: &JobContext,
        payload: serde_json::Value,
    ) -> Result<(), JobError> {
        let args: A = serde_json::from_value(payload)
            .map_err(|e| JobError::Validation(format!("{} payload: {e}", A::KIND)))?;
        self.handler.handle(ctx, args).await
    }

    fn kind(&self) -> JobKind {
        A::KIND
    }
}

/// RegistryError は HandlerRegistry の操作エラー
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Handler for job kind '{0}' is already registered")]
    AlreadyRegistered(JobKind),
}

/// JobKind → handler
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn DynHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A: JobArgs, H: Handler<A> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&A::KIND) {
            return Err(RegistryError::AlreadyRegistered(A::KIND));
        }
        self.handlers
            .insert(A::KIND, Arc::new(TypedHandler::new(handler)));
        Ok(())
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn registered_kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
