//! Handler traits and adapters.
//!
//! Delivery is at-least-once: a job whose worker dies mid-run is executed
//! again after its lease expires, so handlers must make their side effects
//! idempotent.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::job::context::JobContext;

/// Executes jobs of one type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job. An `Err` counts as a failed attempt.
    async fn execute(
        &self,
        ctx: JobContext,
        payload: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value>;
}

/// A job with typed payload and output.
#[async_trait]
pub trait TypedJob: Send + Sync + 'static {
    type Payload: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    async fn run(&self, ctx: JobContext, payload: Self::Payload) -> anyhow::Result<Self::Output>;
}

struct TypedHandler<J>(J);

#[async_trait]
impl<J: TypedJob> JobHandler for TypedHandler<J> {
    async fn execute(
        &self,
        ctx: JobContext,
        payload: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let payload: J::Payload = serde_json::from_value(payload)
            .map_err(|e| anyhow::anyhow!("invalid payload for {}: {e}", ctx.job_type))?;
        let output = self.0.run(ctx, payload).await?;
        Ok(serde_json::to_value(output)?)
    }
}

/// Adapt a [`TypedJob`] into a handler.
pub fn typed<J: TypedJob>(job: J) -> Arc<dyn JobHandler> {
    Arc::new(TypedHandler(job))
}

struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F, Fut>
where
    F: Fn(JobContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    async fn execute(
        &self,
        ctx: JobContext,
        payload: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        (self.f)(ctx, payload).await
    }
}

/// Adapt an async closure into a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _fut: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::model::JobId;
    use crate::store::LibSqlBackend;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    struct Adder;

    #[async_trait]
    impl TypedJob for Adder {
        type Payload = Add;
        type Output = i64;

        async fn run(&self, _ctx: JobContext, payload: Add) -> anyhow::Result<i64> {
            Ok(payload.a + payload.b)
        }
    }

    async fn ctx(job_type: &str) -> JobContext {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        JobContext::detached(JobId::new(), job_type, db)
    }

    #[tokio::test]
    async fn typed_handler_decodes_payload() {
        let handler = typed(Adder);
        let out = handler
            .execute(ctx("add").await, json!({"a": 2, "b": 3}))
            .await
            .unwrap();
        assert_eq!(out, json!(5));
    }

    #[tokio::test]
    async fn typed_handler_rejects_bad_payload() {
        let handler = typed(Adder);
        let err = handler
            .execute(ctx("add").await, json!({"a": "two"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid payload for add"));
    }

    #[tokio::test]
    async fn closure_handler() {
        let handler = handler_fn(|ctx, payload| async move {
            Ok(json!({"type": ctx.job_type, "echo": payload}))
        });
        let out = handler
            .execute(ctx("echo").await, json!([1, 2]))
            .await
            .unwrap();
        assert_eq!(out, json!({"type": "echo", "echo": [1, 2]}));
    }
}
