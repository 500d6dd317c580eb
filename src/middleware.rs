//! Onion composition of middlewares around a terminal handler.
//!
//! Composition happens once, at registration time, producing a single
//! [`ComposedHandler`] with all middlewares already wrapped around the
//! user handler.
//!
//! The `next(message?)` parameter is a `Box<dyn FnOnce>`: calling it twice
//! is a compile error rather than a runtime failure. Likewise a trailing
//! element that isn't a two-argument handler fails to type-check rather
//! than failing at registration.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::error::HandlerError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-dispatch context threaded alongside the payload.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub event_name: Option<String>,
    pub command: Option<String>,
    pub message_id: Option<String>,
    pub metadata: Option<Value>,
}

/// A fully composed handler: `(message, ctx) -> result`.
pub type ComposedHandler =
    Arc<dyn Fn(Value, Context) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

/// The single-shot continuation passed to a middleware. `None` advances
/// with the original message; `Some(v)` advances with a replacement.
pub type NextFn =
    Box<dyn FnOnce(Option<Value>) -> BoxFuture<'static, Result<Value, HandlerError>> + Send>;

/// A middleware: `(message, ctx, next) -> result`.
pub trait Middleware: Send + Sync + 'static {
    fn call(&self, message: Value, ctx: Context, next: NextFn) -> BoxFuture<'static, Result<Value, HandlerError>>;
}

impl<F> Middleware for F
where
    F: Fn(Value, Context, NextFn) -> BoxFuture<'static, Result<Value, HandlerError>>
        + Send
        + Sync
        + 'static,
{
    fn call(
        &self,
        message: Value,
        ctx: Context,
        next: NextFn,
    ) -> BoxFuture<'static, Result<Value, HandlerError>> {
        self(message, ctx, next)
    }
}

/// Wraps a plain async handler function as a [`ComposedHandler`].
pub fn handler_fn<F, Fut>(f: F) -> ComposedHandler
where
    F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(move |message, ctx| Box::pin(f(message, ctx)))
}

/// Composes `middlewares` (outermost first) around `handler` into a single
/// callable, building right-to-left so the first middleware registered is
/// the first one to see the message.
pub fn compose(middlewares: &[Arc<dyn Middleware>], handler: ComposedHandler) -> ComposedHandler {
    let mut composed = handler;
    for mw in middlewares.iter().rev() {
        let mw = Arc::clone(mw);
        let inner = composed.clone();
        composed = Arc::new(move |message: Value, ctx: Context| {
            let mw = Arc::clone(&mw);
            let inner = inner.clone();
            Box::pin(async move {
                let fallback_message = message.clone();
                let ctx_for_next = ctx.clone();
                let inner_for_next = inner.clone();
                let next: NextFn = Box::new(move |override_message: Option<Value>| {
                    let msg = override_message.unwrap_or(fallback_message);
                    inner_for_next(msg, ctx_for_next)
                });
                mw.call(message, ctx, next).await
            }) as BoxFuture<'static, Result<Value, HandlerError>>
        });
    }
    composed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passthrough_middleware(tag: &'static str) -> Arc<dyn Middleware> {
        Arc::new(move |message: Value, ctx: Context, next: NextFn| -> BoxFuture<'static, Result<Value, HandlerError>> {
            Box::pin(async move {
                let mut message = message;
                if let Value::Object(ref mut map) = message {
                    map.insert(tag.to_string(), Value::Bool(true));
                }
                next(Some(message)).await
            })
        })
    }

    #[tokio::test]
    async fn composes_in_registration_order() {
        let handler = handler_fn(|message, _ctx| async move { Ok(message) });
        let composed = compose(
            &[passthrough_middleware("a"), passthrough_middleware("b")],
            handler,
        );
        let result = composed(serde_json::json!({}), Context::default()).await.unwrap();
        assert_eq!(result, serde_json::json!({"a": true, "b": true}));
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let short_circuit: Arc<dyn Middleware> = Arc::new(
            |_message: Value, _ctx: Context, _next: NextFn| -> BoxFuture<'static, Result<Value, HandlerError>> {
                Box::pin(async move { Err(HandlerError::permanent("blocked")) })
            },
        );
        let handler = handler_fn(|message, _ctx| async move { Ok(message) });
        let composed = compose(&[short_circuit], handler);
        let err = composed(serde_json::json!({}), Context::default())
            .await
            .unwrap_err();
        assert_eq!(err.message, "blocked");
    }
}
