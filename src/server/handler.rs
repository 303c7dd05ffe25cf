use crate::Result;
use crate::message::{Request, Response};
use async_trait::async_trait;
use std::future::Future;

/// Turns a request into a response
///
/// The request body may still be streaming when `call` runs, and the
/// returned response body may still be written to after `call` returns.
/// Neither side has to finish before the other starts.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, request: Request) -> Result<Response>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    async fn call(&self, request: Request) -> Result<Response> {
        (self)(request).await
    }
}
