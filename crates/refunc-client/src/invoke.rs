//! Transport selection and the one-shot `invoke` helper.

use bytes::Bytes;
use refunc_core::messages::gen_id;
use refunc_core::InvokeRequest;
use serde::Serialize;

use crate::bus_resolver::new_bus_resolver;
use crate::context::InvocationContext;
use crate::error::TaskError;
use crate::http::new_http_resolver;
use crate::resolver::TaskResolver;

/// Start a resolver for `endpoint`: over the bus when the context carries one,
/// otherwise over long-poll HTTP.
pub async fn new_task_resolver(
    ctx: &InvocationContext,
    endpoint: &str,
    request: InvokeRequest,
) -> Result<TaskResolver, TaskError> {
    match ctx.bus() {
        Some(bus) => new_bus_resolver(ctx, bus.clone(), endpoint, request).await,
        None => new_http_resolver(ctx, endpoint, request),
    }
}

/// Call `endpoint` with `args` and wait for the result.
pub async fn invoke<T: Serialize + ?Sized>(
    ctx: &InvocationContext,
    endpoint: &str,
    args: &T,
) -> Result<Bytes, TaskError> {
    let mut request = InvokeRequest::with_args(args)?;
    request.request_id = gen_id(&[endpoint.as_bytes(), request.args_bytes()]);
    request.user = ctx.user().to_string();

    let tr = new_task_resolver(ctx, endpoint, request).await?;
    tr.done().await;
    tr.result().unwrap_or(Err(TaskError::Stopped))
}
