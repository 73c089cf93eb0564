//! Invoke a function over the gateway's long-poll transport.

use std::time::Duration;

use anyhow::{Context, Result};
use refunc_client::{new_http_resolver, HttpTransport, InvocationContext};
use refunc_core::InvokeRequest;

pub struct InvokeOptions {
    pub recv_log: bool,
    pub user: Option<String>,
    pub timeout: Option<Duration>,
}

pub async fn cmd_invoke(base: &str, endpoint: &str, args: Option<&str>, opts: &InvokeOptions) -> Result<()> {
    let args: serde_json::Value = match args {
        Some(raw) => serde_json::from_str(raw).context("args must be JSON")?,
        None => serde_json::Value::Object(Default::default()),
    };
    let request = InvokeRequest::with_args(&args)?;

    let mut ctx = InvocationContext::new()
        .with_http(HttpTransport::new(base))
        .with_logging(opts.recv_log);
    if let Some(user) = &opts.user {
        ctx = ctx.with_user(user.clone());
    }
    if let Some(timeout) = opts.timeout {
        ctx = ctx.with_timeout(timeout);
    }

    let tr = new_http_resolver(&ctx, endpoint, request)?;
    let mut logs = tr.log_observer();
    loop {
        tokio::select! {
            biased;
            Some(line) = logs.next() => eprintln!("{}", line),
            _ = tr.done() => break,
        }
    }
    for line in logs.drain() {
        eprintln!("{}", line);
    }

    let data = tr
        .result()
        .context("call ended without a result")?
        .with_context(|| format!("{} failed", tr.name()))?;
    match serde_json::from_slice::<serde_json::Value>(&data) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", String::from_utf8_lossy(&data)),
    }
    Ok(())
}
