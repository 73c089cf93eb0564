//! Calls that cross transports: bus and long-poll callers, the broker, worker
//! agents and their pipe-driven processes.

use anyhow::Result;
use refunc_client::{invoke, new_task_resolver, TaskError};
use refunc_core::InvokeRequest;

use crate::{endpoint, http_ctx, Cluster, CHATTY_WORKER, ECHO_WORKER, FAILING_WORKER};

#[tokio::test]
async fn bus_call_wakes_agent_and_runs_worker() -> Result<()> {
    let cluster = Cluster::start().await?;
    cluster.agent("echo", ECHO_WORKER).await?;

    let out = invoke(&cluster.bus_ctx(), &endpoint("echo"), &serde_json::json!({"x": 1})).await?;
    let frame: serde_json::Value = serde_json::from_slice(&out)?;
    assert_eq!(frame["a"], "req");
    assert_eq!(frame["p"]["args"]["x"], 1);
    assert_eq!(cluster.operator.instance(&endpoint("echo")).unwrap().status.active, 1);

    let out = invoke(&cluster.bus_ctx(), &endpoint("echo"), &serde_json::json!({"x": 2})).await?;
    let frame: serde_json::Value = serde_json::from_slice(&out)?;
    assert_eq!(frame["p"]["args"]["x"], 2);
    assert_eq!(cluster.broker.wake_signals().loops_started(), 1);
    Ok(())
}

#[tokio::test]
async fn http_call_goes_through_the_gateway() -> Result<()> {
    let cluster = Cluster::start().await?;
    cluster.agent("echo", ECHO_WORKER).await?;
    let base = cluster.gateway().await?;

    let out = invoke(&http_ctx(&base).with_user("alice"), &endpoint("echo"), &serde_json::json!([1, 2])).await?;
    let frame: serde_json::Value = serde_json::from_slice(&out)?;
    assert_eq!(frame["p"]["args"], serde_json::json!([1, 2]));
    assert_eq!(frame["p"]["user"], "alice");
    Ok(())
}

#[tokio::test]
async fn worker_logs_reach_a_long_poll_caller() -> Result<()> {
    let cluster = Cluster::start().await?;
    cluster.agent("chatty", CHATTY_WORKER).await?;
    let base = cluster.gateway().await?;

    let ctx = http_ctx(&base).with_logging(true);
    let tr = new_task_resolver(&ctx, &endpoint("chatty"), InvokeRequest::default()).await?;
    let mut logs = tr.log_observer();
    tr.done().await;
    assert_eq!(&tr.result().unwrap()?[..], b"\"logged\"");

    let mut lines = Vec::new();
    while let Some(line) = logs.next().await {
        lines.push(line);
    }
    assert_eq!(lines.len(), 1, "got {:?}", lines);
    assert!(lines[0].ends_with(" itest/chatty] got request"), "got {:?}", lines[0]);
    Ok(())
}

#[tokio::test]
async fn application_error_is_carried_verbatim() -> Result<()> {
    let cluster = Cluster::start().await?;
    cluster.agent("fails", FAILING_WORKER).await?;
    let base = cluster.gateway().await?;

    for ctx in [cluster.bus_ctx(), http_ctx(&base)] {
        match invoke(&ctx, &endpoint("fails"), &serde_json::json!({})).await {
            Err(TaskError::Remote(msg)) => {
                assert_eq!(msg.error_type, "ValueError");
                assert_eq!(msg.message, "bad input");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    Ok(())
}

#[tokio::test]
async fn builtins_answer_over_every_transport() -> Result<()> {
    let cluster = Cluster::start().await?;
    let base = cluster.gateway().await?;

    for ctx in [cluster.bus_ctx(), http_ctx(&base)] {
        let out = invoke(&ctx, "builtins/helloworld", &serde_json::json!({})).await?;
        let value: serde_json::Value = serde_json::from_slice(&out)?;
        assert_eq!(value["message"], "Hello world!");
    }
    Ok(())
}

#[tokio::test]
async fn unknown_function_fails_fast() -> Result<()> {
    let cluster = Cluster::start().await?;
    let err = invoke(&cluster.bus_ctx(), &endpoint("ghost"), &serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("ghost"), "got {}", err);
    Ok(())
}
