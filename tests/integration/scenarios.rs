//! Broker scenarios: warm forward, cold wake, cold deadline, malformed reply.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use refunc_client::{invoke, new_task_resolver, TaskError};
use refunc_core::messages::response_action_bytes;
use refunc_core::InvokeRequest;

use crate::{endpoint, http_ctx, Cluster, FakeInstance};

#[tokio::test]
async fn warm_instance_is_forwarded_directly() -> Result<()> {
    let cluster = Cluster::start().await?;
    cluster.register("warm", 0);
    let calls = cluster
        .fake_instance("warm", FakeInstance::replying(response_action_bytes(b"\"hot\"")))
        .await?;
    cluster.operator.set_active(&endpoint("warm"), 1);

    let out = invoke(&cluster.bus_ctx(), &endpoint("warm"), &serde_json::json!({})).await?;
    assert_eq!(&out[..], b"\"hot\"");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cluster.broker.wake_signals().loops_started(), 0);
    Ok(())
}

#[tokio::test]
async fn cold_instance_is_woken_then_forwarded() -> Result<()> {
    let cluster = Cluster::start().await?;
    cluster.register("cold", 0);
    cluster
        .fake_instance(
            "cold",
            FakeInstance {
                announce_after: Duration::from_millis(300),
                ..FakeInstance::replying(response_action_bytes(b"\"awake\""))
            },
        )
        .await?;

    let started = Instant::now();
    let out = invoke(&cluster.bus_ctx(), &endpoint("cold"), &serde_json::json!({})).await?;
    let took = started.elapsed();

    assert_eq!(&out[..], b"\"awake\"");
    assert!(took >= Duration::from_millis(300), "settled before the announcement: {:?}", took);
    assert!(took < Duration::from_secs(2), "took {:?}", took);
    assert_eq!(cluster.broker.wake_signals().loops_started(), 1);
    assert!(cluster.broker.wake_signals().is_empty());
    Ok(())
}

#[tokio::test]
async fn cold_deadline_expires_and_record_is_dropped() -> Result<()> {
    let cluster = Cluster::start().await?;
    cluster.register("asleep", 0);

    for round in 1..=2u64 {
        let ctx = cluster.bus_ctx().with_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let tr = new_task_resolver(&ctx, &endpoint("asleep"), InvokeRequest::default()).await?;
        tr.done().await;
        let took = started.elapsed();
        let err = tr.result().and_then(|r| r.err()).expect("call must fail");
        assert!(err.is_deadline(), "unexpected error {:?}", err);
        assert!(took < Duration::from_secs(1), "took {:?}", took);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cluster.broker.wake_signals().is_empty(), "wake record leaked");
        assert_eq!(cluster.broker.wake_signals().loops_started(), round);
    }
    Ok(())
}

#[tokio::test]
async fn malformed_reply_surfaces_raw_text() -> Result<()> {
    let cluster = Cluster::start().await?;
    cluster.register("garbled", 0);
    cluster
        .fake_instance("garbled", FakeInstance::replying(Bytes::from_static(b"not json")))
        .await?;
    cluster.operator.set_active(&endpoint("garbled"), 1);

    let err = invoke(&cluster.bus_ctx(), &endpoint("garbled"), &serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::Protocol(_)));
    assert!(err.to_string().contains("not json"), "got {}", err);

    let base = cluster.gateway().await?;
    let err = invoke(&http_ctx(&base), &endpoint("garbled"), &serde_json::json!({"via": "http"}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not json"), "got {}", err);
    Ok(())
}
