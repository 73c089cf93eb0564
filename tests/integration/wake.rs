//! Cold-start sharing between concurrent callers.

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use refunc_client::invoke;
use refunc_core::messages::response_action_bytes;

use crate::{endpoint, Cluster, FakeInstance};

#[tokio::test]
async fn concurrent_cold_calls_share_one_wake() -> Result<()> {
    let cluster = Cluster::start().await?;
    cluster.register("shared", 0);
    let calls = cluster
        .fake_instance(
            "shared",
            FakeInstance {
                announce_after: Duration::from_millis(250),
                ..FakeInstance::replying(response_action_bytes(b"1"))
            },
        )
        .await?;

    let ctx = cluster.bus_ctx();
    let ep = endpoint("shared");
    let (args_a, args_b) = (serde_json::json!({"caller": "a"}), serde_json::json!({"caller": "b"}));
    let (a, b) = tokio::join!(invoke(&ctx, &ep, &args_a), invoke(&ctx, &ep, &args_b));
    assert_eq!(&a?[..], b"1");
    assert_eq!(&b?[..], b"1");

    let wake = cluster.broker.wake_signals();
    assert_eq!(wake.loops_started(), 1);
    // 47 ms cadence over a 250 ms wait, with slack for scheduling.
    assert!(wake.pokes() >= 2 && wake.pokes() <= 12, "pokes = {}", wake.pokes());
    assert!(wake.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn warm_after_wake_skips_the_rendezvous() -> Result<()> {
    let cluster = Cluster::start().await?;
    cluster.register("later", 0);
    cluster
        .fake_instance("later", FakeInstance::replying(response_action_bytes(b"2")))
        .await?;

    let ctx = cluster.bus_ctx();
    invoke(&ctx, &endpoint("later"), &serde_json::json!(1)).await?;
    invoke(&ctx, &endpoint("later"), &serde_json::json!(2)).await?;
    assert_eq!(cluster.broker.wake_signals().loops_started(), 1);
    Ok(())
}
