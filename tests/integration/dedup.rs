//! Gateway deduplication of calls sharing a request id.

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use refunc_client::new_task_resolver;
use refunc_core::messages::response_action_bytes;
use refunc_core::InvokeRequest;

use crate::{endpoint, http_ctx, Cluster, FakeInstance};

#[tokio::test]
async fn same_request_id_runs_once() -> Result<()> {
    let cluster = Cluster::start().await?;
    cluster.register("slow", 0);
    let calls = cluster
        .fake_instance(
            "slow",
            FakeInstance {
                reply_after: Duration::from_millis(300),
                ..FakeInstance::replying(response_action_bytes(b"\"once\""))
            },
        )
        .await?;
    cluster.operator.set_active(&endpoint("slow"), 1);
    let base = cluster.gateway().await?;

    let request = InvokeRequest {
        request_id: "dup-0001".into(),
        ..Default::default()
    };
    let ctx = http_ctx(&base);
    let a = new_task_resolver(&ctx, &endpoint("slow"), request.clone()).await?;
    let b = new_task_resolver(&ctx, &endpoint("slow"), request.clone()).await?;
    tokio::join!(a.done(), b.done());

    assert_eq!(&a.result().unwrap()?[..], b"\"once\"");
    assert_eq!(&b.result().unwrap()?[..], b"\"once\"");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A settled call leaves the store; the same id runs again.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let c = new_task_resolver(&ctx, &endpoint("slow"), request).await?;
    c.done().await;
    assert!(c.result().unwrap().is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}
