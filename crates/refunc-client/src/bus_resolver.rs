//! Bus transport — a resolver bound to one request/reply exchange.

use std::sync::Arc;

use bytes::Bytes;
use refunc_core::messages::{gen_id, trim_crlf, LOG_ENDPOINT_OPTION};
use refunc_core::subjects::{forward_logs_subject, invoke_subject};
use refunc_core::{Action, ActionType, InvokeRequest};

use crate::bus::{BusMessage, MessageBus, Subscription};
use crate::context::{instant_for, InvocationContext};
use crate::error::TaskError;
use crate::parse::{parse_action, unquote, TaskParser};
use crate::resolver::TaskResolver;

/// Publish `request` to `endpoint` over `bus` and settle with the reply.
///
/// With log forwarding enabled, a per-call log subject is subscribed before
/// the request goes out and its name travels in `options.logEndpoint`.
pub async fn new_bus_resolver(
    ctx: &InvocationContext,
    bus: Arc<dyn MessageBus>,
    endpoint: &str,
    mut request: InvokeRequest,
) -> Result<TaskResolver, TaskError> {
    ctx.set_request_deadline(&mut request);
    let requested = request
        .deadline
        .map(instant_for)
        .ok_or_else(|| TaskError::Config("request has no deadline".into()))?;
    let deadline = ctx.deadline().map_or(requested, |d| d.min(requested));
    let ctx = ctx.clone().with_deadline(deadline);

    if request.request_id.is_empty() {
        request.request_id = gen_id(&[endpoint.as_bytes(), request.args_bytes()]);
    }
    let tr = TaskResolver::new(request.request_id.clone(), resolver_name(endpoint, &request.request_id));

    let mut logs = None;
    if ctx.is_logging_enabled() {
        let subject = forward_logs_subject(endpoint, &uuid::Uuid::new_v4().simple().to_string());
        logs = Some(bus.subscribe(&subject, None).await?);
        request
            .options
            .insert(LOG_ENDPOINT_OPTION.to_string(), serde_json::Value::String(subject));
    }

    let payload = Bytes::from(serde_json::to_vec(&request)?);
    let subject = invoke_subject(endpoint);
    let this = tr.clone();
    tr.spawn(&ctx, async move {
        let exchange = bus.request(&subject, payload, deadline);
        tokio::pin!(exchange);
        let reply = loop {
            tokio::select! {
                biased;
                Some(msg) = next_log(&mut logs) => forward_log(&this, &msg),
                reply = &mut exchange => break reply,
            }
        };
        if let Some(sub) = logs.as_mut() {
            while let Some(msg) = sub.try_next() {
                forward_log(&this, &msg);
            }
            sub.unsubscribe();
        }

        match reply {
            Ok(msg) => {
                if parse_action(trim_crlf(&msg.payload), &this) {
                    this.set_result(Err(TaskError::EmptyResponse));
                }
            }
            Err(e) => this.set_result(Err(e.into())),
        }
    });
    Ok(tr)
}

fn resolver_name(endpoint: &str, rid: &str) -> String {
    let prefix = if rid.len() > 32 {
        rid.get(..rid.len() - 25).unwrap_or(rid)
    } else {
        rid.get(..7).unwrap_or(rid)
    };
    format!("{}<{}>", endpoint, prefix)
}

async fn next_log(logs: &mut Option<Subscription>) -> Option<BusMessage> {
    match logs {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

fn forward_log(tr: &TaskResolver, msg: &BusMessage) {
    let raw = trim_crlf(&msg.payload);
    let line = match serde_json::from_slice::<Action>(raw) {
        Ok(action) if action.kind == ActionType::Log => unquote(action.payload_bytes()),
        _ => unquote(raw),
    };
    tr.update_log(line);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use refunc_core::messages::{encode, error_action_bytes, response_action_bytes};
    use refunc_core::ErrorMessage;
    use std::time::Duration;

    async fn responder<F>(bus: &LocalBus, endpoint: &str, answer: F)
    where
        F: FnOnce(InvokeRequest) -> Vec<(String, Bytes)> + Send + 'static,
    {
        let mut sub = bus.subscribe(&invoke_subject(endpoint), None).await.unwrap();
        let bus = bus.clone();
        tokio::spawn(async move {
            let msg = sub.next().await.unwrap();
            let req: InvokeRequest = serde_json::from_slice(&msg.payload).unwrap();
            let reply = msg.reply.clone().unwrap();
            for (subject, payload) in answer(req) {
                let target = if subject.is_empty() { reply.clone() } else { subject };
                bus.publish(&target, None, payload).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn reply_settles_resolver() {
        let bus = LocalBus::new();
        responder(&bus, "ns/fn", |req| {
            assert!(req.deadline.is_some());
            vec![(String::new(), response_action_bytes(b"{\"sum\":3}"))]
        })
        .await;

        let req = InvokeRequest::with_args(&serde_json::json!([1, 2])).unwrap();
        let tr = new_bus_resolver(&InvocationContext::new(), Arc::new(bus), "ns/fn", req)
            .await
            .unwrap();
        tr.done().await;
        assert_eq!(tr.result().unwrap().unwrap(), Bytes::from_static(b"{\"sum\":3}"));
        assert!(tr.name().starts_with("ns/fn<"));
    }

    #[tokio::test]
    async fn error_reply_is_remote_error() {
        let bus = LocalBus::new();
        responder(&bus, "ns/fn", |_| {
            vec![(String::new(), error_action_bytes(&ErrorMessage::new("ValueError", "bad input")))]
        })
        .await;
        let tr = new_bus_resolver(&InvocationContext::new(), Arc::new(bus), "ns/fn", InvokeRequest::default())
            .await
            .unwrap();
        tr.done().await;
        assert_eq!(tr.result().unwrap().unwrap_err().to_string(), "ValueError: bad input");
    }

    #[tokio::test]
    async fn nobody_listening_fails_fast() {
        let tr = new_bus_resolver(
            &InvocationContext::new(),
            Arc::new(LocalBus::new()),
            "ns/missing",
            InvokeRequest::default(),
        )
        .await
        .unwrap();
        tr.done().await;
        assert!(matches!(tr.result(), Some(Err(TaskError::Transport(_)))));
    }

    #[tokio::test]
    async fn non_terminal_reply_is_empty_response() {
        let bus = LocalBus::new();
        responder(&bus, "ns/fn", |_| {
            vec![(String::new(), encode(&Action::log("only a log").unwrap()).unwrap())]
        })
        .await;
        let tr = new_bus_resolver(&InvocationContext::new(), Arc::new(bus), "ns/fn", InvokeRequest::default())
            .await
            .unwrap();
        tr.done().await;
        assert!(matches!(tr.result(), Some(Err(TaskError::EmptyResponse))));
    }

    #[tokio::test]
    async fn forwarded_logs_reach_observers() {
        let bus = LocalBus::new();
        responder(&bus, "ns/fn", |req| {
            let log_subject = req.options[LOG_ENDPOINT_OPTION].as_str().unwrap().to_string();
            vec![
                (log_subject.clone(), encode(&Action::log("step 1").unwrap()).unwrap()),
                (log_subject, Bytes::from_static(b"raw step 2")),
                (String::new(), response_action_bytes(b"true")),
            ]
        })
        .await;

        let ctx = InvocationContext::new().with_logging(true);
        let tr = new_bus_resolver(&ctx, Arc::new(bus), "ns/fn", InvokeRequest::default())
            .await
            .unwrap();
        let mut logs = tr.log_observer();
        tr.done().await;

        let mut lines = Vec::new();
        while let Some(line) = logs.next().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["step 1".to_string(), "raw step 2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_responder_hits_deadline() {
        let bus = LocalBus::new();
        let _sub = bus.subscribe(&invoke_subject("ns/slow"), None).await.unwrap();
        let ctx = InvocationContext::new().with_timeout(Duration::from_secs(2));
        let tr = new_bus_resolver(&ctx, Arc::new(bus), "ns/slow", InvokeRequest::default())
            .await
            .unwrap();
        tr.done().await;
        assert!(tr.result().unwrap().unwrap_err().is_deadline());
    }

    #[tokio::test]
    async fn short_ambient_deadline_bounds_request_and_exchange() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe(&invoke_subject("ns/asleep"), None).await.unwrap();
        let ctx = InvocationContext::new().with_timeout(Duration::from_millis(100));
        let started = tokio::time::Instant::now();
        let tr = new_bus_resolver(&ctx, Arc::new(bus), "ns/asleep", InvokeRequest::default())
            .await
            .unwrap();

        let msg = sub.next().await.unwrap();
        let req: InvokeRequest = serde_json::from_slice(&msg.payload).unwrap();
        assert!(req.deadline.unwrap() - chrono::Utc::now() <= chrono::Duration::milliseconds(100));

        tr.done().await;
        assert!(tr.result().unwrap().unwrap_err().is_deadline());
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    }

    #[test]
    fn long_request_ids_keep_their_prefix() {
        let rid = "ns/fn/0123456789abcdef0123456789abcdef";
        assert_eq!(resolver_name("ns/fn", rid), format!("ns/fn<{}>", &rid[..rid.len() - 25]));
        assert_eq!(resolver_name("ns/fn", "abcdef0123"), "ns/fn<abcdef0>");
    }
}
