//! Integration tests for broker message dispatch.
//!
//! Tests fan-out to every handler of a topic, error aggregation without
//! short-circuit, panic isolation and metadata propagation.

use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use vine_server::context::Context;
use vine_server::error::{CallError, RpcError};
use vine_server::server::subscriber::SubscriberError;
use vine_server::server::{Server, ServerOptions, new_subscriber};

mod common;

use common::{MemoryBroker, MemoryRegistry, Note, json_message, proto_message};

async fn started(
    broker: &Arc<MemoryBroker>,
    subscriber: vine_server::server::Subscriber,
) -> Result<Server> {
    let server = Server::new(
        ServerOptions::new("go.vine.events")
            .with_address("127.0.0.1:0")
            .with_registry(MemoryRegistry::new() as _)
            .with_broker(Arc::clone(broker) as _),
    );
    server.subscribe(subscriber)?;
    server.start().await?;
    Ok(server)
}

/// Test one failing and one panicking handler do not stop their siblings.
#[tokio::test]
async fn test_fan_out_collects_every_failure() -> Result<()> {
    let broker = MemoryBroker::new();
    let delivered = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&delivered);

    let subscriber = new_subscriber("orders")
        .handler("Count", move |_ctx: Context, note: Note| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(note.seq, Ordering::SeqCst);
                Ok(())
            }
        })
        .handler("Reject", |_ctx: Context, _note: Note| async {
            Err(CallError::Rpc(RpcError::conflict("go.vine.events", "duplicate order")))
        })
        .handler("Crash", |_ctx: Context, note: Note| async move {
            if note.seq > 0 {
                panic!("handler crashed on {}", note.text);
            }
            Ok(())
        });
    let server = started(&broker, subscriber).await?;

    let results = broker
        .deliver(
            "orders",
            proto_message(&Note {
                text: "order-1".into(),
                seq: 5,
            }),
        )
        .await;
    assert_eq!(results.len(), 1);
    let err = results.into_iter().next().expect("one subscription").unwrap_err();
    let err = err.downcast_ref::<SubscriberError>().expect("aggregated error");

    assert_eq!(err.topic, "orders");
    assert_eq!(err.errors.len(), 2, "both failures reported: {err}");
    assert!(err.errors.iter().any(|e| matches!(e, CallError::Rpc(r) if r.code == 409)));
    assert!(
        err.errors
            .iter()
            .any(|e| matches!(e, CallError::Panic { message, .. } if message.contains("order-1")))
    );
    assert_eq!(delivered.load(Ordering::SeqCst), 5, "healthy handler still ran");

    server.stop().await?;
    Ok(())
}

/// Test JSON bodies are decoded and headers reach the handler context.
#[tokio::test]
async fn test_json_message_and_metadata() -> Result<()> {
    let broker = MemoryBroker::new();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let subscriber = new_subscriber("audit").handler("Record", move |ctx: Context, note: Note| {
        let sink = Arc::clone(&sink);
        async move {
            let tenant = ctx.metadata().get("x-tenant").unwrap_or_default().to_string();
            let leaked = ctx.metadata().get("content-type").is_some();
            sink.lock().push((note.text, tenant, leaked));
            Ok(())
        }
    });
    let server = started(&broker, subscriber).await?;

    let note = Note {
        text: "login".into(),
        seq: 1,
    };
    for result in broker.deliver("audit", json_message(&note, "X-Tenant", "acme")).await {
        assert!(result.is_ok());
    }
    assert_eq!(*seen.lock(), vec![("login".to_string(), "acme".to_string(), false)]);

    server.stop().await?;
    Ok(())
}

/// Test an undecodable body fails every handler without running any.
#[tokio::test]
async fn test_undecodable_body_is_reported() -> Result<()> {
    let broker = MemoryBroker::new();
    let ran = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&ran);

    let subscriber = new_subscriber("raw").handler("Never", move |_ctx: Context, _note: Note| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let server = started(&broker, subscriber).await?;

    let mut message = json_message(&Note::default(), "x-any", "1");
    message.body = b"{not json".to_vec();
    let results = broker.deliver("raw", message).await;
    let err = results.into_iter().next().expect("one subscription").unwrap_err();
    let err = err.downcast_ref::<SubscriberError>().expect("aggregated error");
    assert_eq!(err.errors.len(), 1);
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    server.stop().await?;
    Ok(())
}

/// Test publishing through the broker trait surfaces the subscriber error.
#[tokio::test]
async fn test_publish_surfaces_failure() -> Result<()> {
    use vine_server::broker::Broker;

    let broker = MemoryBroker::new();
    let subscriber = new_subscriber("alerts").handler("Fail", |_ctx: Context, _note: Note| async {
        Err(CallError::Rpc(RpcError::service_unavailable("go.vine.events", "paging offline")))
    });
    let server = started(&broker, subscriber).await?;

    let err = broker
        .publish("alerts", &proto_message(&Note::default()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("paging offline"), "got {err}");

    server.stop().await?;
    Ok(())
}
