//! End-to-end tests of the shutdown drain.
//!
//! A handler parks on a signal while `stop()` runs, so the tests can see
//! whether shutdown waits for in-flight calls and where that wait ends.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, oneshot};
use tonic::Status;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic_prost::ProstCodec;
use vine_server::context::Context;
use vine_server::server::{RunState, Server, ServerOptions, new_handler};
use vine_server::util::drain::Drain;

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
struct Job {
    #[prost(string, tag = "1")]
    name: String,
}

async fn start(
    opts: ServerOptions,
    release: Option<oneshot::Receiver<()>>,
    entered: Arc<Notify>,
) -> anyhow::Result<(Server, String)> {
    let release = Arc::new(Mutex::new(release));
    let jobs = new_handler("Jobs").unary("Run", move |_ctx: Context, job: Job| {
        let release = release.lock().take();
        let entered = Arc::clone(&entered);
        async move {
            entered.notify_one();
            match release {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => std::future::pending::<()>().await,
            }
            Ok(job)
        }
    });

    let server = Server::new(opts.with_address("127.0.0.1:0"));
    server.handle(&jobs)?;
    server.start().await?;
    let addr = server.local_addr().ok_or_else(|| anyhow::anyhow!("server not bound"))?;
    Ok((server, addr.to_string()))
}

async fn run_job(addr: String) -> Result<Job, Status> {
    let channel = Channel::from_shared(format!("http://{addr}"))
        .map_err(|e| Status::internal(e.to_string()))?
        .connect()
        .await
        .map_err(|e| Status::unavailable(e.to_string()))?;
    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready().await.map_err(|e| Status::unavailable(e.to_string()))?;
    let request = tonic::Request::new(Job { name: "reindex".into() });
    grpc.unary(request, PathAndQuery::from_static("/Jobs/Run"), ProstCodec::default())
        .await
        .map(tonic::Response::into_inner)
}

#[tokio::test]
async fn stop_waits_for_in_flight_calls() -> anyhow::Result<()> {
    let drain = Drain::new();
    let entered = Arc::new(Notify::new());
    let (release, parked) = oneshot::channel();
    let opts = ServerOptions::new("go.vine.jobs")
        .with_drain(drain.clone())
        .with_grace_timeout(Duration::from_secs(10));
    let (server, addr) = start(opts, Some(parked), Arc::clone(&entered)).await?;

    let call = tokio::spawn(run_job(addr));
    tokio::time::timeout(Duration::from_secs(5), entered.notified()).await?;
    assert_eq!(drain.active(), 1);

    let stopping = tokio::spawn({
        let server = server.clone();
        async move { server.stop().await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!stopping.is_finished(), "stop returned while a call was running");
    assert_eq!(server.state(), RunState::Stopping);

    release.send(()).map_err(|()| anyhow::anyhow!("handler gone"))?;
    tokio::time::timeout(Duration::from_secs(5), stopping).await???;
    assert_eq!(server.state(), RunState::Stopped);
    assert_eq!(drain.active(), 0);

    let job = call.await??;
    assert_eq!(job.name, "reindex", "drained call still answered");
    Ok(())
}

#[tokio::test]
async fn stuck_call_is_abandoned_after_grace() -> anyhow::Result<()> {
    let drain = Drain::new();
    let entered = Arc::new(Notify::new());
    let grace = Duration::from_millis(200);
    let opts = ServerOptions::new("go.vine.jobs")
        .with_drain(drain.clone())
        .with_grace_timeout(grace);
    let (server, addr) = start(opts, None, Arc::clone(&entered)).await?;

    let _call = tokio::spawn(run_job(addr));
    tokio::time::timeout(Duration::from_secs(5), entered.notified()).await?;

    let started = Instant::now();
    tokio::time::timeout(Duration::from_secs(5), server.stop()).await??;
    let elapsed = started.elapsed();

    assert!(elapsed >= grace, "stop returned after {elapsed:?}");
    assert_eq!(server.state(), RunState::Stopped);
    Ok(())
}
