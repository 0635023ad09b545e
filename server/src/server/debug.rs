//! Built-in `Debug` service every server exposes, never advertised.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use sysinfo::{ProcessesToUpdate, System};

use crate::context::Context;
use crate::error::CallError;

use super::handler::Handler;

/// Empty health probe.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthRequest {}

/// Health probe reply.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthResponse {
    /// Always `ok` while the server serves.
    #[prost(string, tag = "1")]
    pub status: String,
}

/// Empty stats probe.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsRequest {}

/// Process statistics.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsResponse {
    /// Start time, unix seconds.
    #[prost(int64, tag = "1")]
    pub started: i64,
    /// Seconds since start.
    #[prost(uint64, tag = "2")]
    pub uptime: u64,
    /// Resident memory in bytes.
    #[prost(uint64, tag = "3")]
    pub memory: u64,
    /// Virtual memory in bytes.
    #[prost(uint64, tag = "4")]
    pub virtual_memory: u64,
}

struct Clock {
    started_at: DateTime<Utc>,
    started: Instant,
}

fn process_memory() -> (u64, u64) {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return (0, 0);
    };
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .map_or((0, 0), |p| (p.memory(), p.virtual_memory()))
}

/// The `Debug` handler, registered as internal.
#[must_use]
pub fn handler() -> Handler {
    let clock = Arc::new(Clock {
        started_at: Utc::now(),
        started: Instant::now(),
    });
    Handler::new("Debug")
        .unary("Health", |_ctx: Context, _req: HealthRequest| async {
            Ok::<_, CallError>(HealthResponse {
                status: "ok".to_string(),
            })
        })
        .unary("Stats", move |_ctx: Context, _req: StatsRequest| {
            let clock = Arc::clone(&clock);
            async move {
                let (memory, virtual_memory) = tokio::task::spawn_blocking(process_memory)
                    .await
                    .map_err(|e| CallError::Other(anyhow::anyhow!("stats: {e}")))?;
                Ok(StatsResponse {
                    started: clock.started_at.timestamp(),
                    uptime: clock.started.elapsed().as_secs(),
                    memory,
                    virtual_memory,
                })
            }
        })
        .internal(true)
}
