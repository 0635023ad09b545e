use serde::Serialize;
use tracing::{info, info_span};

/// Lifecycle event for audit logging.
/// Structured for JSON serialization to enable machine-readable audit trails.
#[derive(Debug, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// The transport is accepting calls.
    ServerStarted {
        /// Service name.
        service: String,
        /// Bound address.
        address: String,
    },
    /// The server finished its shutdown sequence.
    ServerStopped {
        /// Service name.
        service: String,
    },
    /// The node was registered with discovery for the first time in a cycle.
    ServiceRegistered {
        /// Service name.
        service: String,
        /// Node id.
        node: String,
        /// Registry implementation.
        registry: String,
    },
    /// The node was removed from discovery.
    ServiceDeregistered {
        /// Service name.
        service: String,
        /// Node id.
        node: String,
    },
}

/// Logs an audit event to the dedicated audit channel as structured JSON.
/// This uses a specific `target` which can be filtered by the subscriber to
/// redirect to a secure file.
pub fn log_audit(event: &AuditEvent) {
    let span = info_span!(target: "audit", "audit_event");
    let _enter = span.enter();

    let json = serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"));
    info!(target: "audit", audit_json = %json, "Lifecycle Audit Event");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_audit_variants() {
        log_audit(&AuditEvent::ServerStarted {
            service: "greeter".into(),
            address: "127.0.0.1:9000".into(),
        });
        log_audit(&AuditEvent::ServiceRegistered {
            service: "greeter".into(),
            node: "greeter-1".into(),
            registry: "memory".into(),
        });
        log_audit(&AuditEvent::ServiceDeregistered {
            service: "greeter".into(),
            node: "greeter-1".into(),
        });
        log_audit(&AuditEvent::ServerStopped {
            service: "greeter".into(),
        });
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_string(&AuditEvent::ServerStopped {
            service: "greeter".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"event_type":"server_stopped","service":"greeter"}"#);
    }
}
