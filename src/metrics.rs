//! Prometheus metrics and their exposition endpoint.

use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use tokio::sync::watch;

lazy_static! {
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Gossip member events by kind (join, update, leave, failed, reap).
    pub static ref MEMBER_EVENT_COUNTER: CounterVec = CounterVec::new(
        Opts::new("taskvault_member_events", "gossip member events"),
        &["event"]
    )
    .unwrap();

    /// Replicated command lifecycle (propose, apply).
    pub static ref APPLY_COUNTER: CounterVec = CounterVec::new(
        Opts::new("taskvault_raft_commands", "replicated command lifecycle"),
        &["stage"]
    )
    .unwrap();

    /// Leader-side reconciliation timings (barrier, refresh).
    pub static ref RECONCILE_HISTOGRAM: HistogramVec = HistogramVec::new(
        HistogramOpts::new("taskvault_reconcile_seconds", "voter reconciliation timings"),
        &["op"]
    )
    .unwrap();
}

pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(MEMBER_EVENT_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(APPLY_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RECONCILE_HISTOGRAM.clone()));
}

/// Serves the registry in the Prometheus text format until shutdown.
pub fn spawn_exporter(addr: SocketAddr, mut shutdown: watch::Receiver<bool>) {
    let make_svc = make_service_fn(move |_| async move {
        Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| async move {
            let encoder = TextEncoder::new();
            let metric_families = REGISTRY_INSTANCE.gather();
            let mut buffer = Vec::new();
            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                log::error!("metrics: failed to encode registry: {e}");
            }
            Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
        }))
    });

    let server = match hyper::Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(e) => {
            log::warn!("metrics: cannot bind exporter on {addr}: {e}");
            return;
        }
    };
    let graceful = server.with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    });
    tokio::spawn(async move {
        if let Err(e) = graceful.await {
            log::error!("metrics: exporter failed: {e}");
        }
    });
    log::info!("metrics: exporter listening on {addr}");
}
