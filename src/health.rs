use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use tracing::info;

use crate::pipeline::Pipeline;

/// Health and introspection surface: liveness, per-processor counters as
/// JSON, and a Prometheus-style text rendering of the same counters.
pub struct HealthServer {
    pipeline: Arc<Pipeline>,
}

impl HealthServer {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    pub async fn start(self, addr: SocketAddr) -> Result<(), hyper::Error> {
        let pipeline = self.pipeline.clone();

        let make_svc = make_service_fn(move |_conn| {
            let pipeline = pipeline.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    handle_request(req, pipeline.clone())
                }))
            }
        });

        let server = Server::bind(&addr).serve(make_svc);
        info!("Health server listening on {}", addr);

        server.await
    }
}

async fn handle_request(
    req: Request<Body>,
    pipeline: Arc<Pipeline>,
) -> Result<Response<Body>, Infallible> {
    let response = match req.uri().path() {
        "/health" => health(&pipeline),
        "/processors" => processors(&pipeline),
        "/metrics" => prometheus_metrics(&pipeline),
        _ => not_found(),
    };
    Ok(response)
}

fn health(pipeline: &Pipeline) -> Response<Body> {
    let snapshots = pipeline.snapshots();
    let records_in: u64 = snapshots.iter().map(|s| s.records_in).sum();
    let dropped: u64 = snapshots.iter().map(|s| s.dropped_total()).sum();

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(
            serde_json::json!({
                "status": "healthy",
                "run_id": pipeline.run_id(),
                "records_in": records_in,
                "records_dropped": dropped,
            })
            .to_string(),
        ))
        .unwrap()
}

fn processors(pipeline: &Pipeline) -> Response<Body> {
    let payload = serde_json::json!({
        "processors": pipeline.snapshots(),
        "circuits": pipeline.circuit_states(),
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

fn prometheus_metrics(pipeline: &Pipeline) -> Response<Body> {
    let mut out = String::new();
    out.push_str("# HELP pipeline_records_in_total Records entering each processor\n");
    out.push_str("# TYPE pipeline_records_in_total counter\n");
    for snap in pipeline.snapshots() {
        out.push_str(&format!(
            "pipeline_records_in_total{{processor=\"{}\"}} {}\n",
            snap.stage, snap.records_in
        ));
        out.push_str(&format!(
            "pipeline_records_out_total{{processor=\"{}\"}} {}\n",
            snap.stage, snap.records_out
        ));
        for (reason, count) in &snap.drops {
            out.push_str(&format!(
                "pipeline_records_dropped_total{{processor=\"{}\",reason=\"{}\"}} {}\n",
                snap.stage, reason, count
            ));
        }
        for (name, value) in &snap.gauges {
            out.push_str(&format!(
                "pipeline_gauge{{processor=\"{}\",name=\"{}\"}} {}\n",
                snap.stage, name, value
            ));
        }
    }

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Body::from(out))
        .unwrap()
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("404 - Not Found"))
        .unwrap()
}
