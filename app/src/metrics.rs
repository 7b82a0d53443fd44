use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry, Encoder,
    IntCounterVec, IntGaugeVec, Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;

// Create a new registry named `dv`
lazy_static! {
    pub static ref DV_REGISTRY: Registry =
        Registry::new_custom(Some("dv".to_string()), None).unwrap();
}

// Register metrics with the `dv` registry
lazy_static! {
    pub static ref MESSAGES_PROCESSED: IntCounterVec = register_int_counter_vec_with_registry!(
        "messages_processed_total",
        "Inbound envelopes handled by validator and committee actors",
        &["kind", "status"],
        DV_REGISTRY
    )
    .unwrap();
    pub static ref DUTIES_STARTED: IntCounterVec = register_int_counter_vec_with_registry!(
        "duties_started_total",
        "Duties handed to a runner",
        &["role", "status"],
        DV_REGISTRY
    )
    .unwrap();
    pub static ref SYNC_RUNS: IntCounterVec = register_int_counter_vec_with_registry!(
        "sync_decided_runs_total",
        "Decided sync runs by outcome",
        &["result"],
        DV_REGISTRY
    )
    .unwrap();
    pub static ref SYNC_DECIDED_MESSAGES: IntCounterVec = register_int_counter_vec_with_registry!(
        "sync_decided_messages_total",
        "Decided messages seen by the sync requester",
        &["status"],
        DV_REGISTRY
    )
    .unwrap();
    pub static ref SYNC_HANDLER_REQUESTS: IntCounterVec = register_int_counter_vec_with_registry!(
        "sync_handler_requests_total",
        "Sync requests answered by this node",
        &["protocol", "status"],
        DV_REGISTRY
    )
    .unwrap();
    pub static ref LAST_DECIDED_HEIGHT: IntGaugeVec = register_int_gauge_vec_with_registry!(
        "last_decided_height",
        "Highest decided height persisted locally",
        &["public_key", "role"],
        DV_REGISTRY
    )
    .unwrap();
}

async fn handle_request(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            // Gather the metrics from both the `dv` registry and the default registry
            let mut metric_families = DV_REGISTRY.gather();
            metric_families.extend(prometheus::gather());

            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
                tracing::error!("Failed to encode metrics: {}", err);
                return Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR));
            }

            let mut response = Response::new(Body::from(buffer));
            if let Ok(content_type) = encoder.format_type().parse() {
                response
                    .headers_mut()
                    .insert(hyper::header::CONTENT_TYPE, content_type);
            }
            Ok(response)
        }
        _ => Ok(status_response(StatusCode::NOT_FOUND)),
    }
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

pub async fn start_server(port_number: Option<u16>) {
    // Default port is 9001 if not specified
    const DEFAULT_PORT: u16 = 9001;

    let port = port_number.unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle_request)) });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(err) => {
            tracing::error!("Metrics server could not bind {}: {}", addr, err);
            return;
        }
    };

    tokio::spawn(async move {
        tracing::info!("Starting Metrics server on {}", addr);

        if let Err(e) = server.await {
            tracing::error!("Metrics server error: {}", e);
        }
    });
}
