// Admin HTTP surface: read-only snapshots plus the four control verbs.
//
// Everything except the landing page requires the process-scoped bearer
// token. Responses are point-in-time snapshots taken under the pool's
// reader locks; failures always carry a JSON {"error": ...} body and the
// token value itself is never echoed or logged.
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use crate::config::HTTP_BIND_ADDRESS;
use crate::pool::MiningPool;
use crate::primitives::unix_now;

pub async fn start_admin_server(
    pool: Arc<MiningPool>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = format!("{HTTP_BIND_ADDRESS}:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;
    serve(pool, listener).await
}

/// Accept loop over an already-bound listener (tests bind port 0).
pub async fn serve(
    pool: Arc<MiningPool>,
    listener: TcpListener,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        let (stream, _) = listener.accept().await?;
        let pool = pool.clone();
        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let pool = pool.clone();
                async move { handle_request(pool, req).await }
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), svc)
                .await;
        });
    }
}

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .expect("static response parts")
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, json!({ "error": message }))
}

fn authorized(req: &Request<Incoming>, token: &str) -> bool {
    let header = req
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    header.strip_prefix("Bearer ").is_some_and(|t| t == token)
}

async fn handle_request(
    pool: Arc<MiningPool>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    // Public landing surface: the only unauthenticated route.
    if method == Method::GET && path == "/" {
        return Ok(json_response(
            StatusCode::OK,
            json!({
                "name": "hashforge",
                "version": env!("CARGO_PKG_VERSION"),
                "height": pool.height(),
            }),
        ));
    }

    if !authorized(&req, pool.admin_token()) {
        return Ok(error_response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let resp = match (method, path.as_str()) {
        (Method::GET, "/api/stats") => json_response(StatusCode::OK, json!(pool.stats())),

        (Method::GET, "/api/miners") => {
            json_response(StatusCode::OK, json!({ "miners": pool.miners_snapshot() }))
        }

        (Method::GET, "/api/blockchain") => json_response(
            StatusCode::OK,
            json!({
                "height": pool.height(),
                "difficulty": pool.difficulty(),
                "blocks": pool.chain_snapshot(),
            }),
        ),

        (Method::GET, path) if path.starts_with("/api/blocks/") => {
            match path["/api/blocks/".len()..].parse::<u64>() {
                Ok(index) => match pool.block(index) {
                    Some(block) => json_response(StatusCode::OK, json!(block)),
                    None => error_response(StatusCode::NOT_FOUND, "block not found"),
                },
                Err(_) => error_response(StatusCode::BAD_REQUEST, "invalid block index"),
            }
        }

        (Method::GET, "/api/validate") => match pool.validate_chain() {
            Ok(()) => json_response(
                StatusCode::OK,
                json!({ "valid": true, "height": pool.height() }),
            ),
            Err(e) => json_response(
                StatusCode::OK,
                json!({ "valid": false, "detail": e.to_string() }),
            ),
        },

        (Method::GET, "/api/cpu") => {
            let agg = pool.aggregate();
            let now = unix_now();
            let miners: Vec<Value> = pool
                .miners_snapshot()
                .into_iter()
                .map(|m| {
                    json!({
                        "id": m.id,
                        "reported_ip": m.reported_ip,
                        "observed_ip": m.observed_ip,
                        "active": m.active,
                        "cpu_usage_pct": m.cpu_usage_pct,
                        "cpu_throttle_pct": m.cpu_throttle_pct,
                        "hash_rate": m.hash_rate,
                        "gpu_hash_rate": m.gpu_hash_rate,
                        "gpu_enabled": m.gpu_enabled,
                        "hybrid_mode": m.hybrid_mode,
                        "gpu_devices": m.gpu_devices,
                        "seconds_since_heartbeat": (now - m.last_heartbeat).max(0),
                    })
                })
                .collect();
            json_response(
                StatusCode::OK,
                json!({ "aggregate": agg, "miners": miners }),
            )
        }

        (Method::POST, "/api/miner/pause") => {
            control_op(req, |id, _| pool.pause_miner(id), "paused").await
        }
        (Method::POST, "/api/miner/resume") => {
            control_op(req, |id, _| pool.resume_miner(id), "resumed").await
        }
        (Method::POST, "/api/miner/delete") => {
            control_op(req, |id, _| pool.delete_miner(id), "pending deletion").await
        }
        (Method::POST, "/api/miner/throttle") => {
            control_op(
                req,
                |id, body| {
                    let pct = body
                        .get("throttle_percent")
                        .and_then(Value::as_u64)
                        .unwrap_or(0)
                        .min(100) as u8;
                    pool.throttle_miner(id, pct)
                },
                "throttled",
            )
            .await
        }

        _ => error_response(StatusCode::NOT_FOUND, "no such endpoint"),
    };
    Ok(resp)
}

/// Shared body parsing for the POST control verbs: {"miner_id": ...} plus
/// op-specific fields.
async fn control_op<F>(req: Request<Incoming>, op: F, verb: &str) -> Response<Full<Bytes>>
where
    F: FnOnce(&str, &Value) -> bool,
{
    let body = match req.collect().await {
        Ok(b) => b.to_bytes(),
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "unreadable body"),
    };
    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid JSON body"),
    };
    let Some(miner_id) = parsed.get("miner_id").and_then(Value::as_str) else {
        return error_response(StatusCode::BAD_REQUEST, "miner_id required");
    };
    if op(miner_id, &parsed) {
        json_response(
            StatusCode::OK,
            json!({ "miner_id": miner_id, "status": verb }),
        )
    } else {
        error_response(StatusCode::NOT_FOUND, "unknown miner")
    }
}
