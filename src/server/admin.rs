use super::GatewayState;
use crate::config::{TargetConfig, UpstreamConfig};
use crate::proxy::context::{full_body, BoxBody};
use bytes::Bytes;
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::{Request, Response};
use serde_json::json;

/// Admin API. Served on a dedicated port when `gateway.admin_port` is
/// set, otherwise multiplexed under `/admin` on the proxy listener.
/// Mutations land in the live upstream store and are observed by the
/// next incoming request.
pub async fn handle_admin<B>(
    req: Request<B>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let tail = path.strip_prefix("/admin").unwrap_or(&path).to_string();

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return Ok(error(StatusCode::BAD_REQUEST, "bad request")),
    };

    let segments: Vec<&str> = tail.split('/').filter(|s| !s.is_empty()).collect();

    let response = match (method.as_str(), segments.as_slice()) {
        ("GET", []) | ("GET", ["status"]) => status_response(&state),

        ("GET", ["metrics"]) => Response::builder()
            .status(200)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(state.metrics.render()))
            .unwrap(),

        ("GET", ["upstreams"]) => {
            let mut upstreams = Vec::new();
            state.upstreams.for_each(|_, up| {
                upstreams.push(serde_json::to_value(up.config()).unwrap_or_default());
            });
            json_response(StatusCode::OK, &serde_json::Value::Array(upstreams))
        }

        ("POST", ["upstreams"]) => match serde_json::from_slice::<UpstreamConfig>(&body) {
            Ok(cfg) if !cfg.name.is_empty() => {
                state.upsert_upstream(cfg.clone()).await;
                json_response(StatusCode::CREATED, &json!({"name": cfg.name}))
            }
            Ok(_) => error(StatusCode::BAD_REQUEST, "upstream name required"),
            Err(e) => error(StatusCode::BAD_REQUEST, &e.to_string()),
        },

        ("GET", ["upstreams", name]) => match state.upstreams.get(name) {
            Some(up) => json_response(
                StatusCode::OK,
                &serde_json::to_value(up.config()).unwrap_or_default(),
            ),
            None => error(StatusCode::NOT_FOUND, "upstream not found"),
        },

        ("DELETE", ["upstreams", name]) => {
            if state.delete_upstream(name).await {
                Response::builder()
                    .status(StatusCode::NO_CONTENT)
                    .body(full_body(Bytes::new()))
                    .unwrap()
            } else {
                error(StatusCode::NOT_FOUND, "upstream not found")
            }
        }

        ("GET", ["upstreams", name, "targets"]) => match state.upstreams.get(name) {
            Some(up) => {
                let targets: Vec<serde_json::Value> = up
                    .targets()
                    .iter()
                    .map(|t| {
                        json!({
                            "host": t.host,
                            "port": t.port,
                            "weight": t.weight,
                            "healthy": t.is_healthy(),
                            "active_connections": t.active_conns(),
                        })
                    })
                    .collect();
                json_response(StatusCode::OK, &serde_json::Value::Array(targets))
            }
            None => error(StatusCode::NOT_FOUND, "upstream not found"),
        },

        ("POST", ["upstreams", name, "targets"]) => {
            match serde_json::from_slice::<TargetConfig>(&body) {
                Ok(target) if target.port != 0 => {
                    if state.add_target(name, target).await {
                        json_response(StatusCode::CREATED, &json!({"upstream": name}))
                    } else {
                        error(StatusCode::NOT_FOUND, "upstream not found")
                    }
                }
                Ok(_) => error(StatusCode::BAD_REQUEST, "target port must be non-zero"),
                Err(e) => error(StatusCode::BAD_REQUEST, &e.to_string()),
            }
        }

        ("GET", ["upstreams", name, "health"]) => match state.upstreams.get(name) {
            Some(up) => {
                let targets: Vec<serde_json::Value> = up
                    .targets()
                    .iter()
                    .map(|t| {
                        json!({
                            "target": t.endpoint(),
                            "healthy": t.is_healthy(),
                            "circuit": up.circuit_state(t.endpoint()),
                            "active_connections": t.active_conns(),
                        })
                    })
                    .collect();
                json_response(
                    StatusCode::OK,
                    &json!({"upstream": name, "targets": targets}),
                )
            }
            None => error(StatusCode::NOT_FOUND, "upstream not found"),
        },

        ("GET", ["services"]) => {
            let config = state.config.load();
            let services: Vec<serde_json::Value> = config
                .services
                .iter()
                .map(|s| serde_json::to_value(s).unwrap_or_default())
                .collect();
            json_response(StatusCode::OK, &serde_json::Value::Array(services))
        }

        ("GET", ["routes"]) => {
            let router = state.router.load();
            let routes: Vec<serde_json::Value> = router
                .routes()
                .iter()
                .map(|r| {
                    json!({
                        "name": r.name,
                        "service": r.service,
                        "upstream": r.upstream,
                        "paths": r.patterns.iter().map(|p| p.raw()).collect::<Vec<_>>(),
                        "methods": r.methods,
                        "strip_path": r.strip_path,
                        "plugins": r.plugins.iter().map(|p| p.name()).collect::<Vec<_>>(),
                    })
                })
                .collect();
            json_response(StatusCode::OK, &serde_json::Value::Array(routes))
        }

        ("GET", ["plugins"]) => {
            let config = state.config.load();
            json_response(
                StatusCode::OK,
                &json!({
                    "available": crate::plugins::BUILTIN_PLUGINS,
                    "global": config
                        .plugins
                        .iter()
                        .map(|p| serde_json::to_value(p).unwrap_or_default())
                        .collect::<Vec<_>>(),
                }),
            )
        }

        _ => error(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

fn status_response(state: &GatewayState) -> Response<BoxBody> {
    let mut upstreams = Vec::new();
    state.upstreams.for_each(|name, up| {
        let targets = up.targets();
        let healthy = targets.iter().filter(|t| t.is_healthy()).count();
        upstreams.push(json!({
            "name": name,
            "algorithm": up.config().algorithm,
            "targets": targets.len(),
            "healthy_targets": healthy,
        }));
    });

    json_response(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "routes": state.router.load().routes().len(),
            "upstreams": upstreams,
        }),
    )
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(
            serde_json::to_string_pretty(value).unwrap_or_default(),
        ))
        .unwrap()
}

fn error(status: StatusCode, msg: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(
            serde_json::to_string(&json!({"error": msg})).unwrap_or_default(),
        ))
        .unwrap()
}
