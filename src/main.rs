use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use summa_ledger::state::{new_ledger_core, start_workers};
use summa_ledger::{Dispatcher, LedgerConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "summa_ledger=info,tower_http=info".into()),
        )
        .init();

    let config = LedgerConfig::from_env();
    let core = new_ledger_core(config, None)
        .await
        .expect("ledger core should initialize");
    let mut workers = start_workers(&core).expect("workers should register");
    let dispatcher = Dispatcher::new(core);

    // Every request funnels through the framework-agnostic dispatcher; axum
    // is one adapter deep.
    let router = Router::new()
        .fallback(dispatch)
        .with_state(dispatcher)
        .layer(tower::ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let port = std::env::var("PORT").unwrap_or_else(|_| "3030".to_string());
    let listener = TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("unable to bind TCP listener");
    tracing::info!(%port, "summa-ledger listening");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .expect("server should run");

    workers.stop().await;
}

async fn dispatch(State(dispatcher): State<Dispatcher>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let method = parts.method.as_str().to_string();
    let path = parts.uri.path().to_string();
    let query = parse_query(parts.uri.query().unwrap_or(""));
    let headers: HashMap<String, String> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let bytes = match axum::body::to_bytes(body, 1 << 20).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_body(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", "unreadable body")
        }
    };
    let body_json = if bytes.is_empty() {
        None
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(_) => {
                return error_body(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", "malformed JSON body")
            }
        }
    };

    let api = dispatcher
        .handle(&method, &path, body_json, query, headers)
        .await;

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(api.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header("Content-Type", "application/json");
    for (name, value) in &api.headers {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from(api.body.to_string()))
        .unwrap_or_else(|_| {
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "internal error")
        })
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn error_body(status: StatusCode, code: &str, message: &str) -> Response {
    let body = serde_json::json!({"error": {"code": code, "message": message}});
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("static response builds")
}
