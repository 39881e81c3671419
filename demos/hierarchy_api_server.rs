use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{Next, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use subseq_hierarchy::api::HierarchyApp;
use subseq_hierarchy::config::CoordinatorConfig;
use subseq_hierarchy::db::PgBackend;
use subseq_hierarchy::events::BroadcastSink;
use subseq_hierarchy::operations::HierarchyService;
use subseq_hierarchy::permissions::{ALL_HIERARCHY_ROLES, Principal, is_hierarchy_role};

#[derive(Clone)]
struct DevAuthConfig {
    default_subject: String,
    require_dev_header: bool,
}

#[derive(Clone)]
struct ExampleApp {
    hierarchy: HierarchyService<PgBackend>,
    auth: DevAuthConfig,
}

impl HierarchyApp for ExampleApp {
    type Backend = PgBackend;

    fn hierarchy(&self) -> &HierarchyService<PgBackend> {
        &self.hierarchy
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let database_url = env::var("DATABASE_URL")
        .context("DATABASE_URL is required to run demos/hierarchy_api_server.rs")?;
    let bind =
        env::var("HIERARCHY_EXAMPLE_BIND").unwrap_or_else(|_| "127.0.0.1:4020".to_string());
    let bind_addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid HIERARCHY_EXAMPLE_BIND '{}'", bind))?;
    let config = CoordinatorConfig::from_env().context("invalid coordinator configuration")?;

    let auth = DevAuthConfig {
        default_subject: env::var("HIERARCHY_EXAMPLE_DEFAULT_SUBJECT")
            .unwrap_or_else(|_| "hierarchy-example".to_string()),
        require_dev_header: env_flag("HIERARCHY_EXAMPLE_REQUIRE_DEV_HEADER"),
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to postgres")?;

    subseq_hierarchy::db::create_hierarchy_tables(&pool)
        .await
        .context("failed to run hierarchy migrations")?;

    let sink = Arc::new(BroadcastSink::default());
    let mut changes = sink.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => tracing::info!(
                    operation = ?change.operation,
                    affected = ?change.affected_ids,
                    "hierarchy changed"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "change logger fell behind")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let app_state = ExampleApp {
        hierarchy: HierarchyService::new(PgBackend::new(pool), config).with_sink(sink),
        auth,
    };

    let api_v1 = Router::new()
        .route("/healthz", get(health_handler))
        .route("/example/whoami", get(whoami_handler))
        .merge(subseq_hierarchy::api::routes::<ExampleApp>());

    let app = Router::new()
        .nest("/api/v1", api_v1)
        .layer(from_fn_with_state(
            app_state.clone(),
            dev_identity_middleware,
        ))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", bind_addr))?;

    tracing::info!(%bind_addr, "subseq_hierarchy example server listening");
    tracing::info!("api base path: /api/v1");
    tracing::info!("auth shim headers: x-dev-subject, x-dev-roles (comma separated)");

    axum::serve(listener, app)
        .await
        .context("example server failed")
}

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) => {
            let normalized = value.trim().to_ascii_lowercase();
            normalized == "1" || normalized == "true" || normalized == "yes"
        }
        Err(_) => false,
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "ok": true
    }))
}

async fn whoami_handler(principal: Principal) -> Json<serde_json::Value> {
    Json(json!({
        "subject": principal.subject(),
        "roles": principal.roles().collect::<Vec<_>>(),
    }))
}

async fn dev_identity_middleware(
    State(app): State<ExampleApp>,
    mut req: Request,
    next: Next,
) -> Response {
    let headers = req.headers();
    let subject = match header_value(headers, "x-dev-subject") {
        Some(subject) if !subject.trim().is_empty() => subject.trim().to_string(),
        _ if app.auth.require_dev_header => {
            return json_error(
                StatusCode::UNAUTHORIZED,
                "missing_dev_subject",
                "x-dev-subject header is required",
            );
        }
        _ => app.auth.default_subject.clone(),
    };

    let principal = match parse_roles(headers) {
        Ok(roles) => Principal::new(subject, roles),
        Err(message) => return json_error(StatusCode::BAD_REQUEST, "invalid_dev_roles", &message),
    };

    req.extensions_mut().insert(principal);
    next.run(req).await
}

/// Without the header the dev principal holds every hierarchy role.
fn parse_roles(headers: &HeaderMap) -> Result<Vec<String>, String> {
    let Some(raw) = header_value(headers, "x-dev-roles") else {
        return Ok(ALL_HIERARCHY_ROLES
            .iter()
            .map(|role| role.to_string())
            .collect());
    };

    raw.split(',')
        .map(str::trim)
        .filter(|role| !role.is_empty())
        .map(|role| {
            if is_hierarchy_role(role) {
                Ok(role.to_string())
            } else {
                Err(format!("unknown hierarchy role '{}'", role))
            }
        })
        .collect()
}

fn header_value<'a>(headers: &'a HeaderMap, key: &str) -> Option<&'a str> {
    headers.get(key).and_then(|value| value.to_str().ok())
}

fn json_error(status: StatusCode, code: &'static str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        })),
    )
        .into_response()
}
