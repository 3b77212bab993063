use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use axum::{Json, Router, routing::post};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::error::Result;
use crate::form;
use crate::resolver::Resolved;
use crate::session::{Database, Session};

#[derive(Deserialize)]
pub struct ResolveRequest {
    pub spec: String,
}

#[derive(Deserialize)]
pub struct FormRequest {
    pub specs: Vec<String>,
}

#[derive(Deserialize)]
pub struct ApplyRequest {
    pub form: String,
    #[serde(default)]
    pub commit: bool,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Serialize)]
pub struct Item {
    pub kind: &'static str,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Serialize, Default)]
pub struct Response {
    pub status: String,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<Item>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changeset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn router(database: Arc<Database>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::POST])
        .allow_headers(Any);
    let resolve_db = Arc::clone(&database);
    let form_db = Arc::clone(&database);
    Router::new()
        .route(
            "/v1/resolve",
            post(move |Json(req): Json<ResolveRequest>| {
                let database = Arc::clone(&resolve_db);
                async move { in_session(database, move |session| resolve(session, &req.spec)).await }
            }),
        )
        .route(
            "/v1/form",
            post(move |Json(req): Json<FormRequest>| {
                let database = Arc::clone(&form_db);
                async move { in_session(database, move |session| render(session, &req.specs)).await }
            }),
        )
        .route(
            "/v1/apply",
            post(move |Json(req): Json<ApplyRequest>| {
                let database = Arc::clone(&database);
                async move { in_session(database, move |session| apply(session, &req)).await }
            }),
        )
        .layer(cors)
}

/// Runs `work` on a blocking thread with a fresh session. Anything left
/// uncommitted, including everything after an error, is reverted.
async fn in_session<F>(database: Arc<Database>, work: F) -> (StatusCode, Json<Response>)
where
    F: FnOnce(&mut Session) -> Result<Response> + Send + 'static,
{
    let started = Instant::now();
    let outcome = tokio::task::spawn_blocking(move || {
        let mut session = database.session()?;
        let result = work(&mut session);
        if session.changeset_state().is_open() {
            if let Err(e) = session.revert_changeset() {
                warn!(error = %e, "revert failed");
            }
        }
        result
    })
    .await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    let (status, mut body) = match outcome {
        Ok(Ok(body)) => (StatusCode::OK, body),
        Ok(Err(e)) => {
            let status = if e.is_user_error() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            warn!(error = %e, code = %status.as_u16(), "request failed");
            (status, failure(e.to_string()))
        }
        Err(e) => {
            warn!(error = %e, "join error");
            (StatusCode::INTERNAL_SERVER_ERROR, failure("join error".to_string()))
        }
    };
    body.elapsed_ms = elapsed_ms;
    info!(ms = elapsed_ms, code = %status.as_u16(), "request complete");
    (status, Json(body))
}

fn failure(error: String) -> Response {
    Response {
        status: "error".into(),
        error: Some(error),
        ..Response::default()
    }
}

fn resolve(session: &mut Session, spec: &str) -> Result<Response> {
    let mut items = Vec::new();
    for resolved in session.resolve(spec)? {
        items.push(match resolved {
            Resolved::Entity(entity) => Item {
                kind: "entity",
                name: entity.name().to_string(),
                value: None,
            },
            Resolved::Element(key) => Item {
                kind: "element",
                name: session.element(key)?.element_name(),
                value: None,
            },
            Resolved::Attribute(attribute) => Item {
                kind: "attribute",
                name: format!(
                    "{}/{}",
                    session.element(attribute.element())?.element_name(),
                    attribute.property()
                ),
                value: Some(attribute.get_text(session)?),
            },
        });
    }
    Ok(Response {
        status: "ok".into(),
        items: Some(items),
        ..Response::default()
    })
}

fn render(session: &mut Session, specs: &[String]) -> Result<Response> {
    let mut keys = Vec::new();
    for spec in specs {
        keys.extend(session.resolve(spec)?.iter().filter_map(Resolved::element));
    }
    Ok(Response {
        status: "ok".into(),
        form: Some(form::to_form(session, &keys)?),
        ..Response::default()
    })
}

fn apply(session: &mut Session, req: &ApplyRequest) -> Result<Response> {
    let description = form::apply_form(session, &req.form)?;
    let changes = description.lines();
    let changeset = if req.commit && !description.is_empty() {
        session.set_changeset_info(req.author.as_deref(), req.comment.as_deref())?;
        session.submit_changeset()?.id
    } else {
        None
    };
    Ok(Response {
        status: "ok".into(),
        changes: Some(changes),
        changeset,
        ..Response::default()
    })
}
