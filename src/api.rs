use anyhow::anyhow;
use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;

use crate::error::{ErrorKind, LibError};
use crate::models::{AttachChildPayload, CreateGroupPayload, DeleteGroupQuery, GroupId};
use crate::operations::HierarchyService;
use crate::permissions::Principal;
use crate::store::HierarchyBackend;

#[derive(Debug)]
pub struct AppError(pub LibError);

impl From<LibError> for AppError {
    fn from(value: LibError) -> Self {
        Self(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::Database => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Timeout => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Violation => StatusCode::CONFLICT,
            ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        };

        tracing::error!(
            kind = ?self.0.kind,
            code = self.0.code,
            error = %self.0.source,
            "hierarchy api request failed"
        );
        let body = json!({
            "error": {
                "code": self.0.code,
                "message": self.0.public,
            }
        });
        (status, Json(body)).into_response()
    }
}

/// The identity layer runs in front of these routes and leaves a verified [`Principal`] in the
/// request extensions.
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<Principal>().cloned().ok_or_else(|| {
            AppError(LibError::unauthorized(
                "Authentication required",
                anyhow!("no principal attached to request"),
            ))
        })
    }
}

pub trait HierarchyApp: Clone + Send + Sync + 'static {
    type Backend: HierarchyBackend;

    fn hierarchy(&self) -> &HierarchyService<Self::Backend>;
}

async fn create_group_handler<S>(
    State(app): State<S>,
    principal: Principal,
    Json(payload): Json<CreateGroupPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: HierarchyApp,
{
    let group = app.hierarchy().create_group(&principal, payload).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn get_group_handler<S>(
    State(app): State<S>,
    principal: Principal,
    Path(group_id): Path<GroupId>,
) -> Result<impl IntoResponse, AppError>
where
    S: HierarchyApp,
{
    let group = app.hierarchy().get_group(&principal, group_id).await?;
    Ok(Json(group))
}

async fn delete_group_handler<S>(
    State(app): State<S>,
    principal: Principal,
    Path(group_id): Path<GroupId>,
    Query(query): Query<DeleteGroupQuery>,
) -> Result<impl IntoResponse, AppError>
where
    S: HierarchyApp,
{
    let deleted = app
        .hierarchy()
        .delete_group(&principal, group_id, query.policy())
        .await?;
    Ok(Json(deleted))
}

async fn get_parent_handler<S>(
    State(app): State<S>,
    principal: Principal,
    Path(group_id): Path<GroupId>,
) -> Result<impl IntoResponse, AppError>
where
    S: HierarchyApp,
{
    let edge = app.hierarchy().parent(&principal, group_id).await?;
    Ok(Json(edge))
}

async fn attach_child_handler<S>(
    State(app): State<S>,
    principal: Principal,
    Path(group_id): Path<GroupId>,
    Json(payload): Json<AttachChildPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: HierarchyApp,
{
    let edge = app
        .hierarchy()
        .attach_child(&principal, group_id, payload.parent_id)
        .await?;
    Ok(Json(edge))
}

async fn detach_child_handler<S>(
    State(app): State<S>,
    principal: Principal,
    Path(group_id): Path<GroupId>,
) -> Result<impl IntoResponse, AppError>
where
    S: HierarchyApp,
{
    let edge = app.hierarchy().detach_child(&principal, group_id).await?;
    Ok(Json(edge))
}

async fn children_handler<S>(
    State(app): State<S>,
    principal: Principal,
    Path(group_id): Path<GroupId>,
) -> Result<impl IntoResponse, AppError>
where
    S: HierarchyApp,
{
    let groups = app.hierarchy().children(&principal, group_id).await?;
    Ok(Json(groups))
}

async fn ancestors_handler<S>(
    State(app): State<S>,
    principal: Principal,
    Path(group_id): Path<GroupId>,
) -> Result<impl IntoResponse, AppError>
where
    S: HierarchyApp,
{
    let groups = app.hierarchy().ancestors(&principal, group_id).await?;
    Ok(Json(groups))
}

async fn descendants_handler<S>(
    State(app): State<S>,
    principal: Principal,
    Path(group_id): Path<GroupId>,
) -> Result<impl IntoResponse, AppError>
where
    S: HierarchyApp,
{
    let groups = app.hierarchy().descendants(&principal, group_id).await?;
    Ok(Json(groups))
}

async fn subtree_handler<S>(
    State(app): State<S>,
    principal: Principal,
    Path(group_id): Path<GroupId>,
) -> Result<impl IntoResponse, AppError>
where
    S: HierarchyApp,
{
    let tree = app.hierarchy().subtree(&principal, group_id).await?;
    Ok(Json(tree))
}

async fn audit_handler<S>(
    State(app): State<S>,
    principal: Principal,
) -> Result<impl IntoResponse, AppError>
where
    S: HierarchyApp,
{
    let violations = app.hierarchy().audit(&principal).await?;
    Ok(Json(violations))
}

pub fn routes<S>() -> Router<S>
where
    S: HierarchyApp,
{
    tracing::info!("Registering route /groups [POST]");
    tracing::info!("Registering route /groups/{{group_id}} [GET,DELETE]");
    tracing::info!("Registering route /groups/{{group_id}}/parent [GET,PUT,DELETE]");
    tracing::info!("Registering route /groups/{{group_id}}/children [GET]");
    tracing::info!("Registering route /groups/{{group_id}}/ancestors [GET]");
    tracing::info!("Registering route /groups/{{group_id}}/descendants [GET]");
    tracing::info!("Registering route /groups/{{group_id}}/subtree [GET]");
    tracing::info!("Registering route /hierarchy/audit [GET]");

    Router::new()
        .route("/groups", post(create_group_handler::<S>))
        .route(
            "/groups/{group_id}",
            get(get_group_handler::<S>).delete(delete_group_handler::<S>),
        )
        .route(
            "/groups/{group_id}/parent",
            get(get_parent_handler::<S>)
                .put(attach_child_handler::<S>)
                .delete(detach_child_handler::<S>),
        )
        .route("/groups/{group_id}/children", get(children_handler::<S>))
        .route("/groups/{group_id}/ancestors", get(ancestors_handler::<S>))
        .route(
            "/groups/{group_id}/descendants",
            get(descendants_handler::<S>),
        )
        .route("/groups/{group_id}/subtree", get(subtree_handler::<S>))
        .route("/hierarchy/audit", get(audit_handler::<S>))
}
