//! HTTP surface of the gateway (Axum).
//!
//! - `/api/*` routes proxy the DMS backend behind a bearer/cookie session.
//! - Reads go through the shared [`QueryCache`]; mutations invalidate the
//!   keys they touch and publish a domain event to the [`EventHub`].
//! - `/api/*/stream` routes are server-sent-event channels.

use std::{collections::BTreeMap, convert::Infallible, sync::Arc, time::Duration};

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, Request, State},
    http::{header, HeaderMap, Method},
    middleware::{self, Next},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, patch, post},
    Extension, Json, Router,
};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth::{
    authorize, clear_session_cookie, session_cookie, token_from_headers, AuthError, TokenValidator,
    VerifiedTokens,
};
use crate::backend::{BackendClient, UploadFile};
use crate::cache::{fetcher, CacheConfig, QueryCache, QueryKey};
use crate::config::Config;
use crate::error::AppError;
use crate::events::{event_stream, Audience, Channel, EventHub};
use crate::filter::{filter_documents, paginate};
use crate::invalidation::keys;
use crate::models::{
    ApplicationKind, ChecklistRequest, Document, DocumentStatus, DomainEvent, Envelope, EventKind,
    Role, Session,
};
use crate::sse::to_sse_event;

pub const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;
const DEFAULT_SESSION_SECS: i64 = 24 * 60 * 60;
/// Cheap backend read every role may make; used to vet a stream token.
const SESSION_CHECK_PATH: &str = "/notifications";

/// Shared state for every handler.
pub struct AppState {
    pub backend: BackendClient,
    pub cache: QueryCache,
    pub hub: Arc<EventHub>,
    pub validator: TokenValidator,
    pub verified: VerifiedTokens,
    pub heartbeat: Duration,
    pub cookie_secure: bool,
}

impl AppState {
    pub fn new(
        backend: BackendClient,
        cache_config: CacheConfig,
        validator: TokenValidator,
        heartbeat: Duration,
    ) -> Self {
        Self {
            backend,
            cache: QueryCache::new(cache_config),
            hub: Arc::new(EventHub::default()),
            validator,
            verified: VerifiedTokens::default(),
            heartbeat,
            cookie_secure: false,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut state = Self::new(
            BackendClient::new(config.backend_url.clone()),
            config.cache,
            TokenValidator::from_secret(config.jwt_secret.as_deref()),
            config.heartbeat,
        );
        state.cookie_secure = config.cookie_secure;
        state
    }

    /// A token may read shared state once its signature checked out or the
    /// backend has accepted this exact string.
    async fn is_trusted(&self, token: &str) -> bool {
        self.validator.verifies_signature() || self.verified.contains(token).await
    }

    async fn trust(&self, token: &str) {
        if self.validator.verifies_signature() {
            return;
        }
        if let Some(claims) = self.validator.decode_token(token) {
            self.verified.record(token, claims.exp).await;
        }
    }
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = token_from_headers(req.headers());
    let claims = state.validator.authenticate(token.as_deref())?;

    req.extensions_mut().insert(Session {
        claims,
        token: token.unwrap_or_default(),
    });
    Ok(next.run(req).await)
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let auth_routes = Router::new()
        .route("/api/auth/me", get(me_handler))
        .route("/api/applications", get(list_applications_handler))
        .route("/api/applications/:id", get(get_application_handler))
        .route(
            "/api/applications/:id/documents",
            get(list_documents_handler).post(upload_document_handler),
        )
        .route(
            "/api/applications/:id/checklist",
            get(get_checklist_handler).put(update_checklist_handler),
        )
        .route(
            "/api/applications/:id/checklist-request",
            post(request_checklist_handler),
        )
        .route(
            "/api/applications/:id/quality-check",
            post(push_quality_check_handler),
        )
        .route("/api/documents/:id", delete(delete_document_handler))
        .route("/api/documents/:id/status", patch(update_document_status_handler))
        .route(
            "/api/documents/:id/comments",
            get(list_comments_handler).post(add_comment_handler),
        )
        .route("/api/notifications", get(list_notifications_handler))
        .route(
            "/api/notifications/:id",
            delete(delete_notification_handler),
        )
        .route("/api/notifications/:id/read", patch(mark_notification_read_handler))
        .route("/api/dashboard/deadline-stats", get(deadline_stats_handler))
        .route("/api/quality-check", get(quality_check_queue_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Stream routes authenticate themselves: the token may arrive as a query
    // parameter because EventSource cannot set headers.
    let stream_routes = Router::new()
        .route(Channel::StaffNotifications.path(), get(staff_notifications_stream))
        .route(Channel::ClientNotifications.path(), get(client_notifications_stream))
        .route(Channel::Comments.path(), get(comments_stream));

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/auth/login", post(login_handler))
        .route("/api/auth/logout", post(logout_handler))
        .merge(stream_routes)
        .merge(auth_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn require(session: &Session, roles: &[Role]) -> Result<(), AppError> {
    authorize(&session.claims, roles)?;
    Ok(())
}

/// Staff share cache entries; a client only ever sees entries it fetched.
fn scoped(key: QueryKey, session: &Session) -> QueryKey {
    let mut segments = key.segments().to_vec();
    segments.push(if session.claims.role.is_staff() {
        "staff".to_string()
    } else {
        format!("user:{}", session.claims.id)
    });
    QueryKey::new(segments)
}

/// Client an event belongs to: the caller when it is a client, otherwise
/// the `client_id` a staff member named. Events without one stay staff only.
fn event_owner(session: &Session, client_id: Option<&str>) -> Option<String> {
    if session.claims.role.is_staff() {
        client_id.filter(|id| !id.is_empty()).map(str::to_string)
    } else {
        Some(session.claims.id.clone())
    }
}

fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

async fn cached_get(
    state: &AppState,
    key: QueryKey,
    path: String,
    query: Vec<(String, String)>,
    token: &str,
) -> Result<Value, AppError> {
    if !state.is_trusted(token).await {
        debug!(%key, "token not yet accepted by the backend, bypassing cache");
        let value = state.backend.get_json(&path, &query, token).await?;
        state.trust(token).await;
        return Ok(value);
    }

    let backend = state.backend.clone();
    let token = token.to_string();
    let fetch = fetcher(move || {
        let backend = backend.clone();
        let path = path.clone();
        let query = query.clone();
        let token = token.clone();
        async move { backend.get_json(&path, &query, &token).await }
    });
    Ok(state.cache.fetch(key, fetch).await?)
}

/// Health check handler
async fn health_handler() -> Json<Envelope> {
    Json(Envelope::success_message("WorldVisa DMS gateway healthy"))
}

#[derive(Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Response, AppError> {
    if payload.email.trim().is_empty() || payload.password.is_empty() {
        return Err(AppError::bad_request("Email and password are required"));
    }

    let body = state
        .backend
        .send_json(Method::POST, "/auth/login", &payload, None)
        .await?;

    let token = body
        .pointer("/data/token")
        .or_else(|| body.get("token"))
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Internal("login response did not include a token".to_string()))?;

    let claims = state.validator.decode_token(token);
    let max_age = claims
        .as_ref()
        .map(|claims| claims.exp - Utc::now().timestamp())
        .unwrap_or(DEFAULT_SESSION_SECS);
    let cookie = session_cookie(token, max_age, state.cookie_secure);
    state.trust(token).await;

    let user = claims.as_ref().map_or("unknown", |claims| claims.id.as_str());
    info!(%user, "login succeeded");
    Ok(([(header::SET_COOKIE, cookie)], Json(body)).into_response())
}

async fn logout_handler() -> Response {
    (
        [(header::SET_COOKIE, clear_session_cookie())],
        Json(Envelope::success_message("Logged out")),
    )
        .into_response()
}

async fn me_handler(Extension(session): Extension<Session>) -> Result<Json<Envelope>, AppError> {
    let claims = serde_json::to_value(&session.claims).map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(Envelope::success(claims)))
}

async fn list_applications_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<Value>, AppError> {
    require(&session, Role::STAFF)?;
    if let Some(kind) = params.get("type") {
        ApplicationKind::parse(kind)
            .ok_or_else(|| AppError::bad_request("type must be main or spouse"))?;
    }

    let key = scoped(keys::applications_page(&canonical_query(&params)), &session);
    let query = params.into_iter().collect();
    let value = cached_get(&state, key, "/applications".to_string(), query, &session.token).await?;
    Ok(Json(value))
}

async fn get_application_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let key = scoped(keys::application(&id), &session);
    let value = cached_get(&state, key, format!("/applications/{id}"), vec![], &session.token).await?;
    Ok(Json(value))
}

#[derive(Deserialize, Default)]
pub struct DocumentListParams {
    pub category: Option<String>,
    pub status: Option<String>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

/// The backend answers with either `data: [...]` or `data: {documents: [...]}`.
fn documents_from(value: &Value) -> Option<Vec<Document>> {
    let data = value.get("data").unwrap_or(value);
    let list = data.get("documents").unwrap_or(data);
    serde_json::from_value(list.clone()).ok()
}

async fn list_documents_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(application_id): Path<String>,
    Query(params): Query<DocumentListParams>,
) -> Result<Json<Envelope>, AppError> {
    let status = match params.status.as_deref() {
        Some(raw) => Some(
            DocumentStatus::parse(raw).ok_or_else(|| AppError::bad_request("Invalid status filter"))?,
        ),
        None => None,
    };

    let key = scoped(keys::documents(&application_id), &session);
    let value = cached_get(
        &state,
        key,
        format!("/applications/{application_id}/documents"),
        vec![],
        &session.token,
    )
    .await?;

    let docs = documents_from(&value)
        .ok_or_else(|| AppError::Internal("unexpected documents payload from backend".to_string()))?;
    let docs = filter_documents(docs, params.category.as_deref(), status);
    let page = paginate(docs, params.page, params.limit);

    let data = serde_json::to_value(page).map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(Envelope::success(data)))
}

async fn upload_document_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(application_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let mut files = Vec::new();
    let mut fields = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(format!("Malformed upload: {e}")))?
    {
        let name = field.name().unwrap_or("file").to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::bad_request(format!("Malformed upload: {e}")))?;

        match file_name {
            Some(file_name) => files.push(UploadFile {
                field: name,
                file_name,
                content_type,
                bytes: bytes.to_vec(),
            }),
            None => fields.push((name, String::from_utf8_lossy(&bytes).into_owned())),
        }
    }

    if files.is_empty() {
        return Err(AppError::bad_request("No file provided"));
    }
    let owner = event_owner(
        &session,
        fields
            .iter()
            .find(|(name, _)| name == "client_id")
            .map(|(_, value)| value.as_str()),
    );
    fields.push(("uploaded_by".to_string(), session.claims.id.clone()));

    let count = files.len();
    let invalidates = [
        keys::documents(&application_id),
        keys::application(&application_id),
        keys::quality_check(),
    ];
    let path = format!("/applications/{application_id}/documents");
    let value = state
        .cache
        .mutate(&invalidates, state.backend.upload(&path, files, fields, &session.token))
        .await?;

    info!(application = %application_id, files = count, "documents uploaded");
    state.hub.publish(
        DomainEvent::new(EventKind::DocumentUploaded)
            .with_application(&application_id)
            .with_owner(owner)
            .with_payload(value.get("data").cloned().unwrap_or(Value::Null)),
    );
    Ok(Json(value))
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub application_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

async fn update_document_status_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(document_id): Path<String>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Value>, AppError> {
    require(&session, Role::STAFF)?;

    let status = match DocumentStatus::parse(&payload.status) {
        Some(DocumentStatus::Pending) | None => {
            return Err(AppError::bad_request("Status must be approved or rejected"))
        }
        Some(status) => status,
    };
    let reason = payload.reason.as_deref().map(str::trim).filter(|r| !r.is_empty());
    if status == DocumentStatus::Rejected && reason.is_none() {
        return Err(AppError::bad_request("Rejection reason is required"));
    }

    let mut invalidates = vec![keys::quality_check(), keys::dashboard()];
    match &payload.application_id {
        Some(app) => {
            invalidates.push(keys::documents(app));
            invalidates.push(keys::application(app));
        }
        None => invalidates.push(QueryKey::new(["documents"])),
    }

    let body = json!({
        "status": status,
        "reject_message": reason,
        "reviewed_by": session.claims.id,
    });
    let value = state
        .cache
        .mutate(
            &invalidates,
            state.backend.send_json(
                Method::PATCH,
                &format!("/documents/{document_id}/status"),
                &body,
                Some(&session.token),
            ),
        )
        .await?;

    info!(document = %document_id, ?status, reviewer = %session.claims.id, "document reviewed");
    let mut event = DomainEvent::new(EventKind::DocumentStatusChanged)
        .with_document(&document_id)
        .with_owner(event_owner(&session, payload.client_id.as_deref()))
        .with_payload(json!({ "status": status, "reject_message": reason }));
    if let Some(app) = &payload.application_id {
        event = event.with_application(app);
    }
    state.hub.publish(event);
    Ok(Json(value))
}

#[derive(Deserialize, Default)]
pub struct DeleteDocumentParams {
    pub application_id: Option<String>,
    pub client_id: Option<String>,
}

/// Always reports success: a failed backend delete has most likely removed
/// the file anyway. Failures are logged.
async fn delete_document_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(document_id): Path<String>,
    Query(params): Query<DeleteDocumentParams>,
) -> Json<Envelope> {
    let path = format!("/documents/{document_id}");
    if let Err(err) = state.backend.delete(&path, &session.token).await {
        warn!(document = %document_id, error = %err, "backend delete failed, reporting success");
    }

    let mut invalidates = vec![keys::quality_check()];
    match &params.application_id {
        Some(app) => {
            invalidates.push(keys::documents(app));
            invalidates.push(keys::application(app));
        }
        None => invalidates.push(QueryKey::new(["documents"])),
    }
    state.cache.invalidate_all(&invalidates).await;

    let mut event = DomainEvent::new(EventKind::DocumentDeleted)
        .with_document(&document_id)
        .with_owner(event_owner(&session, params.client_id.as_deref()));
    if let Some(app) = &params.application_id {
        event = event.with_application(app);
    }
    state.hub.publish(event);

    Json(Envelope::success_message("Document deleted successfully"))
}

async fn list_comments_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(document_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let key = scoped(keys::comments(&document_id), &session);
    let value = cached_get(
        &state,
        key,
        format!("/documents/{document_id}/comments"),
        vec![],
        &session.token,
    )
    .await?;
    Ok(Json(value))
}

#[derive(Deserialize)]
pub struct AddCommentRequest {
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub application_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

async fn add_comment_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(document_id): Path<String>,
    Json(payload): Json<AddCommentRequest>,
) -> Result<Json<Value>, AppError> {
    let comment = payload.comment.trim();
    if comment.is_empty() {
        return Err(AppError::bad_request("Comment is required"));
    }

    let body = json!({ "comment": comment, "added_by": session.claims.id });
    let value = state
        .cache
        .mutate(
            &[keys::comments(&document_id)],
            state.backend.send_json(
                Method::POST,
                &format!("/documents/{document_id}/comments"),
                &body,
                Some(&session.token),
            ),
        )
        .await?;

    let mut event = DomainEvent::new(EventKind::CommentAdded)
        .with_document(&document_id)
        .with_owner(event_owner(&session, payload.client_id.as_deref()))
        .with_payload(value.get("data").cloned().unwrap_or(Value::Null));
    if let Some(app) = &payload.application_id {
        event = event.with_application(app);
    }
    state.hub.publish(event);
    Ok(Json(value))
}

async fn get_checklist_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(application_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let key = scoped(keys::checklist(&application_id), &session);
    let value = cached_get(
        &state,
        key,
        format!("/applications/{application_id}/checklist"),
        vec![],
        &session.token,
    )
    .await?;
    Ok(Json(value))
}

async fn request_checklist_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(application_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    require(&session, Role::CLIENT)?;

    let request = ChecklistRequest {
        application_id: application_id.clone(),
        requested: true,
        requested_at: Some(Utc::now()),
    };
    let invalidates = [
        keys::application(&application_id),
        keys::checklist(&application_id),
        keys::applications(),
    ];
    let value = state
        .cache
        .mutate(
            &invalidates,
            state.backend.send_json(
                Method::POST,
                &format!("/applications/{application_id}/checklist-request"),
                &request,
                Some(&session.token),
            ),
        )
        .await?;

    info!(application = %application_id, client = %session.claims.id, "checklist requested");
    let payload = serde_json::to_value(&request).unwrap_or(Value::Null);
    state.hub.publish(
        DomainEvent::new(EventKind::ChecklistRequested)
            .with_application(&application_id)
            .with_owner(event_owner(&session, None))
            .with_payload(payload),
    );
    Ok(Json(value))
}

async fn update_checklist_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(application_id): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, AppError> {
    require(&session, Role::STAFF)?;
    let owner = event_owner(&session, payload.get("client_id").and_then(Value::as_str));

    let value = state
        .cache
        .mutate(
            &[keys::checklist(&application_id)],
            state.backend.send_json(
                Method::PUT,
                &format!("/applications/{application_id}/checklist"),
                &payload,
                Some(&session.token),
            ),
        )
        .await?;

    state.hub.publish(
        DomainEvent::new(EventKind::ApplicationUpdated)
            .with_application(&application_id)
            .with_owner(owner),
    );
    Ok(Json(value))
}

async fn list_notifications_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
) -> Result<Json<Value>, AppError> {
    let key = keys::notifications_for(&session.claims.id);
    let value = cached_get(&state, key, "/notifications".to_string(), vec![], &session.token).await?;
    Ok(Json(value))
}

async fn mark_notification_read_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(notification_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let user = session.claims.id.clone();
    let value = state
        .cache
        .mutate(
            &[keys::notifications_for(&user)],
            state.backend.send_json(
                Method::PATCH,
                &format!("/notifications/{notification_id}/read"),
                &json!({ "is_read": true }),
                Some(&session.token),
            ),
        )
        .await?;

    state.hub.publish(
        DomainEvent::new(EventKind::NotificationUpdated)
            .with_notification(&notification_id)
            .with_recipient(user),
    );
    Ok(Json(value))
}

/// Same leniency as document deletion.
async fn delete_notification_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(notification_id): Path<String>,
) -> Json<Envelope> {
    let path = format!("/notifications/{notification_id}");
    if let Err(err) = state.backend.delete(&path, &session.token).await {
        warn!(notification = %notification_id, error = %err, "backend delete failed, reporting success");
    }

    let user = session.claims.id.clone();
    state.cache.invalidate(&keys::notifications_for(&user)).await;
    state.hub.publish(
        DomainEvent::new(EventKind::NotificationDeleted)
            .with_notification(&notification_id)
            .with_recipient(user),
    );

    Json(Envelope::success_message("Notification deleted successfully"))
}

#[derive(Deserialize, Default)]
pub struct DeadlineStatsParams {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

async fn deadline_stats_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Query(params): Query<DeadlineStatsParams>,
) -> Result<Json<Value>, AppError> {
    require(&session, Role::STAFF)?;

    let kind = match params.kind.as_deref() {
        Some(raw) => ApplicationKind::parse(raw)
            .ok_or_else(|| AppError::bad_request("type must be main or spouse"))?,
        None => ApplicationKind::Main,
    };

    let key = scoped(keys::deadline_stats(kind.as_str()), &session);
    let value = cached_get(
        &state,
        key,
        "/dashboard/deadline-stats".to_string(),
        vec![("type".to_string(), kind.as_str().to_string())],
        &session.token,
    )
    .await?;
    Ok(Json(value))
}

async fn quality_check_queue_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<Value>, AppError> {
    require(&session, Role::STAFF)?;

    let key = scoped(keys::quality_check_page(&canonical_query(&params)), &session);
    let query = params.into_iter().collect();
    let value = cached_get(&state, key, "/quality-check".to_string(), query, &session.token).await?;
    Ok(Json(value))
}

async fn push_quality_check_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
    Path(application_id): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, AppError> {
    require(&session, Role::STAFF)?;
    let owner = event_owner(&session, payload.get("client_id").and_then(Value::as_str));

    let value = state
        .cache
        .mutate(
            &[keys::quality_check(), keys::application(&application_id)],
            state.backend.send_json(
                Method::POST,
                &format!("/applications/{application_id}/quality-check"),
                &payload,
                Some(&session.token),
            ),
        )
        .await?;

    state.hub.publish(
        DomainEvent::new(EventKind::ApplicationUpdated)
            .with_application(&application_id)
            .with_owner(owner),
    );
    Ok(Json(value))
}

#[derive(Deserialize, Default)]
pub struct StreamParams {
    pub token: Option<String>,
}

type EventSse = Sse<std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>>;

async fn open_stream(
    state: &AppState,
    channel: Channel,
    headers: &HeaderMap,
    params: StreamParams,
) -> Result<EventSse, AuthError> {
    let token = params
        .token
        .filter(|t| !t.is_empty())
        .or_else(|| token_from_headers(headers));

    let claims = state
        .validator
        .authenticate(token.as_deref())
        .and_then(|claims| authorize(&claims, channel.allowed_roles()).map(|_| claims))
        .map_err(|err| {
            warn!(channel = channel.name(), error = %err, "stream rejected");
            err
        })?;

    let token = token.unwrap_or_default();
    if !state.is_trusted(&token).await {
        if let Err(err) = state.backend.get_json(SESSION_CHECK_PATH, &[], &token).await {
            warn!(channel = channel.name(), user = %claims.id, error = %err, "backend refused stream token");
            return Err(AuthError::Invalid);
        }
        state.trust(&token).await;
    }

    let rx = state.hub.subscribe(channel);
    let audience = Audience::for_caller(claims.role, &claims.id);
    let events = event_stream(channel, rx, state.heartbeat, audience)
        .map(|event| Ok::<_, Infallible>(to_sse_event(&event)));

    Ok(Sse::new(events.boxed()))
}

async fn staff_notifications_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<StreamParams>,
) -> Result<EventSse, AuthError> {
    open_stream(&state, Channel::StaffNotifications, &headers, params).await
}

async fn client_notifications_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<StreamParams>,
) -> Result<EventSse, AuthError> {
    open_stream(&state, Channel::ClientNotifications, &headers, params).await
}

async fn comments_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<StreamParams>,
) -> Result<EventSse, AuthError> {
    open_stream(&state, Channel::Comments, &headers, params).await
}
