use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use api::auth::{decode_token, Session, SESSION_COOKIE};
use api::blob::{BlobKind, BlobStore, NewBlob};
use api::customers;
use api::schema::TrackerSchema;
use async_graphql::http::GraphiQLSource;
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{self, header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use platform_api::ApiError;
use sea_orm::{ConnectionTrait, DatabaseConnection, Statement};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;

/// Multipart framing on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub schema: TrackerSchema,
    pub blobs: Arc<dyn BlobStore>,
    pub config: Arc<AppConfig>,
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!(%addr, "tracker server listening");
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed = origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect::<Vec<_>>();
    let layer = CorsLayer::new()
        .allow_headers([http::header::CONTENT_TYPE, http::header::AUTHORIZATION])
        .allow_methods([Method::POST, Method::GET]);
    if allowed.is_empty() {
        layer.allow_origin(AllowOrigin::any())
    } else {
        layer
            .allow_credentials(true)
            .allow_origin(AllowOrigin::list(allowed))
    }
}

pub fn build_router(state: AppState) -> Router {
    let request_id = MakeRequestUuid;
    let header_name = HeaderName::from_static("x-request-id");
    let upload_limit = state.config.max_upload_bytes + MULTIPART_OVERHEAD;
    let cors = cors_layer(&state.config.cors_allowed_origins);
    Router::new()
        .route("/health", get(health_handler))
        .route("/graphql", get(graphiql).post(graphql_handler))
        .route(
            "/files",
            post(upload_handler).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/files/{id}", get(download_handler))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(header_name.clone(), request_id))
                .layer(PropagateRequestIdLayer::new(header_name))
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

async fn graphiql() -> Html<String> {
    Html(GraphiQLSource::build().endpoint("/graphql").finish())
}

async fn graphql_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    request: GraphQLRequest,
) -> HttpResult<GraphQLResponse> {
    let mut req = request.into_inner();
    if let Some(session) = resolve_session(&state, &jar, &headers).await? {
        req = req.data(session);
    }
    let response = state.schema.execute(req).await;
    Ok(GraphQLResponse::from(response))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    file_id: Uuid,
    reference: String,
    mime_type: String,
    size: i64,
}

async fn upload_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> HttpResult<Json<UploadResponse>> {
    let session = require_session(&state, &jar, &headers).await?;
    session.require_admin()?;

    let mut file: Option<(String, String, Vec<u8>)> = None;
    let mut kind: Option<BlobKind> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| HttpError::new(err.status(), &err.body_text()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let original_name = field.file_name().unwrap_or("upload").to_string();
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| HttpError::new(err.status(), &err.body_text()))?;
                if bytes.len() > state.config.max_upload_bytes {
                    return Err(HttpError::new(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        "file exceeds the upload limit",
                    ));
                }
                file = Some((original_name, mime_type, bytes.to_vec()));
            }
            Some("kind") => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| HttpError::new(err.status(), &err.body_text()))?;
                kind = Some(BlobKind::parse(&text)?);
            }
            _ => {}
        }
    }

    let Some((original_name, mime_type, bytes)) = file else {
        return Err(ApiError::validation("no file uploaded").into());
    };
    let kind = kind.unwrap_or(BlobKind::ProcessPhoto);
    let stored = state
        .blobs
        .store(NewBlob {
            kind,
            original_name,
            mime_type,
            bytes,
        })
        .await?;
    Ok(Json(UploadResponse {
        file_id: stored.id,
        reference: stored.reference,
        mime_type: stored.mime_type,
        size: stored.size,
    }))
}

async fn download_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> HttpResult<Response> {
    require_session(&state, &jar, &headers).await?;
    let blob = state.blobs.retrieve(&id.to_string()).await?;
    let content_type = HeaderValue::from_str(&blob.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let file_name: String = blob
        .original_name
        .chars()
        .filter(|c| (c.is_ascii_graphic() && *c != '"' && *c != '\\') || *c == ' ')
        .collect();
    let disposition = HeaderValue::from_str(&format!("inline; filename=\"{}\"", file_name))
        .unwrap_or_else(|_| HeaderValue::from_static("inline"));
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static("private, max-age=31536000, immutable"),
            ),
        ],
        blob.bytes,
    )
        .into_response())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let backend = state.db.get_database_backend();
    let db_ok = state
        .db
        .execute(Statement::from_string(backend, "SELECT 1".to_string()))
        .await
        .is_ok();
    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            ok: db_ok,
            db_ok,
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    db_ok: bool,
    version: &'static str,
}

type HttpResult<T> = Result<T, HttpError>;

fn request_token(jar: &CookieJar, headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|text| text.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty());
    bearer.or_else(|| {
        jar.get(SESSION_COOKIE)
            .map(|cookie| cookie.value().to_string())
            .filter(|token| !token.is_empty())
    })
}

/// Turns the request token into a session using the customer's stored role.
/// Missing, expired or dangling tokens yield an anonymous request.
async fn resolve_session(
    state: &AppState,
    jar: &CookieJar,
    headers: &HeaderMap,
) -> HttpResult<Option<Session>> {
    let Some(token) = request_token(jar, headers) else {
        return Ok(None);
    };
    let claims = match decode_token(&token, &state.config.auth) {
        Ok(claims) => claims,
        Err(err) => {
            warn!(error = %err, "rejected session token");
            return Ok(None);
        }
    };
    match customers::get_customer(state.db.as_ref(), claims.sub).await {
        Ok(model) => Ok(Some(Session::from(&model))),
        Err(ApiError::NotFound(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn require_session(
    state: &AppState,
    jar: &CookieJar,
    headers: &HeaderMap,
) -> HttpResult<Session> {
    resolve_session(state, jar, headers)
        .await?
        .ok_or_else(|| ApiError::Unauthenticated.into())
}

#[derive(Debug)]
struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    fn new(status: StatusCode, msg: &str) -> Self {
        Self {
            status,
            message: msg.to_string(),
        }
    }
}

impl From<ApiError> for HttpError {
    fn from(err: ApiError) -> Self {
        let status = match &err {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    ctrl_c.await;

    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::auth::{issue_token, Role};
    use api::blob::DbBlobStore;
    use api::orders::TrackerSettings;
    use api::schema::{build_schema, AppSchema};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;
    use tower::ServiceExt;

    const BOUNDARY: &str = "tracker-test-boundary";

    struct Harness {
        router: Router,
        admin_token: String,
        customer_token: String,
    }

    async fn harness() -> Harness {
        let conn = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&conn, None).await.unwrap();
        let db = Arc::new(conn);
        let config = Arc::new(AppConfig::from_lookup(|_| None).unwrap());

        let (admin, _) = customers::seed_admin(db.as_ref(), "Admin", "9999999999", "9999999999")
            .await
            .unwrap();
        let customer = customers::create_customer(
            db.as_ref(),
            &Session::from(&admin),
            customers::NewCustomer {
                name: "Alice".into(),
                mobile_number: "9000000001".into(),
                password: "ring-lover".into(),
                role: Role::User,
            },
        )
        .await
        .unwrap();

        let auth = Arc::new(config.auth.clone());
        let AppSchema(schema) = build_schema(db.clone(), auth, TrackerSettings::default());
        let state = AppState {
            db: db.clone(),
            schema,
            blobs: Arc::new(DbBlobStore::new(db)),
            config: config.clone(),
        };
        Harness {
            router: build_router(state),
            admin_token: issue_token(admin.id, Role::Admin, &config.auth).unwrap(),
            customer_token: issue_token(customer.id, Role::User, &config.auth).unwrap(),
        }
    }

    fn multipart_body(kind: &str, file_name: &str, mime: &str, bytes: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"kind\"\r\n\r\n{kind}\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: {mime}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(token: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/files")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    #[tokio::test]
    async fn health_reports_database() {
        let h = harness().await;
        let response = h
            .router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["db_ok"], true);
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let h = harness().await;
        let body = multipart_body("process-photos", "casting.jpg", "image/jpeg", b"\xff\xd8jpeg");
        let response = h
            .router
            .clone()
            .oneshot(upload_request(&h.admin_token, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        let reference = json["reference"].as_str().unwrap().to_string();
        assert!(reference.starts_with("/files/"));
        assert_eq!(json["mimeType"], "image/jpeg");
        assert_eq!(json["size"], 6);

        let response = h
            .router
            .oneshot(
                Request::get(reference.as_str())
                    .header(header::COOKIE, format!("{SESSION_COOKIE}={}", h.customer_token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        assert!(response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .starts_with("inline"));
        assert!(response.headers().contains_key(header::CACHE_CONTROL));
        assert_eq!(body_bytes(response).await, b"\xff\xd8jpeg".to_vec());
    }

    #[tokio::test]
    async fn customers_cannot_upload() {
        let h = harness().await;
        let body = multipart_body("bills", "bill.pdf", "application/pdf", b"%PDF");
        let response = h
            .router
            .oneshot(upload_request(&h.customer_token, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unknown_upload_kind_is_rejected() {
        let h = harness().await;
        let body = multipart_body("avatars", "me.png", "image/png", b"png");
        let response = h
            .router
            .oneshot(upload_request(&h.admin_token, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn files_need_a_session() {
        let h = harness().await;
        let uri = format!("/files/{}", Uuid::new_v4());
        let response = h
            .router
            .clone()
            .oneshot(Request::get(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = h
            .router
            .oneshot(
                Request::get(uri.as_str())
                    .header(header::AUTHORIZATION, format!("Bearer {}", h.admin_token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn graphql_uses_bearer_session() {
        let h = harness().await;
        let query = serde_json::json!({ "query": "{ tracker { me { role } } }" });
        let response = h
            .router
            .oneshot(
                Request::post("/graphql")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::AUTHORIZATION, format!("Bearer {}", h.customer_token))
                    .body(Body::from(query.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["data"]["tracker"]["me"]["role"], "USER");
    }

    #[tokio::test]
    async fn garbage_token_is_anonymous() {
        let h = harness().await;
        let query = serde_json::json!({ "query": "{ tracker { me { role } } }" });
        let response = h
            .router
            .oneshot(
                Request::post("/graphql")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::AUTHORIZATION, "Bearer not-a-jwt")
                    .body(Body::from(query.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["errors"][0]["extensions"]["code"], "UNAUTHENTICATED");
    }
}
