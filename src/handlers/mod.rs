use crate::auth::{extract_bearer_token, JwtAuth};
use crate::config::Settings;
use crate::database::ping;
use crate::error::{ApiError, ApiResult};
use crate::fhir_service::FhirService;
use crate::jobs::JobQueue;
use crate::middleware::AuthenticatedUser;
use crate::models::{AuditAction, Claims, TokenType, User};
use crate::nlp_service::NlpService;
use crate::openemr::OpenEmrClient;
use crate::redis_cache::RedisCache;
use crate::sse::SseBroadcaster;
use crate::telehealth_service::TelehealthService;
use actix_web::error::JsonPayloadError;
use actix_web::{web, HttpMessage, HttpRequest, HttpResponse, Responder};
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

pub mod accounts;
pub mod emr;
pub mod journal;
pub mod messaging;
pub mod telehealth;

pub struct AppState {
    pub pool: PgPool,
    pub redis: Arc<RwLock<RedisCache>>,
    pub jwt_auth: Arc<JwtAuth>,
    pub openemr: Arc<OpenEmrClient>,
    pub fhir_service: Arc<FhirService>,
    pub nlp: Arc<NlpService>,
    pub telehealth: Arc<TelehealthService>,
    pub sse_broadcaster: SseBroadcaster,
    pub jobs: JobQueue,
    pub settings: Arc<Settings>,
}

/// Mounts every API module under its prefix.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .service(web::scope("/api/auth").configure(accounts::configure))
        .service(web::scope("/api/emr").configure(emr::configure))
        .service(web::scope("/api/journal").configure(journal::configure))
        .service(web::scope("/api/messaging").configure(messaging::configure))
        .service(web::scope("/api/telehealth").configure(telehealth::configure));
}

// ============ Health Check ============

pub async fn health_check(state: web::Data<AppState>) -> impl Responder {
    let db_ok = ping(&state.pool).await;
    let redis_ok = state.redis.write().await.health_check().await.unwrap_or(false);

    let body = serde_json::json!({
        "status": if db_ok { "healthy" } else { "unhealthy" },
        "database": if db_ok { "connected" } else { "disconnected" },
        "cache": if redis_ok { "connected" } else { "disconnected" },
        "timestamp": Utc::now().to_rfc3339()
    });

    if db_ok {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

/// Malformed JSON bodies answer with the same shape as other 400s.
pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    ApiError::BadRequest(format!("Invalid request body: {}", err)).into()
}

// ============ Authentication ============

/// Resolves the bearer token to an active user and its claims.
pub async fn authenticate_with_claims(req: &HttpRequest, state: &AppState) -> ApiResult<(User, Claims)> {
    let header = req.headers().get("Authorization").and_then(|h| h.to_str().ok());
    let token = extract_bearer_token(header)
        .map_err(|_| ApiError::Unauthorized("Authentication credentials were not provided.".into()))?;

    let claims = state
        .jwt_auth
        .validate_typed(&token, TokenType::Access)
        .map_err(|_| ApiError::Unauthorized("Given token not valid for any token type".into()))?;

    if state.jwt_auth.is_token_revoked(claims.jti, &state.pool).await? {
        return Err(ApiError::Unauthorized("Token is blacklisted".into()));
    }

    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE id = $1")
        .bind(claims.user_id)
        .fetch_optional(&state.pool)
        .await?;

    let user = match user {
        Some(u) if u.is_active => u,
        _ => return Err(ApiError::Unauthorized("User not found".into())),
    };

    req.extensions_mut().insert(AuthenticatedUser(user.id));
    Ok((user, claims))
}

pub async fn authenticate(req: &HttpRequest, state: &AppState) -> ApiResult<User> {
    authenticate_with_claims(req, state).await.map(|(user, _)| user)
}

// ============ Shared helpers ============

pub fn client_ip(req: &HttpRequest) -> String {
    req.connection_info()
        .realip_remote_addr()
        .unwrap_or_default()
        .to_string()
}

pub fn user_agent(req: &HttpRequest) -> String {
    req.headers()
        .get("user-agent")
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Persists an audit row. A failed insert is logged, never surfaced.
pub async fn record_audit(
    pool: &PgPool,
    req: &HttpRequest,
    user_id: Uuid,
    action: AuditAction,
    description: &str,
    resource: Option<(&str, String)>,
) {
    let (resource_type, resource_id) = resource.unwrap_or(("", String::new()));
    crate::audit_log!(action.as_str(), description, user_id);

    let result = sqlx::query(
        "INSERT INTO audit_logs (user_id, action_type, action_description, ip_address, user_agent, resource_type, resource_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(user_id)
    .bind(action)
    .bind(description)
    .bind(client_ip(req))
    .bind(user_agent(req))
    .bind(resource_type)
    .bind(&resource_id)
    .execute(pool)
    .await;

    if let Err(e) = result {
        warn!(error = %e, action = action.as_str(), "Failed to persist audit log");
    }
}

/// `Ok` when the row exists, `NotFound` otherwise.
pub fn found<T>(row: Option<T>) -> ApiResult<T> {
    row.ok_or(ApiError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_request_metadata_helpers() {
        let req = TestRequest::default()
            .insert_header(("user-agent", "webqx-mobile/2.1"))
            .peer_addr("10.1.2.3:5555".parse().unwrap())
            .to_http_request();

        assert_eq!(user_agent(&req), "webqx-mobile/2.1");
        assert_eq!(client_ip(&req), "10.1.2.3");
    }

    #[test]
    fn test_found() {
        assert!(matches!(found::<i32>(None), Err(ApiError::NotFound)));
        assert_eq!(found(Some(3)).unwrap(), 3);
    }
}
