use super::{authenticate, client_ip, found, record_audit, user_agent, AppState};
use crate::error::{ApiError, ApiResult};
use crate::metrics::{TELEHEALTH_FALLBACKS, TELEHEALTH_SESSIONS_CREATED};
use crate::models::*;
use crate::telehealth_service::{generate_room_name, recommend_tier, select_platform, settings_changes, tier_previews};
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde_json::json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

const UPCOMING_SESSIONS: i64 = 10;
const AUDIT_LOG_PAGE: i64 = 100;
const WAITING_ROOM_WELCOME: &str = "Welcome! Your provider will admit you shortly.";

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/sessions/upcoming", web::get().to(upcoming_sessions))
        .route("/sessions/today", web::get().to(today_sessions))
        .service(
            web::resource("/sessions")
                .route(web::get().to(list_sessions))
                .route(web::post().to(create_session)),
        )
        .service(
            web::resource("/sessions/{id}")
                .route(web::get().to(get_session))
                .route(web::put().to(update_session))
                .route(web::patch().to(update_session))
                .route(web::delete().to(delete_session)),
        )
        .route("/sessions/{id}/join", web::post().to(join_session))
        .route("/sessions/{id}/leave", web::post().to(leave_session))
        .route("/sessions/{id}/start", web::post().to(start_session))
        .route("/sessions/{id}/end", web::post().to(end_session))
        .route("/device-tests/run_full_test", web::post().to(run_full_test))
        .service(
            web::resource("/device-tests")
                .route(web::get().to(list_device_tests))
                .route(web::post().to(create_device_test)),
        )
        .route("/signaling/pending", web::get().to(pending_signals))
        .service(
            web::resource("/signaling")
                .route(web::get().to(list_signals))
                .route(web::post().to(create_signal)),
        )
        .route("/recordings", web::get().to(list_recordings))
        .route("/recordings/{id}", web::get().to(get_recording))
        .route("/recordings/{id}/download_url", web::get().to(recording_download_url))
        .route("/waiting-rooms", web::get().to(list_waiting_rooms))
        .route("/waiting-rooms/{id}", web::get().to(get_waiting_room))
        .route("/waiting-rooms/{id}/enter", web::post().to(enter_waiting_room))
        .route("/waiting-rooms/{id}/admit_participant", web::post().to(admit_participant))
        .route("/waiting-rooms/{id}/deny_participant", web::post().to(deny_participant))
        .route("/clinic-settings/audit-logs", web::get().to(tier_audit_logs))
        .service(
            web::resource("/clinic-settings")
                .route(web::get().to(get_clinic_settings))
                .route(web::put().to(update_clinic_settings))
                .route(web::patch().to(update_clinic_settings)),
        )
        .route("/tier-preview", web::get().to(tier_preview))
        .route("/user-permissions", web::get().to(user_permissions));
}

// ============ Scoping ============

/// Patients see their own sessions. Clinical staff see sessions they
/// provide or take part in. Returns `false` when nothing is visible.
fn push_session_scope(qb: &mut QueryBuilder<'_, Postgres>, user: &User) -> bool {
    match user.user_type {
        UserType::Patient => {
            qb.push(" AND patient_id = ").push_bind(user.id);
            true
        }
        t if t.is_clinical_staff() => {
            qb.push(" AND (provider_id = ").push_bind(user.id);
            qb.push(" OR id IN (SELECT session_id FROM telehealth_participants WHERE user_id = ")
                .push_bind(user.id);
            qb.push("))");
            true
        }
        _ => false,
    }
}

fn session_query(user: &User) -> Option<QueryBuilder<'static, Postgres>> {
    let mut qb = QueryBuilder::new("SELECT * FROM telehealth_sessions WHERE TRUE");
    push_session_scope(&mut qb, user).then_some(qb)
}

async fn visible_session(pool: &PgPool, user: &User, id: Uuid) -> ApiResult<TelehealthSession> {
    let Some(mut qb) = session_query(user) else {
        return Err(ApiError::NotFound);
    };
    qb.push(" AND id = ").push_bind(id);
    found(qb.build_query_as().fetch_optional(pool).await?)
}

async fn participant(pool: &PgPool, session_id: Uuid, user_id: Uuid) -> Result<Option<TelehealthParticipant>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM telehealth_participants WHERE session_id = $1 AND user_id = $2")
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
}

async fn require_moderator(pool: &PgPool, session_id: Uuid, user_id: Uuid) -> ApiResult<()> {
    match participant(pool, session_id, user_id).await? {
        Some(p) if p.is_moderator => Ok(()),
        _ => Err(ApiError::Forbidden(
            "Only the session moderator can perform this action".to_string(),
        )),
    }
}

/// Row id of the session with public `session_id` if the user takes part in it.
async fn participating_session(pool: &PgPool, public_id: Uuid, user_id: Uuid) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT s.id FROM telehealth_sessions s
         JOIN telehealth_participants p ON p.session_id = s.id
         WHERE s.session_id = $1 AND p.user_id = $2",
    )
    .bind(public_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

fn session_list(sessions: Vec<TelehealthSession>) -> Vec<SessionResponse> {
    let now = Utc::now();
    sessions.into_iter().map(|s| SessionResponse::new(s, now)).collect()
}

async fn fetch_sessions(pool: &PgPool, qb: Option<QueryBuilder<'static, Postgres>>) -> ApiResult<Vec<SessionResponse>> {
    match qb {
        Some(mut qb) => {
            let sessions: Vec<TelehealthSession> = qb.build_query_as().fetch_all(pool).await?;
            Ok(session_list(sessions))
        }
        None => Ok(Vec::new()),
    }
}

// ============ Clinic settings ============

/// Singleton settings row, served from cache when possible.
async fn clinic_settings(state: &AppState) -> ApiResult<ClinicSettings> {
    match state.redis.write().await.get_clinic_settings().await {
        Ok(Some(settings)) => return Ok(settings),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Clinic settings cache unavailable"),
    }

    sqlx::query("INSERT INTO clinic_settings (id) VALUES (1) ON CONFLICT (id) DO NOTHING")
        .execute(&state.pool)
        .await?;
    let settings: ClinicSettings = sqlx::query_as("SELECT * FROM clinic_settings WHERE id = 1")
        .fetch_one(&state.pool)
        .await?;

    if let Err(e) = state.redis.write().await.set_clinic_settings(&settings).await {
        warn!(error = %e, "Failed to cache clinic settings");
    }
    Ok(settings)
}

// ============ Sessions ============

pub async fn list_sessions(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<SessionListQuery>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let mut qb = session_query(&user);
    if let Some(qb) = qb.as_mut() {
        if let Some(status) = query.status {
            qb.push(" AND status = ").push_bind(status);
        }
        if let Some(platform) = query.platform {
            qb.push(" AND platform = ").push_bind(platform);
        }
        qb.push(" ORDER BY scheduled_start DESC");
    }
    Ok(HttpResponse::Ok().json(fetch_sessions(&state.pool, qb).await?))
}

pub async fn upcoming_sessions(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let mut qb = session_query(&user);
    if let Some(qb) = qb.as_mut() {
        qb.push(" AND scheduled_start > ").push_bind(Utc::now());
        qb.push(" AND status IN ('scheduled', 'waiting') ORDER BY scheduled_start LIMIT ")
            .push_bind(UPCOMING_SESSIONS);
    }
    Ok(HttpResponse::Ok().json(fetch_sessions(&state.pool, qb).await?))
}

pub async fn today_sessions(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let mut qb = session_query(&user);
    if let Some(qb) = qb.as_mut() {
        qb.push(" AND scheduled_start::date = ").push_bind(Utc::now().date_naive());
        qb.push(" ORDER BY scheduled_start");
    }
    Ok(HttpResponse::Ok().json(fetch_sessions(&state.pool, qb).await?))
}

async fn load_provider(pool: &PgPool, caller: &User, provider_id: Option<Uuid>) -> ApiResult<User> {
    match provider_id {
        Some(id) if id != caller.id => {
            let provider: Option<User> = sqlx::query_as(
                "SELECT * FROM users WHERE id = $1 AND is_active AND user_type IN ('provider', 'care_team')",
            )
            .bind(id)
            .fetch_optional(pool)
            .await?;
            provider.ok_or_else(|| ApiError::field("provider_id", "Provider does not exist."))
        }
        _ => Ok(caller.clone()),
    }
}

pub async fn create_session(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateSessionRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    if !user.user_type.is_clinical_staff() {
        return Err(ApiError::Forbidden(
            "Only providers can schedule telehealth sessions".to_string(),
        ));
    }
    body.validate()?;
    if body.scheduled_end <= body.scheduled_start {
        return Err(ApiError::field("scheduled_end", "End time must be after start time."));
    }

    let provider = load_provider(&state.pool, &user, body.provider_id).await?;
    let patient_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM users WHERE id = $1 AND is_active AND user_type = 'patient')",
    )
    .bind(body.patient_id)
    .fetch_one(&state.pool)
    .await?;
    if !patient_exists {
        return Err(ApiError::field("patient_id", "Patient does not exist."));
    }

    let mut platform = select_platform(body.platform, &provider)?;
    let room_name = generate_room_name();

    let mut zoom = None;
    if platform == Platform::Zoom {
        match state
            .telehealth
            .create_zoom_meeting(&room_name, body.scheduled_start, body.scheduled_end)
            .await
        {
            Ok(meeting) => zoom = Some(meeting),
            Err(e) => {
                if !clinic_settings(&state).await?.enable_fallback_to_webrtc {
                    return Err(ApiError::Upstream(format!("Zoom meeting creation failed: {}", e)));
                }
                warn!(room = %room_name, error = %e, "Zoom unavailable, falling back to WebRTC");
                TELEHEALTH_FALLBACKS.inc();
                platform = Platform::WebRtc;
            }
        }
    }

    let (webrtc_config, jitsi_url) = match platform {
        Platform::WebRtc => (state.telehealth.webrtc_room_config(&room_name), String::new()),
        Platform::Jitsi => (json!({}), state.telehealth.jitsi_room_url(&room_name)),
        Platform::Zoom => (json!({}), String::new()),
    };

    let mut tx = state.pool.begin().await?;
    let session: TelehealthSession = sqlx::query_as(
        "INSERT INTO telehealth_sessions (room_name, patient_id, provider_id, platform, scheduled_start,
            scheduled_end, zoom_meeting_id, zoom_meeting_password, zoom_join_url, webrtc_room_config,
            jitsi_room_url, notes, recording_enabled)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) RETURNING *",
    )
    .bind(&room_name)
    .bind(body.patient_id)
    .bind(provider.id)
    .bind(platform)
    .bind(body.scheduled_start)
    .bind(body.scheduled_end)
    .bind(zoom.as_ref().map(|m| m.meeting_id.as_str()).unwrap_or_default())
    .bind(zoom.as_ref().map(|m| m.password.as_str()).unwrap_or_default())
    .bind(zoom.as_ref().map(|m| m.join_url.as_str()).unwrap_or_default())
    .bind(&webrtc_config)
    .bind(&jitsi_url)
    .bind(&body.notes)
    .bind(body.recording_enabled)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO telehealth_participants (session_id, user_id, role, can_share_screen, can_record, is_moderator)
         VALUES ($1, $2, 'patient', FALSE, FALSE, FALSE), ($1, $3, 'provider', TRUE, TRUE, TRUE)",
    )
    .bind(session.id)
    .bind(session.patient_id)
    .bind(session.provider_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query("INSERT INTO telehealth_waiting_rooms (session_id, welcome_message) VALUES ($1, $2)")
        .bind(session.id)
        .bind(WAITING_ROOM_WELCOME)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    TELEHEALTH_SESSIONS_CREATED.with_label_values(&[platform.as_str()]).inc();
    info!(session = %session.session_id, platform = platform.as_str(), "Telehealth session created");
    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::DataModify,
        "Telehealth session created",
        Some(("telehealth_session", session.id.to_string())),
    )
    .await;

    Ok(HttpResponse::Created().json(SessionResponse::new(session, Utc::now())))
}

pub async fn get_session(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let session = visible_session(&state.pool, &user, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(SessionResponse::new(session, Utc::now())))
}

pub async fn update_session(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<UpdateSessionRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    body.validate()?;
    let session = visible_session(&state.pool, &user, path.into_inner()).await?;
    if session.provider_id != user.id {
        return Err(ApiError::Forbidden("Only the session provider can modify it".to_string()));
    }

    let start = body.scheduled_start.unwrap_or(session.scheduled_start);
    let end = body.scheduled_end.unwrap_or(session.scheduled_end);
    if end <= start {
        return Err(ApiError::field("scheduled_end", "End time must be after start time."));
    }

    let updated: TelehealthSession = sqlx::query_as(
        "UPDATE telehealth_sessions SET
            scheduled_start = $2,
            scheduled_end = $3,
            notes = COALESCE($4, notes),
            recording_enabled = COALESCE($5, recording_enabled),
            connection_quality = COALESCE($6, connection_quality),
            technical_issues = COALESCE($7, technical_issues),
            updated_at = now()
         WHERE id = $1 RETURNING *",
    )
    .bind(session.id)
    .bind(start)
    .bind(end)
    .bind(&body.notes)
    .bind(body.recording_enabled)
    .bind(&body.connection_quality)
    .bind(&body.technical_issues)
    .fetch_one(&state.pool)
    .await?;

    Ok(HttpResponse::Ok().json(SessionResponse::new(updated, Utc::now())))
}

pub async fn delete_session(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let session = visible_session(&state.pool, &user, path.into_inner()).await?;
    if session.provider_id != user.id {
        return Err(ApiError::Forbidden("Only the session provider can delete it".to_string()));
    }
    if session.is_active() {
        return Err(ApiError::BadRequest("End the session before deleting it".to_string()));
    }

    sqlx::query("DELETE FROM telehealth_sessions WHERE id = $1")
        .bind(session.id)
        .execute(&state.pool)
        .await?;

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::DataModify,
        "Telehealth session deleted",
        Some(("telehealth_session", session.id.to_string())),
    )
    .await;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn join_session(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let mut session = visible_session(&state.pool, &user, path.into_inner()).await?;

    let Some(member) = participant(&state.pool, session.id, user.id).await? else {
        return Err(ApiError::BadRequest("User is not authorized to join this session".to_string()));
    };
    if session.status.is_terminal() {
        return Err(ApiError::BadRequest(format!("Cannot join a session that is {}", session.status)));
    }

    let waiting: Option<TelehealthSession> = sqlx::query_as(
        "UPDATE telehealth_sessions SET status = 'waiting', updated_at = now()
         WHERE id = $1 AND status = 'scheduled' RETURNING *",
    )
    .bind(session.id)
    .fetch_optional(&state.pool)
    .await?;
    if let Some(waiting) = waiting {
        session = waiting;
    }

    let join_info = state.telehealth.join_info(&session, &member, &user);
    sqlx::query(
        "UPDATE telehealth_participants SET joined_at = now(), left_at = NULL, connection_id = $2
         WHERE id = $1",
    )
    .bind(member.id)
    .bind(join_info.connection_id())
    .execute(&state.pool)
    .await?;

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::DataAccess,
        "Joined telehealth session",
        Some(("telehealth_session", session.id.to_string())),
    )
    .await;

    Ok(HttpResponse::Ok().json(json!({
        "session": SessionResponse::new(session, Utc::now()),
        "join_info": join_info,
    })))
}

pub async fn leave_session(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let session = visible_session(&state.pool, &user, path.into_inner()).await?;

    if participant(&state.pool, session.id, user.id).await?.is_none() {
        return Err(ApiError::BadRequest("User is not a participant in this session".to_string()));
    }

    let mut tx = state.pool.begin().await?;
    sqlx::query(
        "UPDATE telehealth_participants SET left_at = now()
         WHERE session_id = $1 AND user_id = $2 AND left_at IS NULL",
    )
    .bind(session.id)
    .bind(user.id)
    .execute(&mut *tx)
    .await?;

    // The last one out ends the call.
    let ended: Option<TelehealthSession> = sqlx::query_as(
        "UPDATE telehealth_sessions SET status = 'ended', actual_end = now(), updated_at = now()
         WHERE id = $1 AND status IN ('waiting', 'active')
           AND NOT EXISTS (SELECT 1 FROM telehealth_participants WHERE session_id = $1 AND left_at IS NULL)
         RETURNING *",
    )
    .bind(session.id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;

    let session = ended.unwrap_or(session);
    Ok(HttpResponse::Ok().json(json!({
        "message": "Left session successfully",
        "session": SessionResponse::new(session, Utc::now()),
    })))
}

pub async fn start_session(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let session = visible_session(&state.pool, &user, path.into_inner()).await?;
    require_moderator(&state.pool, session.id, user.id).await?;

    let started: Option<TelehealthSession> = sqlx::query_as(
        "UPDATE telehealth_sessions SET status = 'active', actual_start = COALESCE(actual_start, now()),
            updated_at = now()
         WHERE id = $1 AND status IN ('scheduled', 'waiting') RETURNING *",
    )
    .bind(session.id)
    .fetch_optional(&state.pool)
    .await?;

    let Some(started) = started else {
        return Err(ApiError::BadRequest(format!("Cannot start a session that is {}", session.status)));
    };

    info!(session = %started.session_id, "Telehealth session started");
    Ok(HttpResponse::Ok().json(SessionResponse::new(started, Utc::now())))
}

pub async fn end_session(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let session = visible_session(&state.pool, &user, path.into_inner()).await?;
    require_moderator(&state.pool, session.id, user.id).await?;

    let mut tx = state.pool.begin().await?;
    let ended: Option<TelehealthSession> = sqlx::query_as(
        "UPDATE telehealth_sessions SET status = 'ended', actual_end = now(), updated_at = now()
         WHERE id = $1 AND status IN ('active', 'waiting') RETURNING *",
    )
    .bind(session.id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(ended) = ended else {
        return Err(ApiError::BadRequest(format!("Cannot end a session that is {}", session.status)));
    };

    sqlx::query("UPDATE telehealth_participants SET left_at = now() WHERE session_id = $1 AND left_at IS NULL")
        .bind(ended.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    info!(session = %ended.session_id, minutes = ?ended.duration_minutes(), "Telehealth session ended");
    Ok(HttpResponse::Ok().json(SessionResponse::new(ended, Utc::now())))
}

// ============ Device tests ============

pub async fn list_device_tests(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let tests: Vec<DeviceTest> =
        sqlx::query_as("SELECT * FROM telehealth_device_tests WHERE user_id = $1 ORDER BY tested_at DESC")
            .bind(user.id)
            .fetch_all(&state.pool)
            .await?;
    Ok(HttpResponse::Ok().json(tests))
}

pub async fn create_device_test(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateDeviceTestRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    body.validate()?;

    let session_row = match body.session_id {
        Some(public_id) => Some(
            participating_session(&state.pool, public_id, user.id)
                .await?
                .ok_or_else(|| ApiError::field("session_id", "User is not a participant in this session."))?,
        ),
        None => None,
    };

    let details = if body.details.is_null() { json!({}) } else { body.details.clone() };

    let test: DeviceTest = sqlx::query_as(
        "INSERT INTO telehealth_device_tests (user_id, session_id, test_type, test_result, details,
            error_message, upload_speed_mbps, download_speed_mbps, latency_ms, packet_loss_percent)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING *",
    )
    .bind(user.id)
    .bind(session_row)
    .bind(body.test_type)
    .bind(body.test_result)
    .bind(&details)
    .bind(&body.error_message)
    .bind(body.upload_speed_mbps)
    .bind(body.download_speed_mbps)
    .bind(body.latency_ms)
    .bind(body.packet_loss_percent)
    .fetch_one(&state.pool)
    .await?;

    Ok(HttpResponse::Created().json(test))
}

/// Worst result wins: any fail fails, any warning warns.
fn overall_status(results: &[DeviceTest]) -> DeviceTestResult {
    if results.iter().any(|t| t.test_result == DeviceTestResult::Fail) {
        DeviceTestResult::Fail
    } else if results.iter().any(|t| t.test_result == DeviceTestResult::Warning) {
        DeviceTestResult::Warning
    } else {
        DeviceTestResult::Pass
    }
}

pub async fn run_full_test(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: Option<web::Json<RunFullTestRequest>>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;

    let session_row = match body.and_then(|b| b.into_inner().session_id) {
        Some(public_id) => participating_session(&state.pool, public_id, user.id).await?,
        None => None,
    };

    let mut tx = state.pool.begin().await?;
    let mut results = Vec::with_capacity(3);

    for (test_type, details) in [
        (DeviceTestType::Microphone, json!({"audio_level": 0.8, "noise_level": 0.1})),
        (DeviceTestType::Camera, json!({"resolution": "1280x720", "fps": 30})),
    ] {
        let test: DeviceTest = sqlx::query_as(
            "INSERT INTO telehealth_device_tests (user_id, session_id, test_type, test_result, details)
             VALUES ($1, $2, $3, 'pass', $4) RETURNING *",
        )
        .bind(user.id)
        .bind(session_row)
        .bind(test_type)
        .bind(&details)
        .fetch_one(&mut *tx)
        .await?;
        results.push(test);
    }

    let network: DeviceTest = sqlx::query_as(
        "INSERT INTO telehealth_device_tests (user_id, session_id, test_type, test_result, details,
            upload_speed_mbps, download_speed_mbps, latency_ms, packet_loss_percent)
         VALUES ($1, $2, 'network', 'pass', $3, 25.5, 50.2, 45, 0.1) RETURNING *",
    )
    .bind(user.id)
    .bind(session_row)
    .bind(json!({"connection_type": "wifi", "signal_strength": "excellent"}))
    .fetch_one(&mut *tx)
    .await?;
    results.push(network);
    tx.commit().await?;

    Ok(HttpResponse::Ok().json(FullTestReport {
        message: "Device tests completed".to_string(),
        overall_status: overall_status(&results),
        results,
    }))
}

// ============ Signaling ============

/// Restricts to sessions the user takes part in, optionally narrowed to
/// one session by its public id.
fn push_signal_scope(qb: &mut QueryBuilder<'_, Postgres>, user_id: Uuid, public_session: Option<Uuid>) {
    qb.push(" AND session_id IN (SELECT session_id FROM telehealth_participants WHERE user_id = ")
        .push_bind(user_id)
        .push(")");
    if let Some(public_id) = public_session {
        qb.push(" AND session_id = (SELECT id FROM telehealth_sessions WHERE session_id = ")
            .push_bind(public_id)
            .push(")");
    }
}

fn signal_list_query(user_id: Uuid, public_session: Option<Uuid>) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("SELECT * FROM webrtc_signaling WHERE (sender_id = ");
    qb.push_bind(user_id);
    qb.push(" OR receiver_id = ").push_bind(user_id);
    qb.push(" OR receiver_id IS NULL)");
    push_signal_scope(&mut qb, user_id, public_session);
    qb.push(" ORDER BY created_at DESC");
    qb
}

/// Unprocessed signals addressed to the user or broadcast by someone else,
/// flagged processed by the same statement that returns them.
fn pending_signal_query(user_id: Uuid, public_session: Option<Uuid>) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(
        "UPDATE webrtc_signaling SET processed = TRUE WHERE id IN (
            SELECT id FROM webrtc_signaling WHERE NOT processed AND (receiver_id = ",
    );
    qb.push_bind(user_id);
    qb.push(" OR (receiver_id IS NULL AND sender_id <> ").push_bind(user_id);
    qb.push("))");
    push_signal_scope(&mut qb, user_id, public_session);
    qb.push(" FOR UPDATE SKIP LOCKED) RETURNING *");
    qb
}

pub async fn list_signals(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<SignalQuery>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let signals: Vec<WebRtcSignal> = signal_list_query(user.id, query.session_id)
        .build_query_as()
        .fetch_all(&state.pool)
        .await?;
    Ok(HttpResponse::Ok().json(signals))
}

pub async fn create_signal(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateSignalRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let Some(session_row) = participating_session(&state.pool, body.session_id, user.id).await? else {
        return Err(ApiError::BadRequest("User is not a participant in this session".to_string()));
    };

    let signal: WebRtcSignal = sqlx::query_as(
        "INSERT INTO webrtc_signaling (session_id, sender_id, receiver_id, message_type, message_data)
         VALUES ($1, $2, $3, $4, $5) RETURNING *",
    )
    .bind(session_row)
    .bind(user.id)
    .bind(body.receiver_id)
    .bind(body.message_type)
    .bind(&body.message_data)
    .fetch_one(&state.pool)
    .await?;

    Ok(HttpResponse::Created().json(signal))
}

pub async fn pending_signals(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<SignalQuery>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let mut signals: Vec<WebRtcSignal> = pending_signal_query(user.id, query.session_id)
        .build_query_as()
        .fetch_all(&state.pool)
        .await?;
    signals.sort_by_key(|s| s.created_at);
    Ok(HttpResponse::Ok().json(signals))
}

// ============ Recordings ============

fn recording_query(user: &User) -> Option<QueryBuilder<'static, Postgres>> {
    let mut qb = QueryBuilder::new(
        "SELECT * FROM telehealth_recordings WHERE session_id IN (SELECT id FROM telehealth_sessions WHERE TRUE",
    );
    if !push_session_scope(&mut qb, user) {
        return None;
    }
    qb.push(")");
    Some(qb)
}

async fn visible_recording(pool: &PgPool, user: &User, id: Uuid) -> ApiResult<Recording> {
    let Some(mut qb) = recording_query(user) else {
        return Err(ApiError::NotFound);
    };
    qb.push(" AND id = ").push_bind(id);
    found(qb.build_query_as().fetch_optional(pool).await?)
}

pub async fn list_recordings(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let recordings: Vec<Recording> = match recording_query(&user) {
        Some(mut qb) => {
            qb.push(" AND status = 'completed' ORDER BY created_at DESC");
            qb.build_query_as().fetch_all(&state.pool).await?
        }
        None => Vec::new(),
    };
    Ok(HttpResponse::Ok().json(recordings))
}

pub async fn get_recording(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    Ok(HttpResponse::Ok().json(visible_recording(&state.pool, &user, path.into_inner()).await?))
}

pub async fn recording_download_url(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let recording = visible_recording(&state.pool, &user, path.into_inner()).await?;

    if recording.status != RecordingStatus::Completed {
        return Err(ApiError::BadRequest("Recording is not ready for download".to_string()));
    }
    if recording.zoom_download_url.is_empty() {
        return Err(ApiError::BadRequest("Recording has no downloadable file".to_string()));
    }

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::Export,
        "Recording download link issued",
        Some(("telehealth_recording", recording.id.to_string())),
    )
    .await;

    Ok(HttpResponse::Ok().json(RecordingDownload {
        download_url: recording.zoom_download_url.clone(),
        expires_at: recording.expires_at,
        file_size_mb: recording.file_size_mb(),
    }))
}

// ============ Waiting rooms ============

const WAITING_ROOM_SELECT: &str = "SELECT w.*,
        (SELECT COUNT(*) FROM waiting_room_participants p
         WHERE p.waiting_room_id = w.id AND p.admitted_at IS NULL
           AND p.denied_at IS NULL AND p.left_at IS NULL) AS waiting_participants_count
     FROM telehealth_waiting_rooms w
     JOIN telehealth_sessions s ON s.id = w.session_id";

/// Providers manage the rooms of their sessions; others see rooms of
/// sessions where they are the patient.
fn waiting_room_query(user: &User) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(WAITING_ROOM_SELECT);
    if user.user_type.is_clinical_staff() {
        qb.push(" WHERE s.provider_id = ").push_bind(user.id);
    } else {
        qb.push(" WHERE s.patient_id = ").push_bind(user.id);
    }
    qb
}

async fn visible_waiting_room(pool: &PgPool, user: &User, id: Uuid) -> ApiResult<WaitingRoom> {
    let mut qb = waiting_room_query(user);
    qb.push(" AND w.id = ").push_bind(id);
    found(qb.build_query_as().fetch_optional(pool).await?)
}

pub async fn list_waiting_rooms(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let mut qb = waiting_room_query(&user);
    qb.push(" ORDER BY w.created_at DESC");
    let rooms: Vec<WaitingRoom> = qb.build_query_as().fetch_all(&state.pool).await?;
    Ok(HttpResponse::Ok().json(rooms))
}

pub async fn get_waiting_room(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    Ok(HttpResponse::Ok().json(visible_waiting_room(&state.pool, &user, path.into_inner()).await?))
}

pub async fn enter_waiting_room(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let room_id = path.into_inner();

    let status: Option<SessionStatus> = sqlx::query_scalar(
        "SELECT s.status FROM telehealth_waiting_rooms w
         JOIN telehealth_sessions s ON s.id = w.session_id
         JOIN telehealth_participants p ON p.session_id = s.id
         WHERE w.id = $1 AND w.is_enabled AND p.user_id = $2",
    )
    .bind(room_id)
    .bind(user.id)
    .fetch_optional(&state.pool)
    .await?;

    match status {
        None => return Err(ApiError::NotFound),
        Some(status) if status.is_terminal() => {
            return Err(ApiError::BadRequest(format!("Cannot wait for a session that is {}", status)));
        }
        Some(_) => {}
    }

    let entry: WaitingRoomParticipant = sqlx::query_as(
        "INSERT INTO waiting_room_participants (waiting_room_id, participant_id)
         VALUES ($1, $2)
         ON CONFLICT (waiting_room_id, participant_id)
         DO UPDATE SET left_at = NULL, joined_waiting_at = now()
         RETURNING *",
    )
    .bind(room_id)
    .bind(user.id)
    .fetch_one(&state.pool)
    .await?;

    Ok(HttpResponse::Ok().json(entry))
}

async fn decide_participant(
    state: &AppState,
    user: &User,
    room_id: Uuid,
    participant_id: Uuid,
    denial: Option<&str>,
) -> ApiResult<HttpResponse> {
    if !user.user_type.is_clinical_staff() {
        return Err(ApiError::NotFound);
    }
    let room = visible_waiting_room(&state.pool, user, room_id).await?;

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE waiting_room_participants SET ");
    match denial {
        Some(reason) => {
            qb.push("denied_at = now(), denial_reason = ").push_bind(reason.to_string());
        }
        None => {
            qb.push("admitted_at = now()");
        }
    }
    qb.push(" WHERE waiting_room_id = ").push_bind(room.id);
    qb.push(" AND participant_id = ").push_bind(participant_id);
    qb.push(" AND admitted_at IS NULL AND denied_at IS NULL RETURNING *");

    let decided: Option<WaitingRoomParticipant> = qb.build_query_as().fetch_optional(&state.pool).await?;
    if decided.is_none() {
        return Ok(HttpResponse::NotFound().json(json!({
            "error": "Participant not found in waiting room"
        })));
    }

    let message = if denial.is_some() {
        "Participant denied access"
    } else {
        "Participant admitted to session"
    };
    Ok(HttpResponse::Ok().json(json!({ "message": message })))
}

pub async fn admit_participant(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<AdmitRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    decide_participant(&state, &user, path.into_inner(), body.participant_id, None).await
}

pub async fn deny_participant(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<DenyRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    decide_participant(&state, &user, path.into_inner(), body.participant_id, Some(&body.reason)).await
}

// ============ Clinic settings ============

pub async fn get_clinic_settings(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    authenticate(&req, &state).await?;
    Ok(HttpResponse::Ok().json(clinic_settings(&state).await?))
}

pub async fn update_clinic_settings(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<UpdateClinicSettingsRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    if user.user_type != UserType::Admin {
        return Err(ApiError::Forbidden(
            "Only administrators can modify clinic settings".to_string(),
        ));
    }
    body.validate()?;

    let mut tx = state.pool.begin().await?;
    sqlx::query("INSERT INTO clinic_settings (id) VALUES (1) ON CONFLICT (id) DO NOTHING")
        .execute(&mut *tx)
        .await?;
    let current: ClinicSettings = sqlx::query_as("SELECT * FROM clinic_settings WHERE id = 1 FOR UPDATE")
        .fetch_one(&mut *tx)
        .await?;

    let changes = settings_changes(&current, &body);

    let updated: ClinicSettings = sqlx::query_as(
        "UPDATE clinic_settings SET
            clinic_name = COALESCE($1, clinic_name),
            default_telehealth_tier = COALESCE($2, default_telehealth_tier),
            enable_fallback_to_webrtc = COALESCE($3, enable_fallback_to_webrtc),
            enable_patient_choice = COALESCE($4, enable_patient_choice),
            enable_bandwidth_detection = COALESCE($5, enable_bandwidth_detection),
            minimum_bandwidth_for_zoom = COALESCE($6, minimum_bandwidth_for_zoom),
            enable_high_contrast_mode = COALESCE($7, enable_high_contrast_mode),
            default_language = COALESCE($8, default_language),
            last_modified_by = $9,
            updated_at = now()
         WHERE id = 1 RETURNING *",
    )
    .bind(&body.clinic_name)
    .bind(body.default_telehealth_tier)
    .bind(body.enable_fallback_to_webrtc)
    .bind(body.enable_patient_choice)
    .bind(body.enable_bandwidth_detection)
    .bind(body.minimum_bandwidth_for_zoom)
    .bind(body.enable_high_contrast_mode)
    .bind(body.default_language)
    .bind(user.id)
    .fetch_one(&mut *tx)
    .await?;

    let ip = client_ip(&req);
    let agent = user_agent(&req);
    for (change_type, old_value, new_value) in &changes {
        sqlx::query(
            "INSERT INTO telehealth_tier_audit_logs (change_type, user_id, old_value, new_value,
                ip_address, user_agent, reason)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(change_type)
        .bind(user.id)
        .bind(old_value)
        .bind(new_value)
        .bind(&ip)
        .bind(&agent)
        .bind(&body.reason)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    if let Err(e) = state.redis.write().await.invalidate_clinic_settings().await {
        warn!(error = %e, "Failed to invalidate clinic settings cache");
    }

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::AdminAction,
        "Clinic telehealth settings updated",
        Some(("clinic_settings", "1".to_string())),
    )
    .await;
    info!(changes = changes.len(), "Clinic settings updated");

    Ok(HttpResponse::Ok().json(updated))
}

pub async fn tier_audit_logs(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    if user.user_type != UserType::Admin {
        return Err(ApiError::Forbidden("Only administrators can view audit logs".to_string()));
    }

    let logs: Vec<TierAuditLog> =
        sqlx::query_as("SELECT * FROM telehealth_tier_audit_logs ORDER BY timestamp DESC LIMIT $1")
            .bind(AUDIT_LOG_PAGE)
            .fetch_all(&state.pool)
            .await?;
    Ok(HttpResponse::Ok().json(logs))
}

pub async fn tier_preview(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    authenticate(&req, &state).await?;
    let settings = clinic_settings(&state).await?;

    let analytics: Option<UsageAnalytics> =
        sqlx::query_as("SELECT * FROM telehealth_usage_analytics ORDER BY date DESC LIMIT 1")
            .fetch_optional(&state.pool)
            .await?;

    Ok(HttpResponse::Ok().json(TierPreviewResponse {
        current_tier: settings.default_telehealth_tier,
        tiers: tier_previews(),
        recommendation: recommend_tier(analytics.as_ref()),
        analytics_date: analytics.map(|a| a.date),
    }))
}

fn permissions_for(user: &User) -> TelehealthPermissions {
    let is_admin = user.user_type == UserType::Admin;
    let mut available_platforms = vec![Platform::WebRtc, Platform::Jitsi];
    if user.can_use_zoom() {
        available_platforms.push(Platform::Zoom);
    }

    TelehealthPermissions {
        can_modify_clinic_settings: is_admin,
        can_view_audit_logs: is_admin,
        can_use_zoom: user.can_use_zoom(),
        can_create_sessions: user.user_type.is_clinical_staff(),
        available_platforms,
        user_type: user.user_type,
        subscription_tier: user.subscription_tier,
    }
}

pub async fn user_permissions(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    Ok(HttpResponse::Ok().json(permissions_for(&user)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(user_type: UserType, tier: SubscriptionTier) -> User {
        let now = Utc::now();
        User {
            id: Uuid::new_v4(),
            username: "u".into(),
            email: "u@example.com".into(),
            password_hash: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            user_type,
            subscription_tier: tier,
            phone_number: String::new(),
            date_of_birth: None,
            patient_id: None,
            provider_id: None,
            language_preference: "en".into(),
            timezone: "UTC".into(),
            biometric_enabled: false,
            two_factor_enabled: false,
            is_verified: true,
            is_active: true,
            failed_login_attempts: 0,
            locked_until: None,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn device_test(result: DeviceTestResult) -> DeviceTest {
        DeviceTest {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            session_id: None,
            test_type: DeviceTestType::Network,
            test_result: result,
            details: json!({}),
            error_message: String::new(),
            upload_speed_mbps: None,
            download_speed_mbps: None,
            latency_ms: None,
            packet_loss_percent: None,
            tested_at: Utc::now(),
        }
    }

    #[test]
    fn test_session_scope_by_role() {
        let patient = session_query(&user(UserType::Patient, SubscriptionTier::Free)).unwrap();
        assert!(patient.sql().ends_with("AND patient_id = $1"));

        let provider = session_query(&user(UserType::Provider, SubscriptionTier::Free)).unwrap();
        assert!(provider
            .sql()
            .contains("(provider_id = $1 OR id IN (SELECT session_id FROM telehealth_participants WHERE user_id = $2))"));

        assert!(session_query(&user(UserType::Admin, SubscriptionTier::Enterprise)).is_none());
        assert!(recording_query(&user(UserType::Admin, SubscriptionTier::Free)).is_none());
    }

    #[test]
    fn test_waiting_room_scope() {
        let staff = waiting_room_query(&user(UserType::CareTeam, SubscriptionTier::Free));
        assert!(staff.sql().ends_with("WHERE s.provider_id = $1"));
        let patient = waiting_room_query(&user(UserType::Patient, SubscriptionTier::Free));
        assert!(patient.sql().ends_with("WHERE s.patient_id = $1"));
    }

    #[test]
    fn test_overall_status_takes_worst_result() {
        assert_eq!(overall_status(&[]), DeviceTestResult::Pass);
        assert_eq!(
            overall_status(&[device_test(DeviceTestResult::Pass), device_test(DeviceTestResult::Warning)]),
            DeviceTestResult::Warning
        );
        assert_eq!(
            overall_status(&[device_test(DeviceTestResult::Warning), device_test(DeviceTestResult::Fail)]),
            DeviceTestResult::Fail
        );
    }

    #[test]
    fn test_permissions() {
        let admin = permissions_for(&user(UserType::Admin, SubscriptionTier::Free));
        assert!(admin.can_modify_clinic_settings);
        assert!(!admin.can_create_sessions);
        assert_eq!(admin.available_platforms, vec![Platform::WebRtc, Platform::Jitsi]);

        let provider = permissions_for(&user(UserType::Provider, SubscriptionTier::Premium));
        assert!(provider.can_create_sessions);
        assert!(provider.can_use_zoom);
        assert!(provider.available_platforms.contains(&Platform::Zoom));
        assert!(!provider.can_view_audit_logs);
    }

    #[test]
    fn test_signal_queries() {
        let user_id = Uuid::new_v4();
        let list = signal_list_query(user_id, Some(Uuid::new_v4()));
        assert!(list.sql().contains("(sender_id = $1 OR receiver_id = $2 OR receiver_id IS NULL)"));
        assert!(list.sql().contains("(SELECT id FROM telehealth_sessions WHERE session_id = $4)"));

        let pending = pending_signal_query(user_id, None);
        assert!(pending.sql().contains("receiver_id IS NULL AND sender_id <> $2"));
        assert!(pending.sql().ends_with("FOR UPDATE SKIP LOCKED) RETURNING *"));
    }
}
