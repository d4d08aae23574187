use super::{authenticate, authenticate_with_claims, record_audit, AppState};
use crate::auth::{hash_password, verify_password};
use crate::error::{ApiError, ApiResult};
use crate::metrics::AUTH_ATTEMPTS_TOTAL;
use crate::models::*;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;
use validator::Validate;

const MAX_FAILED_LOGINS: i32 = 5;
const LOCKOUT_MINUTES: i32 = 15;

lazy_static! {
    static ref PHONE_RE: Regex = Regex::new(r"^\+?1?\d{9,15}$").unwrap();
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/register", web::post().to(register))
        .route("/login", web::post().to(login))
        .route("/token/refresh", web::post().to(refresh_token))
        .route("/logout", web::post().to(logout))
        .service(
            web::resource("/profile")
                .route(web::get().to(get_profile))
                .route(web::put().to(update_profile))
                .route(web::patch().to(update_profile)),
        )
        .service(
            web::resource("/user")
                .route(web::get().to(get_user))
                .route(web::put().to(update_user))
                .route(web::patch().to(update_user)),
        )
        .route("/change-password", web::post().to(change_password))
        .route("/permissions", web::get().to(permissions));
}

/// Password rules beyond the length check carried by the request types.
fn check_new_password(field: &str, password: &str, confirm: &str) -> ApiResult<()> {
    if password.chars().all(|c| c.is_ascii_digit()) {
        return Err(ApiError::field(field, "This password is entirely numeric."));
    }
    if password != confirm {
        return Err(ApiError::field(field, "Password fields didn't match."));
    }
    Ok(())
}

fn check_phone(phone: &str) -> ApiResult<()> {
    if !phone.is_empty() && !PHONE_RE.is_match(phone) {
        return Err(ApiError::field(
            "phone_number",
            "Phone number must be entered in the format: '+999999999'. Up to 15 digits allowed.",
        ));
    }
    Ok(())
}

fn invalid_credentials() -> ApiError {
    ApiError::field("non_field_errors", "Invalid credentials.")
}

async fn email_taken(state: &AppState, email: &str, except: Option<uuid::Uuid>) -> ApiResult<bool> {
    let taken = sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS(SELECT 1 FROM users WHERE email = $1 AND ($2::uuid IS NULL OR id <> $2))",
    )
    .bind(email)
    .bind(except)
    .fetch_one(&state.pool)
    .await?;
    Ok(taken)
}

// ============ Registration & Login ============

pub async fn register(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<RegisterRequest>,
) -> ApiResult<HttpResponse> {
    let body = body.into_inner();
    body.validate()?;
    check_new_password("password", &body.password, &body.password_confirm)?;
    check_phone(&body.phone_number)?;

    let user_type = body.user_type.unwrap_or(UserType::Patient);
    if user_type == UserType::Admin {
        return Err(ApiError::field("user_type", "Administrator accounts cannot self-register."));
    }

    let username = body.username.trim().to_string();
    let email = body.email.trim().to_lowercase();

    let username_taken = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM users WHERE username = $1)")
        .bind(&username)
        .fetch_one(&state.pool)
        .await?;
    if username_taken {
        return Err(ApiError::field("username", "A user with that username already exists."));
    }
    if email_taken(&state, &email, None).await? {
        return Err(ApiError::field("email", "A user with this email already exists."));
    }

    let password_hash = hash_password(&body.password)?;

    let mut tx = state.pool.begin().await?;
    let user: User = sqlx::query_as(
        "INSERT INTO users (username, email, password_hash, first_name, last_name, user_type,
            phone_number, date_of_birth, language_preference)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING *",
    )
    .bind(&username)
    .bind(&email)
    .bind(&password_hash)
    .bind(body.first_name.trim())
    .bind(body.last_name.trim())
    .bind(user_type)
    .bind(&body.phone_number)
    .bind(body.date_of_birth)
    .bind(body.language_preference.as_deref().unwrap_or("en"))
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("INSERT INTO user_profiles (user_id) VALUES ($1)")
        .bind(user.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    let tokens = state.jwt_auth.generate_pair(&user)?;
    record_audit(&state.pool, &req, user.id, AuditAction::Login, "User registered and logged in", None).await;

    Ok(HttpResponse::Created().json(AuthResponse {
        user: UserResponse::from(&user),
        tokens,
        message: "Registration successful".to_string(),
    }))
}

pub async fn login(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<LoginRequest>,
) -> ApiResult<HttpResponse> {
    body.validate()?;

    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE username = $1")
        .bind(body.username.trim())
        .fetch_optional(&state.pool)
        .await?;

    let Some(user) = user else {
        AUTH_ATTEMPTS_TOTAL.with_label_values(&["failure"]).inc();
        return Err(invalid_credentials());
    };

    if user.is_locked(Utc::now()) {
        AUTH_ATTEMPTS_TOTAL.with_label_values(&["locked"]).inc();
        return Err(ApiError::Forbidden(
            "Account temporarily locked after repeated failed logins. Try again later.".to_string(),
        ));
    }

    if !verify_password(&body.password, &user.password_hash) {
        // The counter restarts once a lock is applied.
        sqlx::query(
            "UPDATE users SET
                locked_until = CASE WHEN failed_login_attempts + 1 >= $2
                    THEN now() + make_interval(mins => $3) ELSE locked_until END,
                failed_login_attempts = CASE WHEN failed_login_attempts + 1 >= $2
                    THEN 0 ELSE failed_login_attempts + 1 END
             WHERE id = $1",
        )
        .bind(user.id)
        .bind(MAX_FAILED_LOGINS)
        .bind(LOCKOUT_MINUTES)
        .execute(&state.pool)
        .await?;

        AUTH_ATTEMPTS_TOTAL.with_label_values(&["failure"]).inc();
        return Err(invalid_credentials());
    }

    if !user.is_active {
        AUTH_ATTEMPTS_TOTAL.with_label_values(&["failure"]).inc();
        return Err(ApiError::field("non_field_errors", "User account is disabled."));
    }

    let user: User = sqlx::query_as(
        "UPDATE users SET failed_login_attempts = 0, locked_until = NULL, last_login_at = now()
         WHERE id = $1 RETURNING *",
    )
    .bind(user.id)
    .fetch_one(&state.pool)
    .await?;

    let tokens = state.jwt_auth.generate_pair(&user)?;
    AUTH_ATTEMPTS_TOTAL.with_label_values(&["success"]).inc();
    record_audit(&state.pool, &req, user.id, AuditAction::Login, "User logged in", None).await;

    Ok(HttpResponse::Ok().json(AuthResponse {
        user: UserResponse::from(&user),
        tokens,
        message: "Login successful".to_string(),
    }))
}

pub async fn refresh_token(
    state: web::Data<AppState>,
    body: web::Json<RefreshRequest>,
) -> ApiResult<HttpResponse> {
    let invalid = || ApiError::Unauthorized("Token is invalid or expired".to_string());

    let claims = state
        .jwt_auth
        .validate_typed(&body.refresh, TokenType::Refresh)
        .map_err(|_| invalid())?;

    if state.jwt_auth.is_token_revoked(claims.jti, &state.pool).await? {
        return Err(invalid());
    }

    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE id = $1 AND is_active")
        .bind(claims.user_id)
        .fetch_optional(&state.pool)
        .await?;
    let user = user.ok_or_else(invalid)?;

    let access = state.jwt_auth.generate_access_token(&user)?;
    Ok(HttpResponse::Ok().json(json!({ "access": access })))
}

pub async fn logout(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: Option<web::Json<LogoutRequest>>,
) -> ApiResult<HttpResponse> {
    let (user, access_claims) = authenticate_with_claims(&req, &state).await?;

    if let Some(refresh) = body.and_then(|b| b.into_inner().refresh) {
        let claims = state
            .jwt_auth
            .validate_typed(&refresh, TokenType::Refresh)
            .ok()
            .filter(|c| c.user_id == user.id)
            .ok_or_else(|| ApiError::BadRequest("Invalid refresh token".to_string()))?;
        state.jwt_auth.revoke_token(&claims, &state.pool).await?;
    }
    state.jwt_auth.revoke_token(&access_claims, &state.pool).await?;

    record_audit(&state.pool, &req, user.id, AuditAction::Logout, "User logged out", None).await;
    Ok(HttpResponse::Ok().json(json!({ "message": "Successfully logged out." })))
}

// ============ Profile ============

async fn get_or_create_profile(state: &AppState, user: &User) -> ApiResult<UserProfile> {
    sqlx::query("INSERT INTO user_profiles (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
        .bind(user.id)
        .execute(&state.pool)
        .await?;

    let profile = sqlx::query_as("SELECT * FROM user_profiles WHERE user_id = $1")
        .bind(user.id)
        .fetch_one(&state.pool)
        .await?;
    Ok(profile)
}

pub async fn get_profile(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let profile = get_or_create_profile(&state, &user).await?;

    Ok(HttpResponse::Ok().json(UserProfileResponse {
        profile,
        user: UserResponse::from(&user),
    }))
}

pub async fn update_profile(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<UpdateProfileRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    body.validate()?;
    get_or_create_profile(&state, &user).await?;

    let profile: UserProfile = sqlx::query_as(
        "UPDATE user_profiles SET
            medical_record_number = COALESCE($2, medical_record_number),
            emergency_contact_name = COALESCE($3, emergency_contact_name),
            emergency_contact_phone = COALESCE($4, emergency_contact_phone),
            allergies = COALESCE($5, allergies),
            medications = COALESCE($6, medications),
            license_number = COALESCE($7, license_number),
            specialty = COALESCE($8, specialty),
            institution = COALESCE($9, institution),
            bio = COALESCE($10, bio),
            updated_at = now()
         WHERE user_id = $1 RETURNING *",
    )
    .bind(user.id)
    .bind(&body.medical_record_number)
    .bind(&body.emergency_contact_name)
    .bind(&body.emergency_contact_phone)
    .bind(&body.allergies)
    .bind(&body.medications)
    .bind(&body.license_number)
    .bind(&body.specialty)
    .bind(&body.institution)
    .bind(&body.bio)
    .fetch_one(&state.pool)
    .await?;

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::DataModify,
        "Profile updated",
        Some(("user_profile", user.id.to_string())),
    )
    .await;

    Ok(HttpResponse::Ok().json(UserProfileResponse {
        profile,
        user: UserResponse::from(&user),
    }))
}

// ============ Current User ============

pub async fn get_user(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    Ok(HttpResponse::Ok().json(UserResponse::from(&user)))
}

pub async fn update_user(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<UpdateUserRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    body.validate()?;
    if let Some(phone) = &body.phone_number {
        check_phone(phone)?;
    }

    let email = body.email.as_ref().map(|e| e.trim().to_lowercase());
    if let Some(email) = &email {
        if email_taken(&state, email, Some(user.id)).await? {
            return Err(ApiError::field("email", "A user with this email already exists."));
        }
    }

    let updated: User = sqlx::query_as(
        "UPDATE users SET
            email = COALESCE($2, email),
            first_name = COALESCE($3, first_name),
            last_name = COALESCE($4, last_name),
            phone_number = COALESCE($5, phone_number),
            date_of_birth = COALESCE($6, date_of_birth),
            language_preference = COALESCE($7, language_preference),
            timezone = COALESCE($8, timezone),
            biometric_enabled = COALESCE($9, biometric_enabled),
            two_factor_enabled = COALESCE($10, two_factor_enabled),
            updated_at = now()
         WHERE id = $1 RETURNING *",
    )
    .bind(user.id)
    .bind(&email)
    .bind(&body.first_name)
    .bind(&body.last_name)
    .bind(&body.phone_number)
    .bind(body.date_of_birth)
    .bind(&body.language_preference)
    .bind(&body.timezone)
    .bind(body.biometric_enabled)
    .bind(body.two_factor_enabled)
    .fetch_one(&state.pool)
    .await?;

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::DataModify,
        "User details updated",
        Some(("user", user.id.to_string())),
    )
    .await;

    Ok(HttpResponse::Ok().json(UserResponse::from(&updated)))
}

pub async fn change_password(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<ChangePasswordRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    body.validate()?;

    if !verify_password(&body.old_password, &user.password_hash) {
        return Err(ApiError::field("old_password", "Old password is incorrect."));
    }
    check_new_password("new_password", &body.new_password, &body.new_password_confirm)?;

    let password_hash = hash_password(&body.new_password)?;
    sqlx::query("UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1")
        .bind(user.id)
        .bind(&password_hash)
        .execute(&state.pool)
        .await?;

    record_audit(&state.pool, &req, user.id, AuditAction::AdminAction, "Password changed", None).await;
    Ok(HttpResponse::Ok().json(json!({ "message": "Password changed successfully." })))
}

pub async fn permissions(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    Ok(HttpResponse::Ok().json(PermissionsResponse::from(&user)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_rules() {
        assert!(check_new_password("password", "12345678", "12345678").is_err());
        assert!(check_new_password("password", "s3cure-pass", "s3cure-pas").is_err());
        assert!(check_new_password("password", "s3cure-pass", "s3cure-pass").is_ok());
    }

    #[test]
    fn test_mismatch_is_keyed_by_field() {
        match check_new_password("password", "abcdefgh", "abcdefgx") {
            Err(ApiError::Validation(body)) => {
                assert_eq!(body["password"][0], "Password fields didn't match.");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_phone_format() {
        assert!(check_phone("").is_ok());
        assert!(check_phone("+14155550123").is_ok());
        assert!(check_phone("415555012").is_ok());
        assert!(check_phone("555-0123").is_err());
        assert!(check_phone("+1234").is_err());
    }
}
