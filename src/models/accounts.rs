use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

crate::text_enum! {
    pub enum UserType {
        Patient => "patient",
        Provider => "provider",
        Admin => "admin",
        CareTeam => "care_team",
    }
}

crate::text_enum! {
    pub enum SubscriptionTier {
        Free => "free",
        Basic => "basic",
        Premium => "premium",
        Enterprise => "enterprise",
    }
}

crate::text_enum! {
    pub enum AuditAction {
        Login => "login",
        Logout => "logout",
        DataAccess => "data_access",
        DataModify => "data_modify",
        Export => "export",
        AdminAction => "admin_action",
    }
}

impl UserType {
    /// Providers and care team members see every patient's chart.
    pub fn is_clinical_staff(&self) -> bool {
        matches!(self, UserType::Provider | UserType::CareTeam)
    }
}

impl SubscriptionTier {
    pub fn is_paid(&self) -> bool {
        matches!(self, SubscriptionTier::Premium | SubscriptionTier::Enterprise)
    }
}

// ============ User Models ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub user_type: UserType,
    pub subscription_tier: SubscriptionTier,
    pub phone_number: String,
    pub date_of_birth: Option<NaiveDate>,
    pub patient_id: Option<String>,
    pub provider_id: Option<String>,
    pub language_preference: String,
    pub timezone: String,
    pub biometric_enabled: bool,
    pub two_factor_enabled: bool,
    pub is_verified: bool,
    pub is_active: bool,
    #[serde(skip_serializing)]
    pub failed_login_attempts: i32,
    #[serde(skip_serializing)]
    pub locked_until: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_string()
    }

    /// Zoom-backed telehealth is reserved for paid tiers.
    pub fn can_use_zoom(&self) -> bool {
        self.subscription_tier.is_paid()
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.map(|until| until > now).unwrap_or(false)
    }
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub user_type: UserType,
    pub subscription_tier: SubscriptionTier,
    pub phone_number: String,
    pub date_of_birth: Option<NaiveDate>,
    pub language_preference: String,
    pub timezone: String,
    pub biometric_enabled: bool,
    pub two_factor_enabled: bool,
    pub is_verified: bool,
    pub can_use_zoom: bool,
    pub date_joined: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl From<&User> for UserResponse {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            username: u.username.clone(),
            email: u.email.clone(),
            first_name: u.first_name.clone(),
            last_name: u.last_name.clone(),
            full_name: u.full_name(),
            user_type: u.user_type,
            subscription_tier: u.subscription_tier,
            phone_number: u.phone_number.clone(),
            date_of_birth: u.date_of_birth,
            language_preference: u.language_preference.clone(),
            timezone: u.timezone.clone(),
            biometric_enabled: u.biometric_enabled,
            two_factor_enabled: u.two_factor_enabled,
            is_verified: u.is_verified,
            can_use_zoom: u.can_use_zoom(),
            date_joined: u.created_at,
            last_login: u.last_login_at,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 1, max = 150, message = "This field may not be blank."))]
    pub username: String,
    #[validate(email(message = "Enter a valid email address."))]
    pub email: String,
    #[validate(length(min = 8, message = "This password is too short. It must contain at least 8 characters."))]
    pub password: String,
    pub password_confirm: String,
    #[serde(default)]
    #[validate(length(max = 150))]
    pub first_name: String,
    #[serde(default)]
    #[validate(length(max = 150))]
    pub last_name: String,
    pub user_type: Option<UserType>,
    #[serde(default)]
    pub phone_number: String,
    pub date_of_birth: Option<NaiveDate>,
    #[validate(length(max = 10))]
    pub language_preference: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, message = "This field may not be blank."))]
    pub username: String,
    #[validate(length(min = 1, message = "This field may not be blank."))]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogoutRequest {
    pub refresh: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateUserRequest {
    #[validate(email(message = "Enter a valid email address."))]
    pub email: Option<String>,
    #[validate(length(max = 150))]
    pub first_name: Option<String>,
    #[validate(length(max = 150))]
    pub last_name: Option<String>,
    pub phone_number: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    #[validate(length(max = 10))]
    pub language_preference: Option<String>,
    #[validate(length(max = 50))]
    pub timezone: Option<String>,
    pub biometric_enabled: Option<bool>,
    pub two_factor_enabled: Option<bool>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    #[validate(length(min = 8, message = "This password is too short. It must contain at least 8 characters."))]
    pub new_password: String,
    pub new_password_confirm: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user: UserResponse,
    pub tokens: TokenPair,
    pub message: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct PermissionsResponse {
    pub can_access_emr: bool,
    pub can_prescribe: bool,
    pub can_use_zoom: bool,
    pub can_export_data: bool,
    pub is_admin: bool,
    pub subscription_tier: SubscriptionTier,
    pub user_type: UserType,
}

impl From<&User> for PermissionsResponse {
    fn from(user: &User) -> Self {
        Self {
            can_access_emr: matches!(user.user_type, UserType::Provider | UserType::Admin),
            can_prescribe: user.user_type == UserType::Provider,
            can_use_zoom: user.can_use_zoom(),
            can_export_data: user.subscription_tier.is_paid(),
            is_admin: user.user_type == UserType::Admin,
            subscription_tier: user.subscription_tier,
            user_type: user.user_type,
        }
    }
}

// ============ Profile Models ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub medical_record_number: String,
    pub emergency_contact_name: String,
    pub emergency_contact_phone: String,
    pub allergies: String,
    pub medications: String,
    pub license_number: String,
    pub specialty: String,
    pub institution: String,
    pub bio: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct UserProfileResponse {
    #[serde(flatten)]
    pub profile: UserProfile,
    pub user: UserResponse,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateProfileRequest {
    #[validate(length(max = 50))]
    pub medical_record_number: Option<String>,
    #[validate(length(max = 100))]
    pub emergency_contact_name: Option<String>,
    #[validate(length(max = 20))]
    pub emergency_contact_phone: Option<String>,
    pub allergies: Option<String>,
    pub medications: Option<String>,
    #[validate(length(max = 50))]
    pub license_number: Option<String>,
    #[validate(length(max = 100))]
    pub specialty: Option<String>,
    #[validate(length(max = 200))]
    pub institution: Option<String>,
    #[validate(length(max = 500))]
    pub bio: Option<String>,
}

// ============ Audit Log Models ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AuditLog {
    pub id: i64,
    pub user_id: Uuid,
    pub action_type: AuditAction,
    pub action_description: String,
    pub ip_address: String,
    pub user_agent: String,
    pub resource_type: String,
    pub resource_id: String,
    pub created_at: DateTime<Utc>,
}

// ============ JWT Claims ============

crate::text_enum! {
    pub enum TokenType {
        Access => "access",
        Refresh => "refresh",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,  // username
    pub user_id: Uuid,
    pub user_type: UserType,
    pub token_type: TokenType,
    pub exp: i64,     // expiration timestamp
    pub iat: i64,     // issued at
    pub jti: Uuid,    // JWT ID (for revocation)
}
