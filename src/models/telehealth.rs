use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

crate::text_enum! {
    pub enum Platform {
        WebRtc => "webrtc",
        Zoom => "zoom",
        Jitsi => "jitsi",
    }
}

crate::text_enum! {
    pub enum SessionStatus {
        Scheduled => "scheduled",
        Waiting => "waiting",
        Active => "active",
        Ended => "ended",
        Cancelled => "cancelled",
        Failed => "failed",
    }
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Cancelled | SessionStatus::Failed)
    }
}

crate::text_enum! {
    pub enum ParticipantRole {
        Patient => "patient",
        Provider => "provider",
        Observer => "observer",
        Interpreter => "interpreter",
    }
}

crate::text_enum! {
    pub enum SignalType {
        Offer => "offer",
        Answer => "answer",
        IceCandidate => "ice_candidate",
        Bye => "bye",
    }
}

crate::text_enum! {
    pub enum DeviceTestType {
        Microphone => "microphone",
        Camera => "camera",
        Speaker => "speaker",
        Network => "network",
        Bandwidth => "bandwidth",
    }
}

crate::text_enum! {
    pub enum DeviceTestResult {
        Pass => "pass",
        Fail => "fail",
        Warning => "warning",
    }
}

crate::text_enum! {
    pub enum RecordingStatus {
        Starting => "starting",
        Recording => "recording",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
}

crate::text_enum! {
    /// Clinic-wide default platform. Jitsi is never a clinic default.
    pub enum TelehealthTier {
        WebRtc => "webrtc",
        Zoom => "zoom",
    }
}

crate::text_enum! {
    pub enum ClinicLanguage {
        En => "en",
        Es => "es",
        Ur => "ur",
        Ar => "ar",
        Fr => "fr",
    }
}

crate::text_enum! {
    pub enum TierChangeType {
        TierChange => "tier_change",
        FallbackToggle => "fallback_toggle",
        PatientChoiceToggle => "patient_choice_toggle",
        BandwidthSetting => "bandwidth_setting",
        AccessibilityChange => "accessibility_change",
        LanguageChange => "language_change",
    }
}

// ============ Sessions ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TelehealthSession {
    pub id: Uuid,
    pub session_id: Uuid,
    pub room_name: String,
    pub patient_id: Uuid,
    pub provider_id: Uuid,
    pub platform: Platform,
    pub status: SessionStatus,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
    pub zoom_meeting_id: String,
    #[serde(skip_serializing)]
    pub zoom_meeting_password: String,
    pub zoom_join_url: String,
    pub webrtc_room_config: Value,
    pub jitsi_room_url: String,
    pub notes: String,
    pub recording_enabled: bool,
    pub recording_url: String,
    pub connection_quality: String,
    pub technical_issues: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TelehealthSession {
    pub fn duration_minutes(&self) -> Option<i64> {
        match (self.actual_start, self.actual_end) {
            (Some(start), Some(end)) => Some((end - start).num_minutes()),
            _ => None,
        }
    }

    /// Joinable from 15 minutes before the scheduled start while not yet live.
    pub fn can_join(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, SessionStatus::Scheduled | SessionStatus::Waiting)
            && now >= self.scheduled_start - Duration::minutes(15)
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    #[serde(flatten)]
    pub session: TelehealthSession,
    pub duration_minutes: Option<i64>,
    pub can_join: bool,
    pub is_active: bool,
}

impl SessionResponse {
    pub fn new(session: TelehealthSession, now: DateTime<Utc>) -> Self {
        Self {
            duration_minutes: session.duration_minutes(),
            can_join: session.can_join(now),
            is_active: session.is_active(),
            session,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSessionRequest {
    pub patient_id: Uuid,
    /// Defaults to the caller when omitted.
    pub provider_id: Option<Uuid>,
    pub platform: Option<Platform>,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub recording_enabled: bool,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateSessionRequest {
    pub scheduled_start: Option<DateTime<Utc>>,
    pub scheduled_end: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub recording_enabled: Option<bool>,
    #[validate(length(max = 20))]
    pub connection_quality: Option<String>,
    pub technical_issues: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TelehealthParticipant {
    pub id: Uuid,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub role: ParticipantRole,
    pub joined_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
    pub connection_id: String,
    pub can_share_screen: bool,
    pub can_record: bool,
    pub is_moderator: bool,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub connection_quality: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceServer {
    pub urls: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ParticipantPermissions {
    pub can_share_screen: bool,
    pub can_record: bool,
    pub is_moderator: bool,
}

/// Everything a client needs to connect to a session on its platform.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "platform", rename_all = "lowercase")]
pub enum JoinInfo {
    Zoom {
        join_url: String,
        meeting_id: String,
        password: String,
        user_id: String,
        display_name: String,
        role: String,
        connection_id: String,
    },
    #[serde(rename = "webrtc")]
    WebRtc {
        room_id: String,
        ice_servers: Vec<IceServer>,
        user_id: String,
        display_name: String,
        role: String,
        permissions: ParticipantPermissions,
        connection_id: String,
    },
    Jitsi {
        join_url: String,
        room_name: String,
        user_id: String,
        display_name: String,
        role: String,
        connection_id: String,
    },
}

impl JoinInfo {
    pub fn connection_id(&self) -> &str {
        match self {
            JoinInfo::Zoom { connection_id, .. }
            | JoinInfo::WebRtc { connection_id, .. }
            | JoinInfo::Jitsi { connection_id, .. } => connection_id,
        }
    }
}

// ============ Signaling ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WebRtcSignal {
    pub id: Uuid,
    pub session_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Option<Uuid>,
    pub message_type: SignalType,
    pub message_data: Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSignalRequest {
    pub session_id: Uuid,
    pub receiver_id: Option<Uuid>,
    pub message_type: SignalType,
    pub message_data: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct SignalQuery {
    /// Public `session_id` of the session, not its row id.
    pub session_id: Option<Uuid>,
}

// ============ Device Tests ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeviceTest {
    pub id: Uuid,
    pub user_id: Uuid,
    pub session_id: Option<Uuid>,
    pub test_type: DeviceTestType,
    pub test_result: DeviceTestResult,
    pub details: Value,
    pub error_message: String,
    pub upload_speed_mbps: Option<f64>,
    pub download_speed_mbps: Option<f64>,
    pub latency_ms: Option<i32>,
    pub packet_loss_percent: Option<f64>,
    pub tested_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateDeviceTestRequest {
    pub session_id: Option<Uuid>,
    pub test_type: DeviceTestType,
    pub test_result: DeviceTestResult,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub error_message: String,
    #[validate(range(min = 0.0))]
    pub upload_speed_mbps: Option<f64>,
    #[validate(range(min = 0.0))]
    pub download_speed_mbps: Option<f64>,
    #[validate(range(min = 0))]
    pub latency_ms: Option<i32>,
    #[validate(range(min = 0.0, max = 100.0))]
    pub packet_loss_percent: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunFullTestRequest {
    /// Public `session_id`; ignored unless the caller participates.
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct FullTestReport {
    pub message: String,
    pub results: Vec<DeviceTest>,
    pub overall_status: DeviceTestResult,
}

// ============ Recordings ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Recording {
    pub id: Uuid,
    pub session_id: Uuid,
    pub status: RecordingStatus,
    #[serde(skip_serializing)]
    pub file_path: String,
    pub file_size_bytes: Option<i64>,
    pub duration_seconds: Option<i32>,
    pub zoom_recording_id: String,
    pub zoom_download_url: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub consent_obtained: bool,
    pub consent_participants: Json<Vec<Uuid>>,
    pub created_at: DateTime<Utc>,
}

impl Recording {
    pub fn file_size_mb(&self) -> Option<f64> {
        self.file_size_bytes
            .filter(|b| *b > 0)
            .map(|b| (b as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0)
    }
}

#[derive(Debug, Serialize)]
pub struct RecordingDownload {
    pub download_url: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub file_size_mb: Option<f64>,
}

// ============ Waiting Rooms ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WaitingRoom {
    pub id: Uuid,
    pub session_id: Uuid,
    pub is_enabled: bool,
    pub admission_control: bool,
    pub welcome_message: String,
    pub instructions: String,
    pub created_at: DateTime<Utc>,
    /// Pending participants: not admitted, denied or gone.
    pub waiting_participants_count: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WaitingRoomParticipant {
    pub id: Uuid,
    pub waiting_room_id: Uuid,
    pub participant_id: Uuid,
    pub joined_waiting_at: DateTime<Utc>,
    pub admitted_at: Option<DateTime<Utc>>,
    pub denied_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
    pub denial_reason: String,
}

#[derive(Debug, Deserialize)]
pub struct AdmitRequest {
    pub participant_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct DenyRequest {
    pub participant_id: Uuid,
    #[serde(default)]
    pub reason: String,
}

// ============ Clinic Settings ============

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ClinicSettings {
    pub clinic_name: String,
    pub default_telehealth_tier: TelehealthTier,
    pub enable_fallback_to_webrtc: bool,
    pub enable_patient_choice: bool,
    pub enable_bandwidth_detection: bool,
    pub minimum_bandwidth_for_zoom: i32,
    pub enable_high_contrast_mode: bool,
    pub default_language: ClinicLanguage,
    pub last_modified_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateClinicSettingsRequest {
    #[validate(length(min = 1, max = 200))]
    pub clinic_name: Option<String>,
    pub default_telehealth_tier: Option<TelehealthTier>,
    pub enable_fallback_to_webrtc: Option<bool>,
    pub enable_patient_choice: Option<bool>,
    pub enable_bandwidth_detection: Option<bool>,
    #[validate(range(min = 500, message = "Minimum bandwidth for Zoom should be at least 500 kbps"))]
    pub minimum_bandwidth_for_zoom: Option<i32>,
    pub enable_high_contrast_mode: Option<bool>,
    pub default_language: Option<ClinicLanguage>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TierAuditLog {
    pub id: Uuid,
    pub change_type: TierChangeType,
    pub user_id: Uuid,
    pub old_value: Value,
    pub new_value: Value,
    pub ip_address: String,
    pub user_agent: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UsageAnalytics {
    pub id: Uuid,
    pub date: NaiveDate,
    pub webrtc_sessions_count: i32,
    pub zoom_sessions_count: i32,
    pub webrtc_total_duration_minutes: i32,
    pub zoom_total_duration_minutes: i32,
    pub webrtc_average_quality_score: f64,
    pub zoom_average_quality_score: f64,
    pub webrtc_connection_failures: i32,
    pub zoom_connection_failures: i32,
    pub webrtc_satisfaction_score: f64,
    pub zoom_satisfaction_score: f64,
    pub created_at: DateTime<Utc>,
}

impl UsageAnalytics {
    pub fn total_sessions(&self) -> i32 {
        self.webrtc_sessions_count + self.zoom_sessions_count
    }

    pub fn webrtc_usage_percentage(&self) -> f64 {
        match self.total_sessions() {
            0 => 0.0,
            total => self.webrtc_sessions_count as f64 / total as f64 * 100.0,
        }
    }

    pub fn zoom_usage_percentage(&self) -> f64 {
        match self.total_sessions() {
            0 => 0.0,
            total => self.zoom_sessions_count as f64 / total as f64 * 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierRecommendation {
    pub recommended_tier: TelehealthTier,
    pub reason: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierPreview {
    pub tier: TelehealthTier,
    pub title: &'static str,
    pub description: &'static str,
    pub features: Vec<&'static str>,
    pub pros: Vec<&'static str>,
    pub cons: Vec<&'static str>,
    pub ideal_for: Vec<&'static str>,
    pub bandwidth_requirement: &'static str,
    pub cost: &'static str,
}

#[derive(Debug, Serialize)]
pub struct TierPreviewResponse {
    pub current_tier: TelehealthTier,
    pub tiers: Vec<TierPreview>,
    pub recommendation: TierRecommendation,
    pub analytics_date: Option<NaiveDate>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct TelehealthPermissions {
    pub can_modify_clinic_settings: bool,
    pub can_view_audit_logs: bool,
    pub can_use_zoom: bool,
    pub can_create_sessions: bool,
    pub available_platforms: Vec<Platform>,
    pub user_type: crate::models::UserType,
    pub subscription_tier: crate::models::SubscriptionTier,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionListQuery {
    pub status: Option<SessionStatus>,
    pub platform: Option<Platform>,
}
