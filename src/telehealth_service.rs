use crate::config::TelehealthConfig;
use crate::error::{ApiError, IntegrationError};
use crate::metrics::ZOOM_MEETINGS_TOTAL;
use crate::models::{
    ClinicSettings, IceServer, JoinInfo, ParticipantPermissions, Platform, TelehealthParticipant,
    TelehealthSession, TelehealthTier, TierChangeType, TierPreview, TierRecommendation,
    UpdateClinicSettingsRequest, UsageAnalytics, User,
};
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

/// Meeting details returned by Zoom for a scheduled meeting.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoomMeeting {
    pub meeting_id: String,
    pub password: String,
    pub join_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MeetingId {
    Number(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct ZoomMeetingResponse {
    id: MeetingId,
    #[serde(default)]
    password: Option<String>,
    join_url: String,
}

#[derive(Debug, Serialize)]
struct ZoomClaims<'a> {
    iss: &'a str,
    exp: i64,
}

/// `session_` followed by eight hex characters.
pub fn generate_room_name() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("session_{}", &hex[..8])
}

pub fn generate_meeting_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

/// An explicit request wins; Zoom is only granted to paid providers.
/// Without a request, paid providers get Zoom and everyone else WebRTC.
pub fn select_platform(requested: Option<Platform>, provider: &User) -> Result<Platform, ApiError> {
    match requested {
        Some(Platform::Zoom) if !provider.can_use_zoom() => Err(ApiError::Forbidden(
            "Zoom sessions require a premium or enterprise subscription".to_string(),
        )),
        Some(platform) => Ok(platform),
        None if provider.can_use_zoom() => Ok(Platform::Zoom),
        None => Ok(Platform::WebRtc),
    }
}

/// Rule-based tier advice from one day of usage analytics.
pub fn recommend_tier(analytics: Option<&UsageAnalytics>) -> TierRecommendation {
    let recommendation = |tier, reason: &str, confidence| TierRecommendation {
        recommended_tier: tier,
        reason: reason.to_string(),
        confidence,
    };

    let Some(a) = analytics else {
        return recommendation(TelehealthTier::WebRtc, "Default recommendation - start with free tier", 0.6);
    };

    if a.total_sessions() < 10 {
        return recommendation(TelehealthTier::WebRtc, "Low session volume - WebRTC is cost-effective", 0.7);
    }

    let failure_rate = a.webrtc_connection_failures as f64 / a.webrtc_sessions_count.max(1) as f64;
    if failure_rate > 0.2 {
        return recommendation(
            TelehealthTier::Zoom,
            "High WebRTC failure rate - Zoom SDK may be more reliable",
            0.8,
        );
    }

    if a.webrtc_usage_percentage() > 80.0 && a.webrtc_average_quality_score > 7.0 {
        return recommendation(
            TelehealthTier::WebRtc,
            "High WebRTC usage with good quality - continue with free tier",
            0.9,
        );
    }

    recommendation(TelehealthTier::WebRtc, "Default recommendation - start with free tier", 0.6)
}

pub fn tier_previews() -> Vec<TierPreview> {
    vec![
        TierPreview {
            tier: TelehealthTier::WebRtc,
            title: "Free Tier (WebRTC)",
            description: "Browser-based peer-to-peer video with no third-party account",
            features: vec!["HD video and audio", "Screen sharing", "No downloads required", "End-to-end encrypted media"],
            pros: vec!["No licensing cost", "Works in any modern browser", "Data stays on clinic infrastructure"],
            cons: vec!["Quality depends on both networks", "Restrictive firewalls may need a TURN relay"],
            ideal_for: vec!["Small practices", "Low to moderate session volume", "Cost-sensitive clinics"],
            bandwidth_requirement: "500 kbps minimum, 1.5 Mbps recommended",
            cost: "Free",
        },
        TierPreview {
            tier: TelehealthTier::Zoom,
            title: "Paid Tier (Zoom SDK)",
            description: "Managed Zoom meetings with waiting rooms and cloud infrastructure",
            features: vec!["Adaptive video quality", "Cloud recording", "Waiting room", "Phone dial-in"],
            pros: vec!["Reliable on poor networks", "Familiar interface for patients", "Vendor-managed infrastructure"],
            cons: vec!["Per-licence subscription cost", "Requires a Zoom business agreement"],
            ideal_for: vec!["High session volume", "Patients on unreliable connections", "Group consultations"],
            bandwidth_requirement: "1 Mbps minimum",
            cost: "Subscription required",
        },
    ]
}

fn single(field: &str, value: Value) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(field.to_string(), value);
    Value::Object(map)
}

/// One audit entry per changed setting: `(type, old, new)`.
pub fn settings_changes(
    current: &ClinicSettings,
    update: &UpdateClinicSettingsRequest,
) -> Vec<(TierChangeType, Value, Value)> {
    let mut changes = Vec::new();

    if let Some(tier) = update.default_telehealth_tier.filter(|t| *t != current.default_telehealth_tier) {
        changes.push((
            TierChangeType::TierChange,
            single("default_telehealth_tier", json!(current.default_telehealth_tier)),
            single("default_telehealth_tier", json!(tier)),
        ));
    }
    if let Some(v) = update.enable_fallback_to_webrtc.filter(|v| *v != current.enable_fallback_to_webrtc) {
        changes.push((
            TierChangeType::FallbackToggle,
            single("enable_fallback_to_webrtc", json!(current.enable_fallback_to_webrtc)),
            single("enable_fallback_to_webrtc", json!(v)),
        ));
    }
    if let Some(v) = update.enable_patient_choice.filter(|v| *v != current.enable_patient_choice) {
        changes.push((
            TierChangeType::PatientChoiceToggle,
            single("enable_patient_choice", json!(current.enable_patient_choice)),
            single("enable_patient_choice", json!(v)),
        ));
    }
    if let Some(v) = update.enable_bandwidth_detection.filter(|v| *v != current.enable_bandwidth_detection) {
        changes.push((
            TierChangeType::BandwidthSetting,
            single("enable_bandwidth_detection", json!(current.enable_bandwidth_detection)),
            single("enable_bandwidth_detection", json!(v)),
        ));
    }
    if let Some(v) = update.minimum_bandwidth_for_zoom.filter(|v| *v != current.minimum_bandwidth_for_zoom) {
        changes.push((
            TierChangeType::BandwidthSetting,
            single("minimum_bandwidth_for_zoom", json!(current.minimum_bandwidth_for_zoom)),
            single("minimum_bandwidth_for_zoom", json!(v)),
        ));
    }
    if let Some(v) = update.enable_high_contrast_mode.filter(|v| *v != current.enable_high_contrast_mode) {
        changes.push((
            TierChangeType::AccessibilityChange,
            single("enable_high_contrast_mode", json!(current.enable_high_contrast_mode)),
            single("enable_high_contrast_mode", json!(v)),
        ));
    }
    if let Some(lang) = update.default_language.filter(|l| *l != current.default_language) {
        changes.push((
            TierChangeType::LanguageChange,
            single("default_language", json!(current.default_language)),
            single("default_language", json!(lang)),
        ));
    }

    changes
}

/// Builds per-platform room configuration and join details.
pub struct TelehealthService {
    http: Client,
    config: TelehealthConfig,
}

impl TelehealthService {
    pub fn new(config: TelehealthConfig) -> Result<Self, IntegrationError> {
        let http = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self { http, config })
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        let stun = self.config.webrtc.stun_servers.iter().map(|url| IceServer {
            urls: url.clone(),
            username: None,
            credential: None,
        });
        let turn = self.config.webrtc.turn_servers.iter().map(|t| IceServer {
            urls: t.url.clone(),
            username: t.username.clone(),
            credential: t.credential.clone(),
        });
        stun.chain(turn).collect()
    }

    pub fn webrtc_room_config(&self, room_name: &str) -> Value {
        json!({
            "room_id": room_name,
            "ice_servers": self.ice_servers(),
            "constraints": {"video": true, "audio": true},
            "codec_preferences": ["VP8", "H264"],
            "bandwidth_limits": {"video": 500000, "audio": 64000},
        })
    }

    pub fn jitsi_room_url(&self, room_name: &str) -> String {
        format!("{}/{}", self.config.jitsi.server_url.trim_end_matches('/'), room_name)
    }

    /// HS256 token for the Zoom REST API, valid for one hour.
    pub fn zoom_jwt(&self) -> Result<String, IntegrationError> {
        let zoom = &self.config.zoom;
        if zoom.api_key.is_empty() || zoom.api_secret.is_empty() {
            return Err(IntegrationError::Config("Zoom API credentials are not configured".into()));
        }

        let claims = ZoomClaims {
            iss: &zoom.api_key,
            exp: Utc::now().timestamp() + 3600,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(zoom.api_secret.as_bytes()))
            .map_err(|e| IntegrationError::Config(format!("Zoom token generation failed: {}", e)))
    }

    pub async fn create_zoom_meeting(
        &self,
        room_name: &str,
        scheduled_start: DateTime<Utc>,
        scheduled_end: DateTime<Utc>,
    ) -> Result<ZoomMeeting, IntegrationError> {
        let token = self.zoom_jwt()?;
        let password = generate_meeting_password();

        let body = json!({
            "topic": format!("Telehealth Session - {}", room_name),
            "type": 2,
            "start_time": scheduled_start.to_rfc3339(),
            "duration": (scheduled_end - scheduled_start).num_minutes(),
            "timezone": "UTC",
            "password": password,
            "settings": {
                "host_video": true,
                "participant_video": true,
                "join_before_host": false,
                "mute_upon_entry": true,
                "watermark": false,
                "use_pmi": false,
                "approval_type": 2,
                "audio": "both",
                "auto_recording": "none",
                "waiting_room": true
            }
        });

        let url = format!("{}/users/me/meetings", self.config.zoom.base_url.trim_end_matches('/'));
        let response = self.http.post(url).bearer_auth(token).json(&body).send().await.map_err(|e| {
            error!(error = %e, "Zoom meeting request failed");
            ZOOM_MEETINGS_TOTAL.with_label_values(&["error"]).inc();
            IntegrationError::from(e)
        })?;

        if response.status() != StatusCode::CREATED {
            let status = response.status().as_u16();
            error!(status = status, "Zoom rejected meeting creation");
            ZOOM_MEETINGS_TOTAL.with_label_values(&["error"]).inc();
            return Err(IntegrationError::Status { resource: "ZoomMeeting", status });
        }

        let bytes = response.bytes().await?;
        let meeting: ZoomMeetingResponse = serde_json::from_slice(&bytes)?;
        ZOOM_MEETINGS_TOTAL.with_label_values(&["ok"]).inc();

        let meeting_id = match meeting.id {
            MeetingId::Number(n) => n.to_string(),
            MeetingId::Text(s) => s,
        };
        info!(room = room_name, "Created Zoom meeting");

        Ok(ZoomMeeting {
            meeting_id,
            password: meeting.password.unwrap_or(password),
            join_url: meeting.join_url,
        })
    }

    /// Connection details for one participant. The provider hosts Zoom calls.
    pub fn join_info(&self, session: &TelehealthSession, participant: &TelehealthParticipant, user: &User) -> JoinInfo {
        let user_id = user.id.to_string();
        let display_name = user.full_name();
        let role = participant.role.as_str().to_string();

        match session.platform {
            Platform::Zoom => JoinInfo::Zoom {
                join_url: session.zoom_join_url.clone(),
                meeting_id: session.zoom_meeting_id.clone(),
                password: session.zoom_meeting_password.clone(),
                connection_id: format!("zoom_{}_{}", session.zoom_meeting_id, user_id),
                role: if user.id == session.provider_id { "host" } else { "participant" }.to_string(),
                user_id,
                display_name,
            },
            Platform::WebRtc => JoinInfo::WebRtc {
                room_id: session.room_name.clone(),
                ice_servers: self.ice_servers(),
                connection_id: format!("webrtc_{}_{}", session.room_name, user_id),
                permissions: ParticipantPermissions {
                    can_share_screen: participant.can_share_screen,
                    can_record: participant.can_record,
                    is_moderator: participant.is_moderator,
                },
                user_id,
                display_name,
                role,
            },
            Platform::Jitsi => {
                let mut fragment = format!(
                    "displayName={}&userId={}&role={}",
                    urlencoding::encode(&display_name),
                    user_id,
                    role
                );
                if participant.is_moderator {
                    fragment.push_str("&isModerator=true");
                }
                JoinInfo::Jitsi {
                    join_url: format!("{}#{}", session.jitsi_room_url, fragment),
                    room_name: session.room_name.clone(),
                    connection_id: format!("jitsi_{}_{}", session.room_name, user_id),
                    user_id,
                    display_name,
                    role,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JitsiConfig, TurnServer, WebRtcConfig, ZoomConfig};
    use crate::models::{ClinicLanguage, ParticipantRole, SessionStatus, SubscriptionTier, UserType};
    use chrono::{Duration as ChronoDuration, NaiveDate};
    use mockito::Server;

    fn config(zoom_base: &str) -> TelehealthConfig {
        TelehealthConfig {
            zoom: ZoomConfig {
                api_key: "key".into(),
                api_secret: "secret".into(),
                base_url: zoom_base.to_string(),
            },
            jitsi: JitsiConfig {
                server_url: "https://meet.jit.si/".into(),
            },
            webrtc: WebRtcConfig {
                stun_servers: vec!["stun:stun.l.google.com:19302".into()],
                turn_servers: vec![TurnServer {
                    url: "turn:turn.example.org:3478".into(),
                    username: Some("u".into()),
                    credential: Some("c".into()),
                }],
            },
        }
    }

    fn user(tier: SubscriptionTier) -> User {
        let now = Utc::now();
        User {
            id: Uuid::new_v4(),
            username: "dr".into(),
            email: "dr@example.com".into(),
            password_hash: String::new(),
            first_name: "Mary".into(),
            last_name: "Jones".into(),
            user_type: UserType::Provider,
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

    fn session(platform: Platform, provider_id: Uuid) -> TelehealthSession {
        let now = Utc::now();
        TelehealthSession {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            room_name: "session_ab12cd34".into(),
            patient_id: Uuid::new_v4(),
            provider_id,
            platform,
            status: SessionStatus::Scheduled,
            scheduled_start: now,
            scheduled_end: now + ChronoDuration::minutes(30),
            actual_start: None,
            actual_end: None,
            zoom_meeting_id: "987".into(),
            zoom_meeting_password: "pw".into(),
            zoom_join_url: "https://zoom.us/j/987".into(),
            webrtc_room_config: json!({}),
            jitsi_room_url: "https://meet.jit.si/session_ab12cd34".into(),
            notes: String::new(),
            recording_enabled: false,
            recording_url: String::new(),
            connection_quality: String::new(),
            technical_issues: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn participant(session: &TelehealthSession, user_id: Uuid, role: ParticipantRole, moderator: bool) -> TelehealthParticipant {
        TelehealthParticipant {
            id: Uuid::new_v4(),
            session_id: session.id,
            user_id,
            role,
            joined_at: None,
            left_at: None,
            connection_id: String::new(),
            can_share_screen: moderator,
            can_record: moderator,
            is_moderator: moderator,
            video_enabled: true,
            audio_enabled: true,
            connection_quality: String::new(),
            created_at: Utc::now(),
        }
    }

    fn analytics(webrtc: i32, zoom: i32, failures: i32, quality: f64) -> UsageAnalytics {
        UsageAnalytics {
            id: Uuid::new_v4(),
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            webrtc_sessions_count: webrtc,
            zoom_sessions_count: zoom,
            webrtc_total_duration_minutes: 0,
            zoom_total_duration_minutes: 0,
            webrtc_average_quality_score: quality,
            zoom_average_quality_score: 0.0,
            webrtc_connection_failures: failures,
            zoom_connection_failures: 0,
            webrtc_satisfaction_score: 0.0,
            zoom_satisfaction_score: 0.0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_room_name_format() {
        let name = generate_room_name();
        assert!(name.starts_with("session_"));
        assert_eq!(name.len(), 16);
        assert!(name[8..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_meeting_password_is_alphanumeric() {
        let pw = generate_meeting_password();
        assert_eq!(pw.len(), 8);
        assert!(pw.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_platform_selection() {
        let free = user(SubscriptionTier::Free);
        let paid = user(SubscriptionTier::Enterprise);

        assert_eq!(select_platform(None, &free).unwrap(), Platform::WebRtc);
        assert_eq!(select_platform(None, &paid).unwrap(), Platform::Zoom);
        assert_eq!(select_platform(Some(Platform::Jitsi), &paid).unwrap(), Platform::Jitsi);
        assert!(matches!(select_platform(Some(Platform::Zoom), &free), Err(ApiError::Forbidden(_))));
    }

    #[test]
    fn test_tier_recommendation_rules() {
        assert_eq!(recommend_tier(None).confidence, 0.6);
        assert_eq!(recommend_tier(Some(&analytics(3, 2, 0, 9.0))).confidence, 0.7);

        let unreliable = recommend_tier(Some(&analytics(20, 0, 5, 9.0)));
        assert_eq!(unreliable.recommended_tier, TelehealthTier::Zoom);
        assert_eq!(unreliable.confidence, 0.8);

        assert_eq!(recommend_tier(Some(&analytics(90, 10, 1, 8.0))).confidence, 0.9);
        assert_eq!(recommend_tier(Some(&analytics(50, 50, 1, 8.0))).confidence, 0.6);
    }

    #[test]
    fn test_webrtc_room_config_includes_turn() {
        let service = TelehealthService::new(config("http://unused")).unwrap();
        let room = service.webrtc_room_config("session_1");
        assert_eq!(room["ice_servers"].as_array().unwrap().len(), 2);
        assert_eq!(room["ice_servers"][1]["username"], "u");
        assert!(room["ice_servers"][0].get("username").is_none());
        assert_eq!(room["bandwidth_limits"]["video"], 500000);
        assert_eq!(service.jitsi_room_url("session_1"), "https://meet.jit.si/session_1");
    }

    #[test]
    fn test_join_info_per_platform() {
        let service = TelehealthService::new(config("http://unused")).unwrap();
        let provider = user(SubscriptionTier::Premium);

        let zoom = session(Platform::Zoom, provider.id);
        let info = service.join_info(&zoom, &participant(&zoom, provider.id, ParticipantRole::Provider, true), &provider);
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["platform"], "zoom");
        assert_eq!(value["role"], "host");
        assert_eq!(info.connection_id(), format!("zoom_987_{}", provider.id));

        let jitsi = session(Platform::Jitsi, provider.id);
        let info = service.join_info(&jitsi, &participant(&jitsi, provider.id, ParticipantRole::Provider, true), &provider);
        match info {
            JoinInfo::Jitsi { join_url, .. } => {
                assert!(join_url.starts_with("https://meet.jit.si/session_ab12cd34#displayName=Mary%20Jones&userId="));
                assert!(join_url.ends_with("&role=provider&isModerator=true"));
            }
            other => panic!("unexpected join info: {other:?}"),
        }

        let webrtc = session(Platform::WebRtc, provider.id);
        let patient = user(SubscriptionTier::Free);
        let info = service.join_info(&webrtc, &participant(&webrtc, patient.id, ParticipantRole::Patient, false), &patient);
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["platform"], "webrtc");
        assert_eq!(value["role"], "patient");
        assert_eq!(value["permissions"]["can_record"], false);
    }

    #[test]
    fn test_settings_changes() {
        let now = Utc::now();
        let current = ClinicSettings {
            clinic_name: "Default Clinic".into(),
            default_telehealth_tier: TelehealthTier::WebRtc,
            enable_fallback_to_webrtc: true,
            enable_patient_choice: true,
            enable_bandwidth_detection: true,
            minimum_bandwidth_for_zoom: 1024,
            enable_high_contrast_mode: false,
            default_language: ClinicLanguage::En,
            last_modified_by: None,
            created_at: now,
            updated_at: now,
        };
        let update = UpdateClinicSettingsRequest {
            default_telehealth_tier: Some(TelehealthTier::Zoom),
            enable_fallback_to_webrtc: Some(true),
            minimum_bandwidth_for_zoom: Some(2048),
            default_language: Some(ClinicLanguage::Es),
            ..Default::default()
        };

        let changes = settings_changes(&current, &update);
        let types: Vec<TierChangeType> = changes.iter().map(|c| c.0).collect();
        assert_eq!(
            types,
            vec![TierChangeType::TierChange, TierChangeType::BandwidthSetting, TierChangeType::LanguageChange]
        );
        assert_eq!(changes[0].1["default_telehealth_tier"], "webrtc");
        assert_eq!(changes[0].2["default_telehealth_tier"], "zoom");
    }

    #[tokio::test]
    async fn test_create_zoom_meeting() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/users/me/meetings")
            .match_header("authorization", mockito::Matcher::Regex("^Bearer .+".into()))
            .with_status(201)
            .with_body(r#"{"id": 85746065432, "password": "abc123", "join_url": "https://zoom.us/j/85746065432", "start_url": "https://zoom.us/s/1"}"#)
            .create_async()
            .await;

        let service = TelehealthService::new(config(&server.url())).unwrap();
        let start = Utc::now();
        let meeting = service
            .create_zoom_meeting("session_1", start, start + ChronoDuration::minutes(45))
            .await
            .unwrap();

        assert_eq!(meeting.meeting_id, "85746065432");
        assert_eq!(meeting.password, "abc123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_zoom_failure_is_reported() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/users/me/meetings")
            .with_status(401)
            .create_async()
            .await;

        let service = TelehealthService::new(config(&server.url())).unwrap();
        let start = Utc::now();
        let err = service
            .create_zoom_meeting("session_1", start, start + ChronoDuration::minutes(30))
            .await
            .unwrap_err();
        assert!(matches!(err, IntegrationError::Status { status: 401, .. }));
    }
}
