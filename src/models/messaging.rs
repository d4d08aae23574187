use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

crate::text_enum! {
    pub enum MessageType {
        General => "general",
        Appointment => "appointment",
        Prescription => "prescription",
        LabResult => "lab_result",
        Urgent => "urgent",
        System => "system",
    }
}

crate::text_enum! {
    pub enum Priority {
        Low => "low",
        Normal => "normal",
        High => "high",
        Urgent => "urgent",
    }
}

crate::text_enum! {
    pub enum TemplateCategory {
        Appointment => "appointment",
        Prescription => "prescription",
        LabResult => "lab_result",
        FollowUp => "follow_up",
        General => "general",
    }
}

crate::text_enum! {
    pub enum Folder {
        Inbox => "inbox",
        Sent => "sent",
        All => "all",
    }
}

// ============ Messages ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub subject: String,
    pub content: String,
    pub message_type: MessageType,
    pub priority: Priority,
    pub parent_message_id: Option<Uuid>,
    pub thread_id: String,
    pub is_read: bool,
    pub sent_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub patient_id: Option<Uuid>,
    pub appointment_id: Option<Uuid>,
    pub is_system_message: bool,
    pub auto_delete_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SendMessageRequest {
    pub recipient_id: Uuid,
    #[validate(length(min = 1, max = 200))]
    pub subject: String,
    #[validate(length(min = 1, message = "This field may not be blank."))]
    pub content: String,
    pub message_type: Option<MessageType>,
    pub priority: Option<Priority>,
    pub parent_message_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub appointment_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MessageListQuery {
    pub folder: Option<Folder>,
    pub unread: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct UnreadCount {
    pub unread_count: i64,
}

// ============ Templates ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct MessageTemplate {
    pub id: Uuid,
    pub name: String,
    pub category: TemplateCategory,
    pub subject_template: String,
    pub content_template: String,
    pub user_types: Json<Vec<String>>,
    pub available_variables: Json<Vec<String>>,
    pub is_active: bool,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateTemplateRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    pub category: TemplateCategory,
    #[validate(length(min = 1, max = 200))]
    pub subject_template: String,
    #[validate(length(min = 1))]
    pub content_template: String,
    #[serde(default)]
    pub user_types: Vec<String>,
    #[serde(default)]
    pub available_variables: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RenderTemplateRequest {
    #[serde(default)]
    pub variables: Map<String, Value>,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct RenderedTemplate {
    pub subject: String,
    pub content: String,
}

#[derive(Debug, PartialEq)]
pub enum TemplateError {
    MissingVariable(String),
    Malformed,
}

impl std::fmt::Display for TemplateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateError::MissingVariable(name) => write!(f, "Missing template variable: {}", name),
            TemplateError::Malformed => f.write_str("Malformed template"),
        }
    }
}

/// Substitutes `{name}` placeholders. `{{` and `}}` produce literal braces.
pub fn render_template(template: &str, variables: &Map<String, Value>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => return Err(TemplateError::Malformed),
                    }
                }
                match variables.get(name.trim()) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => return Err(TemplateError::MissingVariable(name.trim().to_string())),
                }
            }
            '}' => return Err(TemplateError::Malformed),
            _ => out.push(c),
        }
    }

    Ok(out)
}

impl MessageTemplate {
    pub fn render(&self, variables: &Map<String, Value>) -> Result<RenderedTemplate, TemplateError> {
        Ok(RenderedTemplate {
            subject: render_template(&self.subject_template, variables)?,
            content: render_template(&self.content_template, variables)?,
        })
    }
}

// ============ Drafts ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct MessageDraft {
    pub id: Uuid,
    pub user_id: Uuid,
    pub recipient_id: Option<Uuid>,
    pub subject: String,
    pub content: String,
    pub message_type: MessageType,
    pub priority: Priority,
    pub parent_message_id: Option<Uuid>,
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct DraftRequest {
    pub recipient_id: Option<Uuid>,
    #[validate(length(max = 200))]
    pub subject: Option<String>,
    pub content: Option<String>,
    pub message_type: Option<MessageType>,
    pub priority: Option<Priority>,
    pub parent_message_id: Option<Uuid>,
}

// ============ Notification Settings ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct NotificationSettings {
    pub user_id: Uuid,
    pub email_notifications: bool,
    pub sms_notifications: bool,
    pub push_notifications: bool,
    pub in_app_notifications: bool,
    pub urgent_immediate: bool,
    pub high_within_hour: bool,
    pub normal_daily_digest: bool,
    pub quiet_hours_enabled: bool,
    pub quiet_start_time: Option<NaiveTime>,
    pub quiet_end_time: Option<NaiveTime>,
    pub auto_reply_enabled: bool,
    pub auto_reply_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateNotificationSettingsRequest {
    pub email_notifications: Option<bool>,
    pub sms_notifications: Option<bool>,
    pub push_notifications: Option<bool>,
    pub in_app_notifications: Option<bool>,
    pub urgent_immediate: Option<bool>,
    pub high_within_hour: Option<bool>,
    pub normal_daily_digest: Option<bool>,
    pub quiet_hours_enabled: Option<bool>,
    pub quiet_start_time: Option<NaiveTime>,
    pub quiet_end_time: Option<NaiveTime>,
    pub auto_reply_enabled: Option<bool>,
    pub auto_reply_message: Option<String>,
}
