use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

crate::text_enum! {
    pub enum EntryType {
        Text => "text",
        Audio => "audio",
        VoiceNote => "voice_note",
        Mood => "mood",
        Symptom => "symptom",
    }
}

crate::text_enum! {
    pub enum SentimentLabel {
        Positive => "positive",
        Negative => "negative",
        Neutral => "neutral",
    }
}

crate::text_enum! {
    pub enum PromptType {
        Daily => "daily",
        Mood => "mood",
        Symptom => "symptom",
        Gratitude => "gratitude",
        Reflection => "reflection",
        Goal => "goal",
    }
}

crate::text_enum! {
    pub enum ExportFormat {
        Pdf => "pdf",
        Docx => "docx",
        Csv => "csv",
        Json => "json",
    }
}

/// Named entity found in entry text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub text: String,
    pub label: String,
    pub description: String,
}

/// A clinically relevant signal raised by entry analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalFlag {
    pub category: String,
    pub keyword: String,
    pub severity: f64,
}

// ============ Journal Entries ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JournalEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub content: String,
    pub entry_type: EntryType,
    pub transcription: String,
    pub mood_rating: Option<i32>,
    pub pain_level: Option<i32>,
    pub is_private: bool,
    pub shared_with_provider: bool,
    pub sentiment_score: Option<f64>,
    pub sentiment_label: Option<SentimentLabel>,
    pub keywords: Json<Vec<String>>,
    pub entities: Json<Vec<Entity>>,
    pub topics: Json<Vec<String>>,
    pub urgency_score: Option<f64>,
    pub clinical_flags: Json<Vec<ClinicalFlag>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JournalEntry {
    pub fn word_count(&self) -> usize {
        self.content.split_whitespace().count()
    }

    pub fn has_clinical_concerns(&self) -> bool {
        !self.clinical_flags.0.is_empty() || self.urgency_score.map(|u| u > 0.7).unwrap_or(false)
    }
}

/// Tag attached to an entry, joined with the tag's display fields.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct EntryTag {
    #[serde(skip_serializing)]
    pub entry_id: Uuid,
    pub tag_id: Uuid,
    pub name: String,
    pub color: String,
    pub confidence: f64,
    pub added_by_ai: bool,
}

#[derive(Debug, Serialize)]
pub struct JournalEntryResponse {
    #[serde(flatten)]
    pub entry: JournalEntry,
    pub tags: Vec<EntryTag>,
    pub word_count: usize,
    pub has_clinical_concerns: bool,
}

impl JournalEntryResponse {
    pub fn new(entry: JournalEntry, tags: Vec<EntryTag>) -> Self {
        Self {
            word_count: entry.word_count(),
            has_clinical_concerns: entry.has_clinical_concerns(),
            tags,
            entry,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateEntryRequest {
    #[serde(default)]
    #[validate(length(max = 200))]
    pub title: String,
    #[validate(length(min = 1, message = "This field may not be blank."))]
    pub content: String,
    pub entry_type: Option<EntryType>,
    #[validate(range(min = 1, max = 5))]
    pub mood_rating: Option<i32>,
    #[validate(range(min = 0, max = 10))]
    pub pain_level: Option<i32>,
    pub is_private: Option<bool>,
    #[serde(default)]
    pub shared_with_provider: bool,
    #[serde(default)]
    pub tag_ids: Vec<Uuid>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateEntryRequest {
    #[validate(length(max = 200))]
    pub title: Option<String>,
    #[validate(length(min = 1, message = "This field may not be blank."))]
    pub content: Option<String>,
    pub entry_type: Option<EntryType>,
    #[validate(range(min = 1, max = 5))]
    pub mood_rating: Option<i32>,
    #[validate(range(min = 0, max = 10))]
    pub pain_level: Option<i32>,
    pub is_private: Option<bool>,
    pub shared_with_provider: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EntryListQuery {
    pub entry_type: Option<EntryType>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Comma-separated tag names.
    pub tags: Option<String>,
    pub search: Option<String>,
}

// ============ Tags ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JournalTag {
    pub id: Uuid,
    pub name: String,
    pub color: String,
    pub description: String,
    pub is_system_tag: bool,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateTagRequest {
    #[validate(length(min = 1, max = 50))]
    pub name: String,
    #[validate(length(equal = 7, message = "Enter a hex color such as #007bff."))]
    pub color: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateTagRequest {
    #[validate(length(min = 1, max = 50))]
    pub name: Option<String>,
    #[validate(length(equal = 7, message = "Enter a hex color such as #007bff."))]
    pub color: Option<String>,
    pub description: Option<String>,
}

// ============ Prompts ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JournalPrompt {
    pub id: Uuid,
    pub title: String,
    pub question: String,
    pub prompt_type: PromptType,
    pub target_user_types: Json<Vec<String>>,
    pub target_conditions: Json<Vec<String>>,
    pub is_active: bool,
    pub frequency_days: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JournalPromptResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub prompt_id: Uuid,
    pub journal_entry_id: Option<Uuid>,
    pub response_text: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreatePromptResponseRequest {
    pub prompt_id: Uuid,
    pub journal_entry_id: Option<Uuid>,
    #[validate(length(min = 1, message = "This field may not be blank."))]
    pub response_text: String,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdatePromptResponseRequest {
    pub journal_entry_id: Option<Uuid>,
    #[validate(length(min = 1, message = "This field may not be blank."))]
    pub response_text: Option<String>,
}

// ============ Mood Tracking ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct MoodTracking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub overall_mood: i32,
    pub energy_level: i32,
    pub anxiety_level: i32,
    pub sleep_quality: Option<i32>,
    pub activities: Json<Vec<String>>,
    pub triggers: Json<Vec<String>>,
    pub location: String,
    pub weather: String,
    pub notes: String,
    pub journal_entry_id: Option<Uuid>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateMoodRequest {
    #[validate(range(min = 1, max = 5))]
    pub overall_mood: i32,
    #[validate(range(min = 1, max = 5))]
    pub energy_level: i32,
    #[validate(range(min = 1, max = 5))]
    pub anxiety_level: i32,
    #[validate(range(min = 1, max = 5))]
    pub sleep_quality: Option<i32>,
    #[serde(default)]
    pub activities: Vec<String>,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    #[validate(length(max = 100))]
    pub location: String,
    #[serde(default)]
    #[validate(length(max = 50))]
    pub weather: String,
    #[serde(default)]
    pub notes: String,
    pub journal_entry_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateMoodRequest {
    #[validate(range(min = 1, max = 5))]
    pub overall_mood: Option<i32>,
    #[validate(range(min = 1, max = 5))]
    pub energy_level: Option<i32>,
    #[validate(range(min = 1, max = 5))]
    pub anxiety_level: Option<i32>,
    #[validate(range(min = 1, max = 5))]
    pub sleep_quality: Option<i32>,
    pub activities: Option<Vec<String>>,
    pub triggers: Option<Vec<String>>,
    #[validate(length(max = 100))]
    pub location: Option<String>,
    #[validate(length(max = 50))]
    pub weather: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct MoodTrendPoint {
    pub date: NaiveDate,
    pub avg_mood: f64,
    pub avg_energy: f64,
    pub avg_anxiety: f64,
    pub avg_sleep: Option<f64>,
    pub count: i64,
}

#[derive(Debug, Deserialize)]
pub struct TrendQuery {
    pub days: Option<i64>,
    pub symptom: Option<String>,
}

// ============ Symptom Logs ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SymptomLog {
    pub id: Uuid,
    pub user_id: Uuid,
    pub symptom_name: String,
    pub severity: i32,
    pub duration_hours: Option<f64>,
    pub triggers: Json<Vec<String>>,
    pub relief_methods: Json<Vec<String>>,
    pub medications_taken: Json<Vec<String>>,
    pub description: String,
    pub journal_entry_id: Option<Uuid>,
    pub recorded_at: DateTime<Utc>,
}

pub fn severity_display(severity: i32) -> &'static str {
    match severity {
        1 => "Mild",
        2 => "Mild-Moderate",
        3 => "Moderate",
        4 => "Moderate-Severe",
        _ => "Severe",
    }
}

#[derive(Debug, Serialize)]
pub struct SymptomLogResponse {
    #[serde(flatten)]
    pub log: SymptomLog,
    pub severity_display: &'static str,
}

impl From<SymptomLog> for SymptomLogResponse {
    fn from(log: SymptomLog) -> Self {
        Self {
            severity_display: severity_display(log.severity),
            log,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSymptomRequest {
    #[validate(length(min = 1, max = 100))]
    pub symptom_name: String,
    #[validate(range(min = 1, max = 5))]
    pub severity: i32,
    #[validate(range(min = 0.0))]
    pub duration_hours: Option<f64>,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub relief_methods: Vec<String>,
    #[serde(default)]
    pub medications_taken: Vec<String>,
    #[serde(default)]
    pub description: String,
    pub journal_entry_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateSymptomRequest {
    #[validate(length(min = 1, max = 100))]
    pub symptom_name: Option<String>,
    #[validate(range(min = 1, max = 5))]
    pub severity: Option<i32>,
    #[validate(range(min = 0.0))]
    pub duration_hours: Option<f64>,
    pub triggers: Option<Vec<String>>,
    pub relief_methods: Option<Vec<String>>,
    pub medications_taken: Option<Vec<String>>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SymptomTrendPoint {
    pub date: NaiveDate,
    pub symptom_name: String,
    pub avg_severity: f64,
    pub frequency: i64,
    pub avg_duration: Option<f64>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SymptomSummary {
    pub symptom_name: String,
    pub frequency: i64,
    pub avg_severity: f64,
    pub max_severity: i32,
    pub avg_duration: Option<f64>,
}

// ============ Exports ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JournalExport {
    pub id: Uuid,
    pub user_id: Uuid,
    pub export_format: ExportFormat,
    pub date_range_start: NaiveDate,
    pub date_range_end: NaiveDate,
    pub include_private: bool,
    pub entry_types: Json<Vec<String>>,
    pub tags: Json<Vec<String>>,
    #[serde(skip_serializing)]
    pub file_path: String,
    pub file_size_bytes: Option<i64>,
    pub is_complete: bool,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct JournalExportResponse {
    #[serde(flatten)]
    pub export: JournalExport,
    pub file_size_mb: Option<f64>,
}

impl From<JournalExport> for JournalExportResponse {
    fn from(export: JournalExport) -> Self {
        let file_size_mb = export
            .file_size_bytes
            .filter(|b| *b > 0)
            .map(|b| (b as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0);
        Self { export, file_size_mb }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateExportRequest {
    pub export_format: ExportFormat,
    pub date_range_start: NaiveDate,
    pub date_range_end: NaiveDate,
    #[serde(default = "default_true")]
    pub include_private: bool,
    #[serde(default)]
    pub entry_types: Vec<EntryType>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct ExportDownload {
    pub download_url: String,
    pub file_size_bytes: Option<i64>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct SignedDownloadQuery {
    pub expires: i64,
    pub signature: String,
}

// ============ Insights & Stats ============

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyValue {
    pub date: NaiveDate,
    pub value: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JournalInsights {
    pub total_entries: usize,
    pub avg_sentiment: f64,
    pub mood_trend: Vec<DailyValue>,
    pub common_topics: Vec<String>,
    pub word_count_trend: Vec<DailyValue>,
    pub clinical_concerns: usize,
    pub entries_this_week: usize,
    pub entries_this_month: usize,
    pub longest_streak: u32,
    pub current_streak: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SentimentDistribution {
    pub positive: usize,
    pub negative: usize,
    pub neutral: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagUsage {
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JournalStats {
    pub total_entries: usize,
    pub total_words: usize,
    pub avg_words_per_entry: f64,
    pub entries_today: usize,
    pub entries_this_week: usize,
    pub entries_this_month: usize,
    pub current_streak: u32,
    pub longest_streak: u32,
    pub most_used_tags: Vec<TagUsage>,
    pub common_keywords: Vec<String>,
    pub sentiment_distribution: SentimentDistribution,
    pub mood_entries: i64,
    pub symptom_entries: i64,
    pub clinical_flags: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(content: &str, flags: Vec<ClinicalFlag>, urgency: Option<f64>) -> JournalEntry {
        let now = Utc::now();
        JournalEntry {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            title: String::new(),
            content: content.to_string(),
            entry_type: EntryType::Text,
            transcription: String::new(),
            mood_rating: None,
            pain_level: None,
            is_private: true,
            shared_with_provider: false,
            sentiment_score: None,
            sentiment_label: None,
            keywords: Json(vec![]),
            entities: Json(vec![]),
            topics: Json(vec![]),
            urgency_score: urgency,
            clinical_flags: Json(flags),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_word_count() {
        assert_eq!(entry("  slept   badly\nagain ", vec![], None).word_count(), 3);
        assert_eq!(entry("", vec![], None).word_count(), 0);
    }

    #[test]
    fn test_clinical_concerns() {
        assert!(!entry("fine", vec![], Some(0.7)).has_clinical_concerns());
        assert!(entry("fine", vec![], Some(0.71)).has_clinical_concerns());
        let flag = ClinicalFlag {
            category: "pain".into(),
            keyword: "unbearable".into(),
            severity: 0.7,
        };
        assert!(entry("unbearable", vec![flag], None).has_clinical_concerns());
    }

    #[test]
    fn test_export_size_in_megabytes() {
        let now = Utc::now();
        let export = JournalExport {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            export_format: ExportFormat::Json,
            date_range_start: now.date_naive(),
            date_range_end: now.date_naive(),
            include_private: true,
            entry_types: Json(vec![]),
            tags: Json(vec![]),
            file_path: "/tmp/x.json".into(),
            file_size_bytes: Some(1_572_864),
            is_complete: true,
            error_message: String::new(),
            created_at: now,
            expires_at: now,
        };
        let resp = JournalExportResponse::from(export);
        assert_eq!(resp.file_size_mb, Some(1.5));
        let value = serde_json::to_value(&resp).unwrap();
        assert!(value.get("file_path").is_none());
        assert_eq!(value["export_format"], "json");
    }
}
