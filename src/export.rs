use crate::models::{ExportFormat, JournalEntry, JournalExport};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::json;
use sha2::Sha256;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Unsupported export format: {0}")]
    Unsupported(ExportFormat),

    #[error("Failed to write export file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode export: {0}")]
    Encode(#[from] serde_json::Error),
}

/// An entry selected for export together with its tag names.
pub struct ExportItem {
    pub entry: JournalEntry,
    pub tag_names: Vec<String>,
}

#[derive(Serialize)]
struct ExportedEntry<'a> {
    id: Uuid,
    title: &'a str,
    content: &'a str,
    entry_type: &'static str,
    mood_rating: Option<i32>,
    pain_level: Option<i32>,
    created_at: String,
    sentiment_score: Option<f64>,
    sentiment_label: Option<&'static str>,
    keywords: &'a [String],
    topics: &'a [String],
    tags: &'a [String],
    word_count: usize,
}

impl<'a> From<&'a ExportItem> for ExportedEntry<'a> {
    fn from(item: &'a ExportItem) -> Self {
        let e = &item.entry;
        Self {
            id: e.id,
            title: &e.title,
            content: &e.content,
            entry_type: e.entry_type.as_str(),
            mood_rating: e.mood_rating,
            pain_level: e.pain_level,
            created_at: e.created_at.to_rfc3339(),
            sentiment_score: e.sentiment_score,
            sentiment_label: e.sentiment_label.map(|l| l.as_str()),
            keywords: &e.keywords.0,
            topics: &e.topics.0,
            tags: &item.tag_names,
            word_count: e.word_count(),
        }
    }
}

/// Whether an entry falls inside the export's date range and filters.
/// Empty `entry_types` or `tags` lists mean no restriction.
pub fn matches_export(export: &JournalExport, item: &ExportItem) -> bool {
    let entry = &item.entry;
    let day = entry.created_at.date_naive();

    if day < export.date_range_start || day > export.date_range_end {
        return false;
    }
    if !export.include_private && entry.is_private {
        return false;
    }
    if !export.entry_types.0.is_empty()
        && !export.entry_types.0.iter().any(|t| t == entry.entry_type.as_str())
    {
        return false;
    }
    if !export.tags.0.is_empty() && !item.tag_names.iter().any(|name| export.tags.0.contains(name)) {
        return false;
    }
    true
}

pub fn export_file_name(export: &JournalExport, now: DateTime<Utc>) -> String {
    format!(
        "journal_export_{}_{}.{}",
        export.id,
        now.timestamp(),
        export.export_format.as_str()
    )
}

fn render_json(export: &JournalExport, username: &str, items: &[ExportItem]) -> Result<Vec<u8>, ExportError> {
    let entries: Vec<ExportedEntry> = items.iter().map(ExportedEntry::from).collect();
    let document = json!({
        "export_info": {
            "user": username,
            "created_at": export.created_at.to_rfc3339(),
            "date_range": {
                "start": export.date_range_start.to_string(),
                "end": export.date_range_end.to_string(),
            },
            "total_entries": entries.len(),
        },
        "entries": entries,
    });
    Ok(serde_json::to_vec_pretty(&document)?)
}

/// Quotes a field when it contains a separator, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

const CSV_HEADER: &str = "id,title,content,entry_type,mood_rating,pain_level,created_at,sentiment_score,sentiment_label,keywords,topics,tags,word_count";

fn render_csv(items: &[ExportItem]) -> Vec<u8> {
    let opt = |v: Option<String>| v.unwrap_or_default();
    let mut out = String::from(CSV_HEADER);
    out.push_str("\r\n");

    for item in items {
        let e = &item.entry;
        let row = [
            e.id.to_string(),
            csv_field(&e.title),
            csv_field(&e.content),
            e.entry_type.to_string(),
            opt(e.mood_rating.map(|v| v.to_string())),
            opt(e.pain_level.map(|v| v.to_string())),
            e.created_at.to_rfc3339(),
            opt(e.sentiment_score.map(|v| v.to_string())),
            opt(e.sentiment_label.map(|v| v.to_string())),
            csv_field(&e.keywords.0.join(", ")),
            csv_field(&e.topics.0.join(", ")),
            csv_field(&item.tag_names.join(", ")),
            e.word_count().to_string(),
        ];
        out.push_str(&row.join(","));
        out.push_str("\r\n");
    }
    out.into_bytes()
}

/// Renders the export body. PDF and DOCX are not produced.
pub fn render(export: &JournalExport, username: &str, items: &[ExportItem]) -> Result<Vec<u8>, ExportError> {
    match export.export_format {
        ExportFormat::Json => render_json(export, username, items),
        ExportFormat::Csv => Ok(render_csv(items)),
        other => Err(ExportError::Unsupported(other)),
    }
}

/// Writes the rendered export into `dir`, returning the path and size.
pub async fn write_export(
    dir: &Path,
    export: &JournalExport,
    username: &str,
    items: &[ExportItem],
) -> Result<(PathBuf, u64), ExportError> {
    let body = render(export, username, items)?;
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(export_file_name(export, Utc::now()));
    tokio::fs::write(&path, &body).await?;
    Ok((path, body.len() as u64))
}

fn signing_payload(export_id: Uuid, expires: i64) -> String {
    format!("{}.{}", export_id, expires)
}

fn signature(secret: &str, export_id: Uuid, expires: i64) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(signing_payload(export_id, expires).as_bytes());
    Some(mac)
}

/// Short-lived download link for a completed export.
pub fn signed_download_url(
    secret: &str,
    export_id: Uuid,
    ttl_secs: i64,
    now: DateTime<Utc>,
) -> Option<(String, DateTime<Utc>)> {
    let expires_at = now + Duration::seconds(ttl_secs);
    let expires = expires_at.timestamp();
    let mac = signature(secret, export_id, expires)?;
    let sig = general_purpose::URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    let url = format!(
        "/api/journal/exports/{}/file?expires={}&signature={}",
        export_id, expires, sig
    );
    Some((url, expires_at))
}

pub fn verify_download(secret: &str, export_id: Uuid, expires: i64, sig: &str, now: DateTime<Utc>) -> bool {
    if now.timestamp() > expires {
        return false;
    }
    let Ok(raw) = general_purpose::URL_SAFE_NO_PAD.decode(sig) else {
        return false;
    };
    signature(secret, export_id, expires)
        .map(|mac| mac.verify_slice(&raw).is_ok())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryType, SentimentLabel};
    use chrono::{NaiveDate, TimeZone};
    use sqlx::types::Json;

    fn export(format: ExportFormat) -> JournalExport {
        let now = Utc::now();
        JournalExport {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            export_format: format,
            date_range_start: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            date_range_end: NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            include_private: false,
            entry_types: Json(vec![]),
            tags: Json(vec![]),
            file_path: String::new(),
            file_size_bytes: None,
            is_complete: false,
            error_message: String::new(),
            created_at: now,
            expires_at: now,
        }
    }

    fn item(day: u32, private: bool, content: &str, tags: &[&str]) -> ExportItem {
        let at = Utc.with_ymd_and_hms(2024, 3, day, 9, 30, 0).unwrap();
        ExportItem {
            entry: JournalEntry {
                id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                title: "Day".into(),
                content: content.into(),
                entry_type: EntryType::Text,
                transcription: String::new(),
                mood_rating: Some(4),
                pain_level: None,
                is_private: private,
                shared_with_provider: false,
                sentiment_score: Some(0.5),
                sentiment_label: Some(SentimentLabel::Positive),
                keywords: Json(vec!["walk".into(), "sleep".into()]),
                entities: Json(vec![]),
                topics: Json(vec!["lifestyle".into()]),
                urgency_score: None,
                clinical_flags: Json(vec![]),
                created_at: at,
                updated_at: at,
            },
            tag_names: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn test_filters() {
        let mut exp = export(ExportFormat::Json);
        assert!(matches_export(&exp, &item(5, false, "ok", &[])));
        assert!(!matches_export(&exp, &item(5, true, "ok", &[])));

        exp.include_private = true;
        exp.tags = Json(vec!["work".into()]);
        assert!(!matches_export(&exp, &item(5, true, "ok", &["lifestyle"])));
        assert!(matches_export(&exp, &item(31, true, "ok", &["work"])));

        exp.entry_types = Json(vec!["mood".into()]);
        assert!(!matches_export(&exp, &item(5, true, "ok", &["work"])));
    }

    #[test]
    fn test_csv_quotes_fields() {
        let body = render(&export(ExportFormat::Csv), "pat", &[item(2, false, "tired, \"sore\"\nback", &[])]).unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with(CSV_HEADER));
        assert!(text.contains("\"tired, \"\"sore\"\"\nback\""));
        assert!(text.contains("\"walk, sleep\""));
        assert!(text.contains(",positive,"));
    }

    #[test]
    fn test_json_document_shape() {
        let body = render(&export(ExportFormat::Json), "pat", &[item(2, false, "good walk today", &["work"])]).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(doc["export_info"]["user"], "pat");
        assert_eq!(doc["export_info"]["total_entries"], 1);
        assert_eq!(doc["export_info"]["date_range"]["start"], "2024-03-01");
        assert_eq!(doc["entries"][0]["word_count"], 3);
        assert_eq!(doc["entries"][0]["tags"][0], "work");
    }

    #[test]
    fn test_pdf_is_unsupported() {
        let err = render(&export(ExportFormat::Pdf), "pat", &[]).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported export format: pdf");
    }

    #[tokio::test]
    async fn test_write_export_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        let exp = export(ExportFormat::Csv);
        let (path, size) = write_export(dir.path(), &exp, "pat", &[item(3, false, "ok", &[])])
            .await
            .unwrap();
        assert!(path.starts_with(dir.path()));
        assert!(path.extension().is_some_and(|e| e == "csv"));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);
    }

    #[test]
    fn test_download_signature() {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let (url, expires_at) = signed_download_url("s3cret", id, 900, now).unwrap();
        let sig = url.split("signature=").nth(1).unwrap();
        let expires = expires_at.timestamp();

        assert!(verify_download("s3cret", id, expires, sig, now));
        assert!(!verify_download("other", id, expires, sig, now));
        assert!(!verify_download("s3cret", Uuid::new_v4(), expires, sig, now));
        assert!(!verify_download("s3cret", id, expires, sig, now + Duration::seconds(901)));
        assert!(!verify_download("s3cret", id, expires, "not base64!", now));
    }
}
