use super::{authenticate, found, record_audit, AppState};
use crate::error::{ApiError, ApiResult};
use crate::export::{signed_download_url, verify_download};
use crate::jobs::{apply_entry_analysis, Job};
use crate::models::*;
use crate::nlp_service::{current_streak, longest_streak};
use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{Datelike, Duration, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;
use validator::Validate;

const RECENT_ENTRIES: i64 = 10;
const KEYWORD_WINDOW: usize = 50;
const DAILY_PROMPTS: i64 = 3;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/entries/insights", web::get().to(entry_insights))
        .route("/entries/stats", web::get().to(entry_stats))
        .route("/entries/recent", web::get().to(recent_entries))
        .service(
            web::resource("/entries")
                .route(web::get().to(list_entries))
                .route(web::post().to(create_entry)),
        )
        .service(
            web::resource("/entries/{id}")
                .route(web::get().to(get_entry))
                .route(web::put().to(update_entry))
                .route(web::patch().to(update_entry))
                .route(web::delete().to(delete_entry)),
        )
        .route("/entries/{id}/analyze", web::post().to(analyze_entry))
        .service(
            web::resource("/tags")
                .route(web::get().to(list_tags))
                .route(web::post().to(create_tag)),
        )
        .service(
            web::resource("/tags/{id}")
                .route(web::get().to(get_tag))
                .route(web::put().to(update_tag))
                .route(web::patch().to(update_tag))
                .route(web::delete().to(delete_tag)),
        )
        .route("/mood/trends", web::get().to(mood_trends))
        .route("/mood/today", web::get().to(mood_today))
        .service(
            web::resource("/mood")
                .route(web::get().to(list_moods))
                .route(web::post().to(create_mood)),
        )
        .service(
            web::resource("/mood/{id}")
                .route(web::get().to(get_mood))
                .route(web::put().to(update_mood))
                .route(web::patch().to(update_mood))
                .route(web::delete().to(delete_mood)),
        )
        .route("/symptoms/trends", web::get().to(symptom_trends))
        .route("/symptoms/summary", web::get().to(symptom_summary))
        .service(
            web::resource("/symptoms")
                .route(web::get().to(list_symptoms))
                .route(web::post().to(create_symptom)),
        )
        .service(
            web::resource("/symptoms/{id}")
                .route(web::get().to(get_symptom))
                .route(web::put().to(update_symptom))
                .route(web::patch().to(update_symptom))
                .route(web::delete().to(delete_symptom)),
        )
        .route("/prompts/daily", web::get().to(daily_prompts))
        .route("/prompts", web::get().to(list_prompts))
        .route("/prompts/{id}", web::get().to(get_prompt))
        .service(
            web::resource("/prompt-responses")
                .route(web::get().to(list_prompt_responses))
                .route(web::post().to(create_prompt_response)),
        )
        .service(
            web::resource("/prompt-responses/{id}")
                .route(web::get().to(get_prompt_response))
                .route(web::put().to(update_prompt_response))
                .route(web::patch().to(update_prompt_response))
                .route(web::delete().to(delete_prompt_response)),
        )
        .service(
            web::resource("/exports")
                .route(web::get().to(list_exports))
                .route(web::post().to(create_export)),
        )
        .service(
            web::resource("/exports/{id}")
                .route(web::get().to(get_export))
                .route(web::delete().to(delete_export)),
        )
        .route("/exports/{id}/download", web::get().to(download_export))
        .route("/exports/{id}/file", web::get().to(serve_export_file));
}

/// Trend window in days, 30 by default and at most a year.
fn trend_days(requested: Option<i64>) -> i32 {
    requested.unwrap_or(30).clamp(1, 365) as i32
}

// ============ Entries ============

async fn load_entry_tags(pool: &PgPool, entry_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<EntryTag>>, sqlx::Error> {
    let rows: Vec<EntryTag> = sqlx::query_as(
        "SELECT et.entry_id, et.tag_id, t.name, t.color, et.confidence, et.added_by_ai
         FROM journal_entry_tags et
         JOIN journal_tags t ON t.id = et.tag_id
         WHERE et.entry_id = ANY($1)
         ORDER BY t.name",
    )
    .bind(entry_ids)
    .fetch_all(pool)
    .await?;

    let mut by_entry: HashMap<Uuid, Vec<EntryTag>> = HashMap::new();
    for tag in rows {
        by_entry.entry(tag.entry_id).or_default().push(tag);
    }
    Ok(by_entry)
}

async fn entry_responses(pool: &PgPool, entries: Vec<JournalEntry>) -> ApiResult<Vec<JournalEntryResponse>> {
    let ids: Vec<Uuid> = entries.iter().map(|e| e.id).collect();
    let mut tags = load_entry_tags(pool, &ids).await?;
    Ok(entries
        .into_iter()
        .map(|e| {
            let t = tags.remove(&e.id).unwrap_or_default();
            JournalEntryResponse::new(e, t)
        })
        .collect())
}

async fn entry_response(pool: &PgPool, entry: JournalEntry) -> ApiResult<JournalEntryResponse> {
    let mut tags = load_entry_tags(pool, &[entry.id]).await?;
    let t = tags.remove(&entry.id).unwrap_or_default();
    Ok(JournalEntryResponse::new(entry, t))
}

async fn own_entry(pool: &PgPool, user_id: Uuid, id: Uuid) -> ApiResult<JournalEntry> {
    let entry: Option<JournalEntry> = sqlx::query_as("SELECT * FROM journal_entries WHERE id = $1 AND user_id = $2")
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    found(entry)
}

fn entry_list_query(user_id: Uuid, query: EntryListQuery) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("SELECT * FROM journal_entries WHERE user_id = ");
    qb.push_bind(user_id);

    if let Some(entry_type) = query.entry_type {
        qb.push(" AND entry_type = ").push_bind(entry_type);
    }
    if let Some(start) = query.start_date {
        qb.push(" AND created_at::date >= ").push_bind(start);
    }
    if let Some(end) = query.end_date {
        qb.push(" AND created_at::date <= ").push_bind(end);
    }
    if let Some(tags) = query.tags {
        let names: Vec<String> = tags
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if !names.is_empty() {
            qb.push(
                " AND id IN (SELECT et.entry_id FROM journal_entry_tags et
                   JOIN journal_tags t ON t.id = et.tag_id WHERE t.name = ANY(",
            );
            qb.push_bind(names);
            qb.push("))");
        }
    }
    if let Some(search) = query.search.filter(|s| !s.trim().is_empty()) {
        let pattern = format!("%{}%", search.trim());
        qb.push(" AND (title ILIKE ").push_bind(pattern.clone());
        qb.push(" OR content ILIKE ").push_bind(pattern);
        qb.push(")");
    }

    qb.push(" ORDER BY created_at DESC");
    qb
}

pub async fn list_entries(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<EntryListQuery>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let mut qb = entry_list_query(user.id, query.into_inner());
    let entries: Vec<JournalEntry> = qb.build_query_as().fetch_all(&state.pool).await?;
    Ok(HttpResponse::Ok().json(entry_responses(&state.pool, entries).await?))
}

pub async fn create_entry(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateEntryRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    body.validate()?;

    let mut tx = state.pool.begin().await?;
    let entry: JournalEntry = sqlx::query_as(
        "INSERT INTO journal_entries (user_id, title, content, entry_type, mood_rating, pain_level,
            is_private, shared_with_provider)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
    )
    .bind(user.id)
    .bind(&body.title)
    .bind(&body.content)
    .bind(body.entry_type.unwrap_or(EntryType::Text))
    .bind(body.mood_rating)
    .bind(body.pain_level)
    .bind(body.is_private.unwrap_or(true))
    .bind(body.shared_with_provider)
    .fetch_one(&mut *tx)
    .await?;

    if !body.tag_ids.is_empty() {
        // Only system tags and the caller's own tags can be attached.
        sqlx::query(
            "INSERT INTO journal_entry_tags (entry_id, tag_id)
             SELECT $1, id FROM journal_tags
             WHERE id = ANY($2) AND (is_system_tag OR created_by = $3)
             ON CONFLICT (entry_id, tag_id) DO NOTHING",
        )
        .bind(entry.id)
        .bind(&body.tag_ids)
        .bind(user.id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    state.jobs.enqueue(Job::AnalyzeJournalEntry(entry.id));
    Ok(HttpResponse::Created().json(entry_response(&state.pool, entry).await?))
}

pub async fn get_entry(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let entry = own_entry(&state.pool, user.id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(entry_response(&state.pool, entry).await?))
}

pub async fn update_entry(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<UpdateEntryRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    body.validate()?;

    let entry: Option<JournalEntry> = sqlx::query_as(
        "UPDATE journal_entries SET
            title = COALESCE($3, title),
            content = COALESCE($4, content),
            entry_type = COALESCE($5, entry_type),
            mood_rating = COALESCE($6, mood_rating),
            pain_level = COALESCE($7, pain_level),
            is_private = COALESCE($8, is_private),
            shared_with_provider = COALESCE($9, shared_with_provider),
            updated_at = now()
         WHERE id = $1 AND user_id = $2 RETURNING *",
    )
    .bind(path.into_inner())
    .bind(user.id)
    .bind(&body.title)
    .bind(&body.content)
    .bind(body.entry_type)
    .bind(body.mood_rating)
    .bind(body.pain_level)
    .bind(body.is_private)
    .bind(body.shared_with_provider)
    .fetch_optional(&state.pool)
    .await?;
    let entry = found(entry)?;

    // Text or ratings changed, so the stored analysis is stale.
    if body.content.is_some() || body.mood_rating.is_some() || body.pain_level.is_some() {
        state.jobs.enqueue(Job::AnalyzeJournalEntry(entry.id));
    }

    Ok(HttpResponse::Ok().json(entry_response(&state.pool, entry).await?))
}

pub async fn delete_entry(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let deleted = sqlx::query("DELETE FROM journal_entries WHERE id = $1 AND user_id = $2")
        .bind(path.into_inner())
        .bind(user.id)
        .execute(&state.pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::NotFound);
    }
    Ok(HttpResponse::NoContent().finish())
}

/// Runs analysis inline instead of waiting for the worker.
pub async fn analyze_entry(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let entry = own_entry(&state.pool, user.id, path.into_inner()).await?;
    let updated = apply_entry_analysis(&state.pool, &state.nlp, &entry).await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Entry analyzed successfully",
        "entry": entry_response(&state.pool, updated).await?,
    })))
}

pub async fn entry_insights(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let entries: Vec<JournalEntry> =
        sqlx::query_as("SELECT * FROM journal_entries WHERE user_id = $1 ORDER BY created_at DESC")
            .bind(user.id)
            .fetch_all(&state.pool)
            .await?;

    let insights = state.nlp.generate_insights(&entries, Utc::now().date_naive());
    Ok(HttpResponse::Ok().json(insights))
}

/// Top `limit` keywords across entries, ties kept in first-seen order.
fn top_keywords(entries: &[JournalEntry], limit: usize) -> Vec<String> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for keyword in entries.iter().flat_map(|e| e.keywords.0.iter()) {
        match counts.iter_mut().find(|(k, _)| *k == keyword.as_str()) {
            Some(slot) => slot.1 += 1,
            None => counts.push((keyword.as_str(), 1)),
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.into_iter().take(limit).map(|(k, _)| k.to_string()).collect()
}

/// Totals and distributions over `entries`, which must be newest first.
fn compute_stats(entries: &[JournalEntry], today: NaiveDate) -> JournalStats {
    let days: Vec<NaiveDate> = entries.iter().map(|e| e.created_at.date_naive()).collect();
    let total_words: usize = entries.iter().map(|e| e.word_count()).sum();
    let week_ago = today - Duration::days(7);
    let month_start = today.with_day(1).unwrap_or(today);

    let mut sentiment = SentimentDistribution::default();
    for entry in entries {
        match entry.sentiment_label {
            Some(SentimentLabel::Positive) => sentiment.positive += 1,
            Some(SentimentLabel::Negative) => sentiment.negative += 1,
            Some(SentimentLabel::Neutral) => sentiment.neutral += 1,
            None => {}
        }
    }

    let recent = &entries[..entries.len().min(KEYWORD_WINDOW)];

    JournalStats {
        total_entries: entries.len(),
        total_words,
        avg_words_per_entry: if entries.is_empty() {
            0.0
        } else {
            total_words as f64 / entries.len() as f64
        },
        entries_today: days.iter().filter(|d| **d == today).count(),
        entries_this_week: days.iter().filter(|d| **d > week_ago).count(),
        entries_this_month: days.iter().filter(|d| **d >= month_start).count(),
        current_streak: current_streak(&days, today),
        longest_streak: longest_streak(&days),
        most_used_tags: Vec::new(),
        common_keywords: top_keywords(recent, 10),
        sentiment_distribution: sentiment,
        mood_entries: 0,
        symptom_entries: 0,
        clinical_flags: entries.iter().filter(|e| e.has_clinical_concerns()).count(),
    }
}

pub async fn entry_stats(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let entries: Vec<JournalEntry> =
        sqlx::query_as("SELECT * FROM journal_entries WHERE user_id = $1 ORDER BY created_at DESC")
            .bind(user.id)
            .fetch_all(&state.pool)
            .await?;

    let mut stats = compute_stats(&entries, Utc::now().date_naive());

    let tags: Vec<(String, i64)> = sqlx::query_as(
        "SELECT t.name, COUNT(*) FROM journal_entry_tags et
         JOIN journal_tags t ON t.id = et.tag_id
         JOIN journal_entries e ON e.id = et.entry_id
         WHERE e.user_id = $1
         GROUP BY t.name ORDER BY COUNT(*) DESC, t.name LIMIT 5",
    )
    .bind(user.id)
    .fetch_all(&state.pool)
    .await?;
    stats.most_used_tags = tags
        .into_iter()
        .map(|(name, count)| TagUsage { name, count: count as usize })
        .collect();

    stats.mood_entries = sqlx::query_scalar("SELECT COUNT(*) FROM mood_tracking WHERE user_id = $1")
        .bind(user.id)
        .fetch_one(&state.pool)
        .await?;
    stats.symptom_entries = sqlx::query_scalar("SELECT COUNT(*) FROM symptom_logs WHERE user_id = $1")
        .bind(user.id)
        .fetch_one(&state.pool)
        .await?;

    Ok(HttpResponse::Ok().json(stats))
}

pub async fn recent_entries(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let entries: Vec<JournalEntry> =
        sqlx::query_as("SELECT * FROM journal_entries WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2")
            .bind(user.id)
            .bind(RECENT_ENTRIES)
            .fetch_all(&state.pool)
            .await?;
    Ok(HttpResponse::Ok().json(entry_responses(&state.pool, entries).await?))
}

// ============ Tags ============

pub async fn list_tags(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let tags: Vec<JournalTag> = sqlx::query_as(
        "SELECT * FROM journal_tags WHERE is_system_tag OR created_by = $1 ORDER BY name",
    )
    .bind(user.id)
    .fetch_all(&state.pool)
    .await?;
    Ok(HttpResponse::Ok().json(tags))
}

pub async fn create_tag(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateTagRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    body.validate()?;

    let tag: JournalTag = sqlx::query_as(
        "INSERT INTO journal_tags (name, color, description, created_by)
         VALUES ($1, $2, $3, $4) RETURNING *",
    )
    .bind(body.name.trim())
    .bind(body.color.as_deref().unwrap_or("#007bff"))
    .bind(&body.description)
    .bind(user.id)
    .fetch_one(&state.pool)
    .await
    .map_err(|e| match ApiError::from(e) {
        ApiError::Conflict(_) => ApiError::field("name", "journal tag with this name already exists."),
        other => other,
    })?;

    Ok(HttpResponse::Created().json(tag))
}

pub async fn get_tag(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let tag: Option<JournalTag> = sqlx::query_as(
        "SELECT * FROM journal_tags WHERE id = $1 AND (is_system_tag OR created_by = $2)",
    )
    .bind(path.into_inner())
    .bind(user.id)
    .fetch_optional(&state.pool)
    .await?;
    Ok(HttpResponse::Ok().json(found(tag)?))
}

pub async fn update_tag(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<UpdateTagRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    body.validate()?;

    let tag: Option<JournalTag> = sqlx::query_as(
        "UPDATE journal_tags SET
            name = COALESCE($3, name),
            color = COALESCE($4, color),
            description = COALESCE($5, description)
         WHERE id = $1 AND created_by = $2 AND NOT is_system_tag RETURNING *",
    )
    .bind(path.into_inner())
    .bind(user.id)
    .bind(body.name.as_deref().map(str::trim))
    .bind(&body.color)
    .bind(&body.description)
    .fetch_optional(&state.pool)
    .await?;
    Ok(HttpResponse::Ok().json(found(tag)?))
}

pub async fn delete_tag(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let deleted = sqlx::query("DELETE FROM journal_tags WHERE id = $1 AND created_by = $2 AND NOT is_system_tag")
        .bind(path.into_inner())
        .bind(user.id)
        .execute(&state.pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::NotFound);
    }
    Ok(HttpResponse::NoContent().finish())
}

// ============ Mood ============

/// A linked entry must belong to the caller.
async fn check_entry_link(pool: &PgPool, user_id: Uuid, entry_id: Option<Uuid>) -> ApiResult<()> {
    let Some(entry_id) = entry_id else {
        return Ok(());
    };
    let owned: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM journal_entries WHERE id = $1 AND user_id = $2)")
            .bind(entry_id)
            .bind(user_id)
            .fetch_one(pool)
            .await?;
    if owned {
        Ok(())
    } else {
        Err(ApiError::field("journal_entry_id", "Invalid pk - object does not exist."))
    }
}

pub async fn list_moods(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let moods: Vec<MoodTracking> =
        sqlx::query_as("SELECT * FROM mood_tracking WHERE user_id = $1 ORDER BY recorded_at DESC")
            .bind(user.id)
            .fetch_all(&state.pool)
            .await?;
    Ok(HttpResponse::Ok().json(moods))
}

pub async fn create_mood(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateMoodRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    body.validate()?;
    check_entry_link(&state.pool, user.id, body.journal_entry_id).await?;

    let mood: MoodTracking = sqlx::query_as(
        "INSERT INTO mood_tracking (user_id, overall_mood, energy_level, anxiety_level, sleep_quality,
            activities, triggers, location, weather, notes, journal_entry_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING *",
    )
    .bind(user.id)
    .bind(body.overall_mood)
    .bind(body.energy_level)
    .bind(body.anxiety_level)
    .bind(body.sleep_quality)
    .bind(Json(&body.activities))
    .bind(Json(&body.triggers))
    .bind(&body.location)
    .bind(&body.weather)
    .bind(&body.notes)
    .bind(body.journal_entry_id)
    .fetch_one(&state.pool)
    .await?;

    Ok(HttpResponse::Created().json(mood))
}

pub async fn get_mood(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let mood: Option<MoodTracking> = sqlx::query_as("SELECT * FROM mood_tracking WHERE id = $1 AND user_id = $2")
        .bind(path.into_inner())
        .bind(user.id)
        .fetch_optional(&state.pool)
        .await?;
    Ok(HttpResponse::Ok().json(found(mood)?))
}

pub async fn update_mood(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<UpdateMoodRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    body.validate()?;

    let mood: Option<MoodTracking> = sqlx::query_as(
        "UPDATE mood_tracking SET
            overall_mood = COALESCE($3, overall_mood),
            energy_level = COALESCE($4, energy_level),
            anxiety_level = COALESCE($5, anxiety_level),
            sleep_quality = COALESCE($6, sleep_quality),
            activities = COALESCE($7, activities),
            triggers = COALESCE($8, triggers),
            location = COALESCE($9, location),
            weather = COALESCE($10, weather),
            notes = COALESCE($11, notes)
         WHERE id = $1 AND user_id = $2 RETURNING *",
    )
    .bind(path.into_inner())
    .bind(user.id)
    .bind(body.overall_mood)
    .bind(body.energy_level)
    .bind(body.anxiety_level)
    .bind(body.sleep_quality)
    .bind(body.activities.as_ref().map(Json))
    .bind(body.triggers.as_ref().map(Json))
    .bind(&body.location)
    .bind(&body.weather)
    .bind(&body.notes)
    .fetch_optional(&state.pool)
    .await?;
    Ok(HttpResponse::Ok().json(found(mood)?))
}

pub async fn delete_mood(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let deleted = sqlx::query("DELETE FROM mood_tracking WHERE id = $1 AND user_id = $2")
        .bind(path.into_inner())
        .bind(user.id)
        .execute(&state.pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::NotFound);
    }
    Ok(HttpResponse::NoContent().finish())
}

pub async fn mood_trends(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<TrendQuery>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let points: Vec<MoodTrendPoint> = sqlx::query_as(
        "SELECT recorded_at::date AS date,
                AVG(overall_mood)::float8 AS avg_mood,
                AVG(energy_level)::float8 AS avg_energy,
                AVG(anxiety_level)::float8 AS avg_anxiety,
                AVG(sleep_quality)::float8 AS avg_sleep,
                COUNT(*) AS count
         FROM mood_tracking
         WHERE user_id = $1 AND recorded_at >= now() - make_interval(days => $2)
         GROUP BY 1 ORDER BY 1",
    )
    .bind(user.id)
    .bind(trend_days(query.days))
    .fetch_all(&state.pool)
    .await?;
    Ok(HttpResponse::Ok().json(points))
}

pub async fn mood_today(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let mood: Option<MoodTracking> = sqlx::query_as(
        "SELECT * FROM mood_tracking WHERE user_id = $1 AND recorded_at::date = $2
         ORDER BY recorded_at DESC LIMIT 1",
    )
    .bind(user.id)
    .bind(Utc::now().date_naive())
    .fetch_optional(&state.pool)
    .await?;

    match mood {
        Some(mood) => Ok(HttpResponse::Ok().json(mood)),
        None => Ok(HttpResponse::NotFound().json(serde_json::json!({
            "message": "No mood entry for today"
        }))),
    }
}

// ============ Symptoms ============

pub async fn list_symptoms(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let logs: Vec<SymptomLog> =
        sqlx::query_as("SELECT * FROM symptom_logs WHERE user_id = $1 ORDER BY recorded_at DESC")
            .bind(user.id)
            .fetch_all(&state.pool)
            .await?;
    let body: Vec<SymptomLogResponse> = logs.into_iter().map(SymptomLogResponse::from).collect();
    Ok(HttpResponse::Ok().json(body))
}

pub async fn create_symptom(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateSymptomRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    body.validate()?;
    check_entry_link(&state.pool, user.id, body.journal_entry_id).await?;

    let log: SymptomLog = sqlx::query_as(
        "INSERT INTO symptom_logs (user_id, symptom_name, severity, duration_hours, triggers,
            relief_methods, medications_taken, description, journal_entry_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING *",
    )
    .bind(user.id)
    .bind(body.symptom_name.trim())
    .bind(body.severity)
    .bind(body.duration_hours)
    .bind(Json(&body.triggers))
    .bind(Json(&body.relief_methods))
    .bind(Json(&body.medications_taken))
    .bind(&body.description)
    .bind(body.journal_entry_id)
    .fetch_one(&state.pool)
    .await?;

    Ok(HttpResponse::Created().json(SymptomLogResponse::from(log)))
}

pub async fn get_symptom(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let log: Option<SymptomLog> = sqlx::query_as("SELECT * FROM symptom_logs WHERE id = $1 AND user_id = $2")
        .bind(path.into_inner())
        .bind(user.id)
        .fetch_optional(&state.pool)
        .await?;
    Ok(HttpResponse::Ok().json(SymptomLogResponse::from(found(log)?)))
}

pub async fn update_symptom(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<UpdateSymptomRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    body.validate()?;

    let log: Option<SymptomLog> = sqlx::query_as(
        "UPDATE symptom_logs SET
            symptom_name = COALESCE($3, symptom_name),
            severity = COALESCE($4, severity),
            duration_hours = COALESCE($5, duration_hours),
            triggers = COALESCE($6, triggers),
            relief_methods = COALESCE($7, relief_methods),
            medications_taken = COALESCE($8, medications_taken),
            description = COALESCE($9, description)
         WHERE id = $1 AND user_id = $2 RETURNING *",
    )
    .bind(path.into_inner())
    .bind(user.id)
    .bind(body.symptom_name.as_deref().map(str::trim))
    .bind(body.severity)
    .bind(body.duration_hours)
    .bind(body.triggers.as_ref().map(Json))
    .bind(body.relief_methods.as_ref().map(Json))
    .bind(body.medications_taken.as_ref().map(Json))
    .bind(&body.description)
    .fetch_optional(&state.pool)
    .await?;
    Ok(HttpResponse::Ok().json(SymptomLogResponse::from(found(log)?)))
}

pub async fn delete_symptom(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let deleted = sqlx::query("DELETE FROM symptom_logs WHERE id = $1 AND user_id = $2")
        .bind(path.into_inner())
        .bind(user.id)
        .execute(&state.pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::NotFound);
    }
    Ok(HttpResponse::NoContent().finish())
}

pub async fn symptom_trends(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<TrendQuery>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let query = query.into_inner();

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "SELECT recorded_at::date AS date, symptom_name,
                AVG(severity)::float8 AS avg_severity,
                COUNT(*) AS frequency,
                AVG(duration_hours)::float8 AS avg_duration
         FROM symptom_logs WHERE user_id = ",
    );
    qb.push_bind(user.id);
    qb.push(" AND recorded_at >= now() - make_interval(days => ")
        .push_bind(trend_days(query.days))
        .push(")");
    if let Some(symptom) = query.symptom.filter(|s| !s.is_empty()) {
        qb.push(" AND symptom_name ILIKE ").push_bind(format!("%{}%", symptom));
    }
    qb.push(" GROUP BY 1, 2 ORDER BY 1, 2");

    let points: Vec<SymptomTrendPoint> = qb.build_query_as().fetch_all(&state.pool).await?;
    Ok(HttpResponse::Ok().json(points))
}

pub async fn symptom_summary(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<TrendQuery>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let summary: Vec<SymptomSummary> = sqlx::query_as(
        "SELECT symptom_name,
                COUNT(*) AS frequency,
                AVG(severity)::float8 AS avg_severity,
                MAX(severity) AS max_severity,
                AVG(duration_hours)::float8 AS avg_duration
         FROM symptom_logs
         WHERE user_id = $1 AND recorded_at >= now() - make_interval(days => $2)
         GROUP BY symptom_name ORDER BY frequency DESC, symptom_name",
    )
    .bind(user.id)
    .bind(trend_days(query.days))
    .fetch_all(&state.pool)
    .await?;
    Ok(HttpResponse::Ok().json(summary))
}

// ============ Prompts ============

const PROMPT_AUDIENCE: &str =
    "is_active AND (target_user_types = '[]'::jsonb OR target_user_types @> jsonb_build_array($1::text))";

pub async fn list_prompts(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let prompts: Vec<JournalPrompt> = sqlx::query_as(&format!(
        "SELECT * FROM journal_prompts WHERE {} ORDER BY prompt_type, title",
        PROMPT_AUDIENCE
    ))
    .bind(user.user_type.as_str())
    .fetch_all(&state.pool)
    .await?;
    Ok(HttpResponse::Ok().json(prompts))
}

pub async fn get_prompt(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let prompt: Option<JournalPrompt> = sqlx::query_as(&format!(
        "SELECT * FROM journal_prompts WHERE {} AND id = $2",
        PROMPT_AUDIENCE
    ))
    .bind(user.user_type.as_str())
    .bind(path.into_inner())
    .fetch_optional(&state.pool)
    .await?;
    Ok(HttpResponse::Ok().json(found(prompt)?))
}

/// Daily prompts rotate by date so the selection is stable within a day.
pub async fn daily_prompts(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let prompts: Vec<JournalPrompt> = sqlx::query_as(&format!(
        "SELECT * FROM journal_prompts WHERE {} AND prompt_type = 'daily'
         ORDER BY md5(id::text || $2::text) LIMIT $3",
        PROMPT_AUDIENCE
    ))
    .bind(user.user_type.as_str())
    .bind(Utc::now().date_naive().to_string())
    .bind(DAILY_PROMPTS)
    .fetch_all(&state.pool)
    .await?;
    Ok(HttpResponse::Ok().json(prompts))
}

pub async fn list_prompt_responses(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let responses: Vec<JournalPromptResponse> = sqlx::query_as(
        "SELECT * FROM journal_prompt_responses WHERE user_id = $1 ORDER BY completed_at DESC",
    )
    .bind(user.id)
    .fetch_all(&state.pool)
    .await?;
    Ok(HttpResponse::Ok().json(responses))
}

pub async fn create_prompt_response(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreatePromptResponseRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    body.validate()?;
    check_entry_link(&state.pool, user.id, body.journal_entry_id).await?;

    let response: JournalPromptResponse = sqlx::query_as(
        "INSERT INTO journal_prompt_responses (user_id, prompt_id, journal_entry_id, response_text)
         VALUES ($1, $2, $3, $4) RETURNING *",
    )
    .bind(user.id)
    .bind(body.prompt_id)
    .bind(body.journal_entry_id)
    .bind(&body.response_text)
    .fetch_one(&state.pool)
    .await?;

    Ok(HttpResponse::Created().json(response))
}

pub async fn get_prompt_response(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let response: Option<JournalPromptResponse> =
        sqlx::query_as("SELECT * FROM journal_prompt_responses WHERE id = $1 AND user_id = $2")
            .bind(path.into_inner())
            .bind(user.id)
            .fetch_optional(&state.pool)
            .await?;
    Ok(HttpResponse::Ok().json(found(response)?))
}

pub async fn update_prompt_response(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<UpdatePromptResponseRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    body.validate()?;
    check_entry_link(&state.pool, user.id, body.journal_entry_id).await?;

    let response: Option<JournalPromptResponse> = sqlx::query_as(
        "UPDATE journal_prompt_responses SET
            journal_entry_id = COALESCE($3, journal_entry_id),
            response_text = COALESCE($4, response_text)
         WHERE id = $1 AND user_id = $2 RETURNING *",
    )
    .bind(path.into_inner())
    .bind(user.id)
    .bind(body.journal_entry_id)
    .bind(&body.response_text)
    .fetch_optional(&state.pool)
    .await?;
    Ok(HttpResponse::Ok().json(found(response)?))
}

pub async fn delete_prompt_response(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let deleted = sqlx::query("DELETE FROM journal_prompt_responses WHERE id = $1 AND user_id = $2")
        .bind(path.into_inner())
        .bind(user.id)
        .execute(&state.pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::NotFound);
    }
    Ok(HttpResponse::NoContent().finish())
}

// ============ Exports ============

async fn own_export(pool: &PgPool, user_id: Uuid, id: Uuid) -> ApiResult<JournalExport> {
    let export: Option<JournalExport> = sqlx::query_as("SELECT * FROM journal_exports WHERE id = $1 AND user_id = $2")
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    found(export)
}

pub async fn list_exports(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let exports: Vec<JournalExport> =
        sqlx::query_as("SELECT * FROM journal_exports WHERE user_id = $1 ORDER BY created_at DESC")
            .bind(user.id)
            .fetch_all(&state.pool)
            .await?;
    let body: Vec<JournalExportResponse> = exports.into_iter().map(JournalExportResponse::from).collect();
    Ok(HttpResponse::Ok().json(body))
}

pub async fn create_export(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateExportRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    body.validate()?;
    if body.date_range_end < body.date_range_start {
        return Err(ApiError::field(
            "date_range_end",
            "End date must not be before start date.",
        ));
    }

    let entry_types: Vec<String> = body.entry_types.iter().map(|t| t.as_str().to_string()).collect();
    let retention = Duration::days(state.settings.journal.export_retention_days);

    let export: JournalExport = sqlx::query_as(
        "INSERT INTO journal_exports (user_id, export_format, date_range_start, date_range_end,
            include_private, entry_types, tags, expires_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
    )
    .bind(user.id)
    .bind(body.export_format)
    .bind(body.date_range_start)
    .bind(body.date_range_end)
    .bind(body.include_private)
    .bind(Json(&entry_types))
    .bind(Json(&body.tags))
    .bind(Utc::now() + retention)
    .fetch_one(&state.pool)
    .await?;

    state.jobs.enqueue(Job::GenerateExport(export.id));
    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::Export,
        "Journal export requested",
        Some(("journal_export", export.id.to_string())),
    )
    .await;

    Ok(HttpResponse::Created().json(JournalExportResponse::from(export)))
}

pub async fn get_export(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let export = own_export(&state.pool, user.id, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(JournalExportResponse::from(export)))
}

pub async fn delete_export(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let export = own_export(&state.pool, user.id, path.into_inner()).await?;

    if !export.file_path.is_empty() {
        if let Err(e) = tokio::fs::remove_file(&export.file_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(export_id = %export.id, error = %e, "Could not remove export file");
            }
        }
    }

    sqlx::query("DELETE FROM journal_exports WHERE id = $1")
        .bind(export.id)
        .execute(&state.pool)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn download_export(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let export = own_export(&state.pool, user.id, path.into_inner()).await?;

    if !export.is_complete {
        return Err(ApiError::BadRequest("Export is not ready yet".to_string()));
    }

    let cfg = &state.settings.journal;
    let (download_url, expires_at) =
        signed_download_url(&cfg.download_secret, export.id, cfg.download_link_ttl_secs, Utc::now())
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("download signing key rejected")))?;

    Ok(HttpResponse::Ok().json(ExportDownload {
        download_url,
        file_size_bytes: export.file_size_bytes,
        expires_at,
    }))
}

fn export_content_type(format: ExportFormat) -> &'static str {
    match format {
        ExportFormat::Json => "application/json",
        ExportFormat::Csv => "text/csv; charset=utf-8",
        ExportFormat::Pdf => "application/pdf",
        ExportFormat::Docx => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    }
}

/// Serves the export file behind a signed link. No bearer token needed.
pub async fn serve_export_file(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    query: web::Query<SignedDownloadQuery>,
) -> ApiResult<HttpResponse> {
    let id = path.into_inner();
    let secret = &state.settings.journal.download_secret;
    if !verify_download(secret, id, query.expires, &query.signature, Utc::now()) {
        return Err(ApiError::Forbidden("Invalid or expired download link".to_string()));
    }

    let export: Option<JournalExport> =
        sqlx::query_as("SELECT * FROM journal_exports WHERE id = $1 AND is_complete")
            .bind(id)
            .fetch_optional(&state.pool)
            .await?;
    let export = found(export)?;

    let body = match tokio::fs::read(&export.file_path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ApiError::NotFound),
        Err(e) => return Err(ApiError::Internal(e.into())),
    };

    record_audit(
        &state.pool,
        &req,
        export.user_id,
        AuditAction::Export,
        "Journal export downloaded",
        Some(("journal_export", export.id.to_string())),
    )
    .await;

    let file_name = std::path::Path::new(&export.file_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("journal_export.{}", export.export_format));

    Ok(HttpResponse::Ok()
        .content_type(export_content_type(export.export_format))
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(file_name)],
        })
        .body(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};

    fn entry(at: DateTime<Utc>, content: &str, keywords: &[&str], label: Option<SentimentLabel>) -> JournalEntry {
        JournalEntry {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            title: String::new(),
            content: content.to_string(),
            entry_type: EntryType::Text,
            transcription: String::new(),
            mood_rating: None,
            pain_level: None,
            is_private: true,
            shared_with_provider: false,
            sentiment_score: None,
            sentiment_label: label,
            keywords: Json(keywords.iter().map(|k| k.to_string()).collect()),
            entities: Json(vec![]),
            topics: Json(vec![]),
            urgency_score: None,
            clinical_flags: Json(vec![]),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_trend_days_bounds() {
        assert_eq!(trend_days(None), 30);
        assert_eq!(trend_days(Some(0)), 1);
        assert_eq!(trend_days(Some(7)), 7);
        assert_eq!(trend_days(Some(10_000)), 365);
    }

    #[test]
    fn test_top_keywords_orders_by_frequency_then_first_seen() {
        let at = Utc::now();
        let entries = vec![
            entry(at, "", &["sleep", "walk"], None),
            entry(at, "", &["walk", "headache"], None),
            entry(at, "", &["headache", "tea"], None),
        ];
        assert_eq!(top_keywords(&entries, 3), vec!["walk", "headache", "sleep"]);
    }

    #[test]
    fn test_compute_stats() {
        let today = NaiveDate::from_ymd_opt(2024, 5, 20).unwrap();
        let at = |d: u32| Utc.with_ymd_and_hms(2024, 5, d, 12, 0, 0).unwrap();
        let entries = vec![
            entry(at(20), "felt good today", &[], Some(SentimentLabel::Positive)),
            entry(at(19), "tired", &[], Some(SentimentLabel::Negative)),
            entry(at(2), "one two", &[], None),
        ];

        let stats = compute_stats(&entries, today);
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.total_words, 6);
        assert!((stats.avg_words_per_entry - 2.0).abs() < f64::EPSILON);
        assert_eq!(stats.entries_today, 1);
        assert_eq!(stats.entries_this_week, 2);
        assert_eq!(stats.entries_this_month, 3);
        assert_eq!(stats.current_streak, 2);
        assert_eq!(stats.longest_streak, 2);
        assert_eq!(stats.sentiment_distribution.positive, 1);
        assert_eq!(stats.sentiment_distribution.negative, 1);
        assert_eq!(stats.sentiment_distribution.neutral, 0);
    }

    #[test]
    fn test_compute_stats_empty() {
        let stats = compute_stats(&[], NaiveDate::from_ymd_opt(2024, 5, 20).unwrap());
        assert_eq!(stats.total_entries, 0);
        assert_eq!(stats.avg_words_per_entry, 0.0);
        assert_eq!(stats.current_streak, 0);
    }

    #[test]
    fn test_entry_list_query_filters() {
        let query = EntryListQuery {
            entry_type: Some(EntryType::Mood),
            tags: Some("work, ,sleep".into()),
            search: Some("  ".into()),
            ..Default::default()
        };
        let qb = entry_list_query(Uuid::nil(), query);
        let sql = qb.sql();
        assert!(sql.starts_with("SELECT * FROM journal_entries WHERE user_id = $1 AND entry_type = $2"));
        assert!(sql.contains("t.name = ANY($3)"));
        assert!(!sql.contains("ILIKE"));
        assert!(sql.ends_with("ORDER BY created_at DESC"));
    }

    #[test]
    fn test_export_content_types() {
        assert_eq!(export_content_type(ExportFormat::Json), "application/json");
        assert!(export_content_type(ExportFormat::Csv).starts_with("text/csv"));
    }
}
