use super::{authenticate, found, AppState};
use crate::error::{ApiError, ApiResult};
use crate::models::*;
use crate::sse::{broadcast_message, message_stream};
use actix_web::{web, HttpRequest, HttpResponse};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

/// Messages past their auto-delete time are hidden everywhere.
const NOT_EXPIRED: &str = "(auto_delete_at IS NULL OR auto_delete_at > now())";

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/messages/unread_count", web::get().to(unread_count))
        .service(
            web::resource("/messages")
                .route(web::get().to(list_messages))
                .route(web::post().to(send_message)),
        )
        .service(
            web::resource("/messages/{id}")
                .route(web::get().to(get_message))
                .route(web::delete().to(delete_message)),
        )
        .route("/messages/{id}/read", web::post().to(mark_read))
        .route("/threads/{thread_id}", web::get().to(get_thread))
        .service(
            web::resource("/templates")
                .route(web::get().to(list_templates))
                .route(web::post().to(create_template)),
        )
        .route("/templates/{id}/render", web::post().to(render_template))
        .service(
            web::resource("/drafts")
                .route(web::get().to(list_drafts))
                .route(web::post().to(create_draft)),
        )
        .service(
            web::resource("/drafts/{id}")
                .route(web::get().to(get_draft))
                .route(web::put().to(update_draft))
                .route(web::patch().to(update_draft))
                .route(web::delete().to(delete_draft)),
        )
        .route("/drafts/{id}/send", web::post().to(send_draft))
        .service(
            web::resource("/notification-settings")
                .route(web::get().to(get_notification_settings))
                .route(web::put().to(update_notification_settings))
                .route(web::patch().to(update_notification_settings)),
        )
        .route("/stream", web::get().to(stream));
}

// ============ Messages ============

async fn visible_message(pool: &PgPool, user_id: Uuid, id: Uuid) -> ApiResult<Message> {
    let message: Option<Message> = sqlx::query_as(&format!(
        "SELECT * FROM messages WHERE id = $1 AND (sender_id = $2 OR recipient_id = $2) AND {}",
        NOT_EXPIRED
    ))
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    found(message)
}

/// Thread of the replied-to message, or a fresh one.
async fn resolve_thread(pool: &PgPool, user_id: Uuid, parent: Option<Uuid>) -> ApiResult<String> {
    match parent {
        Some(parent_id) => Ok(visible_message(pool, user_id, parent_id).await?.thread_id),
        None => Ok(Uuid::new_v4().to_string()),
    }
}

/// Stores a message, notifies the recipient and sends any auto-reply.
async fn deliver(state: &AppState, sender: &User, body: &SendMessageRequest) -> ApiResult<Message> {
    body.validate()?;

    let recipient_exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1 AND is_active)")
            .bind(body.recipient_id)
            .fetch_one(&state.pool)
            .await?;
    if !recipient_exists {
        return Err(ApiError::field("recipient_id", "Recipient does not exist."));
    }

    let thread_id = resolve_thread(&state.pool, sender.id, body.parent_message_id).await?;

    let message: Message = sqlx::query_as(
        "INSERT INTO messages (sender_id, recipient_id, subject, content, message_type, priority,
            parent_message_id, thread_id, patient_id, appointment_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING *",
    )
    .bind(sender.id)
    .bind(body.recipient_id)
    .bind(&body.subject)
    .bind(&body.content)
    .bind(body.message_type.unwrap_or(MessageType::General))
    .bind(body.priority.unwrap_or(Priority::Normal))
    .bind(body.parent_message_id)
    .bind(&thread_id)
    .bind(body.patient_id)
    .bind(body.appointment_id)
    .fetch_one(&state.pool)
    .await?;

    info!(message_id = %message.id, priority = message.priority.as_str(), "Message sent");
    broadcast_message(&state.sse_broadcaster, &message);

    if let Err(e) = send_auto_reply(state, &message).await {
        warn!(message_id = %message.id, error = %e, "Auto-reply failed");
    }
    Ok(message)
}

async fn send_auto_reply(state: &AppState, original: &Message) -> Result<(), sqlx::Error> {
    let reply_text: Option<String> = sqlx::query_scalar(
        "SELECT auto_reply_message FROM message_notification_settings
         WHERE user_id = $1 AND auto_reply_enabled AND auto_reply_message <> ''",
    )
    .bind(original.recipient_id)
    .fetch_optional(&state.pool)
    .await?;

    let Some(reply_text) = reply_text else {
        return Ok(());
    };

    let reply: Message = sqlx::query_as(
        "INSERT INTO messages (sender_id, recipient_id, subject, content, message_type, priority,
            parent_message_id, thread_id, is_system_message)
         VALUES ($1, $2, $3, $4, 'system', 'normal', $5, $6, TRUE) RETURNING *",
    )
    .bind(original.recipient_id)
    .bind(original.sender_id)
    .bind(reply_subject(&original.subject))
    .bind(reply_text)
    .bind(original.id)
    .bind(&original.thread_id)
    .fetch_one(&state.pool)
    .await?;

    broadcast_message(&state.sse_broadcaster, &reply);
    Ok(())
}

fn reply_subject(subject: &str) -> String {
    let mut subject = if subject.starts_with("Re: ") {
        subject.to_string()
    } else {
        format!("Re: {}", subject)
    };
    if subject.chars().count() > 200 {
        subject = subject.chars().take(200).collect();
    }
    subject
}

pub async fn send_message(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<SendMessageRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let message = deliver(&state, &user, &body).await?;
    Ok(HttpResponse::Created().json(message))
}

fn message_list_query(user_id: Uuid, query: &MessageListQuery) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!("SELECT * FROM messages WHERE {}", NOT_EXPIRED));

    match query.folder.unwrap_or(Folder::Inbox) {
        Folder::Inbox => {
            qb.push(" AND recipient_id = ").push_bind(user_id);
        }
        Folder::Sent => {
            qb.push(" AND sender_id = ").push_bind(user_id);
        }
        Folder::All => {
            qb.push(" AND (sender_id = ").push_bind(user_id);
            qb.push(" OR recipient_id = ").push_bind(user_id);
            qb.push(")");
        }
    }
    if query.unread == Some(true) {
        qb.push(" AND NOT is_read");
    }

    qb.push(" ORDER BY sent_at DESC");
    qb
}

pub async fn list_messages(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<MessageListQuery>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let messages: Vec<Message> = message_list_query(user.id, &query)
        .build_query_as()
        .fetch_all(&state.pool)
        .await?;
    Ok(HttpResponse::Ok().json(messages))
}

pub async fn get_message(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let mut message = visible_message(&state.pool, user.id, path.into_inner()).await?;

    if message.recipient_id == user.id && !message.is_read {
        message = sqlx::query_as(
            "UPDATE messages SET is_read = TRUE, read_at = COALESCE(read_at, now())
             WHERE id = $1 RETURNING *",
        )
        .bind(message.id)
        .fetch_one(&state.pool)
        .await?;
    }

    Ok(HttpResponse::Ok().json(message))
}

pub async fn mark_read(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let message: Option<Message> = sqlx::query_as(&format!(
        "UPDATE messages SET is_read = TRUE, read_at = COALESCE(read_at, now())
         WHERE id = $1 AND recipient_id = $2 AND {} RETURNING *",
        NOT_EXPIRED
    ))
    .bind(path.into_inner())
    .bind(user.id)
    .fetch_optional(&state.pool)
    .await?;

    found(message)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "message": "Message marked as read" })))
}

pub async fn unread_count(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let unread_count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM messages WHERE recipient_id = $1 AND NOT is_read AND {}",
        NOT_EXPIRED
    ))
    .bind(user.id)
    .fetch_one(&state.pool)
    .await?;
    Ok(HttpResponse::Ok().json(UnreadCount { unread_count }))
}

pub async fn get_thread(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let messages: Vec<Message> = sqlx::query_as(&format!(
        "SELECT * FROM messages WHERE thread_id = $1 AND (sender_id = $2 OR recipient_id = $2) AND {}
         ORDER BY sent_at",
        NOT_EXPIRED
    ))
    .bind(path.into_inner())
    .bind(user.id)
    .fetch_all(&state.pool)
    .await?;
    Ok(HttpResponse::Ok().json(messages))
}

pub async fn delete_message(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let message = visible_message(&state.pool, user.id, path.into_inner()).await?;
    if message.sender_id != user.id {
        return Err(ApiError::Forbidden("Only the sender can delete a message".to_string()));
    }

    sqlx::query("DELETE FROM messages WHERE id = $1")
        .bind(message.id)
        .execute(&state.pool)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

// ============ Templates ============

const TEMPLATE_AUDIENCE: &str =
    "is_active AND (user_types = '[]'::jsonb OR user_types @> jsonb_build_array($1::text))";

pub async fn list_templates(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let templates: Vec<MessageTemplate> = sqlx::query_as(&format!(
        "SELECT * FROM message_templates WHERE {} ORDER BY category, name",
        TEMPLATE_AUDIENCE
    ))
    .bind(user.user_type.as_str())
    .fetch_all(&state.pool)
    .await?;
    Ok(HttpResponse::Ok().json(templates))
}

pub async fn create_template(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateTemplateRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    if !matches!(user.user_type, UserType::Provider | UserType::Admin) {
        return Err(ApiError::Forbidden(
            "Only providers and administrators can create templates".to_string(),
        ));
    }
    body.validate()?;

    let template: MessageTemplate = sqlx::query_as(
        "INSERT INTO message_templates (name, category, subject_template, content_template,
            user_types, available_variables, created_by)
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING *",
    )
    .bind(&body.name)
    .bind(body.category)
    .bind(&body.subject_template)
    .bind(&body.content_template)
    .bind(sqlx::types::Json(&body.user_types))
    .bind(sqlx::types::Json(&body.available_variables))
    .bind(user.id)
    .fetch_one(&state.pool)
    .await?;

    Ok(HttpResponse::Created().json(template))
}

pub async fn render_template(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: Option<web::Json<RenderTemplateRequest>>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let template: Option<MessageTemplate> = sqlx::query_as(&format!(
        "SELECT * FROM message_templates WHERE {} AND id = $2",
        TEMPLATE_AUDIENCE
    ))
    .bind(user.user_type.as_str())
    .bind(path.into_inner())
    .fetch_optional(&state.pool)
    .await?;
    let template = found(template)?;

    let variables = body.map(|b| b.into_inner().variables).unwrap_or_default();
    let rendered = template
        .render(&variables)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(HttpResponse::Ok().json(rendered))
}

// ============ Drafts ============

async fn own_draft(pool: &PgPool, user_id: Uuid, id: Uuid) -> ApiResult<MessageDraft> {
    let draft: Option<MessageDraft> = sqlx::query_as("SELECT * FROM message_drafts WHERE id = $1 AND user_id = $2")
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    found(draft)
}

pub async fn list_drafts(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let drafts: Vec<MessageDraft> =
        sqlx::query_as("SELECT * FROM message_drafts WHERE user_id = $1 ORDER BY updated_at DESC")
            .bind(user.id)
            .fetch_all(&state.pool)
            .await?;
    Ok(HttpResponse::Ok().json(drafts))
}

pub async fn create_draft(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<DraftRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    body.validate()?;

    let thread_id = match body.parent_message_id {
        Some(_) => resolve_thread(&state.pool, user.id, body.parent_message_id).await?,
        None => String::new(),
    };

    let draft: MessageDraft = sqlx::query_as(
        "INSERT INTO message_drafts (user_id, recipient_id, subject, content, message_type, priority,
            parent_message_id, thread_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
    )
    .bind(user.id)
    .bind(body.recipient_id)
    .bind(body.subject.as_deref().unwrap_or_default())
    .bind(body.content.as_deref().unwrap_or_default())
    .bind(body.message_type.unwrap_or(MessageType::General))
    .bind(body.priority.unwrap_or(Priority::Normal))
    .bind(body.parent_message_id)
    .bind(thread_id)
    .fetch_one(&state.pool)
    .await?;

    Ok(HttpResponse::Created().json(draft))
}

pub async fn get_draft(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    Ok(HttpResponse::Ok().json(own_draft(&state.pool, user.id, path.into_inner()).await?))
}

pub async fn update_draft(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<DraftRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    body.validate()?;

    let thread_id = match body.parent_message_id {
        Some(_) => Some(resolve_thread(&state.pool, user.id, body.parent_message_id).await?),
        None => None,
    };

    let draft: Option<MessageDraft> = sqlx::query_as(
        "UPDATE message_drafts SET
            recipient_id = COALESCE($3, recipient_id),
            subject = COALESCE($4, subject),
            content = COALESCE($5, content),
            message_type = COALESCE($6, message_type),
            priority = COALESCE($7, priority),
            parent_message_id = COALESCE($8, parent_message_id),
            thread_id = COALESCE($9, thread_id),
            updated_at = now()
         WHERE id = $1 AND user_id = $2 RETURNING *",
    )
    .bind(path.into_inner())
    .bind(user.id)
    .bind(body.recipient_id)
    .bind(&body.subject)
    .bind(&body.content)
    .bind(body.message_type)
    .bind(body.priority)
    .bind(body.parent_message_id)
    .bind(thread_id)
    .fetch_optional(&state.pool)
    .await?;
    Ok(HttpResponse::Ok().json(found(draft)?))
}

pub async fn delete_draft(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let deleted = sqlx::query("DELETE FROM message_drafts WHERE id = $1 AND user_id = $2")
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

/// Turns a draft into a send request, or says which fields are missing.
fn draft_to_message(draft: &MessageDraft) -> ApiResult<SendMessageRequest> {
    let Some(recipient_id) = draft.recipient_id else {
        return Err(ApiError::field("recipient_id", "This field is required."));
    };
    Ok(SendMessageRequest {
        recipient_id,
        subject: draft.subject.clone(),
        content: draft.content.clone(),
        message_type: Some(draft.message_type),
        priority: Some(draft.priority),
        parent_message_id: draft.parent_message_id,
        patient_id: None,
        appointment_id: None,
    })
}

pub async fn send_draft(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let draft = own_draft(&state.pool, user.id, path.into_inner()).await?;

    let request = draft_to_message(&draft)?;
    let message = deliver(&state, &user, &request).await?;

    sqlx::query("DELETE FROM message_drafts WHERE id = $1")
        .bind(draft.id)
        .execute(&state.pool)
        .await?;

    Ok(HttpResponse::Created().json(serde_json::json!({
        "message": "Draft sent successfully",
        "sent_message": message,
    })))
}

// ============ Notification Settings ============

async fn notification_settings(pool: &PgPool, user_id: Uuid) -> Result<NotificationSettings, sqlx::Error> {
    sqlx::query("INSERT INTO message_notification_settings (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
        .bind(user_id)
        .execute(pool)
        .await?;
    sqlx::query_as("SELECT * FROM message_notification_settings WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await
}

pub async fn get_notification_settings(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    Ok(HttpResponse::Ok().json(notification_settings(&state.pool, user.id).await?))
}

pub async fn update_notification_settings(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<UpdateNotificationSettingsRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    notification_settings(&state.pool, user.id).await?;

    let settings: NotificationSettings = sqlx::query_as(
        "UPDATE message_notification_settings SET
            email_notifications = COALESCE($2, email_notifications),
            sms_notifications = COALESCE($3, sms_notifications),
            push_notifications = COALESCE($4, push_notifications),
            in_app_notifications = COALESCE($5, in_app_notifications),
            urgent_immediate = COALESCE($6, urgent_immediate),
            high_within_hour = COALESCE($7, high_within_hour),
            normal_daily_digest = COALESCE($8, normal_daily_digest),
            quiet_hours_enabled = COALESCE($9, quiet_hours_enabled),
            quiet_start_time = COALESCE($10, quiet_start_time),
            quiet_end_time = COALESCE($11, quiet_end_time),
            auto_reply_enabled = COALESCE($12, auto_reply_enabled),
            auto_reply_message = COALESCE($13, auto_reply_message),
            updated_at = now()
         WHERE user_id = $1 RETURNING *",
    )
    .bind(user.id)
    .bind(body.email_notifications)
    .bind(body.sms_notifications)
    .bind(body.push_notifications)
    .bind(body.in_app_notifications)
    .bind(body.urgent_immediate)
    .bind(body.high_within_hour)
    .bind(body.normal_daily_digest)
    .bind(body.quiet_hours_enabled)
    .bind(body.quiet_start_time)
    .bind(body.quiet_end_time)
    .bind(body.auto_reply_enabled)
    .bind(&body.auto_reply_message)
    .fetch_one(&state.pool)
    .await?;

    Ok(HttpResponse::Ok().json(settings))
}

// ============ Stream ============

pub async fn stream(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    Ok(message_stream(&state.sse_broadcaster, user.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_folder_queries() {
        let user = Uuid::nil();
        let inbox = message_list_query(user, &MessageListQuery::default());
        assert!(inbox.sql().contains("AND recipient_id = $1"));
        assert!(!inbox.sql().contains("is_read"));

        let unread_sent = message_list_query(
            user,
            &MessageListQuery {
                folder: Some(Folder::Sent),
                unread: Some(true),
            },
        );
        assert!(unread_sent.sql().contains("AND sender_id = $1 AND NOT is_read"));

        let all = message_list_query(
            user,
            &MessageListQuery {
                folder: Some(Folder::All),
                unread: None,
            },
        );
        assert!(all.sql().contains("(sender_id = $1 OR recipient_id = $2)"));
        assert!(all.sql().ends_with("ORDER BY sent_at DESC"));
    }

    #[test]
    fn test_reply_subject() {
        assert_eq!(reply_subject("Lab results"), "Re: Lab results");
        assert_eq!(reply_subject("Re: Lab results"), "Re: Lab results");
        assert_eq!(reply_subject(&"x".repeat(200)).chars().count(), 200);
    }

    #[test]
    fn test_draft_requires_recipient() {
        let now = Utc::now();
        let mut draft = MessageDraft {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            recipient_id: None,
            subject: "Refill".into(),
            content: "Please renew".into(),
            message_type: MessageType::Prescription,
            priority: Priority::High,
            parent_message_id: None,
            thread_id: String::new(),
            created_at: now,
            updated_at: now,
        };
        assert!(matches!(draft_to_message(&draft), Err(ApiError::Validation(_))));

        let recipient = Uuid::new_v4();
        draft.recipient_id = Some(recipient);
        let request = draft_to_message(&draft).unwrap();
        assert_eq!(request.recipient_id, recipient);
        assert_eq!(request.message_type, Some(MessageType::Prescription));
        assert!(request.validate().is_ok());
    }
}
