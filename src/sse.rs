use crate::models::{Message, MessageType, Priority};
use actix_web::{web, HttpResponse};
use async_stream::stream;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

/// Notification pushed to a message recipient. Content is not included;
/// clients fetch the message itself over the authenticated API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub recipient_id: Uuid,
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub thread_id: String,
    pub subject: String,
    pub message_type: MessageType,
    pub priority: Priority,
    pub sent_at: DateTime<Utc>,
}

impl From<&Message> for MessageEvent {
    fn from(m: &Message) -> Self {
        Self {
            recipient_id: m.recipient_id,
            message_id: m.id,
            sender_id: m.sender_id,
            thread_id: m.thread_id.clone(),
            subject: m.subject.clone(),
            message_type: m.message_type,
            priority: m.priority,
            sent_at: m.sent_at,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SseEvent {
    Message(MessageEvent),
    Heartbeat { timestamp: i64 },
}

/// Broadcast channel for SSE events
pub type SseBroadcaster = Arc<broadcast::Sender<SseEvent>>;

/// Create a new SSE broadcaster
pub fn create_broadcaster() -> SseBroadcaster {
    let (tx, _rx) = broadcast::channel::<SseEvent>(256);
    Arc::new(tx)
}

fn heartbeat_frame() -> web::Bytes {
    let body = serde_json::json!({"timestamp": Utc::now().timestamp()});
    web::Bytes::from(format!("event: heartbeat\ndata: {}\n\n", body))
}

/// Render an event as an SSE frame if it is addressed to `user_id`.
fn frame_for(event: &SseEvent, user_id: Uuid) -> Option<web::Bytes> {
    match event {
        SseEvent::Message(msg) if msg.recipient_id == user_id => serde_json::to_string(msg)
            .ok()
            .map(|json| web::Bytes::from(format!("event: message\ndata: {}\n\n", json))),
        SseEvent::Message(_) => None,
        SseEvent::Heartbeat { timestamp } => Some(web::Bytes::from(format!(
            "event: heartbeat\ndata: {}\n\n",
            serde_json::json!({"timestamp": timestamp})
        ))),
    }
}

/// Stream the caller's message notifications with a 30 second heartbeat.
pub fn message_stream(broadcaster: &SseBroadcaster, user_id: Uuid) -> HttpResponse {
    let rx = broadcaster.subscribe();
    let stream = BroadcastStream::new(rx);

    let event_stream = stream! {
        crate::metrics::SSE_CONNECTIONS_ACTIVE.inc();

        yield Ok::<_, actix_web::Error>(heartbeat_frame());

        tokio::pin!(stream);

        let mut heartbeat_interval = interval(Duration::from_secs(30));
        // The first tick completes immediately; the initial heartbeat was already sent.
        heartbeat_interval.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat_interval.tick() => {
                    yield Ok::<_, actix_web::Error>(heartbeat_frame());
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(event)) => {
                            if let Some(frame) = frame_for(&event, user_id) {
                                crate::metrics::SSE_EVENTS_SENT.with_label_values(&["message"]).inc();
                                yield Ok::<_, actix_web::Error>(frame);
                            }
                        }
                        Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                            tracing::warn!(user_id = %user_id, skipped = skipped, "SSE subscriber lagged");
                        }
                        None => break,
                    }
                }
            }
        }

        crate::metrics::SSE_CONNECTIONS_ACTIVE.dec();
    };

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .insert_header(("X-Accel-Buffering", "no"))
        .streaming(event_stream)
}

/// Notify the recipient of a new message. No subscribers is not an error.
pub fn broadcast_message(broadcaster: &SseBroadcaster, message: &Message) {
    let _ = broadcaster.send(SseEvent::Message(MessageEvent::from(message)));
}
