use std::path::Path;
use tracing::subscriber::set_global_default;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Initialize HIPAA-compliant logging.
///
/// Structured JSON goes to a daily-rotated `audit.log` under `log_dir`; a
/// human-readable layer goes to stdout. The returned guard must be held for
/// the lifetime of the process or buffered file output is lost.
pub fn init_logging(log_dir: impl AsRef<Path>, log_level: &str) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir.as_ref(), "audit.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true);

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = Registry::default()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer);

    set_global_default(subscriber)?;

    tracing::info!("Logging initialized with level: {}", log_level);

    Ok(guard)
}

/// Audit log macro for HIPAA compliance.
/// DO NOT pass PHI (names, content, contact details) as any argument.
#[macro_export]
macro_rules! audit_log {
    ($action_type:expr, $description:expr, $user_id:expr) => {
        tracing::info!(
            action_type = $action_type,
            description = $description,
            user_id = ?$user_id,
            timestamp = chrono::Utc::now().to_rfc3339(),
            "AUDIT_EVENT"
        );
    };
    ($action_type:expr, $description:expr, $user_id:expr, $resource_type:expr, $resource_id:expr) => {
        tracing::info!(
            action_type = $action_type,
            description = $description,
            user_id = ?$user_id,
            resource_type = $resource_type,
            resource_id = %$resource_id,
            timestamp = chrono::Utc::now().to_rfc3339(),
            "AUDIT_EVENT"
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_logging_initialization() {
        let temp_dir = tempdir().unwrap();
        let result = init_logging(temp_dir.path(), "info");
        assert!(result.is_ok());

        audit_log!("login", "User logged in successfully", Some(uuid::Uuid::nil()));
        assert!(temp_dir.path().exists());
    }
}
