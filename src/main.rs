use actix_cors::Cors;
use actix_web::middleware::{NormalizePath, TrailingSlash};
use actix_web::{http::header, web, App, HttpServer};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;
use tracing_actix_web::TracingLogger;
use webqx_backend::auth::JwtAuth;
use webqx_backend::config::Settings;
use webqx_backend::database::{create_pool, run_migrations};
use webqx_backend::fhir_service::FhirService;
use webqx_backend::handlers::{self, json_error_handler, AppState};
use webqx_backend::jobs::{spawn_cleanup_ticker, JobQueue, JobWorker};
use webqx_backend::logging::init_logging;
use webqx_backend::metrics::{init_metrics, metrics_handler};
use webqx_backend::middleware::{AuditLogger, RequestId};
use webqx_backend::nlp_service::NlpService;
use webqx_backend::openemr::OpenEmrClient;
use webqx_backend::redis_cache::RedisCache;
use webqx_backend::sse::create_broadcaster;
use webqx_backend::telehealth_service::TelehealthService;

const CLEANUP_PERIOD: Duration = Duration::from_secs(3600);

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::new().context("Failed to load configuration")?;

    let log_dir = std::path::Path::new(&settings.logging.audit_log_path)
        .parent()
        .unwrap_or(std::path::Path::new("./logs"));
    let _log_guard = init_logging(log_dir, &settings.logging.level).context("Failed to initialize logging")?;

    init_metrics().context("Failed to register metrics")?;

    info!("WebQx backend starting on {}", settings.server.bind_addr);

    info!("Connecting to PostgreSQL...");
    let pool = create_pool(&settings.database)
        .await
        .context("Failed to create database pool")?;

    info!("Running database migrations...");
    run_migrations(&pool).await.context("Failed to run migrations")?;

    info!("Connecting to Redis...");
    let redis = RedisCache::new(&settings.redis)
        .await
        .context("Failed to connect to Redis")?;
    let redis = Arc::new(RwLock::new(redis));

    let openemr = OpenEmrClient::new(&settings.openemr).context("Failed to build OpenEMR client")?;
    let telehealth =
        TelehealthService::new(settings.telehealth.clone()).context("Failed to build telehealth service")?;
    let nlp = NlpService::new();

    let (jobs, job_rx) = JobQueue::new();
    JobWorker::new(
        pool.clone(),
        nlp.clone(),
        settings.journal.export_dir.clone(),
        settings.journal.export_retention_days,
    )
    .spawn(job_rx);
    spawn_cleanup_ticker(jobs.clone(), CLEANUP_PERIOD);

    let app_state = web::Data::new(AppState {
        pool,
        redis,
        jwt_auth: Arc::new(JwtAuth::new(&settings.jwt)),
        openemr: Arc::new(openemr),
        fhir_service: Arc::new(FhirService::new(settings.openemr.base_url.clone())),
        nlp: Arc::new(nlp),
        telehealth: Arc::new(telehealth),
        sse_broadcaster: create_broadcaster(),
        jobs,
        settings: Arc::new(settings.clone()),
    });

    info!("All services initialized");

    let cors_origins = settings.cors.allowed_origins.clone();

    HttpServer::new(move || {
        let mut cors = Cors::default()
            .allowed_methods(vec!["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"])
            .allowed_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
            .supports_credentials()
            .max_age(3600);

        for origin in &cors_origins {
            cors = cors.allowed_origin(origin);
        }

        App::new()
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .wrap(AuditLogger)
            .wrap(RequestId)
            .wrap(TracingLogger::default())
            .wrap(cors)
            .app_data(app_state.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .configure(handlers::configure)
            .route("/metrics", web::get().to(metrics_handler))
    })
    .workers(settings.server.workers.unwrap_or(4))
    .bind(&settings.server.bind_addr)?
    .run()
    .await?;

    Ok(())
}
