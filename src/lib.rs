// Library root - exposes modules for integration tests

pub mod auth;
pub mod config;
pub mod database;
pub mod error;
pub mod export;
pub mod fhir_service;
pub mod handlers;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod nlp_service;
pub mod openemr;
pub mod redis_cache;
pub mod sse;
pub mod telehealth_service;
