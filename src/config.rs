use config::{Config, ConfigError, File};
use serde::{Deserialize, Deserializer};

fn deserialize_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }
    match StringOrVec::deserialize(deserializer) {
        Ok(StringOrVec::String(s)) => Ok(s.split(',').map(|x| x.trim().to_string()).filter(|x| !x.is_empty()).collect()),
        Ok(StringOrVec::Vec(v)) => Ok(v),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub cors: CorsConfig,
    pub openemr: OpenEmrConfig,
    pub telehealth: TelehealthConfig,
    pub journal: JournalConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub expiration_hours: i64,
    pub refresh_token_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    #[serde(deserialize_with = "deserialize_string_list")]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenEmrConfig {
    pub base_url: String,
    pub api_token: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelehealthConfig {
    pub zoom: ZoomConfig,
    pub jitsi: JitsiConfig,
    pub webrtc: WebRtcConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoomConfig {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default = "default_zoom_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JitsiConfig {
    pub server_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebRtcConfig {
    #[serde(deserialize_with = "deserialize_string_list")]
    pub stun_servers: Vec<String>,
    #[serde(default)]
    pub turn_servers: Vec<TurnServer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JournalConfig {
    pub export_dir: String,
    pub export_retention_days: i64,
    pub download_secret: String,
    #[serde(default = "default_download_ttl_secs")]
    pub download_link_ttl_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub audit_log_path: String,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_download_ttl_secs() -> i64 {
    900
}

fn default_zoom_base_url() -> String {
    "https://api.zoom.us/v2".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config.toml").required(false))
            .add_source(config::Environment::with_prefix("WEBQX").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    const SAMPLE: &str = r#"
        [server]
        bind_addr = "127.0.0.1:8000"

        [database]
        url = "postgresql://localhost/webqx"
        max_connections = 5
        min_connections = 1

        [redis]
        url = "redis://localhost:6379"
        pool_size = 4

        [jwt]
        secret = "secret"
        expiration_hours = 1
        refresh_token_days = 7

        [cors]
        allowed_origins = "http://localhost:3000, https://app.webqx.health"

        [openemr]
        base_url = "http://localhost:8080"
        api_token = "token"

        [telehealth.zoom]
        api_key = "key"
        api_secret = "secret"

        [telehealth.jitsi]
        server_url = "https://meet.jit.si"

        [telehealth.webrtc]
        stun_servers = ["stun:stun.l.google.com:19302"]

        [journal]
        export_dir = "./media/exports"
        export_retention_days = 7
        download_secret = "download"

        [logging]
        level = "info"
        audit_log_path = "./logs/audit.log"
    "#;

    #[test]
    fn test_settings_from_toml_with_defaults() {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(SAMPLE, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.cors.allowed_origins.len(), 2);
        assert_eq!(settings.openemr.timeout_secs, 30);
        assert_eq!(settings.telehealth.zoom.base_url, "https://api.zoom.us/v2");
        assert!(settings.telehealth.webrtc.turn_servers.is_empty());
        assert_eq!(settings.journal.download_link_ttl_secs, 900);
    }
}
