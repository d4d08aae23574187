use crate::config::RedisConfig;
use crate::models::{ClinicSettings, FhirPatient};
use redis::{aio::ConnectionManager, AsyncCommands, RedisError};
use serde::de::DeserializeOwned;
use serde::Serialize;

const CLINIC_SETTINGS_KEY: &str = "telehealth:clinic_settings";
const CLINIC_SETTINGS_TTL_SECS: u64 = 600;

fn openemr_patient_key(openemr_id: &str) -> String {
    format!("openemr:patient:{}", openemr_id)
}

pub struct RedisCache {
    client: ConnectionManager,
}

impl RedisCache {
    pub async fn new(config: &RedisConfig) -> Result<Self, RedisError> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self { client: conn })
    }

    /// Store any serializable value as JSON with an expiry.
    pub async fn set_json<T: Serialize>(&mut self, key: &str, value: &T, ttl_secs: u64) -> Result<(), RedisError> {
        let json = serde_json::to_string(value)
            .map_err(|e| RedisError::from((redis::ErrorKind::TypeError, "Serialization failed", e.to_string())))?;

        self.client.set_ex::<_, _, ()>(key, json, ttl_secs).await
    }

    /// Read a JSON value back. A payload that no longer parses counts as a miss.
    pub async fn get_json<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>, RedisError> {
        let json: Option<String> = self.client.get(key).await?;

        let value = json.and_then(|data| match serde_json::from_str(&data) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Discarding undecodable cache entry");
                None
            }
        });

        if value.is_some() {
            crate::metrics::CACHE_HITS.inc();
        } else {
            crate::metrics::CACHE_MISSES.inc();
        }

        Ok(value)
    }

    pub async fn delete(&mut self, key: &str) -> Result<(), RedisError> {
        self.client.del::<_, ()>(key).await
    }

    pub async fn get_clinic_settings(&mut self) -> Result<Option<ClinicSettings>, RedisError> {
        self.get_json(CLINIC_SETTINGS_KEY).await
    }

    pub async fn set_clinic_settings(&mut self, settings: &ClinicSettings) -> Result<(), RedisError> {
        self.set_json(CLINIC_SETTINGS_KEY, settings, CLINIC_SETTINGS_TTL_SECS).await
    }

    pub async fn invalidate_clinic_settings(&mut self) -> Result<(), RedisError> {
        self.delete(CLINIC_SETTINGS_KEY).await
    }

    pub async fn get_openemr_patient(&mut self, openemr_id: &str) -> Result<Option<FhirPatient>, RedisError> {
        self.get_json(&openemr_patient_key(openemr_id)).await
    }

    pub async fn set_openemr_patient(&mut self, patient: &FhirPatient, ttl_secs: u64) -> Result<(), RedisError> {
        match patient.id.as_deref() {
            Some(id) => self.set_json(&openemr_patient_key(id), patient, ttl_secs).await,
            None => Ok(()),
        }
    }

    /// Check if Redis is healthy
    pub async fn health_check(&mut self) -> Result<bool, RedisError> {
        let _: String = redis::cmd("PING").query_async(&mut self.client).await?;
        Ok(true)
    }
}
