use crate::config::OpenEmrConfig;
use crate::error::IntegrationError;
use crate::metrics::OPENEMR_REQUESTS_TOTAL;
use crate::models::{FhirEncounter, FhirPatient};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info};

const FHIR_PATH: &str = "/apis/default/fhir";

/// FHIR R4 client for an OpenEMR instance. No retries; callers decide how
/// to degrade.
pub struct OpenEmrClient {
    http: Client,
    base_url: String,
    api_token: String,
}

impl OpenEmrClient {
    pub fn new(config: &OpenEmrConfig) -> Result<Self, IntegrationError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }

    fn fhir_url(&self, path: &str) -> String {
        format!("{}{}/{}", self.base_url, FHIR_PATH, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        resource: &'static str,
        request: RequestBuilder,
        expected: StatusCode,
    ) -> Result<T, IntegrationError> {
        let response = request
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| {
                error!(resource = resource, error = %e, "OpenEMR request failed");
                OPENEMR_REQUESTS_TOTAL.with_label_values(&[resource, "error"]).inc();
                IntegrationError::from(e)
            })?;

        let status = response.status();
        if status != expected {
            error!(resource = resource, status = status.as_u16(), "OpenEMR returned unexpected status");
            OPENEMR_REQUESTS_TOTAL.with_label_values(&[resource, "error"]).inc();
            return Err(IntegrationError::Status {
                resource,
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        let parsed = serde_json::from_slice(&body)?;
        OPENEMR_REQUESTS_TOTAL.with_label_values(&[resource, "ok"]).inc();
        Ok(parsed)
    }

    /// Register this service as an OAuth client with OpenEMR.
    pub async fn register_client(&self) -> Result<Value, IntegrationError> {
        let url = format!("{}/oauth2/default/registration", self.base_url);
        let body = json!({
            "application_type": "private",
            "redirect_uris": ["https://webqx.healthcare/callback"],
            "client_name": "WebQx Healthcare",
            "grant_types": ["client_credentials"],
        });

        let result = self
            .send("Registration", self.http.post(url).json(&body), StatusCode::OK)
            .await;
        if result.is_ok() {
            info!("Registered OAuth client with OpenEMR");
        }
        result
    }

    pub async fn get_patient(&self, openemr_id: &str) -> Result<FhirPatient, IntegrationError> {
        let url = self.fhir_url(&format!("Patient/{}", urlencoding::encode(openemr_id)));
        self.send("Patient", self.http.get(url), StatusCode::OK).await
    }

    pub async fn create_patient(&self, patient: &FhirPatient) -> Result<FhirPatient, IntegrationError> {
        let url = self.fhir_url("Patient");
        self.send("Patient", self.http.post(url).json(patient), StatusCode::CREATED).await
    }

    pub async fn update_patient(&self, openemr_id: &str, patient: &FhirPatient) -> Result<FhirPatient, IntegrationError> {
        let url = self.fhir_url(&format!("Patient/{}", urlencoding::encode(openemr_id)));
        self.send("Patient", self.http.put(url).json(patient), StatusCode::OK).await
    }

    /// Search bundle of the patient's encounters.
    pub async fn get_encounters(&self, openemr_patient_id: &str) -> Result<Value, IntegrationError> {
        let url = self.fhir_url("Encounter");
        let request = self.http.get(url).query(&[("patient", openemr_patient_id)]);
        self.send("Encounter", request, StatusCode::OK).await
    }

    pub async fn create_encounter(&self, encounter: &FhirEncounter) -> Result<Value, IntegrationError> {
        let url = self.fhir_url("Encounter");
        self.send("Encounter", self.http.post(url).json(encounter), StatusCode::CREATED).await
    }

    pub async fn get_lab_results(&self, openemr_patient_id: &str) -> Result<Value, IntegrationError> {
        let url = self.fhir_url("Observation");
        let request = self
            .http
            .get(url)
            .query(&[("patient", openemr_patient_id), ("category", "laboratory")]);
        self.send("Observation", request, StatusCode::OK).await
    }

    pub async fn get_medications(&self, openemr_patient_id: &str) -> Result<Value, IntegrationError> {
        let url = self.fhir_url("MedicationRequest");
        let request = self.http.get(url).query(&[("patient", openemr_patient_id)]);
        self.send("MedicationRequest", request, StatusCode::OK).await
    }
}
