use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::{Validate, ValidateEmail, ValidationError};

crate::text_enum! {
    pub enum Gender {
        Male => "male",
        Female => "female",
        Other => "other",
        Unknown => "unknown",
    }
}

crate::text_enum! {
    pub enum EncounterStatus {
        Planned => "planned",
        Arrived => "arrived",
        Triaged => "triaged",
        InProgress => "in-progress",
        OnLeave => "onleave",
        Finished => "finished",
        Cancelled => "cancelled",
    }
}

crate::text_enum! {
    pub enum EncounterClass {
        Ambulatory => "AMB",
        Emergency => "EMER",
        Inpatient => "IMP",
        Observation => "OBSENC",
        Virtual => "VR",
    }
}

impl EncounterClass {
    pub fn display(&self) -> &'static str {
        match self {
            EncounterClass::Ambulatory => "ambulatory",
            EncounterClass::Emergency => "emergency",
            EncounterClass::Inpatient => "inpatient encounter",
            EncounterClass::Observation => "observation encounter",
            EncounterClass::Virtual => "virtual",
        }
    }
}

crate::text_enum! {
    pub enum Interpretation {
        High => "H",
        Low => "L",
        Normal => "N",
        Abnormal => "A",
        Critical => "C",
    }
}

crate::text_enum! {
    pub enum AppointmentType {
        Routine => "routine",
        FollowUp => "follow-up",
        Urgent => "urgent",
        Telehealth => "telehealth",
        Consultation => "consultation",
    }
}

crate::text_enum! {
    pub enum AppointmentStatus {
        Scheduled => "scheduled",
        Confirmed => "confirmed",
        Arrived => "arrived",
        InProgress => "in-progress",
        Completed => "completed",
        Cancelled => "cancelled",
        NoShow => "no-show",
    }
}

/// Whole years between `dob` and `today`, counting the birthday itself.
pub fn age_on(dob: NaiveDate, today: NaiveDate) -> i32 {
    let mut age = today.year() - dob.year();
    if (today.month(), today.day()) < (dob.month(), dob.day()) {
        age -= 1;
    }
    age
}

/// `"{h}h {m}m"` for an hour or more, otherwise `"{m}m"`.
pub fn format_duration(minutes: i32) -> String {
    let hours = minutes / 60;
    let mins = minutes % 60;
    if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else {
        format!("{}m", mins)
    }
}

// ============ Patient ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Patient {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub openemr_patient_id: String,
    pub medical_record_number: String,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub gender: Gender,
    pub phone: String,
    pub email: String,
    pub address_line1: String,
    pub address_line2: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub country: String,
    pub blood_type: String,
    pub allergies: String,
    pub medications: String,
    pub emergency_contact_name: String,
    pub emergency_contact_phone: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_sync: Option<DateTime<Utc>>,
}

impl Patient {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Serialize)]
pub struct PatientResponse {
    #[serde(flatten)]
    pub patient: Patient,
    pub full_name: String,
    pub age: i32,
}

impl PatientResponse {
    pub fn new(patient: Patient, today: NaiveDate) -> Self {
        Self {
            full_name: patient.full_name(),
            age: age_on(patient.date_of_birth, today),
            patient,
        }
    }
}

/// Empty clears the address; anything else must parse as one.
fn optional_email(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() || value.validate_email() {
        Ok(())
    } else {
        Err(ValidationError::new("email").with_message("Enter a valid email address.".into()))
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreatePatientRequest {
    pub user_id: Option<Uuid>,
    #[validate(length(min = 1, max = 50))]
    pub openemr_patient_id: String,
    #[validate(length(min = 1, max = 50))]
    pub medical_record_number: String,
    #[validate(length(min = 1, max = 100))]
    pub first_name: String,
    #[validate(length(min = 1, max = 100))]
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub gender: Gender,
    #[serde(default)]
    #[validate(length(max = 20))]
    pub phone: String,
    #[serde(default)]
    #[validate(length(max = 254), custom(function = "optional_email"))]
    pub email: String,
    #[serde(default)]
    #[validate(length(max = 200))]
    pub address_line1: String,
    #[serde(default)]
    #[validate(length(max = 200))]
    pub address_line2: String,
    #[serde(default)]
    #[validate(length(max = 100))]
    pub city: String,
    #[serde(default)]
    #[validate(length(max = 50))]
    pub state: String,
    #[serde(default)]
    #[validate(length(max = 20))]
    pub zip_code: String,
    #[validate(length(max = 50))]
    pub country: Option<String>,
    #[serde(default)]
    #[validate(length(max = 5))]
    pub blood_type: String,
    #[serde(default)]
    pub allergies: String,
    #[serde(default)]
    pub medications: String,
    #[serde(default)]
    #[validate(length(max = 100))]
    pub emergency_contact_name: String,
    #[serde(default)]
    #[validate(length(max = 20))]
    pub emergency_contact_phone: String,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdatePatientRequest {
    pub user_id: Option<Uuid>,
    #[validate(length(min = 1, max = 50))]
    pub openemr_patient_id: Option<String>,
    #[validate(length(min = 1, max = 50))]
    pub medical_record_number: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub first_name: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub last_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<Gender>,
    #[validate(length(max = 20))]
    pub phone: Option<String>,
    #[validate(length(max = 254), custom(function = "optional_email"))]
    pub email: Option<String>,
    #[validate(length(max = 200))]
    pub address_line1: Option<String>,
    #[validate(length(max = 200))]
    pub address_line2: Option<String>,
    #[validate(length(max = 100))]
    pub city: Option<String>,
    #[validate(length(max = 50))]
    pub state: Option<String>,
    #[validate(length(max = 20))]
    pub zip_code: Option<String>,
    #[validate(length(max = 50))]
    pub country: Option<String>,
    #[validate(length(max = 5))]
    pub blood_type: Option<String>,
    pub allergies: Option<String>,
    pub medications: Option<String>,
    #[validate(length(max = 100))]
    pub emergency_contact_name: Option<String>,
    #[validate(length(max = 20))]
    pub emergency_contact_phone: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct EmrListQuery {
    pub patient_id: Option<Uuid>,
    pub provider_id: Option<Uuid>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

// ============ Encounter ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Encounter {
    pub id: Uuid,
    pub openemr_encounter_id: String,
    pub patient_id: Uuid,
    pub appointment_id: Option<Uuid>,
    pub status: EncounterStatus,
    pub encounter_class: EncounterClass,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub provider_id: Option<Uuid>,
    pub chief_complaint: String,
    pub diagnosis: String,
    pub treatment_plan: String,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_sync: Option<DateTime<Utc>>,
}

impl Encounter {
    pub fn duration_minutes(&self) -> Option<i64> {
        self.end_time.map(|end| (end - self.start_time).num_minutes())
    }
}

#[derive(Debug, Serialize)]
pub struct EncounterResponse {
    #[serde(flatten)]
    pub encounter: Encounter,
    pub duration: Option<i64>,
}

impl From<Encounter> for EncounterResponse {
    fn from(encounter: Encounter) -> Self {
        Self {
            duration: encounter.duration_minutes(),
            encounter,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateEncounterRequest {
    #[validate(length(min = 1, max = 50))]
    pub openemr_encounter_id: String,
    pub patient_id: Uuid,
    pub status: Option<EncounterStatus>,
    pub encounter_class: Option<EncounterClass>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub provider_id: Option<Uuid>,
    #[serde(default)]
    pub chief_complaint: String,
    #[serde(default)]
    pub diagnosis: String,
    #[serde(default)]
    pub treatment_plan: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateEncounterRequest {
    #[validate(length(min = 1, max = 50))]
    pub openemr_encounter_id: Option<String>,
    pub status: Option<EncounterStatus>,
    pub encounter_class: Option<EncounterClass>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub chief_complaint: Option<String>,
    pub diagnosis: Option<String>,
    pub treatment_plan: Option<String>,
    pub notes: Option<String>,
}

// ============ Medication ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Medication {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub name: String,
    pub dosage: String,
    pub frequency: String,
    pub route: String,
    pub prescriber_id: Option<Uuid>,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub is_active: bool,
    pub instructions: String,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct MedicationResponse {
    #[serde(flatten)]
    pub medication: Medication,
    pub is_expired: bool,
}

impl MedicationResponse {
    pub fn new(medication: Medication, today: NaiveDate) -> Self {
        Self {
            is_expired: medication.end_date.map(|end| end < today).unwrap_or(false),
            medication,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateMedicationRequest {
    pub patient_id: Uuid,
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(length(min = 1, max = 100))]
    pub dosage: String,
    #[validate(length(min = 1, max = 100))]
    pub frequency: String,
    #[serde(default)]
    #[validate(length(max = 50))]
    pub route: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub is_active: Option<bool>,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateMedicationRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub dosage: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub frequency: Option<String>,
    #[validate(length(max = 50))]
    pub route: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub is_active: Option<bool>,
    pub instructions: Option<String>,
    pub notes: Option<String>,
}

// ============ Lab Result ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct LabResult {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub encounter_id: Option<Uuid>,
    pub test_name: String,
    pub test_code: String,
    pub category: String,
    pub result_value: String,
    pub unit: String,
    pub reference_range: String,
    pub status: String,
    pub interpretation: Option<Interpretation>,
    pub collected_datetime: DateTime<Utc>,
    pub resulted_datetime: DateTime<Utc>,
    pub ordering_provider_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LabResult {
    pub fn is_abnormal(&self) -> bool {
        matches!(
            self.interpretation,
            Some(Interpretation::High)
                | Some(Interpretation::Low)
                | Some(Interpretation::Abnormal)
                | Some(Interpretation::Critical)
        )
    }
}

#[derive(Debug, Serialize)]
pub struct LabResultResponse {
    #[serde(flatten)]
    pub lab: LabResult,
    pub is_abnormal: bool,
}

impl From<LabResult> for LabResultResponse {
    fn from(lab: LabResult) -> Self {
        Self {
            is_abnormal: lab.is_abnormal(),
            lab,
        }
    }
}

// ============ Appointment ============

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Appointment {
    pub id: Uuid,
    pub openemr_appointment_id: Option<String>,
    pub patient_id: Uuid,
    pub provider_id: Uuid,
    pub appointment_type: AppointmentType,
    pub status: AppointmentStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_minutes: i32,
    pub chief_complaint: String,
    pub notes: String,
    pub is_telehealth: bool,
    pub meeting_url: String,
    pub meeting_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    /// Telehealth visits open 15 minutes early and stay joinable until the
    /// visit moves past `arrived`.
    pub fn can_join_telehealth(&self, now: DateTime<Utc>) -> bool {
        self.is_telehealth
            && now >= self.start_time - Duration::minutes(15)
            && matches!(
                self.status,
                AppointmentStatus::Scheduled | AppointmentStatus::Confirmed | AppointmentStatus::Arrived
            )
    }
}

#[derive(Debug, Serialize)]
pub struct AppointmentResponse {
    #[serde(flatten)]
    pub appointment: Appointment,
    pub duration_formatted: String,
    pub is_upcoming: bool,
    pub can_join_telehealth: bool,
}

impl AppointmentResponse {
    pub fn new(appointment: Appointment, now: DateTime<Utc>) -> Self {
        Self {
            duration_formatted: format_duration(appointment.duration_minutes),
            is_upcoming: appointment.start_time > now,
            can_join_telehealth: appointment.can_join_telehealth(now),
            appointment,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateAppointmentRequest {
    #[validate(length(min = 1, max = 50))]
    pub openemr_appointment_id: Option<String>,
    pub patient_id: Uuid,
    pub provider_id: Uuid,
    pub appointment_type: Option<AppointmentType>,
    pub status: Option<AppointmentStatus>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[validate(range(min = 1, max = 1440))]
    pub duration_minutes: Option<i32>,
    #[serde(default)]
    pub chief_complaint: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub is_telehealth: bool,
    #[serde(default)]
    #[validate(length(max = 200))]
    pub meeting_url: String,
    #[serde(default)]
    #[validate(length(max = 100))]
    pub meeting_id: String,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateAppointmentRequest {
    #[validate(length(min = 1, max = 50))]
    pub openemr_appointment_id: Option<String>,
    pub provider_id: Option<Uuid>,
    pub appointment_type: Option<AppointmentType>,
    pub status: Option<AppointmentStatus>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[validate(range(min = 1, max = 1440))]
    pub duration_minutes: Option<i32>,
    pub chief_complaint: Option<String>,
    pub notes: Option<String>,
    pub is_telehealth: Option<bool>,
    #[validate(length(max = 200))]
    pub meeting_url: Option<String>,
    #[validate(length(max = 100))]
    pub meeting_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PatientSummary {
    pub patient: PatientResponse,
    pub recent_encounters: Vec<EncounterResponse>,
    pub active_medications: Vec<MedicationResponse>,
    pub recent_labs: Vec<LabResultResponse>,
    pub upcoming_appointments: Vec<AppointmentResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn appointment(start: DateTime<Utc>, status: AppointmentStatus, telehealth: bool) -> Appointment {
        Appointment {
            id: Uuid::new_v4(),
            openemr_appointment_id: None,
            patient_id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            appointment_type: AppointmentType::Telehealth,
            status,
            start_time: start,
            end_time: start + Duration::minutes(30),
            duration_minutes: 30,
            chief_complaint: String::new(),
            notes: String::new(),
            is_telehealth: telehealth,
            meeting_url: String::new(),
            meeting_id: String::new(),
            created_at: start,
            updated_at: start,
        }
    }

    #[test]
    fn test_age_is_birthday_aware() {
        let dob = NaiveDate::from_ymd_opt(1990, 6, 15).unwrap();
        assert_eq!(age_on(dob, NaiveDate::from_ymd_opt(2024, 6, 14).unwrap()), 33);
        assert_eq!(age_on(dob, NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()), 34);
    }

    #[test]
    fn test_duration_formatting() {
        assert_eq!(format_duration(30), "30m");
        assert_eq!(format_duration(60), "1h 0m");
        assert_eq!(format_duration(95), "1h 35m");
    }

    #[test]
    fn test_can_join_telehealth_window() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let appt = appointment(start, AppointmentStatus::Confirmed, true);

        assert!(!appt.can_join_telehealth(start - Duration::minutes(16)));
        assert!(appt.can_join_telehealth(start - Duration::minutes(15)));
        assert!(appt.can_join_telehealth(start + Duration::minutes(5)));

        let done = appointment(start, AppointmentStatus::Completed, true);
        assert!(!done.can_join_telehealth(start));

        let in_person = appointment(start, AppointmentStatus::Scheduled, false);
        assert!(!in_person.can_join_telehealth(start));
    }

    #[test]
    fn test_appointment_response_flattens_row() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let resp = AppointmentResponse::new(
            appointment(start, AppointmentStatus::Scheduled, true),
            start - Duration::hours(1),
        );
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["status"], "scheduled");
        assert_eq!(value["duration_formatted"], "30m");
        assert_eq!(value["is_upcoming"], true);
        assert_eq!(value["can_join_telehealth"], false);
    }

    #[test]
    fn test_encounter_class_codes() {
        assert_eq!("VR".parse::<EncounterClass>(), Ok(EncounterClass::Virtual));
        assert_eq!(EncounterClass::Ambulatory.as_str(), "AMB");
        assert_eq!(
            serde_json::to_value(EncounterStatus::InProgress).unwrap(),
            "in-progress"
        );
    }

    fn patient_request(extra: serde_json::Value) -> CreatePatientRequest {
        let mut body = serde_json::json!({
            "openemr_patient_id": "emr-1",
            "medical_record_number": "MRN-1",
            "first_name": "Jane",
            "last_name": "Doe",
            "date_of_birth": "1985-04-12",
            "gender": "female"
        });
        if let (Some(body), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            body.extend(extra.clone());
        }
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_patient_request_matches_column_widths() {
        assert!(patient_request(serde_json::json!({})).validate().is_ok());
        assert!(patient_request(serde_json::json!({"email": "jane@example.com"}))
            .validate()
            .is_ok());

        let errors = patient_request(serde_json::json!({
            "email": "not-an-address",
            "city": "c".repeat(101),
            "state": "s".repeat(51),
            "zip_code": "9".repeat(21)
        }))
        .validate()
        .unwrap_err();
        let fields = errors.field_errors();
        for field in ["email", "city", "state", "zip_code"] {
            assert!(fields.contains_key(field), "missing error for {field}");
        }
    }

    #[test]
    fn test_update_patient_request_allows_clearing_email() {
        let clear = UpdatePatientRequest {
            email: Some(String::new()),
            ..Default::default()
        };
        assert!(clear.validate().is_ok());

        let long_zip = UpdatePatientRequest {
            zip_code: Some("1".repeat(21)),
            ..Default::default()
        };
        assert!(long_zip.validate().is_err());
    }
}
