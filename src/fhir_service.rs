use crate::models::{
    Encounter, FhirAddress, FhirCodeableConcept, FhirCoding, FhirContactPoint, FhirEncounter,
    FhirHumanName, FhirIdentifier, FhirObservation, FhirPatient, FhirPeriod, FhirQuantity,
    FhirReference, FhirReferenceRange, Gender, LabResult, Patient,
};
use chrono::{NaiveDate, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

const IDENTIFIER_TYPE_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/v2-0203";
const ACT_CODE_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/v3-ActCode";
const OBSERVATION_CATEGORY_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/observation-category";
const INTERPRETATION_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/v3-ObservationInterpretation";
const LOINC_SYSTEM: &str = "http://loinc.org";
const UCUM_SYSTEM: &str = "http://unitsofmeasure.org";

/// Maps local EMR rows to and from FHIR R4 resources.
pub struct FhirService {
    source: String,
}

/// Demographic fields that a FHIR Patient is allowed to overwrite locally.
#[derive(Debug, Clone, PartialEq)]
pub struct PatientDemographics {
    pub first_name: String,
    pub last_name: String,
    pub gender: Gender,
    pub date_of_birth: NaiveDate,
    pub phone: String,
    pub email: String,
    pub address_line1: String,
    pub address_line2: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub country: String,
}

impl From<&Patient> for PatientDemographics {
    fn from(p: &Patient) -> Self {
        Self {
            first_name: p.first_name.clone(),
            last_name: p.last_name.clone(),
            gender: p.gender,
            date_of_birth: p.date_of_birth,
            phone: p.phone.clone(),
            email: p.email.clone(),
            address_line1: p.address_line1.clone(),
            address_line2: p.address_line2.clone(),
            city: p.city.clone(),
            state: p.state.clone(),
            zip_code: p.zip_code.clone(),
            country: p.country.clone(),
        }
    }
}

/// Truncates upstream text to the width of its local column.
fn clip(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

fn patient_reference(patient: &Patient) -> FhirReference {
    FhirReference {
        reference: format!("Patient/{}", patient.openemr_patient_id),
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

impl FhirService {
    pub fn new(source: impl Into<String>) -> Self {
        Self { source: source.into() }
    }

    pub fn patient_to_fhir(&self, patient: &Patient) -> FhirPatient {
        let mut telecom = Vec::new();
        if !patient.phone.is_empty() {
            telecom.push(FhirContactPoint {
                system: Some("phone".into()),
                value: Some(patient.phone.clone()),
            });
        }
        if !patient.email.is_empty() {
            telecom.push(FhirContactPoint {
                system: Some("email".into()),
                value: Some(patient.email.clone()),
            });
        }

        let address = if patient.address_line1.is_empty() {
            Vec::new()
        } else {
            let mut line = vec![patient.address_line1.clone()];
            if !patient.address_line2.is_empty() {
                line.push(patient.address_line2.clone());
            }
            vec![FhirAddress {
                line,
                city: non_empty(&patient.city),
                state: non_empty(&patient.state),
                postal_code: non_empty(&patient.zip_code),
                country: non_empty(&patient.country),
            }]
        };

        FhirPatient {
            resource_type: "Patient".into(),
            id: non_empty(&patient.openemr_patient_id),
            identifier: vec![FhirIdentifier {
                value: Some(patient.medical_record_number.clone()),
                identifier_type: Some(FhirCodeableConcept {
                    coding: vec![FhirCoding {
                        system: Some(IDENTIFIER_TYPE_SYSTEM.into()),
                        code: Some("MR".into()),
                        display: None,
                    }],
                    text: None,
                }),
            }],
            name: vec![FhirHumanName {
                family: Some(patient.last_name.clone()),
                given: vec![patient.first_name.clone()],
            }],
            gender: Some(patient.gender.as_str().to_string()),
            birth_date: Some(patient.date_of_birth.format("%Y-%m-%d").to_string()),
            telecom,
            address,
        }
    }

    pub fn encounter_to_fhir(&self, encounter: &Encounter, patient: &Patient) -> FhirEncounter {
        FhirEncounter {
            resource_type: "Encounter".into(),
            id: non_empty(&encounter.openemr_encounter_id),
            status: encounter.status.as_str().to_string(),
            class: Some(FhirCoding {
                system: Some(ACT_CODE_SYSTEM.into()),
                code: Some(encounter.encounter_class.as_str().to_string()),
                display: Some(encounter.encounter_class.display().to_string()),
            }),
            subject: Some(patient_reference(patient)),
            period: Some(FhirPeriod {
                start: Some(encounter.start_time.to_rfc3339()),
                end: encounter.end_time.map(|t| t.to_rfc3339()),
            }),
            reason_code: if encounter.chief_complaint.is_empty() {
                Vec::new()
            } else {
                vec![FhirCodeableConcept {
                    coding: Vec::new(),
                    text: Some(encounter.chief_complaint.clone()),
                }]
            },
        }
    }

    /// `encounter_ref` is the OpenEMR encounter id the result belongs to, if any.
    pub fn lab_to_observation(
        &self,
        lab: &LabResult,
        patient: &Patient,
        encounter_ref: Option<&str>,
    ) -> FhirObservation {
        let coding = if lab.test_code.is_empty() {
            Vec::new()
        } else {
            vec![FhirCoding {
                system: Some(LOINC_SYSTEM.into()),
                code: Some(lab.test_code.clone()),
                display: Some(lab.test_name.clone()),
            }]
        };

        let (value_quantity, value_string) = match lab.result_value.trim().parse::<f64>() {
            Ok(value) => (
                Some(FhirQuantity {
                    value,
                    unit: non_empty(&lab.unit),
                    system: Some(UCUM_SYSTEM.into()),
                }),
                None,
            ),
            Err(_) => (None, Some(lab.result_value.clone())),
        };

        FhirObservation {
            resource_type: "Observation".into(),
            id: Some(lab.id.to_string()),
            status: lab.status.clone(),
            category: vec![FhirCodeableConcept {
                coding: vec![FhirCoding {
                    system: Some(OBSERVATION_CATEGORY_SYSTEM.into()),
                    code: Some("laboratory".into()),
                    display: Some("Laboratory".into()),
                }],
                text: None,
            }],
            code: FhirCodeableConcept {
                coding,
                text: Some(lab.test_name.clone()),
            },
            subject: Some(patient_reference(patient)),
            encounter: encounter_ref.map(|id| FhirReference {
                reference: format!("Encounter/{}", id),
            }),
            effective_date_time: Some(lab.collected_datetime.to_rfc3339()),
            issued: Some(lab.resulted_datetime.to_rfc3339()),
            value_quantity,
            value_string,
            interpretation: lab
                .interpretation
                .map(|i| {
                    vec![FhirCodeableConcept {
                        coding: vec![FhirCoding {
                            system: Some(INTERPRETATION_SYSTEM.into()),
                            code: Some(i.as_str().to_string()),
                            display: None,
                        }],
                        text: None,
                    }]
                })
                .unwrap_or_default(),
            reference_range: if lab.reference_range.is_empty() {
                Vec::new()
            } else {
                vec![FhirReferenceRange {
                    text: lab.reference_range.clone(),
                }]
            },
        }
    }

    /// Merge an OpenEMR Patient into local demographics. Elements the
    /// resource omits keep their current value.
    pub fn apply_patient_fhir(&self, current: &Patient, resource: &FhirPatient) -> PatientDemographics {
        let mut out = PatientDemographics::from(current);

        if let Some(name) = resource.name.first() {
            if let Some(given) = name.given.first() {
                out.first_name = clip(given, 100);
            }
            if let Some(family) = &name.family {
                out.last_name = clip(family, 100);
            }
        }

        if let Some(gender) = resource.gender.as_deref().and_then(|g| g.parse::<Gender>().ok()) {
            out.gender = gender;
        }

        if let Some(dob) = resource
            .birth_date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        {
            out.date_of_birth = dob;
        }

        for contact in &resource.telecom {
            match (contact.system.as_deref(), &contact.value) {
                (Some("phone"), Some(v)) => out.phone = clip(v, 20),
                (Some("email"), Some(v)) => out.email = clip(v, 254),
                _ => {}
            }
        }

        if let Some(address) = resource.address.first() {
            let line = |i: usize| address.line.get(i).map(|l| clip(l, 200)).unwrap_or_default();
            out.address_line1 = line(0);
            out.address_line2 = line(1);
            out.city = address.city.as_deref().map(|c| clip(c, 100)).unwrap_or_default();
            out.state = address.state.as_deref().map(|c| clip(c, 50)).unwrap_or_default();
            out.zip_code = address.postal_code.as_deref().map(|c| clip(c, 20)).unwrap_or_default();
            out.country = address
                .country
                .as_deref()
                .map(|c| clip(c, 50))
                .unwrap_or_else(|| "US".to_string());
        }

        out
    }

    /// Collection bundle with the patient, its encounters and lab observations.
    pub fn patient_bundle(
        &self,
        patient: &Patient,
        encounters: &[Encounter],
        labs: &[LabResult],
    ) -> Value {
        let mut entries = vec![json!({ "resource": self.patient_to_fhir(patient) })];

        for encounter in encounters {
            entries.push(json!({ "resource": self.encounter_to_fhir(encounter, patient) }));
        }

        for lab in labs {
            let encounter_ref = lab.encounter_id.and_then(|id| {
                encounters
                    .iter()
                    .find(|e| e.id == id)
                    .map(|e| e.openemr_encounter_id.as_str())
            });
            entries.push(json!({ "resource": self.lab_to_observation(lab, patient, encounter_ref) }));
        }

        json!({
            "resourceType": "Bundle",
            "id": Uuid::new_v4().to_string(),
            "type": "collection",
            "timestamp": Utc::now().to_rfc3339(),
            "meta": { "source": self.source },
            "total": entries.len(),
            "entry": entries
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EncounterClass, EncounterStatus, Interpretation};

    fn create_test_patient() -> Patient {
        let now = Utc::now();
        Patient {
            id: Uuid::new_v4(),
            user_id: None,
            openemr_patient_id: "emr-77".into(),
            medical_record_number: "MRN-0001".into(),
            first_name: "Jane".into(),
            last_name: "Doe".into(),
            date_of_birth: NaiveDate::from_ymd_opt(1985, 4, 12).unwrap(),
            gender: Gender::Female,
            phone: "+15551234567".into(),
            email: String::new(),
            address_line1: String::new(),
            address_line2: String::new(),
            city: String::new(),
            state: String::new(),
            zip_code: String::new(),
            country: "US".into(),
            blood_type: String::new(),
            allergies: String::new(),
            medications: String::new(),
            emergency_contact_name: String::new(),
            emergency_contact_phone: String::new(),
            is_active: true,
            created_at: now,
            updated_at: now,
            last_sync: None,
        }
    }

    fn create_test_lab(patient: &Patient, value: &str) -> LabResult {
        let now = Utc::now();
        LabResult {
            id: Uuid::new_v4(),
            patient_id: patient.id,
            encounter_id: None,
            test_name: "Hemoglobin A1c".into(),
            test_code: "4548-4".into(),
            category: "chemistry".into(),
            result_value: value.into(),
            unit: "%".into(),
            reference_range: "4.0-5.6".into(),
            status: "final".into(),
            interpretation: Some(Interpretation::High),
            collected_datetime: now,
            resulted_datetime: now,
            ordering_provider_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_patient_to_fhir() {
        let service = FhirService::new("http://localhost:8080");
        let value = serde_json::to_value(service.patient_to_fhir(&create_test_patient())).unwrap();

        assert_eq!(value["resourceType"], "Patient");
        assert_eq!(value["identifier"][0]["value"], "MRN-0001");
        assert_eq!(value["identifier"][0]["type"]["coding"][0]["code"], "MR");
        assert_eq!(value["name"][0]["given"][0], "Jane");
        assert_eq!(value["birthDate"], "1985-04-12");
        // phone only, no email entry
        assert_eq!(value["telecom"].as_array().unwrap().len(), 1);
        // no address without a first line
        assert!(value.get("address").is_none());
    }

    #[test]
    fn test_encounter_to_fhir() {
        let service = FhirService::new("http://localhost:8080");
        let patient = create_test_patient();
        let now = Utc::now();
        let encounter = Encounter {
            id: Uuid::new_v4(),
            openemr_encounter_id: "enc-1".into(),
            patient_id: patient.id,
            appointment_id: None,
            status: EncounterStatus::Finished,
            encounter_class: EncounterClass::Virtual,
            start_time: now,
            end_time: None,
            provider_id: None,
            chief_complaint: String::new(),
            diagnosis: String::new(),
            treatment_plan: String::new(),
            notes: String::new(),
            created_at: now,
            updated_at: now,
            last_sync: None,
        };

        let value = serde_json::to_value(service.encounter_to_fhir(&encounter, &patient)).unwrap();
        assert_eq!(value["class"]["code"], "VR");
        assert_eq!(value["subject"]["reference"], "Patient/emr-77");
        assert!(value.get("reasonCode").is_none());
    }

    #[test]
    fn test_lab_observation_numeric_and_text_values() {
        let service = FhirService::new("http://localhost:8080");
        let patient = create_test_patient();

        let numeric = service.lab_to_observation(&create_test_lab(&patient, "6.1"), &patient, Some("enc-1"));
        assert_eq!(numeric.value_quantity.as_ref().map(|q| q.value), Some(6.1));
        assert!(numeric.value_string.is_none());
        assert_eq!(numeric.encounter.unwrap().reference, "Encounter/enc-1");
        assert_eq!(numeric.code.coding[0].system.as_deref(), Some("http://loinc.org"));

        let text = service.lab_to_observation(&create_test_lab(&patient, "positive"), &patient, None);
        assert!(text.value_quantity.is_none());
        assert_eq!(text.value_string.as_deref(), Some("positive"));
        assert_eq!(text.interpretation[0].coding[0].code.as_deref(), Some("H"));
    }

    #[test]
    fn test_apply_patient_fhir_defaults_country() {
        let service = FhirService::new("http://localhost:8080");
        let patient = create_test_patient();
        let resource: FhirPatient = serde_json::from_value(json!({
            "resourceType": "Patient",
            "name": [{"family": "Smith", "given": ["Janet"]}],
            "gender": "other",
            "telecom": [{"system": "email", "value": "janet@example.com"}],
            "address": [{"line": ["9 Elm St"], "city": "Reno"}]
        }))
        .unwrap();

        let merged = service.apply_patient_fhir(&patient, &resource);
        assert_eq!(merged.first_name, "Janet");
        assert_eq!(merged.last_name, "Smith");
        assert_eq!(merged.gender, Gender::Other);
        assert_eq!(merged.date_of_birth, patient.date_of_birth);
        assert_eq!(merged.phone, "+15551234567");
        assert_eq!(merged.email, "janet@example.com");
        assert_eq!(merged.address_line1, "9 Elm St");
        assert_eq!(merged.country, "US");
    }

    #[test]
    fn test_apply_patient_fhir_clips_to_column_width() {
        let service = FhirService::new("http://localhost:8080");
        let patient = create_test_patient();
        let resource: FhirPatient = serde_json::from_value(json!({
            "resourceType": "Patient",
            "telecom": [{"system": "phone", "value": "5".repeat(40)}],
            "address": [{"city": "Ä".repeat(150), "postalCode": "9".repeat(30), "state": "Nevada"}]
        }))
        .unwrap();

        let merged = service.apply_patient_fhir(&patient, &resource);
        assert_eq!(merged.phone.chars().count(), 20);
        assert_eq!(merged.city.chars().count(), 100);
        assert_eq!(merged.zip_code, "9".repeat(20));
        assert_eq!(merged.state, "Nevada");
    }

    #[test]
    fn test_bundle_creation() {
        let service = FhirService::new("http://localhost:8080");
        let patient = create_test_patient();
        let labs = vec![create_test_lab(&patient, "6.1")];

        let bundle = service.patient_bundle(&patient, &[], &labs);

        assert_eq!(bundle["resourceType"], "Bundle");
        assert_eq!(bundle["type"], "collection");
        assert_eq!(bundle["total"], 2);
        assert_eq!(bundle["entry"][1]["resource"]["resourceType"], "Observation");
    }
}
