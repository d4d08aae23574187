use super::{authenticate, found, record_audit, AppState};
use crate::error::{ApiError, ApiResult};
use crate::models::*;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

const SUMMARY_WINDOW_DAYS: i64 = 90;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/patients")
            .route(web::get().to(list_patients))
            .route(web::post().to(create_patient)),
    )
    .service(
        web::resource("/patients/{id}")
            .route(web::get().to(get_patient))
            .route(web::put().to(update_patient))
            .route(web::patch().to(update_patient))
            .route(web::delete().to(delete_patient)),
    )
    .route("/patients/{id}/sync_with_openemr", web::post().to(sync_with_openemr))
    .route("/patients/{id}/push_to_openemr", web::post().to(push_to_openemr))
    .route("/patients/{id}/summary", web::get().to(patient_summary))
    .route("/patients/{id}/fhir", web::get().to(patient_fhir))
    .service(
        web::resource("/encounters")
            .route(web::get().to(list_encounters))
            .route(web::post().to(create_encounter)),
    )
    .service(
        web::resource("/encounters/{id}")
            .route(web::get().to(get_encounter))
            .route(web::put().to(update_encounter))
            .route(web::patch().to(update_encounter))
            .route(web::delete().to(delete_encounter)),
    )
    .service(
        web::resource("/medications")
            .route(web::get().to(list_medications))
            .route(web::post().to(create_medication)),
    )
    .service(
        web::resource("/medications/{id}")
            .route(web::get().to(get_medication))
            .route(web::put().to(update_medication))
            .route(web::patch().to(update_medication))
            .route(web::delete().to(delete_medication)),
    )
    .route("/lab-results", web::get().to(list_lab_results))
    .route("/lab-results/{id}", web::get().to(get_lab_result))
    .route("/appointments/today", web::get().to(appointments_today))
    .route("/appointments/upcoming", web::get().to(appointments_upcoming))
    .service(
        web::resource("/appointments")
            .route(web::get().to(list_appointments))
            .route(web::post().to(create_appointment)),
    )
    .service(
        web::resource("/appointments/{id}")
            .route(web::get().to(get_appointment))
            .route(web::put().to(update_appointment))
            .route(web::patch().to(update_appointment))
            .route(web::delete().to(delete_appointment)),
    )
    .route("/appointments/{id}/check_in", web::post().to(check_in_appointment))
    .route("/appointments/{id}/complete", web::post().to(complete_appointment));
}

// ============ Visibility ============

/// Restricts a query to rows the user may see. Patients see records linked
/// to their own chart, clinical staff see everything, anyone else nothing.
/// Returns `false` when no row can be visible.
fn push_visibility(qb: &mut QueryBuilder<'_, Postgres>, user: &User, patient_col: &str) -> bool {
    match user.user_type {
        UserType::Patient => {
            qb.push(format!(" AND {} IN (SELECT id FROM patients WHERE user_id = ", patient_col));
            qb.push_bind(user.id);
            qb.push(")");
            true
        }
        t if t.is_clinical_staff() => true,
        _ => false,
    }
}

fn visible_query(table: &str, patient_col: &str, user: &User) -> Option<QueryBuilder<'static, Postgres>> {
    let mut qb = QueryBuilder::new(format!("SELECT * FROM {} WHERE TRUE", table));
    push_visibility(&mut qb, user, patient_col).then_some(qb)
}

async fn fetch_visible<T>(pool: &PgPool, user: &User, table: &str, patient_col: &str, id: Uuid) -> ApiResult<T>
where
    T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
{
    let Some(mut qb) = visible_query(table, patient_col, user) else {
        return Err(ApiError::NotFound);
    };
    qb.push(" AND id = ").push_bind(id);
    found(qb.build_query_as::<T>().fetch_optional(pool).await?)
}

async fn fetch_list<T>(pool: &PgPool, qb: Option<QueryBuilder<'static, Postgres>>) -> ApiResult<Vec<T>>
where
    T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
{
    match qb {
        Some(mut qb) => Ok(qb.build_query_as::<T>().fetch_all(pool).await?),
        None => Ok(Vec::new()),
    }
}

fn require_clinical_staff(user: &User) -> ApiResult<()> {
    if user.user_type.is_clinical_staff() {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "You do not have permission to perform this action.".to_string(),
        ))
    }
}

fn push_patient_filter(qb: &mut Option<QueryBuilder<'static, Postgres>>, patient_id: Option<Uuid>) {
    if let (Some(qb), Some(patient_id)) = (qb.as_mut(), patient_id) {
        qb.push(" AND patient_id = ").push_bind(patient_id);
    }
}

// ============ Patients ============

pub async fn list_patients(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let mut qb = visible_query("patients", "id", &user);
    if let Some(qb) = qb.as_mut() {
        qb.push(" ORDER BY last_name, first_name");
    }

    let today = Utc::now().date_naive();
    let patients: Vec<Patient> = fetch_list(&state.pool, qb).await?;
    let body: Vec<PatientResponse> = patients.into_iter().map(|p| PatientResponse::new(p, today)).collect();
    Ok(HttpResponse::Ok().json(body))
}

pub async fn create_patient(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreatePatientRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    require_clinical_staff(&user)?;
    body.validate()?;

    let patient: Patient = sqlx::query_as(
        "INSERT INTO patients (user_id, openemr_patient_id, medical_record_number, first_name, last_name,
            date_of_birth, gender, phone, email, address_line1, address_line2, city, state, zip_code,
            country, blood_type, allergies, medications, emergency_contact_name, emergency_contact_phone)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
         RETURNING *",
    )
    .bind(body.user_id)
    .bind(&body.openemr_patient_id)
    .bind(&body.medical_record_number)
    .bind(&body.first_name)
    .bind(&body.last_name)
    .bind(body.date_of_birth)
    .bind(body.gender)
    .bind(&body.phone)
    .bind(body.email.trim().to_lowercase())
    .bind(&body.address_line1)
    .bind(&body.address_line2)
    .bind(&body.city)
    .bind(&body.state)
    .bind(&body.zip_code)
    .bind(body.country.as_deref().unwrap_or("US"))
    .bind(&body.blood_type)
    .bind(&body.allergies)
    .bind(&body.medications)
    .bind(&body.emergency_contact_name)
    .bind(&body.emergency_contact_phone)
    .fetch_one(&state.pool)
    .await?;

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::DataModify,
        "Patient created",
        Some(("patient", patient.id.to_string())),
    )
    .await;

    Ok(HttpResponse::Created().json(PatientResponse::new(patient, Utc::now().date_naive())))
}

pub async fn get_patient(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let patient: Patient = fetch_visible(&state.pool, &user, "patients", "id", path.into_inner()).await?;

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::DataAccess,
        "Patient record viewed",
        Some(("patient", patient.id.to_string())),
    )
    .await;

    Ok(HttpResponse::Ok().json(PatientResponse::new(patient, Utc::now().date_naive())))
}

pub async fn update_patient(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<UpdatePatientRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    require_clinical_staff(&user)?;
    body.validate()?;
    let id = path.into_inner();

    let patient: Option<Patient> = sqlx::query_as(
        "UPDATE patients SET
            user_id = COALESCE($2, user_id),
            openemr_patient_id = COALESCE($3, openemr_patient_id),
            medical_record_number = COALESCE($4, medical_record_number),
            first_name = COALESCE($5, first_name),
            last_name = COALESCE($6, last_name),
            date_of_birth = COALESCE($7, date_of_birth),
            gender = COALESCE($8, gender),
            phone = COALESCE($9, phone),
            email = COALESCE($10, email),
            address_line1 = COALESCE($11, address_line1),
            address_line2 = COALESCE($12, address_line2),
            city = COALESCE($13, city),
            state = COALESCE($14, state),
            zip_code = COALESCE($15, zip_code),
            country = COALESCE($16, country),
            blood_type = COALESCE($17, blood_type),
            allergies = COALESCE($18, allergies),
            medications = COALESCE($19, medications),
            emergency_contact_name = COALESCE($20, emergency_contact_name),
            emergency_contact_phone = COALESCE($21, emergency_contact_phone),
            is_active = COALESCE($22, is_active),
            updated_at = now()
         WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .bind(body.user_id)
    .bind(&body.openemr_patient_id)
    .bind(&body.medical_record_number)
    .bind(&body.first_name)
    .bind(&body.last_name)
    .bind(body.date_of_birth)
    .bind(body.gender)
    .bind(&body.phone)
    .bind(body.email.as_ref().map(|e| e.trim().to_lowercase()))
    .bind(&body.address_line1)
    .bind(&body.address_line2)
    .bind(&body.city)
    .bind(&body.state)
    .bind(&body.zip_code)
    .bind(&body.country)
    .bind(&body.blood_type)
    .bind(&body.allergies)
    .bind(&body.medications)
    .bind(&body.emergency_contact_name)
    .bind(&body.emergency_contact_phone)
    .bind(body.is_active)
    .fetch_optional(&state.pool)
    .await?;
    let patient = found(patient)?;

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::DataModify,
        "Patient updated",
        Some(("patient", patient.id.to_string())),
    )
    .await;

    Ok(HttpResponse::Ok().json(PatientResponse::new(patient, Utc::now().date_naive())))
}

pub async fn delete_patient(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    require_clinical_staff(&user)?;
    let id = path.into_inner();

    let deleted = sqlx::query("DELETE FROM patients WHERE id = $1")
        .bind(id)
        .execute(&state.pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::NotFound);
    }

    record_audit(&state.pool, &req, user.id, AuditAction::DataModify, "Patient deleted", Some(("patient", id.to_string()))).await;
    Ok(HttpResponse::NoContent().finish())
}

/// OpenEMR Patient for `openemr_id`, served from cache when fresh.
async fn fetch_openemr_patient(state: &AppState, openemr_id: &str) -> ApiResult<FhirPatient> {
    if let Ok(Some(cached)) = state.redis.write().await.get_openemr_patient(openemr_id).await {
        return Ok(cached);
    }

    let resource = state
        .openemr
        .get_patient(openemr_id)
        .await
        .map_err(|e| ApiError::BadRequest(format!("Sync failed: {}", e)))?;

    let ttl = state.settings.openemr.cache_ttl_secs;
    if let Err(e) = state.redis.write().await.set_openemr_patient(&resource, ttl).await {
        warn!(error = %e, "Failed to cache OpenEMR patient");
    }
    Ok(resource)
}

pub async fn sync_with_openemr(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let patient: Patient = fetch_visible(&state.pool, &user, "patients", "id", path.into_inner()).await?;

    let resource = fetch_openemr_patient(&state, &patient.openemr_patient_id).await?;
    let d = state.fhir_service.apply_patient_fhir(&patient, &resource);

    let patient: Patient = sqlx::query_as(
        "UPDATE patients SET first_name = $2, last_name = $3, gender = $4, date_of_birth = $5,
            phone = $6, email = $7, address_line1 = $8, address_line2 = $9, city = $10, state = $11,
            zip_code = $12, country = $13, last_sync = now(), updated_at = now()
         WHERE id = $1 RETURNING *",
    )
    .bind(patient.id)
    .bind(&d.first_name)
    .bind(&d.last_name)
    .bind(d.gender)
    .bind(d.date_of_birth)
    .bind(&d.phone)
    .bind(&d.email)
    .bind(&d.address_line1)
    .bind(&d.address_line2)
    .bind(&d.city)
    .bind(&d.state)
    .bind(&d.zip_code)
    .bind(&d.country)
    .fetch_one(&state.pool)
    .await?;

    info!(patient = %patient.id, "Patient synchronized from OpenEMR");
    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::DataModify,
        "Patient synchronized from OpenEMR",
        Some(("patient", patient.id.to_string())),
    )
    .await;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Patient synchronized successfully",
        "patient": PatientResponse::new(patient, Utc::now().date_naive()),
    })))
}

/// Sends local demographics to OpenEMR.
pub async fn push_to_openemr(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    require_clinical_staff(&user)?;
    let patient: Patient = fetch_visible(&state.pool, &user, "patients", "id", path.into_inner()).await?;

    let resource = state.fhir_service.patient_to_fhir(&patient);
    let updated = state
        .openemr
        .update_patient(&patient.openemr_patient_id, &resource)
        .await
        .map_err(|e| ApiError::Upstream(format!("OpenEMR update failed: {}", e)))?;

    if let Err(e) = state
        .redis
        .write()
        .await
        .set_openemr_patient(&updated, state.settings.openemr.cache_ttl_secs)
        .await
    {
        warn!(error = %e, "Failed to cache OpenEMR patient");
    }

    sqlx::query("UPDATE patients SET last_sync = now() WHERE id = $1")
        .bind(patient.id)
        .execute(&state.pool)
        .await?;

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::Export,
        "Patient pushed to OpenEMR",
        Some(("patient", patient.id.to_string())),
    )
    .await;

    Ok(HttpResponse::Ok().json(serde_json::json!({ "message": "Patient pushed to OpenEMR" })))
}

pub async fn patient_summary(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let patient: Patient = fetch_visible(&state.pool, &user, "patients", "id", path.into_inner()).await?;
    let now = Utc::now();
    let since = now - Duration::days(SUMMARY_WINDOW_DAYS);

    let encounters: Vec<Encounter> = sqlx::query_as(
        "SELECT * FROM encounters WHERE patient_id = $1 AND start_time >= $2
         ORDER BY start_time DESC LIMIT 5",
    )
    .bind(patient.id)
    .bind(since)
    .fetch_all(&state.pool)
    .await?;

    let medications: Vec<Medication> = sqlx::query_as(
        "SELECT * FROM medications WHERE patient_id = $1 AND is_active ORDER BY start_date DESC",
    )
    .bind(patient.id)
    .fetch_all(&state.pool)
    .await?;

    let labs: Vec<LabResult> = sqlx::query_as(
        "SELECT * FROM lab_results WHERE patient_id = $1 AND resulted_datetime >= $2
         ORDER BY resulted_datetime DESC LIMIT 10",
    )
    .bind(patient.id)
    .bind(since)
    .fetch_all(&state.pool)
    .await?;

    let appointments: Vec<Appointment> = sqlx::query_as(
        "SELECT * FROM appointments WHERE patient_id = $1 AND start_time > $2
            AND status IN ('scheduled', 'confirmed')
         ORDER BY start_time LIMIT 5",
    )
    .bind(patient.id)
    .bind(now)
    .fetch_all(&state.pool)
    .await?;

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::DataAccess,
        "Patient summary viewed",
        Some(("patient", patient.id.to_string())),
    )
    .await;

    let today = now.date_naive();
    Ok(HttpResponse::Ok().json(PatientSummary {
        patient: PatientResponse::new(patient, today),
        recent_encounters: encounters.into_iter().map(EncounterResponse::from).collect(),
        active_medications: medications.into_iter().map(|m| MedicationResponse::new(m, today)).collect(),
        recent_labs: labs.into_iter().map(LabResultResponse::from).collect(),
        upcoming_appointments: appointments.into_iter().map(|a| AppointmentResponse::new(a, now)).collect(),
    }))
}

pub async fn patient_fhir(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let patient: Patient = fetch_visible(&state.pool, &user, "patients", "id", path.into_inner()).await?;

    let encounters: Vec<Encounter> =
        sqlx::query_as("SELECT * FROM encounters WHERE patient_id = $1 ORDER BY start_time DESC")
            .bind(patient.id)
            .fetch_all(&state.pool)
            .await?;
    let labs: Vec<LabResult> =
        sqlx::query_as("SELECT * FROM lab_results WHERE patient_id = $1 ORDER BY resulted_datetime DESC")
            .bind(patient.id)
            .fetch_all(&state.pool)
            .await?;

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::Export,
        "Patient FHIR bundle exported",
        Some(("patient", patient.id.to_string())),
    )
    .await;

    let bundle = state.fhir_service.patient_bundle(&patient, &encounters, &labs);
    Ok(HttpResponse::Ok().content_type("application/fhir+json").json(bundle))
}

// ============ Encounters ============

pub async fn list_encounters(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<EmrListQuery>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let mut qb = visible_query("encounters", "patient_id", &user);
    push_patient_filter(&mut qb, query.patient_id);
    if let Some(qb) = qb.as_mut() {
        qb.push(" ORDER BY start_time DESC");
    }

    let encounters: Vec<Encounter> = fetch_list(&state.pool, qb).await?;
    let body: Vec<EncounterResponse> = encounters.into_iter().map(EncounterResponse::from).collect();
    Ok(HttpResponse::Ok().json(body))
}

pub async fn create_encounter(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateEncounterRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    require_clinical_staff(&user)?;
    body.validate()?;

    let encounter: Encounter = sqlx::query_as(
        "INSERT INTO encounters (openemr_encounter_id, patient_id, status, encounter_class, start_time,
            end_time, provider_id, chief_complaint, diagnosis, treatment_plan, notes)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING *",
    )
    .bind(&body.openemr_encounter_id)
    .bind(body.patient_id)
    .bind(body.status.unwrap_or(EncounterStatus::Planned))
    .bind(body.encounter_class.unwrap_or(EncounterClass::Ambulatory))
    .bind(body.start_time)
    .bind(body.end_time)
    .bind(user.id)
    .bind(&body.chief_complaint)
    .bind(&body.diagnosis)
    .bind(&body.treatment_plan)
    .bind(&body.notes)
    .fetch_one(&state.pool)
    .await?;

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::DataModify,
        "Encounter created",
        Some(("encounter", encounter.id.to_string())),
    )
    .await;

    Ok(HttpResponse::Created().json(EncounterResponse::from(encounter)))
}

pub async fn get_encounter(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let encounter: Encounter = fetch_visible(&state.pool, &user, "encounters", "patient_id", path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(EncounterResponse::from(encounter)))
}

pub async fn update_encounter(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<UpdateEncounterRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    require_clinical_staff(&user)?;
    body.validate()?;

    let encounter: Option<Encounter> = sqlx::query_as(
        "UPDATE encounters SET
            openemr_encounter_id = COALESCE($2, openemr_encounter_id),
            status = COALESCE($3, status),
            encounter_class = COALESCE($4, encounter_class),
            start_time = COALESCE($5, start_time),
            end_time = COALESCE($6, end_time),
            chief_complaint = COALESCE($7, chief_complaint),
            diagnosis = COALESCE($8, diagnosis),
            treatment_plan = COALESCE($9, treatment_plan),
            notes = COALESCE($10, notes),
            updated_at = now()
         WHERE id = $1 RETURNING *",
    )
    .bind(path.into_inner())
    .bind(&body.openemr_encounter_id)
    .bind(body.status)
    .bind(body.encounter_class)
    .bind(body.start_time)
    .bind(body.end_time)
    .bind(&body.chief_complaint)
    .bind(&body.diagnosis)
    .bind(&body.treatment_plan)
    .bind(&body.notes)
    .fetch_optional(&state.pool)
    .await?;
    let encounter = found(encounter)?;

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::DataModify,
        "Encounter updated",
        Some(("encounter", encounter.id.to_string())),
    )
    .await;

    Ok(HttpResponse::Ok().json(EncounterResponse::from(encounter)))
}

pub async fn delete_encounter(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    require_clinical_staff(&user)?;
    let id = path.into_inner();

    let deleted = sqlx::query("DELETE FROM encounters WHERE id = $1")
        .bind(id)
        .execute(&state.pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::NotFound);
    }

    record_audit(&state.pool, &req, user.id, AuditAction::DataModify, "Encounter deleted", Some(("encounter", id.to_string()))).await;
    Ok(HttpResponse::NoContent().finish())
}

// ============ Medications ============

pub async fn list_medications(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<EmrListQuery>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let mut qb = visible_query("medications", "patient_id", &user);
    push_patient_filter(&mut qb, query.patient_id);
    if let Some(qb) = qb.as_mut() {
        qb.push(" ORDER BY start_date DESC, created_at DESC");
    }

    let today = Utc::now().date_naive();
    let medications: Vec<Medication> = fetch_list(&state.pool, qb).await?;
    let body: Vec<MedicationResponse> = medications.into_iter().map(|m| MedicationResponse::new(m, today)).collect();
    Ok(HttpResponse::Ok().json(body))
}

pub async fn create_medication(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateMedicationRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    require_clinical_staff(&user)?;
    body.validate()?;

    let prescriber = (user.user_type == UserType::Provider).then_some(user.id);

    let medication: Medication = sqlx::query_as(
        "INSERT INTO medications (patient_id, name, dosage, frequency, route, prescriber_id, start_date,
            end_date, is_active, instructions, notes)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING *",
    )
    .bind(body.patient_id)
    .bind(&body.name)
    .bind(&body.dosage)
    .bind(&body.frequency)
    .bind(&body.route)
    .bind(prescriber)
    .bind(body.start_date)
    .bind(body.end_date)
    .bind(body.is_active.unwrap_or(true))
    .bind(&body.instructions)
    .bind(&body.notes)
    .fetch_one(&state.pool)
    .await?;

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::DataModify,
        "Medication created",
        Some(("medication", medication.id.to_string())),
    )
    .await;

    Ok(HttpResponse::Created().json(MedicationResponse::new(medication, Utc::now().date_naive())))
}

pub async fn get_medication(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let medication: Medication =
        fetch_visible(&state.pool, &user, "medications", "patient_id", path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(MedicationResponse::new(medication, Utc::now().date_naive())))
}

pub async fn update_medication(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<UpdateMedicationRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    require_clinical_staff(&user)?;
    body.validate()?;

    let medication: Option<Medication> = sqlx::query_as(
        "UPDATE medications SET
            name = COALESCE($2, name),
            dosage = COALESCE($3, dosage),
            frequency = COALESCE($4, frequency),
            route = COALESCE($5, route),
            start_date = COALESCE($6, start_date),
            end_date = COALESCE($7, end_date),
            is_active = COALESCE($8, is_active),
            instructions = COALESCE($9, instructions),
            notes = COALESCE($10, notes),
            updated_at = now()
         WHERE id = $1 RETURNING *",
    )
    .bind(path.into_inner())
    .bind(&body.name)
    .bind(&body.dosage)
    .bind(&body.frequency)
    .bind(&body.route)
    .bind(body.start_date)
    .bind(body.end_date)
    .bind(body.is_active)
    .bind(&body.instructions)
    .bind(&body.notes)
    .fetch_optional(&state.pool)
    .await?;
    let medication = found(medication)?;

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::DataModify,
        "Medication updated",
        Some(("medication", medication.id.to_string())),
    )
    .await;

    Ok(HttpResponse::Ok().json(MedicationResponse::new(medication, Utc::now().date_naive())))
}

pub async fn delete_medication(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    require_clinical_staff(&user)?;
    let id = path.into_inner();

    let deleted = sqlx::query("DELETE FROM medications WHERE id = $1")
        .bind(id)
        .execute(&state.pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::NotFound);
    }

    record_audit(&state.pool, &req, user.id, AuditAction::DataModify, "Medication deleted", Some(("medication", id.to_string()))).await;
    Ok(HttpResponse::NoContent().finish())
}

// ============ Lab Results ============

pub async fn list_lab_results(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<EmrListQuery>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let mut qb = visible_query("lab_results", "patient_id", &user);
    push_patient_filter(&mut qb, query.patient_id);
    if let Some(qb) = qb.as_mut() {
        qb.push(" ORDER BY resulted_datetime DESC");
    }

    let labs: Vec<LabResult> = fetch_list(&state.pool, qb).await?;
    let body: Vec<LabResultResponse> = labs.into_iter().map(LabResultResponse::from).collect();
    Ok(HttpResponse::Ok().json(body))
}

pub async fn get_lab_result(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let lab: LabResult = fetch_visible(&state.pool, &user, "lab_results", "patient_id", path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(LabResultResponse::from(lab)))
}

// ============ Appointments ============

fn appointment_list(appointments: Vec<Appointment>) -> Vec<AppointmentResponse> {
    let now = Utc::now();
    appointments.into_iter().map(|a| AppointmentResponse::new(a, now)).collect()
}

pub async fn list_appointments(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<EmrListQuery>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let query = query.into_inner();
    let mut qb = visible_query("appointments", "patient_id", &user);
    push_patient_filter(&mut qb, query.patient_id);

    if let Some(qb) = qb.as_mut() {
        if let Some(provider_id) = query.provider_id {
            qb.push(" AND provider_id = ").push_bind(provider_id);
        }
        if let Some(start) = query.start_date {
            qb.push(" AND start_time::date >= ").push_bind(start);
        }
        if let Some(end) = query.end_date {
            qb.push(" AND start_time::date <= ").push_bind(end);
        }
        qb.push(" ORDER BY start_time");
    }

    let appointments: Vec<Appointment> = fetch_list(&state.pool, qb).await?;
    Ok(HttpResponse::Ok().json(appointment_list(appointments)))
}

pub async fn appointments_today(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let mut qb = visible_query("appointments", "patient_id", &user);
    if let Some(qb) = qb.as_mut() {
        qb.push(" AND start_time::date = ").push_bind(Utc::now().date_naive());
        qb.push(" ORDER BY start_time");
    }

    let appointments: Vec<Appointment> = fetch_list(&state.pool, qb).await?;
    Ok(HttpResponse::Ok().json(appointment_list(appointments)))
}

pub async fn appointments_upcoming(req: HttpRequest, state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let mut qb = visible_query("appointments", "patient_id", &user);
    if let Some(qb) = qb.as_mut() {
        qb.push(" AND start_time > ").push_bind(Utc::now());
        qb.push(" AND status IN ('scheduled', 'confirmed') ORDER BY start_time LIMIT 10");
    }

    let appointments: Vec<Appointment> = fetch_list(&state.pool, qb).await?;
    Ok(HttpResponse::Ok().json(appointment_list(appointments)))
}

pub async fn create_appointment(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateAppointmentRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    require_clinical_staff(&user)?;
    body.validate()?;
    if body.end_time <= body.start_time {
        return Err(ApiError::field("end_time", "End time must be after start time."));
    }

    let duration = body
        .duration_minutes
        .unwrap_or_else(|| (body.end_time - body.start_time).num_minutes().clamp(1, 1440) as i32);
    let appointment_type = body.appointment_type.unwrap_or(AppointmentType::Routine);

    let appointment: Appointment = sqlx::query_as(
        "INSERT INTO appointments (openemr_appointment_id, patient_id, provider_id, appointment_type, status,
            start_time, end_time, duration_minutes, chief_complaint, notes, is_telehealth, meeting_url, meeting_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) RETURNING *",
    )
    .bind(&body.openemr_appointment_id)
    .bind(body.patient_id)
    .bind(body.provider_id)
    .bind(appointment_type)
    .bind(body.status.unwrap_or(AppointmentStatus::Scheduled))
    .bind(body.start_time)
    .bind(body.end_time)
    .bind(duration)
    .bind(&body.chief_complaint)
    .bind(&body.notes)
    .bind(body.is_telehealth || appointment_type == AppointmentType::Telehealth)
    .bind(&body.meeting_url)
    .bind(&body.meeting_id)
    .fetch_one(&state.pool)
    .await?;

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::DataModify,
        "Appointment created",
        Some(("appointment", appointment.id.to_string())),
    )
    .await;

    Ok(HttpResponse::Created().json(AppointmentResponse::new(appointment, Utc::now())))
}

pub async fn get_appointment(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let appointment: Appointment =
        fetch_visible(&state.pool, &user, "appointments", "patient_id", path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(AppointmentResponse::new(appointment, Utc::now())))
}

pub async fn update_appointment(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<UpdateAppointmentRequest>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    require_clinical_staff(&user)?;
    body.validate()?;

    let appointment: Option<Appointment> = sqlx::query_as(
        "UPDATE appointments SET
            openemr_appointment_id = COALESCE($2, openemr_appointment_id),
            provider_id = COALESCE($3, provider_id),
            appointment_type = COALESCE($4, appointment_type),
            status = COALESCE($5, status),
            start_time = COALESCE($6, start_time),
            end_time = COALESCE($7, end_time),
            duration_minutes = COALESCE($8, duration_minutes),
            chief_complaint = COALESCE($9, chief_complaint),
            notes = COALESCE($10, notes),
            is_telehealth = COALESCE($11, is_telehealth),
            meeting_url = COALESCE($12, meeting_url),
            meeting_id = COALESCE($13, meeting_id),
            updated_at = now()
         WHERE id = $1 RETURNING *",
    )
    .bind(path.into_inner())
    .bind(&body.openemr_appointment_id)
    .bind(body.provider_id)
    .bind(body.appointment_type)
    .bind(body.status)
    .bind(body.start_time)
    .bind(body.end_time)
    .bind(body.duration_minutes)
    .bind(&body.chief_complaint)
    .bind(&body.notes)
    .bind(body.is_telehealth)
    .bind(&body.meeting_url)
    .bind(&body.meeting_id)
    .fetch_optional(&state.pool)
    .await?;
    let appointment = found(appointment)?;

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::DataModify,
        "Appointment updated",
        Some(("appointment", appointment.id.to_string())),
    )
    .await;

    Ok(HttpResponse::Ok().json(AppointmentResponse::new(appointment, Utc::now())))
}

pub async fn delete_appointment(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    require_clinical_staff(&user)?;
    let id = path.into_inner();

    let deleted = sqlx::query("DELETE FROM appointments WHERE id = $1")
        .bind(id)
        .execute(&state.pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::NotFound);
    }

    record_audit(&state.pool, &req, user.id, AuditAction::DataModify, "Appointment deleted", Some(("appointment", id.to_string()))).await;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn check_in_appointment(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    let appointment: Appointment =
        fetch_visible(&state.pool, &user, "appointments", "patient_id", path.into_inner()).await?;

    let updated: Option<Appointment> = sqlx::query_as(
        "UPDATE appointments SET status = 'arrived', updated_at = now()
         WHERE id = $1 AND status IN ('scheduled', 'confirmed', 'arrived') RETURNING *",
    )
    .bind(appointment.id)
    .fetch_optional(&state.pool)
    .await?;

    let Some(updated) = updated else {
        return Err(ApiError::BadRequest(format!(
            "Appointment cannot be checked in from status {}",
            appointment.status
        )));
    };

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::DataModify,
        "Appointment checked in",
        Some(("appointment", updated.id.to_string())),
    )
    .await;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Patient checked in successfully",
        "appointment": AppointmentResponse::new(updated, Utc::now()),
    })))
}

/// `enc_{appointment}_{unix seconds}`.
/// One encounter per appointment, so the appointment id alone keys it.
fn completion_encounter_id(appointment_id: Uuid) -> String {
    format!("enc_{}", appointment_id.simple())
}

pub async fn complete_appointment(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ApiResult<HttpResponse> {
    let user = authenticate(&req, &state).await?;
    require_clinical_staff(&user)?;
    let id = path.into_inner();
    let now = Utc::now();

    let mut tx = state.pool.begin().await?;
    let appointment: Option<Appointment> = sqlx::query_as(
        "UPDATE appointments SET status = 'completed', end_time = $2, updated_at = now()
         WHERE id = $1 AND status NOT IN ('completed', 'cancelled', 'no-show') RETURNING *",
    )
    .bind(id)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(appointment) = appointment else {
        let status: Option<AppointmentStatus> =
            sqlx::query_scalar("SELECT status FROM appointments WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        return Err(match status {
            None => ApiError::NotFound,
            Some(AppointmentStatus::Completed) => {
                ApiError::Conflict("Appointment is already completed".to_string())
            }
            Some(_) => {
                ApiError::BadRequest("Cancelled or missed appointments cannot be completed".to_string())
            }
        });
    };

    let class = if appointment.is_telehealth {
        EncounterClass::Virtual
    } else {
        EncounterClass::Ambulatory
    };

    sqlx::query(
        "INSERT INTO encounters (openemr_encounter_id, patient_id, appointment_id, status, encounter_class,
            start_time, end_time, provider_id, chief_complaint)
         VALUES ($1, $2, $3, 'finished', $4, $5, $6, $7, $8)
         ON CONFLICT (appointment_id) DO NOTHING",
    )
    .bind(completion_encounter_id(appointment.id))
    .bind(appointment.patient_id)
    .bind(appointment.id)
    .bind(class)
    .bind(appointment.start_time)
    .bind(now)
    .bind(appointment.provider_id)
    .bind(&appointment.chief_complaint)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    record_audit(
        &state.pool,
        &req,
        user.id,
        AuditAction::DataModify,
        "Appointment completed",
        Some(("appointment", appointment.id.to_string())),
    )
    .await;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Appointment completed successfully",
        "appointment": AppointmentResponse::new(appointment, now),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubscriptionTier;

    fn user(user_type: UserType) -> User {
        let now = Utc::now();
        User {
            id: Uuid::new_v4(),
            username: "u".into(),
            email: "u@example.com".into(),
            password_hash: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            user_type,
            subscription_tier: SubscriptionTier::Free,
            phone_number: String::new(),
            date_of_birth: None,
            patient_id: None,
            provider_id: None,
            language_preference: "en".into(),
            timezone: "UTC".into(),
            biometric_enabled: false,
            two_factor_enabled: false,
            is_verified: false,
            is_active: true,
            failed_login_attempts: 0,
            locked_until: None,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_visibility_by_user_type() {
        let patient = user(UserType::Patient);
        let qb = visible_query("encounters", "patient_id", &patient).unwrap();
        assert_eq!(
            qb.sql(),
            "SELECT * FROM encounters WHERE TRUE AND patient_id IN (SELECT id FROM patients WHERE user_id = $1)"
        );

        let staff = user(UserType::CareTeam);
        assert_eq!(
            visible_query("patients", "id", &staff).unwrap().sql(),
            "SELECT * FROM patients WHERE TRUE"
        );

        assert!(visible_query("patients", "id", &user(UserType::Admin)).is_none());
    }

    #[test]
    fn test_patient_filter_only_applies_to_visible_queries() {
        let mut none: Option<QueryBuilder<'static, Postgres>> = None;
        push_patient_filter(&mut none, Some(Uuid::new_v4()));
        assert!(none.is_none());

        let mut qb = visible_query("medications", "patient_id", &user(UserType::Provider));
        push_patient_filter(&mut qb, Some(Uuid::new_v4()));
        assert!(qb.unwrap().sql().ends_with("AND patient_id = $1"));
    }

    #[test]
    fn test_write_permission() {
        assert!(require_clinical_staff(&user(UserType::Provider)).is_ok());
        assert!(require_clinical_staff(&user(UserType::CareTeam)).is_ok());
        assert!(matches!(require_clinical_staff(&user(UserType::Patient)), Err(ApiError::Forbidden(_))));
    }

    #[test]
    fn test_completion_encounter_id_fits_column() {
        let id = Uuid::new_v4();
        let encounter_id = completion_encounter_id(id);
        assert!(encounter_id.len() <= 50);
        assert_eq!(encounter_id, format!("enc_{}", id.simple()));
        assert_ne!(completion_encounter_id(Uuid::new_v4()), encounter_id);
    }
}
