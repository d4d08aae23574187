use crate::metrics::{module_label, HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION};
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{HeaderName, HeaderValue},
    Error, HttpMessage,
};
use futures::future::LocalBoxFuture;
use std::future::{ready, Ready};
use std::rc::Rc;
use tracing::{info, warn};
use uuid::Uuid;

/// Inserted into request extensions once a bearer token has been accepted,
/// so request logging can attribute the call without touching PHI.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedUser(pub Uuid);

#[derive(Debug, Clone)]
pub struct RequestIdValue(pub String);

/// Modules whose responses carry patient data.
fn is_phi_path(path: &str) -> bool {
    ["/api/emr", "/api/journal", "/api/messaging", "/api/telehealth"]
        .iter()
        .any(|prefix| path.starts_with(prefix))
}

/// Audit logging middleware for HIPAA compliance
pub struct AuditLogger;

impl<S, B> Transform<S, ServiceRequest> for AuditLogger
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = AuditLoggerMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuditLoggerMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct AuditLoggerMiddleware<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for AuditLoggerMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let svc = self.service.clone();

        Box::pin(async move {
            let method = req.method().to_string();
            let path = req.path().to_string();
            let module = module_label(&path);
            let ip = req.connection_info().realip_remote_addr().map(|s| s.to_string());
            let user_agent = req.headers()
                .get("user-agent")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.to_string());

            let start_time = std::time::Instant::now();
            let res = svc.call(req).await;
            let elapsed = start_time.elapsed();

            HTTP_REQUEST_DURATION
                .with_label_values(&[&method, module])
                .observe(elapsed.as_secs_f64());

            match &res {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let user = response.request().extensions().get::<AuthenticatedUser>().map(|u| u.0);
                    let request_id = response.request().extensions().get::<RequestIdValue>().map(|r| r.0.clone());

                    HTTP_REQUESTS_TOTAL
                        .with_label_values(&[&method, module, &status.to_string()])
                        .inc();

                    if path.starts_with("/api/") {
                        info!(
                            method = %method,
                            path = %path,
                            status = status,
                            duration_ms = elapsed.as_millis(),
                            ip = ?ip,
                            user = ?user,
                            user_agent = ?user_agent,
                            request_id = ?request_id,
                            "API_REQUEST"
                        );
                    }

                    if path.starts_with("/api/auth/") {
                        info!(
                            event_type = "authentication",
                            action = path.trim_start_matches("/api/auth/").trim_end_matches('/'),
                            status = status,
                            user = ?user,
                            ip = ?ip,
                            "AUTH_EVENT"
                        );
                    }

                    // Log data access (HIPAA requirement)
                    if is_phi_path(&path) {
                        info!(
                            event_type = "data_access",
                            module = module,
                            resource = %path,
                            method = %method,
                            user = ?user,
                            status = status,
                            "DATA_ACCESS"
                        );
                    }
                }
                Err(err) => {
                    HTTP_REQUESTS_TOTAL
                        .with_label_values(&[&method, module, "error"])
                        .inc();
                    warn!(
                        method = %method,
                        path = %path,
                        error = %err,
                        ip = ?ip,
                        "REQUEST_ERROR"
                    );
                }
            }

            res
        })
    }
}

/// Request ID middleware for tracing
pub struct RequestId;

impl<S, B> Transform<S, ServiceRequest> for RequestId
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestIdMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestIdMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct RequestIdMiddleware<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for RequestIdMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        // Honour an upstream proxy's id when it is a sane header value.
        let request_id = req
            .headers()
            .get("x-request-id")
            .and_then(|h| h.to_str().ok())
            .filter(|s| !s.is_empty() && s.len() <= 64)
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        req.extensions_mut().insert(RequestIdValue(request_id.clone()));

        let svc = self.service.clone();

        Box::pin(async move {
            let mut res = svc.call(req).await?;
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                res.headers_mut()
                    .insert(HeaderName::from_static("x-request-id"), value);
            }
            Ok(res)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App, HttpResponse};

    #[::core::prelude::v1::test]
    fn test_phi_paths() {
        assert!(is_phi_path("/api/emr/patients/"));
        assert!(is_phi_path("/api/journal/entries/"));
        assert!(!is_phi_path("/api/auth/login/"));
        assert!(!is_phi_path("/health"));
    }

    #[actix_web::test]
    async fn test_request_id_header_added() {
        let app = test::init_service(
            App::new()
                .wrap(AuditLogger)
                .wrap(RequestId)
                .route("/ping", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let req = test::TestRequest::get().uri("/ping").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let id = resp.headers().get("x-request-id").unwrap().to_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());

        let req = test::TestRequest::get()
            .uri("/ping")
            .insert_header(("x-request-id", "upstream-123"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.headers().get("x-request-id").unwrap(), "upstream-123");
    }
}
