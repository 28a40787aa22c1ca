use crate::error::SyncError;
use crate::model::{IncidentUpdate, NewIncident, NewPortalUser, NewReservation};
use crate::session::PortalCredential;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Typed surface of the portal consumed by the sync core. The trait is the
/// seam test doubles implement; `PortalClient` is the real HTTP binding.
/// Credentials are passed explicitly on every authenticated call; session
/// refresh is the orchestration layer's job, never this one's.
#[async_trait]
pub trait PortalService: Send + Sync {
    async fn login(&self, email: &str) -> Result<LoginClaims, SyncError>;

    async fn create_reservation(
        &self,
        cred: &PortalCredential,
        payload: &Value,
    ) -> Result<RemoteRecord, SyncError>;

    async fn create_incident(
        &self,
        cred: &PortalCredential,
        payload: &Value,
    ) -> Result<RemoteRecord, SyncError>;

    async fn update_incident(
        &self,
        cred: &PortalCredential,
        portal_id: &str,
        payload: &Value,
    ) -> Result<RemoteRecord, SyncError>;

    async fn approve_reservation(
        &self,
        cred: &PortalCredential,
        portal_id: &str,
        payload: &Value,
    ) -> Result<RemoteRecord, SyncError>;

    async fn provision_user(
        &self,
        cred: &PortalCredential,
        payload: &Value,
    ) -> Result<RemoteRecord, SyncError>;

    async fn list_reservations(
        &self,
        cred: &PortalCredential,
        filters: &[(String, String)],
    ) -> Result<Vec<Value>, SyncError>;

    async fn list_incidents(
        &self,
        cred: &PortalCredential,
        filters: &[(String, String)],
    ) -> Result<Vec<Value>, SyncError>;
}

/// Claims extracted from a successful login envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginClaims {
    pub token: String,
    pub token_type: String,
    pub role: Option<String>,
}

/// The slice of a portal write response the sync core cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteRecord {
    pub id: Option<String>,
    pub status: Option<String>,
}

#[derive(Clone)]
pub struct PortalClient {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for PortalClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl PortalClient {
    pub fn new(base_url: Url, timeout: Duration) -> Self {
        let http = Client::builder()
            .user_agent("portal-sync/0.1")
            .timeout(timeout)
            .no_proxy()
            .build()
            .expect("reqwest client");
        Self { http, base_url }
    }

    /// Build one portal request: absolute URL from the configured base,
    /// query parameters for non-empty values only, `Accept` always,
    /// `Content-Type` only alongside a body, `Authorization` only with a
    /// credential.
    pub fn build_request(
        &self,
        method: Method,
        path: &str,
        cred: Option<&PortalCredential>,
        params: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<reqwest::Request, SyncError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|err| SyncError::Network(format!("invalid portal URL: {err}")))?;
        if params.iter().any(|(_, v)| !v.is_empty()) {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                if !value.is_empty() {
                    pairs.append_pair(key, value);
                }
            }
        }

        let mut builder = self
            .http
            .request(method, url)
            .header("Accept", "application/json");
        if let Some(cred) = cred {
            builder = builder.header("Authorization", cred.authorization_header());
        }
        if let Some(body) = body {
            builder = builder
                .header("Content-Type", "application/json")
                .json(body);
        }
        builder
            .build()
            .map_err(|err| SyncError::Network(err.to_string()))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        cred: Option<&PortalCredential>,
        params: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Value, SyncError> {
        let request = self.build_request(method, path, cred, params, body)?;
        debug!(url = %request.url(), "portal request");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|err| SyncError::Network(err.to_string()))?;

        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|err| SyncError::Network(err.to_string()))?;
        let parsed: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)
                .map_err(|err| SyncError::Network(format!("malformed portal response: {err}")))?
        };

        // The portal signals failure two ways: the HTTP status, or a 2xx
        // envelope whose own `status` field says "error".
        if !status.is_success() || parsed.get("status").and_then(Value::as_str) == Some("error") {
            return Err(error_from_response(status, &parsed));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl PortalService for PortalClient {
    async fn login(&self, email: &str) -> Result<LoginClaims, SyncError> {
        let body = build_login_request(email);
        let response = self
            .request(Method::POST, "auth/login", None, &[], Some(&body))
            .await?;
        login_claims_from_response(&response)
    }

    async fn create_reservation(
        &self,
        cred: &PortalCredential,
        payload: &Value,
    ) -> Result<RemoteRecord, SyncError> {
        let response = self
            .request(Method::POST, "reservas", Some(cred), &[], Some(payload))
            .await?;
        Ok(record_from_response(&response))
    }

    async fn create_incident(
        &self,
        cred: &PortalCredential,
        payload: &Value,
    ) -> Result<RemoteRecord, SyncError> {
        let response = self
            .request(Method::POST, "incidencias", Some(cred), &[], Some(payload))
            .await?;
        Ok(record_from_response(&response))
    }

    async fn update_incident(
        &self,
        cred: &PortalCredential,
        portal_id: &str,
        payload: &Value,
    ) -> Result<RemoteRecord, SyncError> {
        let path = format!("incidencias/{portal_id}");
        let response = self
            .request(Method::PUT, &path, Some(cred), &[], Some(payload))
            .await?;
        Ok(record_from_response(&response))
    }

    async fn approve_reservation(
        &self,
        cred: &PortalCredential,
        portal_id: &str,
        payload: &Value,
    ) -> Result<RemoteRecord, SyncError> {
        let path = format!("approvals/reservations/{portal_id}");
        let response = self
            .request(Method::PUT, &path, Some(cred), &[], Some(payload))
            .await?;
        Ok(record_from_response(&response))
    }

    async fn provision_user(
        &self,
        cred: &PortalCredential,
        payload: &Value,
    ) -> Result<RemoteRecord, SyncError> {
        let response = self
            .request(Method::POST, "auth/usuarios", Some(cred), &[], Some(payload))
            .await?;
        Ok(record_from_response(&response))
    }

    async fn list_reservations(
        &self,
        cred: &PortalCredential,
        filters: &[(String, String)],
    ) -> Result<Vec<Value>, SyncError> {
        let response = self
            .request(Method::GET, "reservas", Some(cred), filters, None)
            .await?;
        Ok(rows_from_response(&response))
    }

    async fn list_incidents(
        &self,
        cred: &PortalCredential,
        filters: &[(String, String)],
    ) -> Result<Vec<Value>, SyncError> {
        let response = self
            .request(Method::GET, "incidencias", Some(cred), filters, None)
            .await?;
        Ok(rows_from_response(&response))
    }
}

/// Normalize a failure response into the error taxonomy: a structured
/// `error` object wins, then a bare message, then the 404 special case,
/// then the raw HTTP status.
fn error_from_response(status: StatusCode, body: &Value) -> SyncError {
    if let Some(err) = body.get("error").filter(|e| e.is_object()) {
        let message = err
            .get("message")
            .or_else(|| err.get("mensaje"))
            .and_then(Value::as_str)
            .unwrap_or("portal error")
            .to_string();
        let status_code = err
            .get("statusCode")
            .and_then(Value::as_u64)
            .map(|code| code as u16)
            .or(Some(status.as_u16()));
        let description = err
            .get("description")
            .or_else(|| err.get("descripcion"))
            .and_then(Value::as_str)
            .map(str::to_string);
        return SyncError::Portal {
            message,
            status_code,
            description,
        };
    }
    if let Some(message) = body
        .get("message")
        .or_else(|| body.get("mensaje"))
        .and_then(Value::as_str)
    {
        return SyncError::Portal {
            message: message.to_string(),
            status_code: Some(status.as_u16()),
            description: None,
        };
    }
    if status == StatusCode::NOT_FOUND {
        return SyncError::NotFound;
    }
    SyncError::Unexpected(status.as_u16())
}

/// The portal is inconsistent about list envelopes: some endpoints return a
/// bare array, others wrap it as `data`, `items` or `result`.
pub fn rows_from_response(value: &Value) -> Vec<Value> {
    if let Some(rows) = value.as_array() {
        return rows.clone();
    }
    for key in ["data", "items", "result"] {
        if let Some(rows) = value.get(key).and_then(Value::as_array) {
            return rows.clone();
        }
    }
    Vec::new()
}

/// Detail envelopes vary the same way: `{data:{…}}` or a bare object, ids
/// sometimes numeric, status under `estado` or `status`.
pub fn record_from_response(value: &Value) -> RemoteRecord {
    let body = value.get("data").filter(|d| d.is_object()).unwrap_or(value);
    let id = body
        .get("id")
        .or_else(|| body.get("_id"))
        .or_else(|| body.get("folio"))
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
    let status = body
        .get("estado")
        .or_else(|| body.get("status"))
        .and_then(Value::as_str)
        .map(str::to_string);
    RemoteRecord { id, status }
}

pub fn login_claims_from_response(value: &Value) -> Result<LoginClaims, SyncError> {
    let body = value.get("data").filter(|d| d.is_object()).unwrap_or(value);
    let token = body
        .get("token")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Auth("login response carried no token".into()))?;
    let token_type = body
        .get("tokenType")
        .and_then(Value::as_str)
        .unwrap_or("Bearer");
    let role = body
        .get("rol")
        .or_else(|| body.get("role"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(LoginClaims {
        token: token.to_string(),
        token_type: token_type.to_string(),
        role,
    })
}

pub fn build_login_request(email: &str) -> Value {
    json!({ "correo": email })
}

pub fn build_reservation_request(
    unit_portal_id: &str,
    amenity_portal_id: &str,
    input: &NewReservation,
) -> Value {
    let mut fields = Map::new();
    fields.insert("unidad".into(), json!(unit_portal_id));
    fields.insert("amenidad".into(), json!(amenity_portal_id));
    fields.insert("fecha".into(), json!(input.date));
    fields.insert("horaInicio".into(), json!(input.start));
    fields.insert("horaFin".into(), json!(input.end));
    if let Some(notes) = input.notes.as_deref().filter(|n| !n.is_empty()) {
        fields.insert("notas".into(), json!(notes));
    }
    Value::Object(fields)
}

pub fn build_incident_request(building_portal_id: &str, input: &NewIncident) -> Value {
    let mut fields = Map::new();
    fields.insert("edificio".into(), json!(building_portal_id));
    fields.insert("tipo".into(), json!(input.kind));
    fields.insert("titulo".into(), json!(input.title));
    fields.insert("descripcion".into(), json!(input.description));
    if let Some(location) = input.location.as_deref().filter(|l| !l.is_empty()) {
        fields.insert("ubicacion".into(), json!(location));
    }
    if let Some(priority) = input.priority.as_deref().filter(|p| !p.is_empty()) {
        fields.insert("prioridad".into(), json!(priority));
    }
    Value::Object(fields)
}

pub fn build_incident_update_request(update: &IncidentUpdate) -> Value {
    let mut fields = Map::new();
    if let Some(status) = update.status {
        fields.insert("estado".into(), json!(status.portal_literal()));
    }
    if let Some(description) = update.description.as_deref().filter(|d| !d.is_empty()) {
        fields.insert("descripcion".into(), json!(description));
    }
    if let Some(priority) = update.priority.as_deref().filter(|p| !p.is_empty()) {
        fields.insert("prioridad".into(), json!(priority));
    }
    Value::Object(fields)
}

pub fn build_approval_request(approve: bool) -> Value {
    json!({ "estado": if approve { "APROBADA" } else { "RECHAZADA" } })
}

pub fn build_user_request(input: &NewPortalUser) -> Value {
    let mut fields = Map::new();
    fields.insert("correo".into(), json!(input.email));
    fields.insert("nombre".into(), json!(input.full_name));
    fields.insert("rol".into(), json!(input.role));
    if let Some(unit) = input.unit_label.as_deref().filter(|u| !u.is_empty()) {
        fields.insert("unidad".into(), json!(unit));
    }
    Value::Object(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::IncidentStatus;

    fn client() -> PortalClient {
        PortalClient::new(
            Url::parse("https://portal.example.com/api/v1/").unwrap(),
            Duration::from_secs(5),
        )
    }

    fn cred() -> PortalCredential {
        PortalCredential {
            token: "tok".into(),
            token_type: "Bearer".into(),
        }
    }

    #[test]
    fn build_request_sets_headers() {
        let client = client();
        let body = json!({ "sample": true });
        let request = client
            .build_request(Method::POST, "reservas", Some(&cred()), &[], Some(&body))
            .unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url().path(), "/api/v1/reservas");
        let headers = request.headers();
        assert_eq!(
            headers.get("Authorization").and_then(|h| h.to_str().ok()),
            Some("Bearer tok")
        );
        assert_eq!(
            headers.get("Accept").and_then(|h| h.to_str().ok()),
            Some("application/json")
        );
        assert_eq!(
            headers.get("Content-Type").and_then(|h| h.to_str().ok()),
            Some("application/json")
        );
    }

    #[test]
    fn build_request_without_body_or_credential() {
        let client = client();
        let request = client
            .build_request(Method::GET, "reservas", None, &[], None)
            .unwrap();
        assert!(request.headers().get("Authorization").is_none());
        assert!(request.headers().get("Content-Type").is_none());
        assert_eq!(
            request.headers().get("Accept").and_then(|h| h.to_str().ok()),
            Some("application/json")
        );
    }

    #[test]
    fn build_request_skips_empty_query_values() {
        let client = client();
        let params = vec![
            ("estado".to_string(), "PENDIENTE".to_string()),
            ("edificio".to_string(), String::new()),
        ];
        let request = client
            .build_request(Method::GET, "reservas", Some(&cred()), &params, None)
            .unwrap();
        assert_eq!(request.url().query(), Some("estado=PENDIENTE"));

        let empty = vec![("estado".to_string(), String::new())];
        let request = client
            .build_request(Method::GET, "reservas", Some(&cred()), &empty, None)
            .unwrap();
        assert_eq!(request.url().query(), None);
    }

    #[test]
    fn reservation_request_includes_resolved_ids() {
        let input = NewReservation {
            user_id: 1,
            unit_id: 2,
            amenity_id: 3,
            date: "2026-08-10".into(),
            start: "10:00".into(),
            end: "11:00".into(),
            notes: Some("birthday".into()),
        };
        let body = build_reservation_request("u-9", "am-4", &input);
        assert_eq!(body["unidad"], "u-9");
        assert_eq!(body["amenidad"], "am-4");
        assert_eq!(body["fecha"], "2026-08-10");
        assert_eq!(body["horaInicio"], "10:00");
        assert_eq!(body["horaFin"], "11:00");
        assert_eq!(body["notas"], "birthday");
    }

    #[test]
    fn reservation_request_omits_empty_notes() {
        let input = NewReservation {
            user_id: 1,
            unit_id: 2,
            amenity_id: 3,
            date: "2026-08-10".into(),
            start: "10:00".into(),
            end: "11:00".into(),
            notes: Some(String::new()),
        };
        let body = build_reservation_request("u-9", "am-4", &input);
        assert!(body.get("notas").is_none());
    }

    #[test]
    fn incident_update_request_uses_portal_literals() {
        let body = build_incident_update_request(&IncidentUpdate {
            status: Some(IncidentStatus::InProgress),
            description: Some("tech dispatched".into()),
            priority: None,
        });
        assert_eq!(body["estado"], "EN_PROCESO");
        assert_eq!(body["descripcion"], "tech dispatched");
        assert!(body.get("prioridad").is_none());
    }

    #[test]
    fn approval_request_literals() {
        assert_eq!(build_approval_request(true)["estado"], "APROBADA");
        assert_eq!(build_approval_request(false)["estado"], "RECHAZADA");
    }

    #[test]
    fn rows_from_any_envelope() {
        let bare = json!([{ "id": 1 }, { "id": 2 }]);
        assert_eq!(rows_from_response(&bare).len(), 2);
        for key in ["data", "items", "result"] {
            let wrapped = json!({ key: [{ "id": 1 }] });
            assert_eq!(rows_from_response(&wrapped).len(), 1, "envelope {key}");
        }
        assert!(rows_from_response(&json!({ "data": { "id": 1 } })).is_empty());
    }

    #[test]
    fn record_from_nested_and_bare_envelopes() {
        let nested = json!({ "data": { "id": 42, "estado": "ABIERTA" } });
        let record = record_from_response(&nested);
        assert_eq!(record.id.as_deref(), Some("42"));
        assert_eq!(record.status.as_deref(), Some("ABIERTA"));

        let bare = json!({ "folio": "INC-7", "status": "EN_PROCESO" });
        let record = record_from_response(&bare);
        assert_eq!(record.id.as_deref(), Some("INC-7"));
        assert_eq!(record.status.as_deref(), Some("EN_PROCESO"));

        assert_eq!(record_from_response(&json!({})), RemoteRecord::default());
    }

    #[test]
    fn login_claims_from_nested_envelope() {
        let value = json!({ "data": { "rol": "RESIDENTE", "token": "t1", "tokenType": "Bearer" } });
        let claims = login_claims_from_response(&value).unwrap();
        assert_eq!(claims.token, "t1");
        assert_eq!(claims.token_type, "Bearer");
        assert_eq!(claims.role.as_deref(), Some("RESIDENTE"));
    }

    #[test]
    fn login_claims_default_token_type_and_missing_token() {
        let value = json!({ "token": "t2" });
        let claims = login_claims_from_response(&value).unwrap();
        assert_eq!(claims.token_type, "Bearer");
        assert!(claims.role.is_none());

        let err = login_claims_from_response(&json!({ "data": {} })).unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
    }

    #[test]
    fn error_normalization_prefers_structured_error() {
        let body = json!({
            "status": "error",
            "error": { "message": "unidad ocupada", "statusCode": 422, "descripcion": "overlap" }
        });
        match error_from_response(StatusCode::OK, &body) {
            SyncError::Portal {
                message,
                status_code,
                description,
            } => {
                assert_eq!(message, "unidad ocupada");
                assert_eq!(status_code, Some(422));
                assert_eq!(description.as_deref(), Some("overlap"));
            }
            other => panic!("wrong error: {other:?}"),
        }
    }

    #[test]
    fn error_normalization_fallbacks() {
        let message_only = json!({ "mensaje": "sin permiso" });
        assert!(matches!(
            error_from_response(StatusCode::FORBIDDEN, &message_only),
            SyncError::Portal { message, .. } if message == "sin permiso"
        ));

        assert!(matches!(
            error_from_response(StatusCode::NOT_FOUND, &json!({})),
            SyncError::NotFound
        ));

        assert!(matches!(
            error_from_response(StatusCode::BAD_GATEWAY, &json!({})),
            SyncError::Unexpected(502)
        ));
    }
}
