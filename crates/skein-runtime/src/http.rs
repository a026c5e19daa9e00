//! HTTP call collaborator
//!
//! Serves `call: http` tasks. Arguments come pre-evaluated from the
//! kernel: `method`, `endpoint`, optional `headers`, `query`, `body`,
//! and an `authentication` policy (basic, bearer, or oauth2
//! client-credentials). Failures surface as `communication` errors, with
//! 401/403 mapped to `authentication`/`authorization`.

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::Value;
use tracing::{debug, instrument};

use skein_core::services::Caller;
use skein_core::{ErrorKind, Position, WorkflowError};

/// Caller for `http` call tasks over a shared reqwest client
pub struct HttpCaller {
    client: reqwest::Client,
}

impl HttpCaller {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn authorization_header(
        &self,
        auth: &Value,
        at: &Position,
    ) -> Result<Option<String>, WorkflowError> {
        if auth.is_null() {
            return Ok(None);
        }
        if let Some(basic) = auth.get("basic") {
            let username = required_str(basic, "username", at)?;
            let password = required_str(basic, "password", at)?;
            let token = base64::engine::general_purpose::STANDARD
                .encode(format!("{username}:{password}"));
            return Ok(Some(format!("Basic {token}")));
        }
        if let Some(bearer) = auth.get("bearer") {
            let token = required_str(bearer, "token", at)?;
            return Ok(Some(format!("Bearer {token}")));
        }
        if let Some(oauth2) = auth.get("oauth2") {
            let token = self.client_credentials_token(oauth2, at).await?;
            return Ok(Some(format!("Bearer {token}")));
        }
        Err(WorkflowError::configuration(
            at,
            "authentication policy must define basic, bearer, or oauth2",
        ))
    }

    /// Client-credentials grant against the policy's authority, which is
    /// taken to be the token endpoint
    async fn client_credentials_token(
        &self,
        oauth2: &Value,
        at: &Position,
    ) -> Result<String, WorkflowError> {
        let authority = required_str(oauth2, "authority", at)?;
        let client = oauth2.get("client").cloned().unwrap_or(Value::Null);
        let id = required_str(&client, "id", at)?;
        let secret = required_str(&client, "secret", at)?;
        let scopes = oauth2
            .get("scopes")
            .and_then(Value::as_array)
            .map(|s| {
                s.iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();

        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", id),
            ("client_secret", secret),
        ];
        if !scopes.is_empty() {
            form.push(("scope", scopes));
        }

        let response = self
            .client
            .post(&authority)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                WorkflowError::new(ErrorKind::Authentication, at, format!("token request failed: {e}"))
            })?;
        if !response.status().is_success() {
            return Err(WorkflowError::new(
                ErrorKind::Authentication,
                at,
                format!("token endpoint returned {}", response.status()),
            ));
        }
        let body: Value = response.json().await.map_err(|e| {
            WorkflowError::new(ErrorKind::Authentication, at, format!("malformed token response: {e}"))
        })?;
        body.get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                WorkflowError::new(ErrorKind::Authentication, at, "token response lacks access_token")
            })
    }
}

impl Default for HttpCaller {
    fn default() -> Self {
        Self::new()
    }
}

fn required_str(value: &Value, key: &str, at: &Position) -> Result<String, WorkflowError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            WorkflowError::configuration(at, format!("call argument requires a string {key:?}"))
        })
}

#[async_trait]
impl Caller for HttpCaller {
    #[instrument(skip(self, with, _input), fields(position = %at))]
    async fn invoke(
        &self,
        kind: &str,
        with: &Value,
        _input: &Value,
        at: &Position,
    ) -> Result<Value, WorkflowError> {
        if kind != "http" {
            return Err(WorkflowError::configuration(
                at,
                format!("unsupported call kind {kind:?}"),
            ));
        }

        let method = with
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("get")
            .to_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| WorkflowError::configuration(at, format!("invalid method {method:?}")))?;
        let endpoint = required_str(with, "endpoint", at)?;

        let mut request = self.client.request(method, &endpoint);

        if let Some(headers) = with.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }
        if let Some(query) = with.get("query").and_then(Value::as_object) {
            let pairs: Vec<(&String, String)> = query
                .iter()
                .map(|(k, v)| {
                    let rendered = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k, rendered)
                })
                .collect();
            request = request.query(&pairs);
        }
        if let Some(auth) = with.get("authentication") {
            if let Some(header) = self.authorization_header(auth, at).await? {
                request = request.header(reqwest::header::AUTHORIZATION, header);
            }
        }
        if let Some(body) = with.get("body") {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            WorkflowError::communication(at, 503, format!("request to {endpoint} failed: {e}"))
        })?;
        let status = response.status();
        debug!(status = status.as_u16(), endpoint = %endpoint, "http call returned");

        if status.as_u16() == 401 {
            return Err(WorkflowError::new(
                ErrorKind::Authentication,
                at,
                format!("{endpoint} returned 401"),
            ));
        }
        if status.as_u16() == 403 {
            return Err(WorkflowError::new(
                ErrorKind::Authorization,
                at,
                format!("{endpoint} returned 403"),
            ));
        }
        if !status.is_success() {
            return Err(WorkflowError::communication(
                at,
                status.as_u16(),
                format!("{endpoint} returned {status}"),
            ));
        }

        let text = response.text().await.map_err(|e| {
            WorkflowError::communication(at, 502, format!("reading response body failed: {e}"))
        })?;
        if text.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unsupported_kind() {
        let caller = HttpCaller::new();
        let err = caller
            .invoke("grpc", &Value::Null, &Value::Null, &Position::root())
            .await
            .unwrap_err();
        assert!(err.error_type.ends_with("/configuration"));
    }

    #[tokio::test]
    async fn test_missing_endpoint() {
        let caller = HttpCaller::new();
        let err = caller
            .invoke(
                "http",
                &serde_json::json!({"method": "get"}),
                &Value::Null,
                &Position::root(),
            )
            .await
            .unwrap_err();
        assert!(err.detail.unwrap().contains("endpoint"));
    }
}
