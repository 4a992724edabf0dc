//! REST provider adapter.
//!
//! Speaks a minimal resource API:
//! - `PUT {endpoint}/resources/{type}/{name}` with the desired attributes,
//!   answered by `{"id": ..., "outputs": {...}}`
//! - `DELETE {endpoint}/resources/{type}/{external_id}`

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{CairnError, ConfigError, ProviderError, Result};
use crate::graph::ResourceId;

use super::{Provider, ProviderOutput, ProvisionRequest};

/// HTTP client for a REST provisioning endpoint.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL.
    endpoint: Url,
    /// Bearer token.
    token: Option<String>,
}

/// Body of a create-or-update request.
#[derive(Debug, Serialize)]
struct ProvisionBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    external_id: Option<&'a str>,
    attributes: &'a BTreeMap<String, Value>,
}

/// Body of a successful create-or-update response.
#[derive(Debug, Deserialize)]
struct ProvisionResponse {
    id: String,
    #[serde(default)]
    outputs: BTreeMap<String, Value>,
}

impl HttpProvider {
    /// Creates a provider for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a base URL or the HTTP client
    /// cannot be created.
    pub fn new(endpoint: &str, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| {
                CairnError::Config(ConfigError::validation(
                    format!("Invalid provider endpoint: {endpoint}"),
                    "provider.endpoint",
                ))
            })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| CairnError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            token,
        })
    }

    /// Builds `{endpoint}/resources/{type}/{segment}` with proper escaping.
    fn resource_url(&self, resource_type: &str, segment: &str) -> std::result::Result<Url, ProviderError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| ProviderError::permanent("Provider endpoint cannot be a base URL"))?
            .pop_if_empty()
            .extend(["resources", resource_type, segment]);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    /// Maps a transport failure to a provider error.
    fn transport_error(e: &reqwest::Error) -> ProviderError {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            ProviderError::transient(format!("Request failed: {e}"))
        } else {
            ProviderError::permanent(format!("Request failed: {e}"))
        }
    }

    /// Maps an unsuccessful response to a provider error.
    async fn status_error(response: Response) -> ProviderError {
        let status = response.status();
        let retry_after_secs = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok());
        let body = response.text().await.unwrap_or_default();
        let message = format!("Provider returned {status}: {body}");

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            ProviderError::Transient {
                message,
                retry_after_secs,
            }
        } else {
            ProviderError::permanent(message)
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create_or_update(
        &self,
        request: &ProvisionRequest,
    ) -> std::result::Result<ProviderOutput, ProviderError> {
        let url = self.resource_url(&request.id.resource_type, &request.id.name)?;
        trace!(url = %url, "PUT resource");

        let body = ProvisionBody {
            external_id: request.external_id.as_deref(),
            attributes: &request.attributes,
        };

        let response = self
            .authorize(self.client.put(url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::transport_error(&e))?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let parsed: ProvisionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::permanent(format!("Failed to parse response: {e}")))?;

        debug!(resource = %request.id, external_id = %parsed.id, "Provider applied resource");
        Ok(ProviderOutput {
            external_id: parsed.id,
            attributes: parsed.outputs,
        })
    }

    async fn delete(
        &self,
        id: &ResourceId,
        external_id: &str,
    ) -> std::result::Result<(), ProviderError> {
        let url = self.resource_url(&id.resource_type, external_id)?;
        trace!(url = %url, "DELETE resource");

        let response = self
            .authorize(self.client.delete(url))
            .send()
            .await
            .map_err(|e| Self::transport_error(&e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(resource = %id, "Resource already gone");
            return Ok(());
        }
        if !status.is_success() {
            return Err(Self::status_error(response).await);
        }

        debug!(resource = %id, "Provider deleted resource");
        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_url_escapes_segments() {
        let provider = HttpProvider::new("http://localhost:8080/api/", None, 5).unwrap();
        let url = provider
            .resource_url("sql-server", "/subscriptions/0/servers/main")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/api/resources/sql-server/%2Fsubscriptions%2F0%2Fservers%2Fmain"
        );
    }

    #[test]
    fn test_rejects_non_base_endpoint() {
        assert!(HttpProvider::new("mailto:ops@example.net", None, 5).is_err());
        assert!(HttpProvider::new("not a url", None, 5).is_err());
    }
}
