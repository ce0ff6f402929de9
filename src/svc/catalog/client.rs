//! # Client module
//!
//! This module provides the reqwest implementation of the catalog surface,
//! with bearer-token authentication, a shared outstanding-request budget and
//! retry with backoff on transient failures.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info};

use crate::svc::{
    catalog::{
        entity::{Entity, EntityRef},
        retry::{self, Backoff, Classify, ErrorClass},
        Blueprint, BulkUpsert, CatalogClient, DeleteOpts, DeleteOutcome, FailedUpsert,
        IntegrationSpec, StatusPatch, UpsertOpts,
    },
    cfg::Configuration,
    mapping::PortAppConfig,
};

// -----------------------------------------------------------------------------
// Constants

/// seconds of validity left under which the cached token is renewed
pub const TOKEN_RENEWAL_MARGIN: i64 = 60;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to build catalog http client, {0}")]
    Build(reqwest::Error),
    #[error("failed to execute request on catalog api, {0}")]
    Request(reqwest::Error),
    #[error("failed to deserialize catalog response, {0}")]
    Deserialize(reqwest::Error),
    #[error("catalog api answered with status {status}, {body}")]
    Status { status: u16, body: String },
    #[error("catalog api rate limited the request")]
    RateLimited { retry_after: Option<Duration> },
    #[error("failed to authenticate against catalog api, {0}")]
    Authenticate(String),
    #[error("failed to acquire a request budget permit, {0}")]
    Budget(tokio::sync::AcquireError),
    #[error("failed to serialize request payload, {0}")]
    Serialize(serde_json::Error),
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            // timeouts and transport failures, worth another attempt
            Self::Request(_) => ErrorClass::Transient,
            Self::Status { status, .. } if *status >= 500 => ErrorClass::Transient,
            Self::RateLimited { retry_after } => ErrorClass::RateLimited(*retry_after),
            // the cached token was invalidated, retrying re-authenticates
            Self::Authenticate(_) => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

// -----------------------------------------------------------------------------
// Token structure

#[derive(Clone, Debug)]
struct Token {
    value: String,
    expires_at: DateTime<Utc>,
}

impl Token {
    fn is_valid(&self) -> bool {
        (self.expires_at - Utc::now()).num_seconds() > TOKEN_RENEWAL_MARGIN
    }
}

#[derive(Deserialize)]
struct AccessToken {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "expiresIn")]
    expires_in: i64,
}

// -----------------------------------------------------------------------------
// Response structures

#[derive(Deserialize)]
struct IntegrationEnvelope {
    #[serde(rename = "integration")]
    integration: IntegrationBody,
}

#[derive(Deserialize)]
struct IntegrationBody {
    #[serde(rename = "config", default)]
    config: Option<PortAppConfig>,
}

#[derive(Deserialize)]
struct BlueprintEnvelope {
    #[serde(rename = "blueprint")]
    blueprint: Blueprint,
}

#[derive(Deserialize)]
struct BulkEnvelope {
    #[serde(rename = "entities", default)]
    entities: Vec<EntityRef>,
    #[serde(rename = "errors", default)]
    errors: Vec<BulkError>,
}

#[derive(Deserialize)]
struct BulkError {
    #[serde(rename = "identifier")]
    identifier: String,
    #[serde(rename = "blueprint")]
    blueprint: String,
    #[serde(rename = "message", default)]
    message: String,
}

#[derive(Deserialize)]
struct SearchEnvelope {
    #[serde(rename = "entities", default)]
    entities: Vec<EntityRef>,
    #[serde(rename = "next", default)]
    next: Option<String>,
}

// -----------------------------------------------------------------------------
// PortClient structure

/// the production catalog client. All operations share one outstanding
/// request budget and retry transient failures with backoff
pub struct PortClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    backoff: Backoff,
    budget: Arc<Semaphore>,
    token: RwLock<Option<Token>>,
}

impl PortClient {
    pub fn try_from(config: &Configuration) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .user_agent(format!(
                "{}/{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ));

        if !config.verify_ssl {
            builder = builder.danger_accept_invalid_certs(true);
        }

        if let Some(proxy) = &config.proxy {
            let no_proxy = reqwest::NoProxy::from_string(&proxy.no.join(","));

            if let Some(url) = &proxy.http {
                let proxy = reqwest::Proxy::http(url)
                    .map_err(Error::Build)?
                    .no_proxy(no_proxy.to_owned());

                builder = builder.proxy(proxy);
            }

            if let Some(url) = &proxy.https {
                let proxy = reqwest::Proxy::https(url)
                    .map_err(Error::Build)?
                    .no_proxy(no_proxy);

                builder = builder.proxy(proxy);
            }
        }

        Ok(Self {
            http: builder.build().map_err(Error::Build)?,
            base_url: config.port.base_url.trim_end_matches('/').to_string(),
            client_id: config.port.client_id.to_owned(),
            client_secret: config.port.client_secret.to_owned(),
            backoff: Backoff::with_attempts(config.max_retries),
            budget: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            token: RwLock::new(None),
        })
    }

    // -------------------------------------------------------------------------
    // Authentication

    async fn token(&self) -> Result<String, Error> {
        if let Some(token) = self.token.read().await.as_ref() {
            if token.is_valid() {
                return Ok(token.value.to_owned());
            }
        }

        let mut guard = self.token.write().await;
        if let Some(token) = guard.as_ref() {
            if token.is_valid() {
                return Ok(token.value.to_owned());
            }
        }

        debug!("Fetch a new access token from the catalog api");
        let response = self
            .http
            .post(format!("{}/v1/auth/access_token", self.base_url))
            .json(&json!({
                "clientId": self.client_id,
                "clientSecret": self.client_secret,
            }))
            .send()
            .await
            .map_err(Error::Request)?;

        if !response.status().is_success() {
            return Err(Error::Authenticate(format!(
                "catalog api answered with status {}",
                response.status().as_u16()
            )));
        }

        let access: AccessToken = response.json().await.map_err(Error::Deserialize)?;
        let token = Token {
            value: access.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(access.expires_in),
        };

        *guard = Some(token.to_owned());
        Ok(token.value)
    }

    // -------------------------------------------------------------------------
    // Request helpers

    async fn send(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, Error> {
        let _permit = self.budget.acquire().await.map_err(Error::Budget)?;
        let token = self.token().await?;

        let mut request = self
            .http
            .request(method.to_owned(), format!("{}{}", self.base_url, path))
            .bearer_auth(token);

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(Error::Request)?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED => {
                self.token.write().await.take();
                Err(Error::Authenticate(
                    "access token was rejected by the catalog api".to_string(),
                ))
            }
            StatusCode::TOO_MANY_REQUESTS => Err(Error::RateLimited {
                retry_after: retry_after(response.headers()),
            }),
            status => Err(Error::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn call<U>(&self, method: Method, path: String, body: Option<Value>) -> Result<U, Error>
    where
        U: DeserializeOwned,
    {
        retry::with_backoff(&self.backoff, || {
            let method = method.to_owned();
            let path = path.to_owned();
            let body = body.to_owned();

            async move {
                self.send(&method, &path, body.as_ref())
                    .await?
                    .json::<U>()
                    .await
                    .map_err(Error::Deserialize)
            }
        })
        .await
    }
}

// -----------------------------------------------------------------------------
// CatalogClient implementation

#[async_trait]
impl CatalogClient for PortClient {
    async fn get_app_config(&self, integration: &str) -> Result<Option<PortAppConfig>, Error> {
        let envelope: IntegrationEnvelope = self
            .call(
                Method::GET,
                format!("/v1/integration/{integration}"),
                None,
            )
            .await?;

        Ok(envelope.integration.config)
    }

    async fn get_blueprint(&self, identifier: &str) -> Result<Option<Blueprint>, Error> {
        let result: Result<BlueprintEnvelope, Error> = self
            .call(Method::GET, format!("/v1/blueprints/{identifier}"), None)
            .await;

        match result {
            Ok(envelope) => Ok(Some(envelope.blueprint)),
            Err(Error::Status { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn upsert_entities(
        &self,
        blueprint: &str,
        entities: &[Entity],
        opts: &UpsertOpts,
    ) -> Result<BulkUpsert, Error> {
        let path = format!(
            "/v1/blueprints/{blueprint}/entities/bulk?upsert=true&merge={}&create_missing_related_entities={}",
            opts.merge, opts.create_missing_related_entities,
        );

        let envelope: BulkEnvelope = self
            .call(Method::POST, path, Some(json!({ "entities": entities })))
            .await?;

        Ok(BulkUpsert {
            upserted: envelope.entities,
            failed: envelope
                .errors
                .into_iter()
                .map(|err| FailedUpsert {
                    reference: EntityRef::new(err.blueprint, err.identifier),
                    message: err.message,
                })
                .collect(),
        })
    }

    async fn search_entities(
        &self,
        integration: &str,
        blueprint: &str,
    ) -> Result<Vec<EntityRef>, Error> {
        let body = json!({
            "combinator": "and",
            "rules": [{
                "property": "$integration",
                "operator": "=",
                "value": integration,
            }],
        });

        let mut references = vec![];
        let mut cursor: Option<String> = None;

        loop {
            let path = match &cursor {
                Some(from) => format!("/v1/blueprints/{blueprint}/entities/search?from={from}"),
                None => format!("/v1/blueprints/{blueprint}/entities/search"),
            };

            let envelope: SearchEnvelope = self
                .call(Method::POST, path, Some(body.to_owned()))
                .await?;

            references.extend(envelope.entities);
            match envelope.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(
            blueprint = blueprint,
            count = references.len(),
            "Enumerated attributed catalog entities"
        );

        Ok(references)
    }

    async fn delete_entity(
        &self,
        reference: &EntityRef,
        opts: &DeleteOpts,
    ) -> Result<DeleteOutcome, Error> {
        let path = format!(
            "/v1/blueprints/{}/entities/{}?delete_dependents={}",
            reference.blueprint, reference.identifier, opts.delete_dependents,
        );

        let result: Result<Value, Error> = self.call(Method::DELETE, path, None).await;
        match result {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(Error::Status { status: 404, .. }) => Ok(DeleteOutcome::NotFound),
            Err(err) => Err(err),
        }
    }

    async fn register_integration(&self, spec: &IntegrationSpec) -> Result<(), Error> {
        let body = serde_json::to_value(spec).map_err(Error::Serialize)?;

        let result: Result<Value, Error> = self
            .call(Method::POST, "/v1/integration".to_string(), Some(body))
            .await;

        match result {
            Ok(_) => {
                info!(
                    integration = spec.identifier,
                    "Registered integration with the catalog"
                );
                Ok(())
            }
            // the integration already exists, registration is idempotent
            Err(Error::Status { status: 409, .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn patch_integration(&self, integration: &str, patch: &StatusPatch) -> Result<(), Error> {
        let body = json!({ "resyncState": patch });

        let _: Value = self
            .call(
                Method::PATCH,
                format!("/v1/integration/{integration}"),
                Some(body),
            )
            .await?;

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// helpers

fn retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

    use super::{retry_after, Error, PortClient};
    use crate::svc::{
        catalog::retry::{Classify, ErrorClass},
        cfg::tests_support::configuration,
    };

    #[test]
    fn client_should_build_from_configuration() {
        assert!(PortClient::try_from(&configuration()).is_ok());
    }

    #[test]
    fn server_errors_should_be_transient() {
        let err = Error::Status {
            status: 503,
            body: "unavailable".to_string(),
        };

        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn client_errors_should_be_permanent() {
        let err = Error::Status {
            status: 422,
            body: "validation failed".to_string(),
        };

        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[test]
    fn rate_limits_should_carry_the_server_delay() {
        let err = Error::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };

        assert_eq!(
            err.class(),
            ErrorClass::RateLimited(Some(Duration::from_secs(7)))
        );
    }

    #[test]
    fn retry_after_should_parse_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));

        assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));
    }

    #[test]
    fn retry_after_should_ignore_dates() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );

        assert_eq!(retry_after(&headers), None);
    }
}
