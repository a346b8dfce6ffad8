//! Admission Gate: decides who may enter a room.
//!
//! The gate delegates the actual decision to the consultation directory,
//! the external collaborator that knows which two identities are bound
//! to a consultation. That hand-off is the only out-of-process call in
//! the core, so it is bounded by a timeout: an unanswered check is a
//! denial (`authorization-timeout`), never a hang.
//!
//! [`DirectoryAuthorizer`] is the production implementation (HTTP);
//! [`StaticAuthorizer`] serves tests and local development.

use crate::errors::CoreError;

use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use common::types::{ConsultationId, UserId};
use serde::Deserialize;
use signal_protocol::{IceServer, Role, SessionConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a successful authorization check.
#[derive(Debug, Clone)]
pub struct AdmissionGrant {
    /// The role the directory binds this identity to.
    pub role: Role,
    /// Negotiation-assistance configuration to hand to the client.
    pub config: SessionConfig,
}

/// The external authorization contract.
///
/// Given a consultation and an identity, answer whether the identity is
/// one of the two bound parties, and if so with which role and
/// negotiation configuration.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        consultation_id: &ConsultationId,
        user_id: &UserId,
    ) -> Result<AdmissionGrant, CoreError>;
}

/// The Admission Gate: bounded-timeout wrapper around an [`Authorizer`],
/// plus the fallback connection-assistance list.
pub struct AdmissionGate {
    authorizer: Arc<dyn Authorizer>,
    timeout: Duration,
    fallback_ice_servers: Vec<IceServer>,
}

impl AdmissionGate {
    /// Create a gate around an authorizer.
    ///
    /// `fallback_stun_urls` fills the grant's server list when the
    /// directory supplies none.
    #[must_use]
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        timeout: Duration,
        fallback_stun_urls: &[String],
    ) -> Self {
        let fallback_ice_servers = if fallback_stun_urls.is_empty() {
            Vec::new()
        } else {
            vec![IceServer::new(fallback_stun_urls.to_vec())]
        };

        Self {
            authorizer,
            timeout,
            fallback_ice_servers,
        }
    }

    /// Run the authorization check with the bounded timeout.
    pub async fn authorize(
        &self,
        consultation_id: &ConsultationId,
        user_id: &UserId,
    ) -> Result<AdmissionGrant, CoreError> {
        let result = tokio::time::timeout(
            self.timeout,
            self.authorizer.authorize(consultation_id, user_id),
        )
        .await;

        match result {
            Ok(Ok(mut grant)) => {
                if grant.config.ice_servers.is_empty() {
                    grant.config.ice_servers = self.fallback_ice_servers.clone();
                }
                debug!(
                    target: "cc.admission",
                    consultation_id = %consultation_id,
                    role = grant.role.as_str(),
                    "Admission granted"
                );
                Ok(grant)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                warn!(
                    target: "cc.admission",
                    consultation_id = %consultation_id,
                    timeout = ?self.timeout,
                    "Authorization check timed out"
                );
                Err(CoreError::AuthorizationTimeout)
            }
        }
    }
}

/// Wire shape of the directory's authorization reply.
#[derive(Debug, Deserialize)]
struct AuthorizeResponse {
    role: Role,
    #[serde(default)]
    ice_servers: Vec<IceServer>,
}

/// HTTP client for the consultation directory.
pub struct DirectoryAuthorizer {
    client: reqwest::Client,
    base_url: String,
    token: SecretString,
}

impl DirectoryAuthorizer {
    /// Create a directory client.
    ///
    /// `request_timeout` caps the HTTP round trip independently of the
    /// gate's overall timeout.
    pub fn new(
        base_url: String,
        token: SecretString,
        request_timeout: Duration,
    ) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CoreError::Config(format!("HTTP client build failed: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl Authorizer for DirectoryAuthorizer {
    async fn authorize(
        &self,
        consultation_id: &ConsultationId,
        user_id: &UserId,
    ) -> Result<AdmissionGrant, CoreError> {
        let url = format!(
            "{}/internal/consultations/{}/authorize",
            self.base_url, consultation_id
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.token.expose_secret())
            .json(&HashMap::from([("user_id", user_id.as_str())]))
            .send()
            .await
            .map_err(|e| CoreError::Directory(format!("request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
            || status == reqwest::StatusCode::NOT_FOUND
        {
            return Err(CoreError::NotAuthorized);
        }
        if !status.is_success() {
            return Err(CoreError::Directory(format!(
                "unexpected status: {status}"
            )));
        }

        let body: AuthorizeResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Directory(format!("malformed response: {e}")))?;

        Ok(AdmissionGrant {
            role: body.role,
            config: SessionConfig {
                ice_servers: body.ice_servers,
            },
        })
    }
}

/// Fixture authorizer backed by an in-memory assignment table.
///
/// Used by tests and local development runs without a directory service.
#[derive(Debug, Default)]
pub struct StaticAuthorizer {
    assignments: HashMap<ConsultationId, HashMap<UserId, Role>>,
    config: SessionConfig,
}

impl StaticAuthorizer {
    /// Create an empty fixture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the negotiation configuration handed out with every grant.
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind an identity to a consultation with the given role.
    #[must_use]
    pub fn allow(
        mut self,
        consultation_id: impl Into<ConsultationId>,
        user_id: impl Into<UserId>,
        role: Role,
    ) -> Self {
        self.assignments
            .entry(consultation_id.into())
            .or_default()
            .insert(user_id.into(), role);
        self
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authorize(
        &self,
        consultation_id: &ConsultationId,
        user_id: &UserId,
    ) -> Result<AdmissionGrant, CoreError> {
        self.assignments
            .get(consultation_id)
            .and_then(|parties| parties.get(user_id))
            .map(|role| AdmissionGrant {
                role: *role,
                config: self.config.clone(),
            })
            .ok_or(CoreError::NotAuthorized)
    }
}
