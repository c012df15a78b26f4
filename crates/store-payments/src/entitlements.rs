//! Entitlements Client
//!
//! Grants and revokes named capabilities for an email on the internal auth
//! service. Grants retry transient failures a bounded number of times;
//! revocations are single best-effort attempts. None of these calls fail
//! webhook processing: outcomes are typed and logged.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::env;
use crate::error::clip;
use crate::metadata::MetadataBag;

const DEFAULT_BASE_URL: &str = "https://auth.serp.co";
const SECRET_HEADER: &str = "x-serp-internal-secret";
const BODY_LOG_LIMIT: usize = 1_000;

/// Entitlements service configuration
#[derive(Clone, Debug)]
pub struct EntitlementsConfig {
    pub base_url: String,
    pub internal_secret: Option<String>,

    /// Per-attempt timeout for grants
    pub grant_timeout: Duration,

    /// Timeout for revoke and lookup calls
    pub revoke_timeout: Duration,

    /// Total grant attempts
    pub max_attempts: u32,

    /// First retry delay; doubles per attempt
    pub initial_backoff: Duration,
}

impl Default for EntitlementsConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            internal_secret: None,
            grant_timeout: Duration::from_secs(5),
            revoke_timeout: Duration::from_secs(15),
            max_attempts: 2,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

impl EntitlementsConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env::var("SERP_AUTH_BASE_URL")
                .map_or_else(|| DEFAULT_BASE_URL.into(), |u| u.trim_end_matches('/').to_string()),
            internal_secret: env::first_var(&["INTERNAL_ENTITLEMENTS_TOKEN", "SERP_AUTH_INTERNAL_SECRET"]),
            ..Default::default()
        }
    }
}

/// Where a grant originated, for logs
#[derive(Clone, Debug, Default)]
pub struct GrantContext {
    pub provider: Option<String>,
    pub provider_event_id: Option<String>,
    pub provider_session_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct EntitlementRequest {
    pub email: String,
    pub entitlements: Vec<String>,
    pub metadata: MetadataBag,
    pub context: GrantContext,
}

impl EntitlementRequest {
    pub fn new(email: impl Into<String>, entitlements: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            email: email.into(),
            entitlements: entitlements.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    MissingInternalSecret,
    MissingEmailOrEntitlements,
}

impl SkipReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingInternalSecret => "missing_internal_secret",
            Self::MissingEmailOrEntitlements => "missing_email_or_entitlements",
        }
    }
}

/// Result of a grant or revoke call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrantOutcome {
    Skipped {
        reason: SkipReason,
    },
    Failed {
        http_status: Option<u16>,
        error: String,
        attempts: u32,
    },
    Succeeded {
        http_status: u16,
        attempts: u32,
    },
}

impl GrantOutcome {
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
            Self::Succeeded { .. } => "succeeded",
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// Current entitlements of an email
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LookupOutcome {
    Skipped,
    Found {
        entitlements: Vec<String>,
        customer_exists: bool,
    },
    Failed {
        error: String,
    },
}

/// Entitlement seam used by the orchestrator
#[async_trait]
pub trait EntitlementGrantor: Send + Sync {
    async fn grant(&self, request: EntitlementRequest) -> GrantOutcome;

    async fn revoke(&self, request: EntitlementRequest) -> GrantOutcome;

    async fn lookup_by_email(&self, email: &str) -> LookupOutcome;

    /// Revoke every entitlement the email currently holds.
    async fn revoke_all(&self, email: &str, metadata: MetadataBag, context: GrantContext) -> GrantOutcome {
        match self.lookup_by_email(email).await {
            LookupOutcome::Found { entitlements, .. } => {
                self.revoke(EntitlementRequest {
                    email: email.to_string(),
                    entitlements,
                    metadata,
                    context,
                })
                .await
            }
            LookupOutcome::Skipped => GrantOutcome::Skipped {
                reason: SkipReason::MissingInternalSecret,
            },
            LookupOutcome::Failed { error } => GrantOutcome::Failed {
                http_status: None,
                error,
                attempts: 1,
            },
        }
    }
}

/// Trim, drop empties and dedupe while keeping first-seen order.
pub fn normalize_entitlements<S: AsRef<str>>(entitlements: &[S]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    entitlements
        .iter()
        .map(|e| e.as_ref().trim())
        .filter(|e| !e.is_empty() && seen.insert(e.to_string()))
        .map(ToString::to_string)
        .collect()
}

#[derive(Serialize)]
struct EntitlementsBody<'a> {
    email: &'a str,
    entitlements: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a MetadataBag>,
}

enum Attempt {
    Done(u16),
    Retryable { http_status: Option<u16>, error: String },
    Fatal { http_status: Option<u16>, error: String },
}

/// HTTP client for the internal entitlements API
pub struct EntitlementsClient {
    http: reqwest::Client,
    config: EntitlementsConfig,
}

impl EntitlementsClient {
    pub fn new(config: EntitlementsConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> Self {
        Self::new(EntitlementsConfig::from_env())
    }

    fn prepare<'a>(&'a self, request: &EntitlementRequest, action: &str) -> Result<(&'a str, Vec<String>), SkipReason> {
        let Some(secret) = self.config.internal_secret.as_deref() else {
            tracing::debug!(action, email = %request.email, "serp_auth.entitlements_skipped");
            return Err(SkipReason::MissingInternalSecret);
        };
        let entitlements = normalize_entitlements(&request.entitlements);
        if request.email.trim().is_empty() || entitlements.is_empty() {
            tracing::debug!(action, email = %request.email, "serp_auth.entitlements_skipped");
            return Err(SkipReason::MissingEmailOrEntitlements);
        }
        Ok((secret, entitlements))
    }

    async fn attempt(&self, path: &str, secret: &str, body: &EntitlementsBody<'_>, timeout: Duration) -> Attempt {
        let url = format!("{}{path}", self.config.base_url);
        let response = self
            .http
            .post(&url)
            .header(SECRET_HEADER, secret)
            .timeout(timeout)
            .json(body)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => Attempt::Done(response.status().as_u16()),
            Ok(response) => {
                let status = response.status().as_u16();
                let text = clip(response.text().await.unwrap_or_default(), BODY_LOG_LIMIT);
                let error = format!("HTTP {status}: {text}");
                if matches!(status, 408 | 429 | 500..=599) {
                    Attempt::Retryable { http_status: Some(status), error }
                } else {
                    Attempt::Fatal { http_status: Some(status), error }
                }
            }
            Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => Attempt::Retryable {
                http_status: None,
                error: e.to_string(),
            },
            Err(e) => Attempt::Fatal {
                http_status: e.status().map(|s| s.as_u16()),
                error: e.to_string(),
            },
        }
    }
}

#[async_trait]
impl EntitlementGrantor for EntitlementsClient {
    async fn grant(&self, request: EntitlementRequest) -> GrantOutcome {
        let (secret, entitlements) = match self.prepare(&request, "grant") {
            Ok(prepared) => prepared,
            Err(reason) => return GrantOutcome::Skipped { reason },
        };
        let body = EntitlementsBody {
            email: &request.email,
            entitlements: &entitlements,
            metadata: (!request.metadata.is_empty()).then_some(&request.metadata),
        };

        tracing::info!(
            email = %request.email,
            entitlements = ?entitlements,
            provider = ?request.context.provider,
            provider_event_id = ?request.context.provider_event_id,
            "serp_auth.entitlements_grant_started"
        );

        let max_attempts = self.config.max_attempts.max(1);
        let mut delay = self.config.initial_backoff;
        let mut attempt = 1;
        loop {
            match self
                .attempt("/internal/entitlements/grant", secret, &body, self.config.grant_timeout)
                .await
            {
                Attempt::Done(http_status) => {
                    tracing::info!(
                        email = %request.email,
                        status = http_status,
                        attempts = attempt,
                        "serp_auth.entitlements_grant_succeeded"
                    );
                    return GrantOutcome::Succeeded { http_status, attempts: attempt };
                }
                Attempt::Retryable { http_status, error } if attempt < max_attempts => {
                    tracing::warn!(
                        email = %request.email,
                        status = ?http_status,
                        error = %error,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "serp_auth.entitlements_grant_retry"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Attempt::Retryable { http_status, error } | Attempt::Fatal { http_status, error } => {
                    tracing::error!(
                        email = %request.email,
                        entitlements = ?entitlements,
                        status = ?http_status,
                        error = %error,
                        attempts = attempt,
                        provider_session_id = ?request.context.provider_session_id,
                        "serp_auth.entitlements_grant_failed"
                    );
                    return GrantOutcome::Failed {
                        http_status,
                        error,
                        attempts: attempt,
                    };
                }
            }
        }
    }

    async fn revoke(&self, request: EntitlementRequest) -> GrantOutcome {
        let (secret, entitlements) = match self.prepare(&request, "revoke") {
            Ok(prepared) => prepared,
            Err(reason) => return GrantOutcome::Skipped { reason },
        };
        let body = EntitlementsBody {
            email: &request.email,
            entitlements: &entitlements,
            metadata: (!request.metadata.is_empty()).then_some(&request.metadata),
        };

        match self
            .attempt("/internal/entitlements/revoke", secret, &body, self.config.revoke_timeout)
            .await
        {
            Attempt::Done(http_status) => {
                tracing::info!(email = %request.email, entitlements = ?entitlements, "serp_auth.entitlements_revoke_succeeded");
                GrantOutcome::Succeeded { http_status, attempts: 1 }
            }
            Attempt::Retryable { http_status, error } | Attempt::Fatal { http_status, error } => {
                tracing::error!(
                    email = %request.email,
                    status = ?http_status,
                    error = %error,
                    "serp_auth.entitlements_revoke_failed"
                );
                GrantOutcome::Failed {
                    http_status,
                    error,
                    attempts: 1,
                }
            }
        }
    }

    async fn lookup_by_email(&self, email: &str) -> LookupOutcome {
        let Some(secret) = self.config.internal_secret.as_deref() else {
            return LookupOutcome::Skipped;
        };
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return LookupOutcome::Found {
                entitlements: Vec::new(),
                customer_exists: false,
            };
        }

        let response = self
            .http
            .post(format!("{}/internal/entitlements/by-email", self.config.base_url))
            .header(SECRET_HEADER, secret)
            .timeout(self.config.revoke_timeout)
            .json(&serde_json::json!({ "email": email }))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return LookupOutcome::Failed { error: e.to_string() },
        };
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            let error = body
                .get("error")
                .and_then(Value::as_str)
                .map_or_else(|| format!("HTTP {}", status.as_u16()), ToString::to_string);
            return LookupOutcome::Failed { error };
        }

        let entitlements: Vec<String> = body
            .get("entitlements")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect::<Vec<_>>())
            .map(|items| normalize_entitlements(&items))
            .unwrap_or_default();

        LookupOutcome::Found {
            entitlements,
            customer_exists: body.get("customerExists").and_then(Value::as_bool).unwrap_or(false),
        }
    }
}
