//! Stripe Signature Verification
//!
//! Header format: `t=<unix>,v1=<hex>[,v1=<hex>]`. Each `v1` is checked
//! against each configured secret with `stripe::Webhook`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{Webhook, WebhookError};

use crate::env;
use crate::error::{PaymentError, Result};
use crate::providers::StripeMode;
use crate::webhook::event::StripeEvent;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed timestamp, matching `stripe::Webhook`
pub const TOLERANCE_SECS: u64 = 300;

/// An endpoint secret and the account it belongs to
#[derive(Clone)]
pub struct WebhookSecret {
    secret: String,
    pub mode: StripeMode,
    pub account_alias: Option<String>,
}

impl std::fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSecret")
            .field("mode", &self.mode)
            .field("account_alias", &self.account_alias)
            .finish_non_exhaustive()
    }
}

/// A verified event plus the account whose secret matched
#[derive(Clone, Debug)]
pub struct VerifiedEvent {
    pub event: StripeEvent,
    pub mode: StripeMode,
    pub account_alias: Option<String>,
}

/// Tries each configured secret in order
#[derive(Clone, Debug, Default)]
pub struct StripeSignatureVerifier {
    secrets: Vec<WebhookSecret>,
}

impl StripeSignatureVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret. Duplicates keep their first registration.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>, mode: StripeMode, account_alias: Option<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() && !self.secrets.iter().any(|s| s.secret == secret) {
            self.secrets.push(WebhookSecret {
                secret,
                mode,
                account_alias,
            });
        }
        self
    }

    pub fn from_env() -> Self {
        Self::from_lookup(env::var)
    }

    /// Live, then test, then each `STRIPE_ACCOUNT_ALIASES` entry.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let first = |names: &[&str]| names.iter().find_map(|name| lookup(name));
        let mut verifier = Self::new();

        if let Some(secret) = first(&["STRIPE_WEBHOOK_SECRET_LIVE", "STRIPE_WEBHOOK_SECRET"]) {
            verifier = verifier.with_secret(secret, StripeMode::Live, None);
        }
        if let Some(secret) = first(&[
            "STRIPE_WEBHOOK_SECRET_TEST",
            "STRIPE_TEST_WEBHOOK_SECRET",
            "STRIPE_WEBHOOK_SECRET",
        ]) {
            verifier = verifier.with_secret(secret, StripeMode::Test, None);
        }

        let aliases = lookup("STRIPE_ACCOUNT_ALIASES").unwrap_or_default();
        for alias in aliases.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            let suffix = env::alias_suffix(alias);
            for mode in [StripeMode::Live, StripeMode::Test] {
                let name = format!("STRIPE_WEBHOOK_SECRET_{}_{suffix}", mode.as_str().to_uppercase());
                if let Some(secret) = lookup(&name) {
                    verifier = verifier.with_secret(secret, mode, Some(alias.to_lowercase()));
                }
            }
        }
        verifier
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn verify(&self, payload: &str, header: &str) -> Result<VerifiedEvent> {
        self.verify_at(payload, header, chrono::Utc::now().timestamp())
    }

    /// Verify against `now` (unix seconds) and parse the event.
    ///
    /// The verified mode and alias come from the secret that matched, not
    /// from the payload.
    pub fn verify_at(&self, payload: &str, header: &str, now: i64) -> Result<VerifiedEvent> {
        if self.secrets.is_empty() {
            return Err(PaymentError::Config("Stripe webhook secret not configured".into()));
        }

        let (timestamp, signatures) = parse_header(header)?;
        if now.abs_diff(timestamp) > TOLERANCE_SECS {
            return Err(PaymentError::InvalidSignature(
                "timestamp outside the tolerance zone".into(),
            ));
        }

        let matched = self
            .secrets
            .iter()
            .find(|s| {
                signatures.iter().any(|sig| {
                    let single = format!("t={timestamp},v1={sig}");
                    match Webhook::construct_event_with_timestamp(payload, &single, &s.secret, now) {
                        Ok(_) => true,
                        // Parsing runs after the signature check passed.
                        Err(WebhookError::BadParse(e)) => {
                            tracing::debug!(error = %e, "stripe.typed_event_unparsed");
                            true
                        }
                        Err(_) => false,
                    }
                })
            })
            .ok_or_else(|| {
                PaymentError::InvalidSignature("no signatures found matching the expected signature".into())
            })?;

        let event = StripeEvent::parse(payload)?;
        if StripeMode::from_livemode(event.livemode) != matched.mode {
            tracing::warn!(
                event_id = %event.id,
                secret_mode = matched.mode.as_str(),
                livemode = event.livemode,
                "stripe.livemode_mismatch"
            );
        }

        Ok(VerifiedEvent {
            mode: matched.mode,
            account_alias: matched.account_alias.clone(),
            event,
        })
    }
}

fn parse_header(header: &str) -> Result<(i64, Vec<&str>)> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" if !value.is_empty() => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| PaymentError::InvalidSignature("missing timestamp in signature header".into()))?;
    if signatures.is_empty() {
        return Err(PaymentError::InvalidSignature("missing v1 signature".into()));
    }
    Ok((timestamp, signatures))
}

/// Build a `stripe-signature` header value for `payload`.
pub fn sign(secret: &str, payload: &str, timestamp: i64) -> Result<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| PaymentError::InvalidSignature(e.to_string()))?;
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(format!("t={timestamp},v1={}", hex::encode(digest)))
}
