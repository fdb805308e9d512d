//! Webhook dispatcher: signed event delivery with retries.
//!
//! Subscribes to the event bus and POSTs each matching event to the
//! configured URL, one event per request, signed with HMAC-SHA256 over
//! the JSON body (`X-Council-Signature: sha256=<hex>`). Failed
//! deliveries retry up to 5 times with exponential backoff (1 s → 32 s)
//! and jitter; a delivery that still fails is logged internally and
//! never dispatched anywhere.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use tracing::{debug, warn};

use conclave_types::{EventKind, LayerEvent, WebhookConfig};

use crate::bus::{EventEmitter, EventSubscription};

type HmacSha256 = Hmac<Sha256>;

/// Maximum delivery attempts per event.
const MAX_ATTEMPTS: u32 = 5;

/// Backoff ceiling between attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(32);

/// Signature header name.
pub const SIGNATURE_HEADER: &str = "X-Council-Signature";

/// Compute the signature header value for a body: `sha256=<hex>`.
pub fn sign_body(secret: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a signature header against a body (for receivers and tests).
pub fn verify_body(secret: &str, body: &str, signature: &str) -> bool {
    constant_time_eq(sign_body(secret, body).as_bytes(), signature.as_bytes())
}

/// Constant-time byte comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// Minimal hex encoding, avoiding the `hex` crate as a dependency.
mod hex {
    /// Encode bytes as lowercase hexadecimal.
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().fold(String::new(), |mut acc, b| {
            use std::fmt::Write;
            let _ = write!(acc, "{b:02x}");
            acc
        })
    }
}

/// Delivers bus events to one webhook endpoint.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    config: WebhookConfig,
    kinds: Option<HashSet<EventKind>>,
    query_id: Option<String>,
    base_backoff: Duration,
}

impl WebhookDispatcher {
    /// Dispatcher for one webhook subscription. An empty `events` list
    /// in the config means every dispatchable kind is delivered.
    pub fn new(config: WebhookConfig) -> Self {
        let kinds = if config.events.is_empty() {
            None
        } else {
            Some(
                config
                    .events
                    .iter()
                    .filter_map(|name| {
                        serde_json::from_value::<EventKind>(serde_json::Value::String(
                            name.clone(),
                        ))
                        .ok()
                    })
                    .collect(),
            )
        };
        Self {
            client: reqwest::Client::new(),
            config,
            kinds,
            query_id: None,
            base_backoff: Duration::from_secs(1),
        }
    }

    /// Deliver only events belonging to one query. The bus carries every
    /// session; a scoped dispatcher ignores the rest.
    pub fn scoped_to(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }

    /// Override the backoff base (tests).
    pub fn with_base_backoff(mut self, base: Duration) -> Self {
        self.base_backoff = base;
        self
    }

    /// Whether this dispatcher delivers the given kind.
    pub fn wants(&self, kind: EventKind) -> bool {
        if !kind.is_dispatchable() {
            return false;
        }
        match self.kinds {
            Some(ref kinds) => kinds.contains(&kind),
            None => true,
        }
    }

    /// Consume a bus subscription, delivering each matching event until
    /// the stream terminates. Delivery failures are recorded through
    /// `emitter` (when the session is still open) and the internal log.
    pub async fn run(self, mut subscription: EventSubscription, emitter: Option<Arc<EventEmitter>>) {
        while let Some(event) = subscription.next().await {
            if let Some(ref query_id) = self.query_id {
                if &event.query_id != query_id {
                    continue;
                }
            }
            let terminal = event.kind.is_terminal();
            if self.wants(event.kind) && !self.deliver(&event).await {
                warn!(
                    url = %self.config.url,
                    seq = event.seq,
                    kind = ?event.kind,
                    "webhook delivery failed after all attempts"
                );
                if let Some(ref emitter) = emitter {
                    emitter.emit(
                        EventKind::WebhookDeliveryFailed,
                        event.stage,
                        event.slot,
                        serde_json::json!({
                            "url": self.config.url,
                            "event_seq": event.seq,
                        }),
                    );
                }
            }
            if terminal {
                break;
            }
        }
    }

    /// Deliver one event with retries. Returns whether delivery
    /// eventually succeeded.
    pub async fn deliver(&self, event: &LayerEvent) -> bool {
        let body = match serde_json::to_string(event) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "event not serializable, skipping delivery");
                return false;
            }
        };
        let signature = sign_body(&self.config.secret, &body);

        for attempt in 0..MAX_ATTEMPTS {
            let result = self
                .client
                .post(&self.config.url)
                .header("Content-Type", "application/json")
                .header(SIGNATURE_HEADER, &signature)
                .body(body.clone())
                .timeout(Duration::from_secs(10))
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(
                        url = %self.config.url,
                        seq = event.seq,
                        attempt,
                        "webhook delivered"
                    );
                    return true;
                }
                Ok(response) => {
                    warn!(
                        url = %self.config.url,
                        status = %response.status(),
                        attempt,
                        "webhook endpoint rejected event"
                    );
                }
                Err(e) => {
                    warn!(url = %self.config.url, error = %e, attempt, "webhook request failed");
                }
            }

            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }
        false
    }

    /// Backoff before the next attempt: `base * 2^attempt` capped,
    /// plus up to 25% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_backoff.as_millis() as u64;
        let raw_ms = base_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(MAX_BACKOFF.as_millis() as u64);
        let jitter = rand::thread_rng().gen_range(0..=raw_ms / 4);
        Duration::from_millis(raw_ms + jitter)
    }
}
