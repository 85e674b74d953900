use crate::audit::{AuditEvent, AuditSink, Outcome, SecurityEventType};
use crate::clock::{Clock, SystemClock, now_ms};
use crate::config::GateConfig;
use crate::error::ConfigError;
use crate::identity::{ClientIdentifier, RequestInfo};
use crate::store::BucketStore;
use crate::token::{Hs256Decoder, SubjectDecoder};
use std::num::NonZeroU32;
use std::sync::Arc;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Allow/deny verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Whole tokens left for this client after the request.
    pub remaining_tokens: u64,
    /// Zero when allowed, at least one when denied.
    pub retry_after_seconds: u64,
    pub client_key: String,
}

/// Request-facing entry point: identify, look up the bucket, take one token.
pub struct AdmissionGate {
    identifier: ClientIdentifier,
    store: BucketStore,
    audit: Option<Arc<dyn AuditSink>>,
}

impl AdmissionGate {
    pub fn new(identifier: ClientIdentifier, store: BucketStore) -> Self {
        Self {
            identifier,
            store,
            audit: None,
        }
    }

    pub fn from_config(config: &GateConfig) -> Result<Self, ConfigError> {
        Self::from_config_with_clock(config, Arc::new(SystemClock))
    }

    pub fn from_config_with_clock(
        config: &GateConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let decoder = config
            .jwt_secret
            .as_deref()
            .map(|secret| Arc::new(Hs256Decoder::new(secret)) as Arc<dyn SubjectDecoder>);
        let identifier = ClientIdentifier::new(config.trust_forwarded_header, decoder);
        let store = BucketStore::with_clock(
            config.rate_limit()?,
            config.idle_timeout(),
            config.max_clients,
            clock,
        );
        Ok(Self::new(identifier, store))
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn store(&self) -> &BucketStore {
        &self.store
    }

    /// Decide whether `req` may proceed. Never fails.
    pub fn admit(&self, req: &RequestInfo) -> Decision {
        let client_key = self.identifier.resolve(req);
        let entry = self.store.get_or_create(&client_key);
        let result = entry.try_consume(NonZeroU32::MIN, self.store.clock().now());

        if result.allowed {
            return Decision {
                allowed: true,
                remaining_tokens: result.remaining_tokens,
                retry_after_seconds: 0,
                client_key,
            };
        }

        let retry_after_seconds = result.nanos_until_next_token.div_ceil(NANOS_PER_SEC).max(1);
        tracing::warn!(
            client = %client_key,
            retry_after_secs = retry_after_seconds,
            "rate limit exceeded"
        );
        if let Some(sink) = &self.audit {
            sink.record(AuditEvent {
                event_type: SecurityEventType::RateLimitExceeded,
                subject: client_key.clone(),
                client_addr: self.identifier.client_address(req),
                timestamp_ms: now_ms(),
                outcome: Outcome::Failure,
            });
        }

        Decision {
            allowed: false,
            remaining_tokens: result.remaining_tokens,
            retry_after_seconds,
            client_key,
        }
    }
}
