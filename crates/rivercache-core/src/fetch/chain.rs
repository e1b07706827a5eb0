//! Ordered fallback across upstream sources.
//!
//! Sources are tried in configured priority order. A source is passed over
//! when its fetch fails or times out, when its payload cannot be decoded, or
//! when the decoded value fails the source's validity check (typically "the
//! newest observation is older than N hours"). A source is never retried
//! within one pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::error::{DecodeError, FailureKind, FetchError, SourceFailure, TransportError};
use super::transport::Fetcher;
use crate::clock::{std_duration, Clock, SystemClock};
use crate::config::SourceSettings;
use crate::models::Timestamped;
use crate::utils::format_duration;

/// Turns a source's raw body into a value. One decoder per payload format.
pub trait Decoder<V>: Send + Sync {
    fn decode(&self, key: &str, body: &[u8]) -> Result<V, DecodeError>;
}

impl<V, F> Decoder<V> for F
where
    F: Fn(&str, &[u8]) -> Result<V, DecodeError> + Send + Sync,
{
    fn decode(&self, key: &str, body: &[u8]) -> Result<V, DecodeError> {
        self(key, body)
    }
}

/// Accepts or rejects a decoded value. `Err` carries the reason.
pub trait Validator<V>: Send + Sync {
    fn validate(&self, value: &V, now: DateTime<Utc>) -> Result<(), String>;
}

/// Rejects values whose newest observation is older than `max_age`.
/// Values without any observation time are rejected too.
#[derive(Debug, Clone, Copy)]
pub struct MaxAge(pub Duration);

impl<V: Timestamped> Validator<V> for MaxAge {
    fn validate(&self, value: &V, now: DateTime<Utc>) -> Result<(), String> {
        let observed = value
            .observed_at()
            .ok_or_else(|| "payload has no observation time".to_string())?;
        let age = std_duration(now - observed);
        if age > self.0 {
            Err(format!(
                "newest observation is {} old, limit is {}",
                format_duration(age),
                format_duration(self.0)
            ))
        } else {
            Ok(())
        }
    }
}

/// Wraps a plain predicate; `reason` is reported when it returns false.
pub struct Predicate<F> {
    reason: String,
    check: F,
}

impl<F> Predicate<F> {
    pub fn new(reason: impl Into<String>, check: F) -> Self {
        Self {
            reason: reason.into(),
            check,
        }
    }
}

impl<V, F> Validator<V> for Predicate<F>
where
    F: Fn(&V) -> bool + Send + Sync,
{
    fn validate(&self, value: &V, _now: DateTime<Utc>) -> Result<(), String> {
        if (self.check)(value) {
            Ok(())
        } else {
            Err(self.reason.clone())
        }
    }
}

/// Default per-source timeout.
pub const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(10);

/// One entry of a fallback chain.
pub struct Source<V> {
    tag: String,
    fetcher: Arc<dyn Fetcher>,
    decoder: Arc<dyn Decoder<V>>,
    validator: Option<Arc<dyn Validator<V>>>,
    timeout: Duration,
}

impl<V> Source<V> {
    pub fn new(tag: impl Into<String>, fetcher: Arc<dyn Fetcher>, decoder: Arc<dyn Decoder<V>>) -> Self {
        Self {
            tag: tag.into(),
            fetcher,
            decoder,
            validator: None,
            timeout: DEFAULT_SOURCE_TIMEOUT,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator<V>>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

/// A value together with the tag of the source that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<V> {
    pub value: V,
    pub source: String,
}

pub struct FallbackChain<V> {
    sources: Vec<Source<V>>,
    clock: Arc<dyn Clock>,
}

impl<V> FallbackChain<V> {
    pub fn new(sources: Vec<Source<V>>) -> Self {
        Self::with_clock(sources, Arc::new(SystemClock))
    }

    pub fn with_clock(sources: Vec<Source<V>>, clock: Arc<dyn Clock>) -> Self {
        Self { sources, clock }
    }

    pub fn tags(&self) -> Vec<&str> {
        self.sources.iter().map(Source::tag).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Try each source in order and return the first validated value.
    pub async fn fetch(&self, key: &str) -> Result<Fetched<V>, FetchError> {
        let mut attempts = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            debug!(key = key, source = %source.tag, "Fetching from source");
            match self.try_source(source, key).await {
                Ok(value) => {
                    debug!(key = key, source = %source.tag, "Source returned valid data");
                    return Ok(Fetched {
                        value,
                        source: source.tag.clone(),
                    });
                }
                Err(kind) => {
                    let failure = SourceFailure {
                        source: source.tag.clone(),
                        kind,
                    };
                    warn!(key = key, failure = %failure, "Source failed, trying next");
                    attempts.push(failure);
                }
            }
        }

        warn!(key = key, attempts = attempts.len(), "All sources exhausted");
        Err(FetchError::NoFreshData {
            key: key.to_string(),
            attempts,
        })
    }

    async fn try_source(&self, source: &Source<V>, key: &str) -> Result<V, FailureKind> {
        let response = match tokio::time::timeout(source.timeout, source.fetcher.fetch(key, source.timeout)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(FailureKind::Transport(e)),
            Err(_) => return Err(FailureKind::Transport(TransportError::Timeout(source.timeout))),
        };

        if !response.is_success() {
            let body = String::from_utf8_lossy(&response.body);
            return Err(FailureKind::Transport(TransportError::from_status(response.status, &body)));
        }

        let value = source
            .decoder
            .decode(key, &response.body)
            .map_err(FailureKind::Decode)?;

        if let Some(validator) = &source.validator {
            validator
                .validate(&value, self.clock.now())
                .map_err(FailureKind::Invalid)?;
        }
        Ok(value)
    }
}

impl<V: Timestamped + 'static> FallbackChain<V> {
    /// Build a chain from configuration.
    ///
    /// `fetcher_for` creates the transport for each source; `decoders` maps a
    /// source's `format` to its decoder. Sources with `max_age_secs` get a
    /// [`MaxAge`] validator.
    pub fn from_settings<F>(
        settings: &[SourceSettings],
        mut fetcher_for: F,
        decoders: &HashMap<String, Arc<dyn Decoder<V>>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self>
    where
        F: FnMut(&SourceSettings) -> Result<Arc<dyn Fetcher>>,
    {
        let mut sources = Vec::with_capacity(settings.len());
        for s in settings {
            let decoder = decoders
                .get(&s.format)
                .cloned()
                .ok_or_else(|| anyhow!("No decoder registered for format '{}' (source '{}')", s.format, s.tag))?;
            let mut source = Source::new(s.tag.clone(), fetcher_for(s)?, decoder).timeout(s.timeout());
            if let Some(max_age) = s.max_age() {
                source = source.validator(Arc::new(MaxAge(max_age)));
            }
            sources.push(source);
        }
        Ok(Self::with_clock(sources, clock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fetch::RawResponse;
    use crate::models::LiveReading;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 16, 12, 0, 0).unwrap()
    }

    /// Serves a fixed response (or error) and counts calls.
    struct Canned {
        response: Result<RawResponse, TransportError>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Canned {
        fn ok(body: &str) -> Arc<Self> {
            Arc::new(Self {
                response: Ok(RawResponse::ok(body)),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }

        fn err(e: TransportError) -> Arc<Self> {
            Arc::new(Self {
                response: Err(e),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }

        fn slow(body: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                response: Ok(RawResponse::ok(body)),
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for Canned {
        async fn fetch(&self, _key: &str, _timeout: Duration) -> Result<RawResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.response.clone()
        }
    }

    /// Body format: "<minutes old>,<discharge>"
    fn reading_decoder() -> Arc<dyn Decoder<LiveReading>> {
        Arc::new(|key: &str, body: &[u8]| -> Result<LiveReading, DecodeError> {
            let text = std::str::from_utf8(body).map_err(|e| DecodeError::new(e.to_string()))?;
            let (age, discharge) = text
                .split_once(',')
                .ok_or_else(|| DecodeError::new("expected '<age>,<discharge>'"))?;
            let age: i64 = age.parse().map_err(|_| DecodeError::new("bad age"))?;
            let discharge: f64 = discharge.parse().map_err(|_| DecodeError::new("bad discharge"))?;
            Ok(LiveReading::new(key, now() - chrono::Duration::minutes(age)).with_discharge(discharge))
        })
    }

    fn source(tag: &str, fetcher: Arc<Canned>) -> Source<LiveReading> {
        Source::new(tag, fetcher, reading_decoder())
            .validator(Arc::new(MaxAge(Duration::from_secs(6 * 3600))))
    }

    fn chain(sources: Vec<Source<LiveReading>>) -> FallbackChain<LiveReading> {
        FallbackChain::with_clock(sources, ManualClock::new(now()))
    }

    // -------------------------------------------------------------------------
    // Ordering and fallback
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_first_valid_source_wins() {
        let a = Canned::ok("10,8.43");
        let b = Canned::ok("5,34.8");
        let chain = chain(vec![source("a", a.clone()), source("b", b.clone())]);

        let fetched = chain.fetch("08NA011").await.unwrap();
        assert_eq!(fetched.source, "a");
        assert_eq!(fetched.value.discharge, Some(8.43));
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_source_falls_through_to_fresh_one() {
        // a answers with a 7h old reading, b with a 10 minute old one.
        let a = Canned::ok("420,34.8");
        let b = Canned::ok("10,8.43");
        let chain = chain(vec![source("a", a.clone()), source("b", b.clone())]);

        let fetched = chain.fetch("08NA011").await.unwrap();
        assert_eq!(fetched.source, "b");
        assert_eq!(fetched.value.discharge, Some(8.43));
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn test_transport_and_decode_failures_fall_through() {
        let a = Canned::err(TransportError::Network("connection reset".into()));
        let b = Canned::ok("not a reading");
        let c = Canned::ok("1,9.0");
        let chain = chain(vec![source("a", a), source("b", b), source("c", c)]);

        let fetched = chain.fetch("k").await.unwrap();
        assert_eq!(fetched.source, "c");
    }

    #[tokio::test]
    async fn test_http_error_status_is_a_failure() {
        let a = Arc::new(Canned {
            response: Ok(RawResponse {
                status: 503,
                body: b"maintenance".to_vec(),
            }),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        });
        let chain = chain(vec![source("a", a)]);

        let err = chain.fetch("k").await.unwrap_err();
        assert!(matches!(
            &err.attempts()[0].kind,
            FailureKind::Transport(TransportError::ServerError(body)) if body == "maintenance"
        ));
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure_not_a_crash() {
        let slow = Canned::slow("1,1.0", Duration::from_millis(500));
        let fast = Canned::ok("1,2.0");
        let chain = chain(vec![
            source("slow", slow).timeout(Duration::from_millis(20)),
            source("fast", fast),
        ]);

        let fetched = chain.fetch("k").await.unwrap();
        assert_eq!(fetched.source, "fast");
    }

    // -------------------------------------------------------------------------
    // Exhaustion
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_exhausted_sources_report_every_attempt() {
        let a = Canned::err(TransportError::Timeout(Duration::from_secs(10)));
        let b = Canned::ok("600,1.0");
        let chain = chain(vec![source("a", a), source("b", b)]);

        let err = chain.fetch("k").await.unwrap_err();
        assert!(err.is_no_fresh_data());
        assert_eq!(err.attempts().len(), 2);
        assert_eq!(err.attempts()[0].source, "a");
        assert!(matches!(err.attempts()[1].kind, FailureKind::Invalid(_)));
        assert!(!err.all_stale());
    }

    #[tokio::test]
    async fn test_all_stale_when_every_source_is_old() {
        let chain = chain(vec![source("a", Canned::ok("500,1.0")), source("b", Canned::ok("900,1.0"))]);
        let err = chain.fetch("k").await.unwrap_err();
        assert!(err.all_stale());
    }

    #[tokio::test]
    async fn test_empty_chain_is_exhausted() {
        let chain = chain(Vec::new());
        let err = chain.fetch("k").await.unwrap_err();
        assert!(err.is_no_fresh_data());
        assert!(err.attempts().is_empty());
    }

    // -------------------------------------------------------------------------
    // Validators
    // -------------------------------------------------------------------------

    #[test]
    fn test_max_age_rejects_missing_timestamp() {
        let empty: Vec<LiveReading> = Vec::new();
        assert!(MaxAge(Duration::from_secs(60)).validate(&empty, now()).is_err());
    }

    #[test]
    fn test_predicate_validator() {
        let positive = Predicate::new("discharge must be positive", |r: &LiveReading| {
            r.discharge.map(|d| d > 0.0).unwrap_or(false)
        });
        let good = LiveReading::new("k", now()).with_discharge(1.0);
        let bad = LiveReading::new("k", now()).with_discharge(-1.0);
        assert!(positive.validate(&good, now()).is_ok());
        assert_eq!(
            positive.validate(&bad, now()).unwrap_err(),
            "discharge must be positive"
        );
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_from_settings_keeps_configured_order() {
        let settings = vec![
            SourceSettings::new("csv", "https://example.org/{0}.csv", "reading"),
            SourceSettings::new("json", "https://example.org/{0}.json", "reading"),
        ];
        let mut decoders: HashMap<String, Arc<dyn Decoder<LiveReading>>> = HashMap::new();
        decoders.insert("reading".to_string(), reading_decoder());

        let chain = FallbackChain::from_settings(
            &settings,
            |s| {
                let body = if s.tag == "csv" { "700,1.0" } else { "1,2.0" };
                Ok(Canned::ok(body) as Arc<dyn Fetcher>)
            },
            &decoders,
            ManualClock::new(now()),
        )
        .unwrap();

        assert_eq!(chain.tags(), vec!["csv", "json"]);
        let fetched = chain.fetch("08NA011").await.unwrap();
        assert_eq!(fetched.source, "json");
    }

    #[test]
    fn test_from_settings_requires_decoder() {
        let settings = vec![SourceSettings::new("csv", "https://example.org", "unknown")];
        let decoders: HashMap<String, Arc<dyn Decoder<LiveReading>>> = HashMap::new();
        let result = FallbackChain::from_settings(
            &settings,
            |_| Ok(Canned::ok("") as Arc<dyn Fetcher>),
            &decoders,
            ManualClock::new(now()),
        );
        assert!(result.is_err());
    }
}
