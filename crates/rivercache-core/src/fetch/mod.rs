//! Upstream access: transports, decoding, and the fallback chain.

pub mod chain;
pub mod error;
pub mod transport;

pub use chain::{Decoder, FallbackChain, Fetched, MaxAge, Predicate, Source, Validator, DEFAULT_SOURCE_TIMEOUT};
pub use error::{DecodeError, FailureKind, FetchError, SourceFailure, TransportError};
pub use transport::{default_client, render_url, Fetcher, HttpFetcher, RawResponse};
