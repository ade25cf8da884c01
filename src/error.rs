use thiserror::Error;

/// Crate-wide result alias used by CLI-level plumbing.
pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;

/// A single quota fetch against a resolved endpoint failed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The endpoint answered with something other than HTTP 200.
    #[error("quota endpoint returned HTTP {0}")]
    BadStatus(u16),

    /// Connection failure or timeout before a full response was read.
    #[error("quota request failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// The response body was not the JSON shape we expect.
    #[error("quota response was not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),
}

/// Outcome classes of a full refresh cycle. Every variant is recoverable:
/// the coordinator returns to idle and retries on the next trigger.
#[derive(Debug, Error)]
pub enum RefreshError {
    /// No language_server process exposing a CSRF token was found. Covers
    /// enumeration failure, no matching process, and token-less matches.
    #[error("no language_server process with a CSRF token was found")]
    NoProcess,

    /// No candidate port answered the probe and the command line advertised
    /// no fallback port.
    #[error("no listening port answered the probe and no fallback port was advertised")]
    NoPort,

    /// The fetch itself failed; the cached endpoint has been invalidated.
    #[error(transparent)]
    Fetch(#[from] FetchError),
}
