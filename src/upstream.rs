// Outbound HTTP for the feed archive and the live vehicle endpoint.

use bytes::Bytes;
use reqwest::blocking;
use std::time::Duration;

use crate::error::FetchError;

/// Blocking GET with a per-call timeout. Swapped for an in-memory double in tests.
pub trait Upstream: Send + Sync {
    fn get(&self, url: &str, timeout: Duration) -> Result<Bytes, FetchError>;
}

pub struct HttpUpstream {
    client: blocking::Client,
}

impl HttpUpstream {
    pub fn new() -> Result<Self, FetchError> {
        let client = blocking::Client::builder()
            .user_agent(concat!("metro-tracker/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(HttpUpstream { client })
    }
}

impl Upstream for HttpUpstream {
    fn get(&self, url: &str, timeout: Duration) -> Result<Bytes, FetchError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .map_err(|e| FetchError::Transport(format!("GET {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        response
            .bytes()
            .map_err(|e| {
                FetchError::Transport(format!("Failed to read response from {}: {}", url, e))
            })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Serves canned bodies per URL; unknown URLs fail like a refused connection.
    #[derive(Default)]
    pub(crate) struct FakeUpstream {
        responses: Mutex<HashMap<String, Result<Bytes, FetchError>>>,
        timeouts: Mutex<HashMap<String, Duration>>,
        calls: AtomicUsize,
    }

    impl FakeUpstream {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn respond(&self, url: &str, body: impl Into<Bytes>) {
            self.responses
                .lock()
                .unwrap()
                .insert(url.to_string(), Ok(body.into()));
        }

        pub(crate) fn fail(&self, url: &str, err: FetchError) {
            self.responses.lock().unwrap().insert(url.to_string(), Err(err));
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Timeout passed on the last request to `url`.
        pub(crate) fn timeout_for(&self, url: &str) -> Option<Duration> {
            self.timeouts.lock().unwrap().get(url).copied()
        }
    }

    impl Upstream for FakeUpstream {
        fn get(&self, url: &str, timeout: Duration) -> Result<Bytes, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.timeouts.lock().unwrap().insert(url.to_string(), timeout);
            self.responses
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .unwrap_or_else(|| {
                    Err(FetchError::Transport(format!("connection refused: {}", url)))
                })
        }
    }
}
