//! Rate limited vendor HTTP client
//!
//! Every request to the vendor, from backfill jobs and from the latest
//! reading poller alike, goes through one [`RateLimitedHttpClient`]. The
//! client holds a single gate, so requests are serialized and spaced at
//! least `min_interval` apart regardless of which caller issued them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::{config::VendorConfig, errors::BackfillError};

const TOO_MANY_REQUESTS: u16 = 429;

/// Raw HTTP response as seen by the rate limiter
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Issues one HTTP GET
///
/// Implemented by [`ReqwestTransport`] in production and by scripted
/// vendors in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<TransportResponse, BackfillError>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, BackfillError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(BackfillError::HttpClientInit)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<TransportResponse, BackfillError> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .query(query)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify_reqwest_error)?;
        Ok(TransportResponse { status, body })
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> BackfillError {
    if e.is_timeout() {
        BackfillError::Timeout
    } else {
        BackfillError::Network(e.to_string())
    }
}

/// Process-local pacing state, derived purely from the monotonic clock
#[derive(Debug, Default)]
struct RateLimitState {
    last_request: Option<Instant>,
    cooldown_until: Option<Instant>,
}

impl RateLimitState {
    /// Earliest instant the next request may be sent
    fn next_slot(&self, min_interval: Duration) -> Option<Instant> {
        let paced = self.last_request.map(|last| last + min_interval);
        match (paced, self.cooldown_until) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Shared, serialized gate in front of the vendor API
pub struct RateLimitedHttpClient {
    transport: Arc<dyn Transport>,
    base_url: String,
    api_key: SecretString,
    application_key: SecretString,
    min_interval: Duration,
    cooldown: Duration,
    state: Mutex<RateLimitState>,
}

impl RateLimitedHttpClient {
    /// Create a client talking to the real vendor over HTTPS
    pub fn from_config(config: &VendorConfig) -> Result<Self, BackfillError> {
        let transport = ReqwestTransport::new(config.request_timeout)?;
        Ok(Self::new(Arc::new(transport), config))
    }

    pub fn new(transport: Arc<dyn Transport>, config: &VendorConfig) -> Self {
        info!(
            "Initializing vendor client: base_url={}, min_interval={:?}, cooldown={:?}",
            config.base_url, config.min_interval, config.cooldown
        );
        Self {
            transport,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: SecretString::new(config.api_key.clone().into()),
            application_key: SecretString::new(config.application_key.clone().into()),
            min_interval: config.min_interval,
            cooldown: config.cooldown,
            state: Mutex::new(RateLimitState::default()),
        }
    }

    /// Configured wait after a rate limit rejection
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// GET `path` relative to the base URL and decode the JSON body.
    ///
    /// Waits for the pacing gate before each attempt. A 429 puts the gate
    /// into cooldown and the request is retried exactly once after it; a
    /// second 429 is returned as [`BackfillError::RateLimited`]. Every
    /// request actually sent increments `requests`.
    pub(crate) async fn fetch(
        &self,
        path: &str,
        params: &[(&str, String)],
        requests: &mut u64,
    ) -> Result<Value, BackfillError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut query: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        query.push(("apiKey".to_string(), self.api_key.expose_secret().to_string()));
        query.push((
            "applicationKey".to_string(),
            self.application_key.expose_secret().to_string(),
        ));

        // Held for the whole exchange: callers queue here
        let mut state = self.state.lock().await;
        let mut first_rejection: Option<Instant> = None;
        let mut attempts = 0u32;

        loop {
            if let Some(slot) = state.next_slot(self.min_interval) {
                sleep_until(slot).await;
            }
            state.last_request = Some(Instant::now());
            state.cooldown_until = None;
            attempts += 1;
            *requests += 1;

            debug!("GET {} (attempt {})", url, attempts);
            let response = self.transport.get(&url, &query).await?;

            if response.status == TOO_MANY_REQUESTS {
                if first_rejection.is_some() {
                    warn!("Still rate limited after cooldown, giving up on {}", url);
                    return Err(BackfillError::RateLimited { attempts });
                }
                warn!(
                    "Rate limited by vendor, cooling down for {:?} before retrying",
                    self.cooldown
                );
                let now = Instant::now();
                first_rejection = Some(now);
                state.cooldown_until = Some(now + self.cooldown);
                continue;
            }

            if !(200..300).contains(&response.status) {
                return Err(BackfillError::Http {
                    status: response.status,
                    message: response.body.trim().to_string(),
                });
            }

            if let Some(rejected_at) = first_rejection {
                info!(
                    "Recovered from rate limit after {:?}",
                    rejected_at.elapsed()
                );
            }

            return Ok(serde_json::from_str(&response.body)?);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use super::*;

    /// Replays a fixed list of responses and records request times
    struct ScriptedTransport {
        responses: StdMutex<VecDeque<Result<TransportResponse, BackfillError>>>,
        calls: StdMutex<Vec<(Instant, Vec<(String, String)>)>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<TransportResponse, BackfillError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: StdMutex::new(responses.into()),
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().iter().map(|(t, _)| *t).collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(
            &self,
            _url: &str,
            query: &[(String, String)],
        ) -> Result<TransportResponse, BackfillError> {
            self.calls
                .lock()
                .unwrap()
                .push((Instant::now(), query.to_vec()));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ok("[]")))
        }
    }

    fn ok(body: &str) -> TransportResponse {
        TransportResponse {
            status: 200,
            body: body.to_string(),
        }
    }

    fn status(status: u16) -> TransportResponse {
        TransportResponse {
            status,
            body: "{\"error\":\"above-user-rate-limit\"}".to_string(),
        }
    }

    fn vendor_config() -> VendorConfig {
        VendorConfig {
            base_url: "https://vendor.test/v1/".to_string(),
            api_key: "api".to_string(),
            application_key: "app".to_string(),
            mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
            min_interval: Duration::from_millis(1100),
            cooldown: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            page_limit: 288,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_calls_are_paced() {
        let transport = ScriptedTransport::new(vec![]);
        let client = RateLimitedHttpClient::new(transport.clone(), &vendor_config());
        let mut requests = 0;

        let started = Instant::now();
        for _ in 0..5 {
            client.fetch("devices", &[], &mut requests).await.unwrap();
        }

        assert_eq!(requests, 5);
        assert!(started.elapsed() >= Duration::from_millis(4 * 1100));
        let times = transport.call_times();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(1100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_the_gate() {
        let transport = ScriptedTransport::new(vec![]);
        let client = Arc::new(RateLimitedHttpClient::new(
            transport.clone(),
            &vendor_config(),
        ));

        let a = {
            let client = client.clone();
            tokio::spawn(async move {
                let mut requests = 0;
                for _ in 0..3 {
                    client.fetch("devices/a", &[], &mut requests).await.unwrap();
                }
            })
        };
        let b = {
            let client = client.clone();
            tokio::spawn(async move {
                let mut requests = 0;
                for _ in 0..3 {
                    client.fetch("devices", &[], &mut requests).await.unwrap();
                }
            })
        };
        a.await.unwrap();
        b.await.unwrap();

        let mut times = transport.call_times();
        times.sort();
        assert_eq!(times.len(), 6);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(1100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_cooldown_then_success() {
        let transport = ScriptedTransport::new(vec![Ok(status(429)), Ok(ok("[{\"dateutc\":1}]"))]);
        let client = RateLimitedHttpClient::new(transport.clone(), &vendor_config());
        let mut requests = 0;

        let body = client.fetch("devices/x", &[], &mut requests).await.unwrap();

        assert_eq!(requests, 2);
        assert!(body.is_array());
        let times = transport.call_times();
        assert!(times[1] - times[0] >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_twice_surfaces_error() {
        let transport =
            ScriptedTransport::new(vec![Ok(status(429)), Ok(status(429)), Ok(ok("[]"))]);
        let client = RateLimitedHttpClient::new(transport.clone(), &vendor_config());
        let mut requests = 0;

        let result = client.fetch("devices/x", &[], &mut requests).await;

        assert!(matches!(
            result,
            Err(BackfillError::RateLimited { attempts: 2 })
        ));
        assert_eq!(requests, 2);
        assert_eq!(transport.call_times().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn http_errors_are_not_retried() {
        let transport = ScriptedTransport::new(vec![Ok(TransportResponse {
            status: 401,
            body: "invalid apiKey".to_string(),
        })]);
        let client = RateLimitedHttpClient::new(transport.clone(), &vendor_config());
        let mut requests = 0;

        let result = client.fetch("devices/x", &[], &mut requests).await;

        match result {
            Err(BackfillError::Http { status, message }) => {
                assert_eq!(status, 401);
                assert_eq!(message, "invalid apiKey");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn credentials_are_appended_to_query() {
        let transport = ScriptedTransport::new(vec![]);
        let client = RateLimitedHttpClient::new(transport.clone(), &vendor_config());
        let mut requests = 0;

        client
            .fetch("devices/x", &[("limit", "288".to_string())], &mut requests)
            .await
            .unwrap();

        let calls = transport.calls.lock().unwrap();
        let query = &calls[0].1;
        assert!(query.contains(&("limit".to_string(), "288".to_string())));
        assert!(query.contains(&("apiKey".to_string(), "api".to_string())));
        assert!(query.contains(&("applicationKey".to_string(), "app".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_propagate() {
        let transport = ScriptedTransport::new(vec![Err(BackfillError::Network(
            "connection reset".to_string(),
        ))]);
        let client = RateLimitedHttpClient::new(transport, &vendor_config());
        let mut requests = 0;

        let result = client.fetch("devices/x", &[], &mut requests).await;

        assert!(matches!(result, Err(BackfillError::Network(_))));
        assert_eq!(requests, 1);
    }
}
