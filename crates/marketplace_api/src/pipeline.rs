use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, Offset};
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{ApiError, Classification, CredentialProvider, Endpoint, ErrorClassifier, ResponseBody};

/// Header the bot-detection layer sets on challenge responses.
pub const CAPTCHA_HEADER: &str = "X-DD-B";

/// Transport and retry settings for the [`RequestPipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// API root, ending in `/`.
    pub base_url: String,
    /// Sent as the `User-Agent` header.
    pub user_agent: String,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Per-read timeout.
    pub read_timeout: Duration,
    /// Sends per request when the connection fails mid-exchange.
    pub send_attempts: u32,
    /// Attempts for the whole operation on transport failures and 5xx responses.
    pub operation_attempts: u32,
    /// Pause between operation attempts.
    pub retry_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: "https://apptoogoodtogo.com/api/".to_string(),
            user_agent: "TGTG/25.6.0 Dalvik/2.1.0 (Linux; U; Android 14; Pixel 8 Build/UQ1A.240105.004)"
                .to_string(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(2),
            send_attempts: 2,
            operation_attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Told when the server answers with a bot-detection challenge.
#[async_trait]
pub trait CaptchaListener: Send + Sync {
    /// Called once per challenge response, before the error reaches the caller.
    async fn on_captcha(&self, endpoint: Endpoint);
}

/// Sends API requests and classifies their responses.
///
/// Each call:
/// 1. refreshes credentials when the access token has expired,
/// 2. resends on mid-exchange transport failures,
/// 3. on a 401 forces one refresh and resends once,
/// 4. repeats the whole operation after a fixed delay on transport failures and 5xx responses.
pub struct RequestPipeline {
    client: Client,
    config: PipelineConfig,
    credentials: Arc<dyn CredentialProvider>,
    captcha_listener: Option<Arc<dyn CaptchaListener>>,
}

impl RequestPipeline {
    /// Creates a pipeline with its own HTTP client.
    pub fn new(
        config: PipelineConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ApiError> {
        let client = Self::build_client(&config)?;
        Ok(Self {
            client,
            config,
            credentials,
            captcha_listener: None,
        })
    }

    /// Builds an HTTP client with the configured timeouts.
    pub fn build_client(config: &PipelineConfig) -> Result<Client, ApiError> {
        Ok(Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .user_agent(config.user_agent.clone())
            .cookie_store(true)
            .build()?)
    }

    /// Registers the listener told about challenge responses.
    pub fn with_captcha_listener(mut self, listener: Arc<dyn CaptchaListener>) -> Self {
        self.captcha_listener = Some(listener);
        self
    }

    /// The credential source used for authenticated requests.
    pub fn credentials(&self) -> &Arc<dyn CredentialProvider> {
        &self.credentials
    }

    /// POSTs `json` to `endpoint`, filling its path with `path_params`.
    pub fn send(
        &self,
        endpoint: Endpoint,
        path_params: &[&(dyn fmt::Display + Sync)],
        json: Option<Value>,
    ) -> impl Future<Output = Result<Value, ApiError>> + Send + '_ {
        let path = endpoint.path(path_params);
        self.send_path(endpoint, path, json)
    }

    async fn send_path(
        &self,
        endpoint: Endpoint,
        path: String,
        json: Option<Value>,
    ) -> Result<Value, ApiError> {
        let attempts = self.config.operation_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.send_authenticated(endpoint, &path, json.as_ref()).await {
                Err(error) if error.is_retryable() && attempt < attempts => {
                    warn!(
                        "Attempt {}/{} for {} failed: {}",
                        attempt, attempts, path, error
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn send_authenticated(
        &self,
        endpoint: Endpoint,
        path: &str,
        json: Option<&Value>,
    ) -> Result<Value, ApiError> {
        if endpoint.requires_credentials() {
            self.credentials.ensure_fresh().await?;
        }

        match self.exchange(endpoint, path, json).await? {
            Classification::RefreshCredentials => {
                warn!("Unauthorized on {}, refreshing credentials", path);
                self.credentials
                    .refresh()
                    .await
                    .map_err(|e| ApiError::InvalidCredentials(e.to_string()))?;

                match self.exchange(endpoint, path, json).await? {
                    Classification::RefreshCredentials => Err(ApiError::InvalidCredentials(
                        "access token rejected after refresh".to_string(),
                    )),
                    classification => self.resolve(endpoint, path, classification).await,
                }
            }
            classification => self.resolve(endpoint, path, classification).await,
        }
    }

    async fn resolve(
        &self,
        endpoint: Endpoint,
        path: &str,
        classification: Classification,
    ) -> Result<Value, ApiError> {
        match classification {
            Classification::Success(value) => Ok(value),
            Classification::Captcha => {
                error!("CAPTCHA challenge on {}", path);
                if let Some(listener) = &self.captcha_listener {
                    listener.on_captcha(endpoint).await;
                }
                Err(ApiError::Captcha)
            }
            Classification::Failure(error) => {
                if let ApiError::Http { status, body } = &error {
                    error!("{} on {}: {}", status, path, body);
                }
                Err(error)
            }
            Classification::RefreshCredentials => Err(ApiError::InvalidCredentials(
                "access token rejected".to_string(),
            )),
        }
    }

    /// One request/response exchange, resending on mid-exchange transport failures.
    async fn exchange(
        &self,
        endpoint: Endpoint,
        path: &str,
        json: Option<&Value>,
    ) -> Result<Classification, ApiError> {
        let attempts = self.config.send_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.exchange_once(endpoint, path, json).await {
                Err(error) if attempt < attempts && is_resendable(&error) => {
                    debug!("Resending {} after {}", path, error);
                    attempt += 1;
                }
                result => return result.map_err(ApiError::from),
            }
        }
    }

    async fn exchange_once(
        &self,
        endpoint: Endpoint,
        path: &str,
        json: Option<&Value>,
    ) -> Result<Classification, reqwest::Error> {
        let response = self.request(endpoint, path, json).send().await?;
        let status = response.status().as_u16();
        let captcha_marker = response.headers().contains_key(CAPTCHA_HEADER);
        let body = ResponseBody::from_bytes(&response.bytes().await?);
        debug!("{} {}", status, path);

        Ok(ErrorClassifier.classify(endpoint, status, captcha_marker, body))
    }

    fn request(&self, endpoint: Endpoint, path: &str, json: Option<&Value>) -> RequestBuilder {
        let url = format!("{}{}", self.config.base_url, path);
        let mut request = self
            .client
            .post(url)
            .header("X-Correlation-ID", Uuid::new_v4().to_string());

        if endpoint.sends_clock_headers() {
            request = request
                .header("X-24HourFormat", "false")
                .header("X-TimezoneOffset", timezone_offset());
        }
        if endpoint.requires_credentials() {
            request = request.bearer_auth(self.credentials.current().access_token);
        }
        match json {
            Some(json) => request.json(json),
            None => request,
        }
    }
}

impl fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("config", &self.config)
            .field("captcha_listener", &self.captcha_listener.is_some())
            .finish()
    }
}

/// Failures where the request may not have reached the server intact.
fn is_resendable(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_request() || error.is_body()
}

/// Local UTC offset as `+HH:MM`, or `Z` at UTC.
fn timezone_offset() -> String {
    let seconds = Local::now().offset().fix().local_minus_utc();
    if seconds == 0 {
        return "Z".to_string();
    }
    let sign = if seconds < 0 { '-' } else { '+' };
    let minutes = seconds.abs() / 60;
    format!("{sign}{:02}:{:02}", minutes / 60, minutes % 60)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::Credentials;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use serde_json::json;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Credentials that never expire; refreshing swaps in the next token.
    #[derive(Default)]
    pub(crate) struct StaticCredentials {
        token: Mutex<String>,
        pub(crate) refreshes: AtomicUsize,
    }

    #[async_trait]
    impl CredentialProvider for StaticCredentials {
        fn current(&self) -> Credentials {
            Credentials {
                access_token: self.token.lock().unwrap().clone(),
                refresh_token: "refresh".into(),
            }
        }

        fn needs_refresh(&self) -> bool {
            false
        }

        async fn refresh(&self) -> Result<Credentials, ApiError> {
            let count = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            *self.token.lock().unwrap() = format!("token-{count}");
            Ok(self.current())
        }
    }

    #[derive(Default)]
    struct CountingListener(AtomicUsize);

    #[async_trait]
    impl CaptchaListener for CountingListener {
        async fn on_captcha(&self, _endpoint: Endpoint) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn test_config(server: &MockServer) -> PipelineConfig {
        PipelineConfig {
            base_url: format!("{}/", server.uri()),
            retry_delay: Duration::from_millis(10),
            ..PipelineConfig::default()
        }
    }

    fn pipeline(server: &MockServer, credentials: Arc<StaticCredentials>) -> RequestPipeline {
        RequestPipeline::new(test_config(server), credentials).unwrap()
    }

    #[tokio::test]
    async fn test_sends_headers_and_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/item/v8/42"))
            .and(header("X-24HourFormat", "false"))
            .and(header_exists("X-TimezoneOffset"))
            .and(header_exists("X-Correlation-ID"))
            .and(header("Authorization", "Bearer token-0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let credentials = Arc::new(StaticCredentials::default());
        *credentials.token.lock().unwrap() = "token-0".into();
        let value = pipeline(&server, credentials)
            .send(Endpoint::ItemStatus, &[&42u64], Some(json!({})))
            .await
            .unwrap();

        assert_eq!(value, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_once_and_resends() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/order/v8/abc"))
            .and(header("Authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "SUCCESS"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/order/v8/abc"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let credentials = Arc::new(StaticCredentials::default());
        let value = pipeline(&server, credentials.clone())
            .send(Endpoint::OrderStatus, &[&"abc"], None)
            .await
            .unwrap();

        assert_eq!(value["state"], "SUCCESS");
        assert_eq!(credentials.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_unauthorized_is_invalid_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let credentials = Arc::new(StaticCredentials::default());
        let result = pipeline(&server, credentials.clone())
            .send(Endpoint::Favorites, &[], Some(json!({})))
            .await;

        assert!(matches!(result, Err(ApiError::InvalidCredentials(_))));
        assert_eq!(credentials.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_three_times() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let result = pipeline(&server, Arc::default())
            .send(Endpoint::OrderCreate, &[&1u64], Some(json!({"item_count": 1})))
            .await;

        assert!(matches!(result, Err(ApiError::Http { status: 503, .. })));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
            .expect(1)
            .mount(&server)
            .await;

        let result = pipeline(&server, Arc::default())
            .send(Endpoint::OrderStatus, &[&"x"], None)
            .await;

        match result {
            Err(ApiError::Http { status, body }) => {
                assert_eq!(status, 404);
                assert_eq!(body, json!("missing"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_captcha_notifies_listener_and_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).insert_header(CAPTCHA_HEADER, "1"))
            .expect(1)
            .mount(&server)
            .await;

        let listener = Arc::new(CountingListener::default());
        let pipeline = pipeline(&server, Arc::default()).with_captcha_listener(listener.clone());
        let result = pipeline.send(Endpoint::Favorites, &[], None).await;

        assert!(matches!(result, Err(ApiError::Captcha)));
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_responses_time_out_as_transport_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let config = PipelineConfig {
            read_timeout: Duration::from_millis(50),
            operation_attempts: 1,
            ..test_config(&server)
        };
        let pipeline = RequestPipeline::new(config, Arc::new(StaticCredentials::default())).unwrap();
        let result = pipeline.send(Endpoint::Favorites, &[], None).await;

        assert!(matches!(result, Err(ApiError::Transport(_))));
        // one operation, two sends
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[test]
    fn test_timezone_offset_format() {
        let offset = timezone_offset();
        assert!(offset == "Z" || (offset.len() == 6 && offset.as_bytes()[3] == b':'));
    }
}
