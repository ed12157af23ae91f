//! Transport dispatcher: sends one wire request and awaits one response.
//!
//! # Design
//! - One request, one response, no implicit retries. Imports and deletes
//!   mutate remote state, so retrying is left to callers that know the
//!   operation is idempotent.
//! - The deadline and the caller's cancellation token race the exchange.
//!   The losing exchange future is dropped, which aborts the connection;
//!   nothing received so far is returned.
//! - `Transport` is the seam for the network. `HttpTransport` wraps a shared
//!   `reqwest::Client`, whose connection pool is safe for concurrent calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::http::{RawResponse, WireRequest};
use crate::log::{CallSite, LogSink, Severity};

/// Performs the network exchange for a wire request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: WireRequest) -> Result<RawResponse, TransportError>;
}

/// Production transport over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a pooled client. Redirects are not followed so that a moved
    /// endpoint surfaces as `UnexpectedStatus` instead of a silent GET.
    pub fn new(user_agent: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| TransportError::ConnectionFailed(format!("building HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: WireRequest) -> Result<RawResponse, TransportError> {
        let mut builder = self
            .client
            .post(&request.uri)
            .header(CONTENT_TYPE, &request.content_type);
        if let Some(accept) = &request.accept {
            builder = builder.header(ACCEPT, accept);
        }

        let response = builder.body(request.body).send().await.map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

        Ok(RawResponse { status, headers, body })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout(Duration::ZERO);
    }
    TransportError::ConnectionFailed(err.to_string())
}

/// Bounds on a single exchange.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self { timeout: Some(timeout), cancel: None }
    }

    pub fn cancelled_by(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Sends requests through a `Transport`, enforcing deadlines.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn LogSink>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, sink: Arc<dyn LogSink>) -> Self {
        Self { transport, sink }
    }

    /// Send `request` and wait for the response or the deadline.
    ///
    /// Statuses that never carry an in-band error (3xx, or a failure with an
    /// empty body) become `UnexpectedStatus`; everything else is returned for
    /// classification.
    pub async fn send(
        &self,
        request: WireRequest,
        deadline: &Deadline,
        site: &CallSite,
    ) -> Result<RawResponse, TransportError> {
        self.sink.log(
            Severity::Debug,
            &format!("POST {} ({} bytes, {})", request.uri, request.body.len(), request.content_type),
            site,
        );

        let exchange = self.transport.execute(request);
        let bounded = async {
            match deadline.timeout {
                Some(limit) => match tokio::time::timeout(limit, exchange).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout(limit)),
                },
                None => exchange.await,
            }
        };

        let outcome = match &deadline.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(TransportError::Cancelled),
                result = bounded => result,
            },
            None => bounded.await,
        };

        let outcome = outcome.map_err(|err| match (err, deadline.timeout) {
            (TransportError::Timeout(_), Some(limit)) => TransportError::Timeout(limit),
            (other, _) => other,
        });

        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                self.sink.log(Severity::Warn, &format!("exchange failed: {err}"), site);
                return Err(err);
            }
        };

        self.sink.log(
            Severity::Debug,
            &format!("HTTP {} ({} bytes)", response.status, response.body.len()),
            site,
        );

        let redirected = (300..400).contains(&response.status);
        let empty_failure = !response.is_success() && response.body.is_empty();
        if redirected || empty_failure {
            self.sink.log(Severity::Warn, &format!("unexpected HTTP status {}", response.status), site);
            return Err(TransportError::UnexpectedStatus(response.status));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use uuid::Uuid;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::log::testing::RecordingSink;
    use crate::log::{Stage, TracingLogSink};

    fn site() -> CallSite {
        CallSite::new(Uuid::nil(), "version/export", Stage::Dispatch)
    }

    fn request(uri: &str) -> WireRequest {
        WireRequest {
            uri: uri.to_string(),
            content_type: "application/x-www-form-urlencoded".to_string(),
            accept: Some("application/json".to_string()),
            body: b"token=T&content=version".to_vec(),
            fields: vec![("content".to_string(), "version".to_string())],
        }
    }

    fn dispatcher() -> Dispatcher {
        let transport = HttpTransport::new("redcap-core-tests").unwrap();
        Dispatcher::new(Arc::new(transport), Arc::new(TracingLogSink))
    }

    /// Counts calls and answers after a fixed delay.
    struct SlowTransport {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for SlowTransport {
        async fn execute(&self, _request: WireRequest) -> Result<RawResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(RawResponse { status: 200, headers: Vec::new(), body: b"late".to_vec() })
        }
    }

    #[tokio::test]
    async fn returns_raw_response_with_lowercased_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(header("accept", "application/json"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(b"14.0.1".to_vec(), "text/html; charset=UTF-8"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let response = dispatcher()
            .send(request(&server.uri()), &Deadline::default(), &site())
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"14.0.1");
        assert_eq!(response.header("Content-Type"), Some("text/html; charset=UTF-8"));
        assert!(response.headers.iter().all(|(k, _)| k == &k.to_ascii_lowercase()));
    }

    #[tokio::test]
    async fn deadline_shorter_than_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let limit = Duration::from_millis(50);
        let err = dispatcher()
            .send(request(&server.uri()), &Deadline::after(limit), &site())
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout(limit));
    }

    #[tokio::test]
    async fn cancellation_aborts_the_exchange_without_retry() {
        let transport = Arc::new(SlowTransport { delay: Duration::from_secs(5), calls: AtomicUsize::new(0) });
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Dispatcher::new(transport.clone(), sink.clone());
        let token = CancellationToken::new();
        let deadline = Deadline::default().cancelled_by(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let err = dispatcher.send(request("http://unused"), &deadline, &site()).await.unwrap_err();
        canceller.await.unwrap();

        assert_eq!(err, TransportError::Cancelled);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(sink.messages().iter().any(|m| m.contains("cancelled")));
    }

    #[tokio::test]
    async fn server_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string(r#"{"error":"boom"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let response = dispatcher()
            .send(request(&server.uri()), &Deadline::default(), &site())
            .await
            .unwrap();
        assert_eq!(response.status, 500);
    }

    #[tokio::test]
    async fn empty_failure_and_redirect_are_unexpected_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/elsewhere"))
            .mount(&server)
            .await;
        let err = dispatcher()
            .send(request(&server.uri()), &Deadline::default(), &site())
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::UnexpectedStatus(302));

        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(502)).mount(&server).await;
        let err = dispatcher()
            .send(request(&server.uri()), &Deadline::default(), &site())
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::UnexpectedStatus(502));
    }

    #[tokio::test]
    async fn refused_connection_is_connection_failed() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = dispatcher()
            .send(request(&format!("http://{addr}/api/")), &Deadline::after(Duration::from_secs(5)), &site())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)), "{err:?}");
    }
}
