use crate::config::{HarnessConfig, MockConfig, TargetMode};
use crate::error::{HarnessError, RequestError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::sleep;

/// Status and body returned by the target service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    pub status: u16,
    pub body: String,
}

impl ServiceResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub type ServiceFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<ServiceResponse, RequestError>> + Send + 'a>>;

/// The text processing service under load.
pub trait TargetService: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write-style call: submit one line to the configured processing function.
    fn analyze<'a>(&'a self, line: &'a str) -> ServiceFuture<'a>;

    /// Read-style call: look up the aggregated result for one term.
    fn lookup<'a>(&'a self, term: &'a str) -> ServiceFuture<'a>;

    /// Prove the service is reachable before the run starts.
    fn preflight(&self) -> ServiceFuture<'_> {
        Box::pin(async {
            Ok(ServiceResponse {
                status: 200,
                body: String::new(),
            })
        })
    }
}

/// Build the adapter selected by `target.mode`.
pub fn build_target(config: &HarnessConfig) -> Result<Arc<dyn TargetService>> {
    let target: Arc<dyn TargetService> = match config.target.mode {
        TargetMode::Mock => Arc::new(MockTarget::new(config.mock.clone())),
        TargetMode::Http => Arc::new(HttpTarget::new(
            &config.target.base_url,
            &config.target.function,
            config.target.timeout_ms,
        )?),
    };
    Ok(target)
}

#[derive(Serialize)]
struct TextLine<'a> {
    message: &'a str,
}

/// HTTP/JSON adapter for the text processing servlet
pub struct HttpTarget {
    client: reqwest::Client,
    base: url::Url,
    analyze_url: url::Url,
    function: String,
}

impl HttpTarget {
    pub fn new(base_url: &str, function: &str, timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        let base = url::Url::parse(base_url)
            .map_err(|e| HarnessError::Config(format!("invalid base URL {base_url}: {e}")))?;
        let analyze_url = endpoint(&base, &["textbody", function])
            .map_err(|e| HarnessError::Config(format!("base URL {base_url}: {e}")))?;

        Ok(Self {
            client,
            base,
            analyze_url,
            function: function.to_string(),
        })
    }

    async fn read_response(
        response: reqwest::Response,
    ) -> std::result::Result<ServiceResponse, RequestError> {
        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify)?;
        Ok(ServiceResponse { status, body })
    }
}

fn endpoint(base: &url::Url, segments: &[&str]) -> std::result::Result<url::Url, String> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| "URL cannot carry a path".to_string())?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn classify(e: reqwest::Error) -> RequestError {
    if e.is_timeout() {
        RequestError::Timeout
    } else {
        RequestError::Transport(e.to_string())
    }
}

impl TargetService for HttpTarget {
    fn name(&self) -> &'static str {
        "http"
    }

    fn analyze<'a>(&'a self, line: &'a str) -> ServiceFuture<'a> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.analyze_url.clone())
                .json(&TextLine { message: line })
                .send()
                .await
                .map_err(classify)?;
            Self::read_response(response).await
        })
    }

    fn lookup<'a>(&'a self, term: &'a str) -> ServiceFuture<'a> {
        Box::pin(async move {
            let url = endpoint(&self.base, &["textbody", self.function.as_str(), term])
                .map_err(RequestError::Transport)?;
            let response = self.client.get(url).send().await.map_err(classify)?;
            Self::read_response(response).await
        })
    }

    fn preflight(&self) -> ServiceFuture<'_> {
        Box::pin(async move {
            // Any HTTP status proves the service is reachable.
            let response = self
                .client
                .get(self.base.clone())
                .send()
                .await
                .map_err(classify)?;
            Ok(ServiceResponse {
                status: response.status().as_u16(),
                body: String::new(),
            })
        })
    }
}

/// In-process target for dry runs and tests (configurable delay and failure rate)
pub struct MockTarget {
    delay: Duration,
    failure_rate: f64,
    rng: Mutex<StdRng>,
    analyzed: AtomicU64,
    looked_up: AtomicU64,
}

impl MockTarget {
    pub fn new(config: MockConfig) -> Self {
        Self {
            delay: Duration::from_millis(config.delay_ms),
            failure_rate: config.failure_rate.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            analyzed: AtomicU64::new(0),
            looked_up: AtomicU64::new(0),
        }
    }

    /// Number of write-style calls received so far.
    pub fn analyzed(&self) -> u64 {
        self.analyzed.load(Ordering::Acquire)
    }

    pub fn looked_up(&self) -> u64 {
        self.looked_up.load(Ordering::Acquire)
    }

    fn should_fail(&self) -> bool {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.gen_bool(self.failure_rate)
    }
}

impl TargetService for MockTarget {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn analyze<'a>(&'a self, line: &'a str) -> ServiceFuture<'a> {
        Box::pin(async move {
            sleep(self.delay).await;
            self.analyzed.fetch_add(1, Ordering::Relaxed);

            if self.should_fail() {
                return Ok(ServiceResponse {
                    status: 500,
                    body: "fail to process the text line message".to_string(),
                });
            }
            Ok(ServiceResponse {
                status: 200,
                body: line.split_whitespace().count().to_string(),
            })
        })
    }

    fn lookup<'a>(&'a self, term: &'a str) -> ServiceFuture<'a> {
        Box::pin(async move {
            sleep(self.delay).await;
            self.looked_up.fetch_add(1, Ordering::Relaxed);

            if term.is_empty() {
                return Ok(ServiceResponse {
                    status: 404,
                    body: "the word is not found".to_string(),
                });
            }
            Ok(ServiceResponse {
                status: 200,
                body: term.len().to_string(),
            })
        })
    }
}
