use reqwest::{RequestBuilder, Response, StatusCode};
use thiserror::Error;

/// Default number of attempts per request.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Why a single HTTP attempt did not succeed.
#[derive(Debug, Error)]
pub enum AttemptFailure {
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("request timed out")]
    Timeout,

    #[error("too many redirects")]
    TooManyRedirects,

    #[error("transport error: {0}")]
    Transport(String),
}

impl AttemptFailure {
    /// Classifies a reqwest send error.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_redirect() {
            Self::TooManyRedirects
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    GiveUp,
}

/// Bounded retry policy.
///
/// Non-200 responses and timeouts are retried; redirect loops and other
/// transport errors end the request immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Decides whether attempt number `attempt` (1-based) should be followed
    /// by another.
    pub fn decide(&self, attempt: u32, failure: &AttemptFailure) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        match failure {
            AttemptFailure::Status { .. } | AttemptFailure::Timeout => RetryDecision::Retry,
            AttemptFailure::TooManyRedirects | AttemptFailure::Transport(_) => {
                RetryDecision::GiveUp
            }
        }
    }

    /// Sends the request built by `build` until it returns `200 OK` or the
    /// policy gives up. `build` is called once per attempt.
    pub async fn send<F>(&self, target: &str, build: F) -> RetriedResponse
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let failure = match build().send().await {
                Ok(resp) if resp.status() == StatusCode::OK => {
                    return RetriedResponse {
                        attempts: attempt,
                        result: Ok(resp),
                    };
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    tracing::warn!(target_url = target, attempt, %status, body = %body, "request rejected");
                    AttemptFailure::Status { status, body }
                }
                Err(e) => {
                    let failure = AttemptFailure::from_reqwest(&e);
                    match failure {
                        AttemptFailure::Timeout => {
                            tracing::warn!(target_url = target, attempt, "request timed out, reattempting");
                        }
                        _ => {
                            tracing::warn!(target_url = target, attempt, error = %e, "request failed");
                        }
                    }
                    failure
                }
            };

            if self.decide(attempt, &failure) == RetryDecision::GiveUp {
                tracing::error!(target_url = target, attempts = attempt, "gave up after {attempt} attempts");
                return RetriedResponse {
                    attempts: attempt,
                    result: Err(failure),
                };
            }
        }
    }
}

/// Result of a retried request together with the attempts it took.
#[derive(Debug)]
pub struct RetriedResponse {
    pub attempts: u32,
    pub result: Result<Response, AttemptFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_failure() -> AttemptFailure {
        AttemptFailure::Status {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: String::new(),
        }
    }

    #[test]
    fn test_retryable_failures() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(1, &status_failure()), RetryDecision::Retry);
        assert_eq!(policy.decide(2, &AttemptFailure::Timeout), RetryDecision::Retry);
    }

    #[test]
    fn test_non_retryable_failures() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(1, &AttemptFailure::TooManyRedirects),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy.decide(1, &AttemptFailure::Transport("refused".to_string())),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_gives_up_at_max_attempts() {
        let policy = RetryPolicy { max_attempts: 3 };
        assert_eq!(policy.decide(3, &status_failure()), RetryDecision::GiveUp);
        assert_eq!(policy.decide(3, &AttemptFailure::Timeout), RetryDecision::GiveUp);
    }

    #[test]
    fn test_single_attempt_policy() {
        let policy = RetryPolicy { max_attempts: 1 };
        assert_eq!(policy.decide(1, &status_failure()), RetryDecision::GiveUp);
    }

    #[tokio::test]
    async fn test_send_retries_until_ok() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = server.uri();
        let out = RetryPolicy::default()
            .send(&url, || client.get(&url))
            .await;

        assert_eq!(out.attempts, 2);
        assert!(out.result.is_ok());
    }

    #[tokio::test]
    async fn test_send_connection_refused_gives_up_immediately() {
        // Bind then drop a listener to get a port nothing is serving.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let client = reqwest::Client::new();
        let url = format!("http://{addr}/");
        let out = RetryPolicy::default()
            .send(&url, || client.get(&url))
            .await;

        assert_eq!(out.attempts, 1);
        assert!(matches!(out.result, Err(AttemptFailure::Transport(_))));
    }
}
