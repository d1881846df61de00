use super::protocol::{ENDPOINT_RPC, ForwardOptions};
use crate::error::ForwardError;

/// Delivers encoded calls to `http://<destination>/rpc/<method>`.
///
/// Transport failures and timeouts are retried on the fixed schedule of
/// `ForwardOptions`. Once the destination answers, the body is returned as-is
/// whatever the HTTP status: failures are carried inside the `Response`.
#[derive(Clone)]
pub struct HttpForwarder {
    http_client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new() -> Self {
        Self {
            http_client: reqwest::Client::new(),
        }
    }

    pub async fn forward(
        &self,
        destination: &str,
        method: &str,
        payload: Vec<u8>,
        options: &ForwardOptions,
    ) -> Result<Vec<u8>, ForwardError> {
        let url = format!("http://{}{}/{}", destination, ENDPOINT_RPC, method);
        let attempts = options.attempts();
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = options.backoff(attempt - 1);
                tracing::warn!(
                    "Retrying {} on {} in {:?} (attempt {}/{}): {}",
                    method,
                    destination,
                    delay,
                    attempt + 1,
                    attempts,
                    last_error
                );
                tokio::time::sleep(delay).await;
            }

            let response = self
                .http_client
                .post(url.clone())
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(payload.clone())
                .timeout(options.timeout)
                .send()
                .await;

            match response {
                Ok(resp) => match resp.bytes().await {
                    Ok(body) => {
                        tracing::debug!("Forwarded {} to {} on attempt {}", method, destination, attempt + 1);
                        return Ok(body.to_vec());
                    }
                    Err(e) => last_error = e.to_string(),
                },
                Err(e) => last_error = e.to_string(),
            }
        }

        Err(ForwardError::Exhausted {
            node: destination.to_string(),
            attempts,
            reason: last_error,
        })
    }
}

impl Default for HttpForwarder {
    fn default() -> Self {
        Self::new()
    }
}
