//! Legacy Authenticode timestamp-authority client.
//!
//! The protocol predates RFC 3161: the request is a base64-encoded
//! `SpcTimeStampRequest` POSTed as the body, and the response is a base64
//! PKCS7 SignedData whose SignerInfo becomes the countersignature.

use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, warn};
use reqwest::blocking::Client;

use super::spc::spc_timestamp_request;
use crate::error::{DeployError, DeployResult};

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// POST the signature to `url` and return the decoded PKCS7 response.
///
/// Transient failures are retried with exponential back-off; after the last
/// attempt the error is fatal to the whole signing operation.
pub fn request_countersignature(url: &str, signature: &[u8]) -> DeployResult<Vec<u8>> {
    let body = STANDARD.encode(spc_timestamp_request(signature));
    let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
    let response = send_with_retry(
        url,
        &body,
        |url, body| post_once(&client, url, body),
        thread::sleep,
    )?;
    decode_response(&response)
}

/// The bounded retry loop, with the transport and clock injected so the
/// schedule is testable without a listener.
fn send_with_retry<P, S>(url: &str, body: &str, mut post: P, mut sleep: S) -> DeployResult<String>
where
    P: FnMut(&str, &str) -> DeployResult<String>,
    S: FnMut(Duration),
{
    let mut backoff = INITIAL_BACKOFF;
    let mut last_error = None;
    for attempt in 1..=MAX_ATTEMPTS {
        debug!("timestamp request to {url} (attempt {attempt}/{MAX_ATTEMPTS})");
        match post(url, body) {
            Ok(response) => return Ok(response),
            Err(error) => {
                warn!("timestamp attempt {attempt} failed: {error}");
                last_error = Some(error);
                if attempt < MAX_ATTEMPTS {
                    sleep(backoff);
                    backoff *= 2;
                }
            }
        }
    }
    Err(DeployError::TimestampFailed(format!(
        "no response from {url} after {MAX_ATTEMPTS} attempts: {}",
        last_error.map_or_else(|| "unknown error".into(), |e| e.to_string())
    )))
}

fn post_once(client: &Client, url: &str, body: &str) -> DeployResult<String> {
    let response = client
        .post(url)
        .header("Content-Type", "application/octet-stream")
        .header("Accept", "application/octet-stream")
        .body(body.to_owned())
        .send()?;
    let status = response.status();
    if !status.is_success() {
        return Err(DeployError::TimestampFailed(format!(
            "timestamp authority answered {status}"
        )));
    }
    Ok(response.text()?)
}

fn decode_response(text: &str) -> DeployResult<Vec<u8>> {
    let stripped: String = text.split_whitespace().collect();
    STANDARD.decode(stripped.as_bytes()).map_err(|e| {
        DeployError::BadTimestampResponse(format!("response is not valid base64: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_response_strips_whitespace() {
        let encoded = STANDARD.encode(b"pkcs7");
        let wrapped = format!("{}\r\n{}", &encoded[..4], &encoded[4..]);
        assert_eq!(decode_response(&wrapped).unwrap(), b"pkcs7");
    }

    #[test]
    fn test_decode_response_rejects_garbage() {
        assert!(matches!(
            decode_response("<html>504 Gateway Timeout</html>"),
            Err(DeployError::BadTimestampResponse(_))
        ));
    }

    #[test]
    fn test_retry_exhausts_with_doubling_backoff() {
        let mut attempts = 0u32;
        let mut delays = Vec::new();
        let result = send_with_retry(
            "http://ts.invalid",
            "body",
            |_, _| {
                attempts += 1;
                Err(DeployError::TimestampFailed("connection refused".into()))
            },
            |delay| delays.push(delay),
        );

        assert!(matches!(result, Err(DeployError::TimestampFailed(_))));
        assert_eq!(attempts, MAX_ATTEMPTS);
        // Four sleeps between five attempts, doubling from 50 ms.
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(50),
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ]
        );
    }

    #[test]
    fn test_retry_stops_on_first_success() {
        let mut attempts = 0u32;
        let mut slept = 0u32;
        let result = send_with_retry(
            "http://ts.invalid",
            "body",
            |_, _| {
                attempts += 1;
                if attempts < 3 {
                    Err(DeployError::TimestampFailed("flaky".into()))
                } else {
                    Ok("response".into())
                }
            },
            |_| slept += 1,
        );

        assert_eq!(result.unwrap(), "response");
        assert_eq!(attempts, 3);
        assert_eq!(slept, 2);
    }
}
