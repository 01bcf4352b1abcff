use reqwest::{
    RequestBuilder,
    header::{HeaderValue, RETRY_AFTER},
};
use serde_json::Value;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::error::FetchError;

pub fn parse_retry_after(value: Option<&HeaderValue>) -> Option<Duration> {
    let value = value?.to_str().ok()?.trim();
    let secs = value.parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

pub fn truncate_for_log(text: &str) -> String {
    let trimmed = text.trim();
    let max_len = 300usize;
    if trimmed.len() <= max_len {
        return trimmed.to_string();
    }
    let mut end = max_len;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}

/// Trims a string, returning `None` when nothing is left.
pub fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}

/// Whether a response body looks like an anti-automation interstitial.
pub fn looks_blocked(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("captcha") || lower.contains("blocked") || lower.contains("access denied")
}

/// Sends a request and returns the body of a successful response.
///
/// Non-2xx statuses are classified through [`FetchError::from_status`].
pub async fn fetch_text(request: RequestBuilder) -> Result<String, FetchError> {
    let resp = request.send().await?;
    let status = resp.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
        let body = resp.text().await.unwrap_or_default();
        return Err(FetchError::from_status(
            status,
            retry_after,
            &truncate_for_log(&body),
        ));
    }
    Ok(resp.text().await?)
}

/// Parses a JSON body; challenge pages become `Blocked`, anything else unparsable `Malformed`.
pub fn parse_json_body(body: &str) -> Result<Value, FetchError> {
    serde_json::from_str(body).map_err(|err| {
        if looks_blocked(body) {
            FetchError::Blocked(format!(
                "non-JSON challenge page ({err}): {}",
                truncate_for_log(body)
            ))
        } else {
            FetchError::Malformed(format!("invalid JSON ({err}): {}", truncate_for_log(body)))
        }
    })
}

pub fn install_ctrlc_handler(shutdown_requested: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let was_set = shutdown_requested.swap(true, Ordering::SeqCst);
            if !was_set {
                tracing::warn!(
                    "Received Ctrl-C. Finishing in-flight batches, saving progress, and exiting..."
                );
            }
        }
    });
}

pub fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
