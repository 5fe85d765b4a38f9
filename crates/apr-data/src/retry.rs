//! Exponential backoff around flaky remote calls.

use std::future::Future;
use std::time::Duration;

use alloy::transports::{RpcError, TransportError, TransportErrorKind};
use eyre::{Report, Result, WrapErr};
use tracing::warn;

use crate::error::FatalError;

/// Backoff schedule: `initial`, doubled after every failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max_attempts: 6,
        }
    }
}

/// True for HTTP failures worth retrying: timeouts, connection errors,
/// 429 and 5xx responses.
pub fn is_transient_http(err: &Report) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .is_some_and(|e| {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|status| {
                        status == reqwest::StatusCode::TOO_MANY_REQUESTS
                            || status.is_server_error()
                    })
            })
    })
}

fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

fn is_transient_transport(kind: &TransportErrorKind) -> bool {
    match kind {
        TransportErrorKind::HttpError(e) => is_transient_status(e.status),
        TransportErrorKind::BackendGone => true,
        other => other.is_retry_err(),
    }
}

fn is_transient_rpc_error(err: &TransportError) -> bool {
    match err {
        RpcError::Transport(kind) => is_transient_transport(kind),
        // node-side rate limits (429, -32005 and friends)
        RpcError::ErrorResp(payload) => payload.is_retry_err(),
        _ => false,
    }
}

/// True for JSON-RPC failures worth retrying: everything
/// [`is_transient_http`] accepts, plus alloy transport errors carrying HTTP
/// 429/5xx, a dropped backend, or a rate-limit error response.
///
/// Reverts and decoding errors are not transient.
pub fn is_transient_rpc(err: &Report) -> bool {
    if is_transient_http(err) {
        return true;
    }
    err.chain().any(|cause| {
        if let Some(alloy::contract::Error::TransportError(e)) =
            cause.downcast_ref::<alloy::contract::Error>()
        {
            return is_transient_rpc_error(e);
        }
        if let Some(e) = cause.downcast_ref::<TransportError>() {
            return is_transient_rpc_error(e);
        }
        if let Some(kind) = cause.downcast_ref::<TransportErrorKind>() {
            return is_transient_transport(kind);
        }
        cause
            .downcast_ref::<alloy::transports::HttpError>()
            .is_some_and(|e| is_transient_status(e.status))
    })
}

/// Runs `op`, retrying transient HTTP failures per `backoff`.
pub async fn retry_transient<T, F, Fut>(backoff: &Backoff, operation: &str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_if(backoff, operation, is_transient_http, op).await
}

/// Runs `op`, retrying errors for which `is_transient` holds.
///
/// Other errors are returned immediately. When the attempts run out the last
/// error is wrapped in [`FatalError::RetriesExhausted`].
pub async fn retry_if<T, F, Fut, P>(
    backoff: &Backoff,
    operation: &str,
    is_transient: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Report) -> bool,
{
    let max_attempts = backoff.max_attempts.max(1);
    let mut delay = backoff.initial;
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) => {
                if attempt >= max_attempts {
                    return Err(e).wrap_err(FatalError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                    });
                }
                warn!(
                    operation,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %e,
                    "something went wrong, backing off"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
