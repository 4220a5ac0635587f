use anyhow::Context;
use lapin::{Connection, ConnectionProperties};
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};

const MAX_RETRIES: u8 = 10;
const INITIAL_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(30);
const PREVIEW_LEN: usize = 200;

/// Attempts to connect to a `RabbitMQ` instance,
/// retrying up to 10 times with exponential backoff.
pub(crate) async fn connect_with_retry(uri: &str, context_msg: &str) -> anyhow::Result<Connection> {
    let mut delay = INITIAL_DELAY;
    let sanitized_uri = sanitize_uri_for_logging(uri);

    for attempt in 1..=MAX_RETRIES {
        info!(
            event = "amqp_connecting",
            uri = %sanitized_uri,
            attempt,
            max_attempts = MAX_RETRIES,
            "{context_msg}: connecting"
        );

        match Connection::connect(uri, ConnectionProperties::default()).await {
            Ok(conn) => {
                info!(
                    event = "amqp_connected",
                    uri = %sanitized_uri,
                    attempt,
                    "Connected to RabbitMQ"
                );
                return Ok(conn);
            }
            Err(e) => {
                error!(
                    event = "amqp_connect_failed",
                    uri = %sanitized_uri,
                    attempt,
                    max_attempts = MAX_RETRIES,
                    error = %e,
                    hint = failure_hint(&format!("{e:?}")),
                    "{context_msg}"
                );

                if attempt < MAX_RETRIES {
                    warn!(
                        event = "amqp_retry_scheduled",
                        delay_ms = delay.as_millis() as u64,
                        "Retrying connection"
                    );
                    time::sleep(delay).await;
                    delay = next_delay(delay);
                } else {
                    return Err(e).context(format!(
                        "{context_msg} after {MAX_RETRIES} attempts to {sanitized_uri}",
                    ));
                }
            }
        }
    }
    Err(anyhow::anyhow!("Exhausted all connection retries."))
}

/// Exponential backoff, capped at 30 seconds.
fn next_delay(delay: Duration) -> Duration {
    std::cmp::min(delay * 2, MAX_DELAY)
}

fn failure_hint(error_debug: &str) -> &'static str {
    if error_debug.contains("ConnectionRefused") || error_debug.contains("Connection refused") {
        "connection refused: broker not running, wrong host/port, or firewalled"
    } else if error_debug.contains("timeout") || error_debug.contains("Timeout") {
        "connection timeout: no response from broker"
    } else if error_debug.contains("auth") || error_debug.contains("Auth") {
        "authentication failed: check credentials"
    } else if error_debug.contains("resolution") || error_debug.contains("resolve") {
        "DNS resolution failed: cannot resolve hostname"
    } else {
        "unknown"
    }
}

/// Masks the password in an AMQP URI.
pub(crate) fn sanitize_uri_for_logging(uri: &str) -> String {
    if let (Some(at_pos), Some(scheme_end)) = (uri.rfind('@'), uri.find("://")) {
        let authority_start = scheme_end + 3;
        if at_pos > authority_start {
            if let Some(colon_pos) = uri[authority_start..at_pos].find(':') {
                let username = &uri[authority_start..authority_start + colon_pos];
                return format!("{}{username}:***{}", &uri[..authority_start], &uri[at_pos..]);
            }
        }
    }
    uri.to_string()
}

/// Short printable form of a message body for logs.
pub(crate) fn preview(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(s) if s.len() > PREVIEW_LEN => {
            let mut end = PREVIEW_LEN;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &s[..end])
        }
        Ok(s) => s.to_string(),
        Err(_) => format!("<binary data, {} bytes>", data.len()),
    }
}
