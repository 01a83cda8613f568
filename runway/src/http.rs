use std::time::Duration;

use reqwest::Client;

/// User agent sent on every outbound call. GitHub rejects requests without
/// one.
pub const USER_AGENT: &str = concat!("runway/", env!("CARGO_PKG_VERSION"));

/// Shared HTTP client with a request-level timeout.
pub fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10).min(timeout))
        .build()
}

/// Truncated, single-line rendering of a response body for error messages.
pub fn body_snippet(body: &str) -> String {
    const LIMIT: usize = 512;
    let flat: String = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.len() <= LIMIT {
        return flat;
    }
    let mut end = LIMIT;
    while !flat.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &flat[..end])
}
