/// Shared blocking HTTP plumbing for the issue tracker and the transports.
///
/// `ureq` is synchronous; callers run these helpers inside
/// `tokio::task::spawn_blocking` so the runtime's worker threads never block.
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::time::Duration;

/// One agent per run; `ureq::Agent` is a cheap `Arc` clone.
pub fn agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout(timeout)
        .user_agent(concat!("escalate/", env!("CARGO_PKG_VERSION")))
        .build()
}

pub fn basic_auth(username: &str, secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", username, secret)))
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

/// POST a JSON body, returning the raw response text.
pub fn post_json(
    agent:         &ureq::Agent,
    url:           &str,
    authorization: Option<&str>,
    body:          &serde_json::Value,
) -> Result<String, String> {
    let mut request = agent.post(url).set("Content-Type", "application/json; charset=utf-8");
    if let Some(auth) = authorization {
        request = request.set("Authorization", auth);
    }
    request
        .send_string(&body.to_string())
        .map_err(describe)?
        .into_string()
        .map_err(|e| format!("reading response body: {}", e))
}

/// Flatten a ureq error into a log-friendly message, keeping the response
/// body for HTTP status errors (the APIs put the useful detail there).
pub fn describe(err: ureq::Error) -> String {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            let body = body.trim();
            if body.is_empty() {
                format!("HTTP {}", code)
            } else {
                format!("HTTP {}: {}", code, truncate(body, 300))
            }
        }
        ureq::Error::Transport(t) => t.to_string(),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None           => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_basic_auth() {
        assert_eq!(basic_auth("bot", "secret"), "Basic Ym90OnNlY3JldA==");
    }

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
