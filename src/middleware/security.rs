use axum::{
    extract::{Request, State},
    http::header::HOST,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{error::AppError, state::AppState};

/// Rejects requests whose `Host` is not in `TRUSTED_HOSTS`. A `*` entry
/// disables the check; requests without a host header pass through.
pub async fn enforce_trusted_hosts(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(strip_port);

    if let Some(host) = host {
        if !host_is_trusted(&state.config.trusted_hosts, host) {
            tracing::warn!(host = %host, "Rejected request for untrusted host");
            return AppError::BadRequest("Invalid host header.".to_string()).into_response();
        }
    }
    next.run(request).await
}

fn strip_port(raw: &str) -> &str {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    raw.rsplit_once(':').map_or(raw, |(host, _)| host)
}

fn host_is_trusted(trusted: &[String], host: &str) -> bool {
    trusted.iter().any(|entry| {
        let entry = entry.trim();
        if entry == "*" {
            return true;
        }
        if let Some(suffix) = entry.strip_prefix("*.") {
            return host
                .strip_suffix(suffix)
                .is_some_and(|prefix| prefix.ends_with('.'));
        }
        entry.eq_ignore_ascii_case(host)
    })
}

#[cfg(test)]
mod tests {
    use super::{host_is_trusted, strip_port};

    #[test]
    fn strips_ports_from_hosts() {
        assert_eq!(strip_port("localhost:8000"), "localhost");
        assert_eq!(strip_port("[::1]:8000"), "::1");
        assert_eq!(strip_port("api.example.com"), "api.example.com");
    }

    #[test]
    fn matches_exact_wildcard_and_subdomain_entries() {
        let trusted = vec!["localhost".to_string(), "*.example.com".to_string()];
        assert!(host_is_trusted(&trusted, "localhost"));
        assert!(host_is_trusted(&trusted, "api.example.com"));
        assert!(!host_is_trusted(&trusted, "example.com"));
        assert!(!host_is_trusted(&trusted, "evil.com"));
        assert!(host_is_trusted(&["*".to_string()], "anything"));
    }
}
