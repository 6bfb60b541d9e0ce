use http::HeaderMap;
use http::header::USER_AGENT;
use shared::http::PeerAddr;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Client IP as seen by the service: the first `X-Forwarded-For` entry when
/// the proxy in front is trusted, otherwise the TCP peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<&PeerAddr>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get(X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    peer.map(|peer| peer.0.ip().to_string()).unwrap_or_default()
}

/// The `User-Agent` header, or an empty string.
pub fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
