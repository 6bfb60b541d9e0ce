//! Signed URL verification.
//!
//! A signed request carries `t` (unix seconds) and `mac` (hex HMAC-SHA256) in
//! its query string. The mac covers `{path}?{canonical query}`, where the
//! canonical query is every parameter except `mac`, percent-decoded, sorted by
//! name then value, and re-encoded with `application/x-www-form-urlencoded`
//! rules. Signer and verifier both go through `signable_string`, so any
//! spelling of the same parameters (`%20` or `+` for a space) verifies.
use crate::config::{AuthConfig, AuthMode};
use crate::metrics_defs::AUTH_FAILURES;
use hmac::{Hmac, Mac};
use http::{Method, Uri};
use sha2::Sha256;
use shared::counter;
use url::form_urlencoded;

type HmacSha256 = Hmac<Sha256>;

pub const MAC_PARAM: &str = "mac";
pub const TIMESTAMP_PARAM: &str = "t";

/// Oldest accepted timestamp, in seconds before now.
pub const MAX_AGE_SECS: i64 = 300;
/// Newest accepted timestamp, in seconds after now.
pub const MAX_CLOCK_SKEW_SECS: i64 = 5;

const MAC_LEN: usize = 32;

/// Why a request failed authentication. Only logged and counted; clients
/// always see the same 401.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("missing mac")]
    MissingMac,
    #[error("missing timestamp")]
    MissingTimestamp,
    #[error("malformed timestamp")]
    MalformedTimestamp,
    #[error("malformed mac")]
    MalformedMac,
    #[error("mac mismatch")]
    Mismatch,
    #[error("stale timestamp")]
    Stale,
    #[error("timestamp in the future")]
    FutureSkew,
}

impl AuthFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthFailure::MissingMac => "missing_mac",
            AuthFailure::MissingTimestamp => "missing_timestamp",
            AuthFailure::MalformedTimestamp => "malformed_timestamp",
            AuthFailure::MalformedMac => "malformed_mac",
            AuthFailure::Mismatch => "mismatch",
            AuthFailure::Stale => "stale",
            AuthFailure::FutureSkew => "future_skew",
        }
    }
}

/// Failures that point at a bug rather than at the client.
#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("internal authentication error: {0}")]
    Internal(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct AuthenticatedRequestContext {
    pub original_url: String,
    /// The request URL with `mac` removed. `t` is kept.
    pub cleaned_url: String,
    pub valid: bool,
    pub timestamp: Option<i64>,
    pub failure: Option<AuthFailure>,
}

impl AuthenticatedRequestContext {
    fn bypassed(url: String) -> Self {
        AuthenticatedRequestContext {
            cleaned_url: url.clone(),
            original_url: url,
            valid: true,
            timestamp: None,
            failure: None,
        }
    }
}

pub struct RequestAuthenticator {
    secret: Option<Vec<u8>>,
    mode: AuthMode,
    loopback_path: Option<String>,
}

impl RequestAuthenticator {
    pub fn new(config: &AuthConfig) -> Self {
        if config.secret.is_none() {
            tracing::warn!("No auth secret configured, request authentication is disabled");
        }

        RequestAuthenticator {
            secret: config.secret.as_ref().map(|s| s.as_bytes().to_vec()),
            mode: config.mode,
            loopback_path: config.loopback_path.clone(),
        }
    }

    pub fn validate(
        &self,
        method: &Method,
        uri: &Uri,
    ) -> Result<AuthenticatedRequestContext, AuthError> {
        self.validate_at(method, uri, chrono::Utc::now().timestamp())
    }

    pub fn validate_at(
        &self,
        method: &Method,
        uri: &Uri,
        now: i64,
    ) -> Result<AuthenticatedRequestContext, AuthError> {
        let original_url = uri
            .path_and_query()
            .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());

        let Some(secret) = &self.secret else {
            return Ok(AuthenticatedRequestContext::bypassed(original_url));
        };
        if self.is_exempt(method, uri.path()) {
            return Ok(AuthenticatedRequestContext::bypassed(original_url));
        }

        let path = uri.path();
        let mut mac = None;
        let mut params = Vec::new();
        for (name, value) in form_urlencoded::parse(uri.query().unwrap_or("").as_bytes()) {
            if name == MAC_PARAM {
                if mac.is_none() {
                    mac = Some(value.into_owned());
                }
            } else {
                params.push((name.into_owned(), value.into_owned()));
            }
        }

        let cleaned_url = if params.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{}", encode_query(&params))
        };

        let timestamp_param = params
            .iter()
            .find(|(name, _)| name == TIMESTAMP_PARAM)
            .map(|(_, value)| value.as_str());
        let timestamp = timestamp_param.and_then(|t| t.parse::<i64>().ok());

        let outcome = verify(secret, path, &params, mac.as_deref(), timestamp_param, now)?;

        if let Err(failure) = outcome {
            counter!(AUTH_FAILURES, "reason" => failure.as_str()).increment(1);
            tracing::warn!(
                reason = %failure,
                path,
                timestamp = ?timestamp,
                log_only = self.mode == AuthMode::LogOnly,
                "Request authentication failed"
            );
        }

        Ok(AuthenticatedRequestContext {
            original_url,
            cleaned_url,
            valid: outcome.is_ok(),
            timestamp,
            failure: outcome.err(),
        })
    }

    /// Whether the request may proceed. Log-only mode lets failed requests
    /// through.
    pub fn permits(&self, context: &AuthenticatedRequestContext) -> bool {
        context.valid || self.mode == AuthMode::LogOnly
    }

    fn is_exempt(&self, method: &Method, path: &str) -> bool {
        matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
            || self.loopback_path.as_deref() == Some(path)
    }
}

fn verify(
    secret: &[u8],
    path: &str,
    params: &[(String, String)],
    mac: Option<&str>,
    timestamp: Option<&str>,
    now: i64,
) -> Result<Result<(), AuthFailure>, AuthError> {
    let Some(mac) = mac else {
        return Ok(Err(AuthFailure::MissingMac));
    };
    let Some(timestamp) = timestamp else {
        return Ok(Err(AuthFailure::MissingTimestamp));
    };
    let Ok(timestamp) = timestamp.parse::<i64>() else {
        return Ok(Err(AuthFailure::MalformedTimestamp));
    };
    let Ok(provided) = hex::decode(mac) else {
        return Ok(Err(AuthFailure::MalformedMac));
    };
    if provided.len() != MAC_LEN {
        return Ok(Err(AuthFailure::Mismatch));
    }

    let mut hmac = new_hmac(secret)?;
    hmac.update(signable_string(path, params).as_bytes());
    if hmac.verify_slice(&provided).is_err() {
        return Ok(Err(AuthFailure::Mismatch));
    }

    if timestamp < now - MAX_AGE_SECS {
        return Ok(Err(AuthFailure::Stale));
    }
    if timestamp > now + MAX_CLOCK_SKEW_SECS {
        return Ok(Err(AuthFailure::FutureSkew));
    }
    Ok(Ok(()))
}

fn new_hmac(secret: &[u8]) -> Result<HmacSha256, AuthError> {
    HmacSha256::new_from_slice(secret).map_err(|e| AuthError::Internal(e.to_string()))
}

fn encode_query<'a>(params: impl IntoIterator<Item = &'a (String, String)>) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.into_iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .finish()
}

/// The exact bytes covered by the mac. `params` are decoded values and must
/// not contain `mac`.
pub fn signable_string(path: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();
    format!("{path}?{}", encode_query(sorted))
}

/// Produces signed URLs the authenticator accepts.
pub struct RequestSigner {
    secret: Vec<u8>,
}

impl RequestSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        RequestSigner {
            secret: secret.into(),
        }
    }

    /// Returns `<path>?<params>&t=<t>&mac=<hex>`. `path` is signed as given,
    /// so it must already be in the form the server will see.
    pub fn sign(&self, path: &str, params: &[(&str, &str)], t: i64) -> Result<String, AuthError> {
        let mut signed: Vec<(String, String)> = params
            .iter()
            .filter(|(name, _)| *name != MAC_PARAM)
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        signed.push((TIMESTAMP_PARAM.to_string(), t.to_string()));

        let mut hmac = new_hmac(&self.secret)?;
        hmac.update(signable_string(path, &signed).as_bytes());
        let mac = hex::encode(hmac.finalize().into_bytes());

        let mut query = form_urlencoded::Serializer::new(String::new());
        query.extend_pairs(signed.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        query.append_pair(MAC_PARAM, &mac);
        Ok(format!("{path}?{}", query.finish()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";
    const NOW: i64 = 1_700_000_000;

    fn authenticator(mode: AuthMode) -> RequestAuthenticator {
        RequestAuthenticator::new(&AuthConfig {
            secret: Some(SECRET.into()),
            mode,
            loopback_path: Some("/internal/event".into()),
        })
    }

    fn sign(path: &str, params: &[(&str, &str)], t: i64) -> Uri {
        RequestSigner::new(SECRET)
            .sign(path, params, t)
            .unwrap()
            .parse()
            .unwrap()
    }

    fn check(uri: &Uri) -> AuthenticatedRequestContext {
        authenticator(AuthMode::Enforce)
            .validate_at(&Method::POST, uri, NOW)
            .unwrap()
    }

    #[test]
    fn test_sign_then_validate() {
        for params in [
            vec![],
            vec![("site", "abc")],
            vec![("z", "1"), ("a", "2"), ("a", "1")],
            vec![("q", "a b&c=d"), ("utf8", "héllo")],
        ] {
            let uri = sign("/api/event", &params, NOW);
            let context = check(&uri);
            assert!(context.valid, "{uri}: {:?}", context.failure);
            assert_eq!(context.timestamp, Some(NOW));
            assert_eq!(context.failure, None);
        }
    }

    #[test]
    fn test_any_mac_byte_change_fails() {
        let uri = sign("/api/event", &[("site", "abc")], NOW).to_string();
        let (prefix, mac) = uri.split_once("mac=").unwrap();

        for i in 0..mac.len() {
            let mut mutated = mac.as_bytes().to_vec();
            mutated[i] = if mutated[i] == b'0' { b'1' } else { b'0' };
            let mutated = format!("{prefix}mac={}", String::from_utf8(mutated).unwrap());

            let context = check(&mutated.parse().unwrap());
            assert!(!context.valid);
            assert_eq!(context.failure, Some(AuthFailure::Mismatch), "{mutated}");
        }
    }

    #[test]
    fn test_tampered_params_fail() {
        let uri = sign("/api/event", &[("site", "abc")], NOW).to_string();

        let tampered = uri.replace("site=abc", "site=abd");
        assert_eq!(
            check(&tampered.parse().unwrap()).failure,
            Some(AuthFailure::Mismatch)
        );

        let moved = uri.replace("/api/event", "/api/other");
        assert_eq!(
            check(&moved.parse().unwrap()).failure,
            Some(AuthFailure::Mismatch)
        );
    }

    #[test]
    fn test_window_edges() {
        let cases = [
            (NOW - MAX_AGE_SECS, None),
            (NOW + MAX_CLOCK_SKEW_SECS, None),
            (NOW - MAX_AGE_SECS - 1, Some(AuthFailure::Stale)),
            (NOW + MAX_CLOCK_SKEW_SECS + 1, Some(AuthFailure::FutureSkew)),
        ];

        for (t, failure) in cases {
            let context = check(&sign("/api/event", &[], t));
            assert_eq!(context.failure, failure, "t = now{:+}", t - NOW);
            assert_eq!(context.valid, failure.is_none());
        }
    }

    #[test]
    fn test_space_spellings_are_equivalent() {
        let signed = sign("/api/event", &[("q", "a b")], NOW).to_string();
        assert!(signed.contains("q=a+b"));

        let percent = signed.replace("q=a+b", "q=a%20b");
        assert!(check(&percent.parse().unwrap()).valid);
    }

    #[test]
    fn test_parameter_order_does_not_matter() {
        let signed = sign("/api/event", &[("a", "1"), ("b", "2")], NOW).to_string();
        let (_, query) = signed.split_once('?').unwrap();
        let mut pairs: Vec<&str> = query.split('&').collect();
        pairs.reverse();

        let reordered = format!("/api/event?{}", pairs.join("&"));
        assert!(check(&reordered.parse().unwrap()).valid);
    }

    #[test]
    fn test_failure_reasons() {
        let missing_mac: Uri = format!("/api/event?t={NOW}").parse().unwrap();
        assert_eq!(check(&missing_mac).failure, Some(AuthFailure::MissingMac));

        let missing_t: Uri = "/api/event?mac=00".parse().unwrap();
        assert_eq!(check(&missing_t).failure, Some(AuthFailure::MissingTimestamp));

        let bad_t: Uri = "/api/event?t=soon&mac=00".parse().unwrap();
        let context = check(&bad_t);
        assert_eq!(context.failure, Some(AuthFailure::MalformedTimestamp));
        assert_eq!(context.timestamp, None);

        let bad_mac: Uri = format!("/api/event?t={NOW}&mac=xyz").parse().unwrap();
        assert_eq!(check(&bad_mac).failure, Some(AuthFailure::MalformedMac));

        let short_mac: Uri = format!("/api/event?t={NOW}&mac=abcd").parse().unwrap();
        assert_eq!(check(&short_mac).failure, Some(AuthFailure::Mismatch));
    }

    #[test]
    fn test_cleaned_url_drops_mac_only() {
        let uri = sign("/api/event", &[("site", "abc")], NOW);
        let context = check(&uri);

        assert_eq!(context.original_url, uri.to_string());
        assert_eq!(context.cleaned_url, format!("/api/event?site=abc&t={NOW}"));
    }

    #[test]
    fn test_bypass() {
        let authenticator = authenticator(AuthMode::Enforce);
        let unsigned: Uri = "/api/event?x=1".parse().unwrap();

        for method in [Method::GET, Method::HEAD, Method::OPTIONS] {
            let context = authenticator.validate_at(&method, &unsigned, NOW).unwrap();
            assert!(context.valid);
            assert_eq!(context.cleaned_url, "/api/event?x=1");
        }

        let loopback: Uri = "/internal/event".parse().unwrap();
        let context = authenticator
            .validate_at(&Method::POST, &loopback, NOW)
            .unwrap();
        assert!(context.valid);

        let context = authenticator
            .validate_at(&Method::POST, &unsigned, NOW)
            .unwrap();
        assert!(!context.valid);
        assert!(!authenticator.permits(&context));
    }

    #[test]
    fn test_log_only_lets_failures_through() {
        let authenticator = authenticator(AuthMode::LogOnly);
        let uri: Uri = format!("/api/event?site=abc&t={NOW}&mac=00").parse().unwrap();

        let context = authenticator.validate_at(&Method::POST, &uri, NOW).unwrap();
        assert!(!context.valid);
        assert_eq!(context.failure, Some(AuthFailure::Mismatch));
        assert!(authenticator.permits(&context));
        assert_eq!(context.cleaned_url, format!("/api/event?site=abc&t={NOW}"));
    }

    #[test]
    fn test_no_secret_disables_auth() {
        let authenticator = RequestAuthenticator::new(&AuthConfig::default());
        let uri: Uri = "/api/event?mac=garbage".parse().unwrap();

        let context = authenticator.validate_at(&Method::POST, &uri, NOW).unwrap();
        assert!(context.valid);
        assert_eq!(context.cleaned_url, context.original_url);
    }
}
