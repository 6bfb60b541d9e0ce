//! Turns queue payloads into the events delivered to the sink.
//!
//! Everything here is pure: decoding, schema checks, and the user agent and
//! referrer classification. The session signature is computed by the caller
//! and passed in.
use crate::errors::ValidationError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::event::RawEvent;
use url::Url;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Desktop,
    Mobile,
    Tablet,
    Bot,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferrerSource {
    Direct,
    Internal,
    Search,
    Social,
    Referral,
    Unknown,
}

/// An enriched event, ready for delivery.
///
/// The client IP and raw user agent are not carried over; only the session
/// signature and the classification derived from them leave the worker.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProcessedEvent {
    pub site_id: String,
    pub hostname: String,
    pub pathname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_width: Option<u32>,
    pub received_at: DateTime<Utc>,
    pub session_id: String,
    pub device: Device,
    pub browser: &'static str,
    pub os: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer_host: Option<String>,
    pub referrer_source: ReferrerSource,
}

/// Decodes a queue payload and checks it against the event schema.
pub fn parse_event(data: &[u8]) -> Result<RawEvent, ValidationError> {
    let event: RawEvent = serde_json::from_slice(data)?;
    event.validate()?;
    Ok(event)
}

pub fn transform(raw: RawEvent, session_id: String) -> ProcessedEvent {
    let user_agent = raw.user_agent.as_str();
    let device = classify_device(user_agent);
    let browser = classify_browser(user_agent);
    let os = classify_os(user_agent);
    let (referrer_host, referrer_source) = classify_referrer(raw.referrer.as_deref(), &raw.hostname);

    ProcessedEvent {
        site_id: raw.site_id,
        hostname: raw.hostname,
        pathname: raw.pathname,
        referrer: raw.referrer.filter(|r| !r.is_empty()),
        title: raw.title,
        screen_width: raw.screen_width,
        received_at: raw.received_at,
        session_id,
        device,
        browser,
        os,
        referrer_host,
        referrer_source,
    }
}

const BOT_MARKERS: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "slurp",
    "headless",
    "lighthouse",
    "facebookexternalhit",
    "curl/",
    "wget/",
    "python-requests",
];

pub fn classify_device(user_agent: &str) -> Device {
    if user_agent.trim().is_empty() {
        return Device::Unknown;
    }
    let ua = user_agent.to_ascii_lowercase();

    if BOT_MARKERS.iter().any(|marker| ua.contains(marker)) {
        Device::Bot
    } else if ua.contains("ipad")
        || ua.contains("tablet")
        || (ua.contains("android") && !ua.contains("mobile"))
    {
        Device::Tablet
    } else if ua.contains("mobi") || ua.contains("iphone") || ua.contains("android") {
        Device::Mobile
    } else {
        Device::Desktop
    }
}

pub fn classify_browser(user_agent: &str) -> &'static str {
    // Order matters: most engines also claim to be Chrome and Safari
    const BROWSERS: &[(&str, &str)] = &[
        ("Edg/", "Edge"),
        ("OPR/", "Opera"),
        ("Opera", "Opera"),
        ("SamsungBrowser/", "Samsung Internet"),
        ("Firefox/", "Firefox"),
        ("FxiOS/", "Firefox"),
        ("CriOS/", "Chrome"),
        ("Chrome/", "Chrome"),
        ("Safari/", "Safari"),
    ];

    BROWSERS
        .iter()
        .find(|(marker, _)| user_agent.contains(marker))
        .map_or("Other", |(_, name)| name)
}

pub fn classify_os(user_agent: &str) -> &'static str {
    // iOS claims "like Mac OS X" and Android claims "Linux"
    const SYSTEMS: &[(&str, &str)] = &[
        ("Windows", "Windows"),
        ("iPhone", "iOS"),
        ("iPad", "iOS"),
        ("iPod", "iOS"),
        ("Android", "Android"),
        ("CrOS", "Chrome OS"),
        ("Mac OS X", "macOS"),
        ("Macintosh", "macOS"),
        ("Linux", "Linux"),
    ];

    SYSTEMS
        .iter()
        .find(|(marker, _)| user_agent.contains(marker))
        .map_or("Other", |(_, name)| name)
}

const SEARCH_ENGINES: &[&str] = &[
    "google.",
    "bing.com",
    "duckduckgo.com",
    "search.yahoo.com",
    "yandex.",
    "baidu.com",
    "ecosia.org",
];

const SOCIAL_NETWORKS: &[&str] = &[
    "facebook.com",
    "t.co",
    "twitter.com",
    "x.com",
    "linkedin.com",
    "reddit.com",
    "instagram.com",
    "youtube.com",
    "news.ycombinator.com",
];

/// Returns the referrer host (without `www.`) and where the visit came from.
pub fn classify_referrer(
    referrer: Option<&str>,
    hostname: &str,
) -> (Option<String>, ReferrerSource) {
    let Some(referrer) = referrer.filter(|r| !r.trim().is_empty()) else {
        return (None, ReferrerSource::Direct);
    };
    let Some(host) = Url::parse(referrer)
        .ok()
        .and_then(|url| url.host_str().map(|h| h.to_ascii_lowercase()))
    else {
        return (None, ReferrerSource::Unknown);
    };

    let host = strip_www(&host).to_string();
    let source = if host == strip_www(&hostname.to_ascii_lowercase()) {
        ReferrerSource::Internal
    } else if SEARCH_ENGINES.iter().any(|engine| host_matches(&host, engine)) {
        ReferrerSource::Search
    } else if SOCIAL_NETWORKS.iter().any(|network| host_matches(&host, network)) {
        ReferrerSource::Social
    } else {
        ReferrerSource::Referral
    };

    (Some(host), source)
}

fn strip_www(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

/// `pattern` ending in '.' matches any TLD, otherwise the host must equal it
/// or be a subdomain of it.
fn host_matches(host: &str, pattern: &str) -> bool {
    if pattern.ends_with('.') {
        return host.starts_with(pattern) || host.contains(&format!(".{pattern}"));
    }
    host == pattern || host.ends_with(&format!(".{pattern}"))
}
