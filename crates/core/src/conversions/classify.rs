//! Client-environment heuristics: device from viewport width, browser from
//! user agent, traffic source from referrer. Missing signals degrade to
//! `desktop`, `unknown` and `direct`.

use crate::domain::conversion::{DeviceClass, TrafficSource};

pub const MOBILE_MAX_WIDTH: u32 = 768;
pub const TABLET_MAX_WIDTH: u32 = 1024;

const SEARCH_ENGINE_LABELS: &[&str] =
    &["google", "bing", "yahoo", "duckduckgo", "baidu", "yandex", "ecosia"];

const SOCIAL_DOMAINS: &[&str] = &[
    "facebook.com",
    "fb.com",
    "instagram.com",
    "twitter.com",
    "x.com",
    "t.co",
    "linkedin.com",
    "lnkd.in",
    "reddit.com",
    "youtube.com",
    "tiktok.com",
    "pinterest.com",
];

const PAID_CLICK_PARAMS: &[&str] = &["gclid", "msclkid", "gbraid", "wbraid", "dclid"];
const PAID_MEDIUMS: &[&str] = &["cpc", "ppc", "paid", "paid_search", "paidsearch"];

pub fn classify_device(viewport_width: Option<u32>) -> DeviceClass {
    match viewport_width {
        Some(width) if width < MOBILE_MAX_WIDTH => DeviceClass::Mobile,
        Some(width) if width < TABLET_MAX_WIDTH => DeviceClass::Tablet,
        _ => DeviceClass::Desktop,
    }
}

pub fn classify_browser(user_agent: Option<&str>) -> String {
    let Some(agent) = user_agent.map(str::trim).filter(|agent| !agent.is_empty()) else {
        return "unknown".to_string();
    };
    let agent = agent.to_ascii_lowercase();

    // Order matters: Edge and Opera also announce Chrome, Chrome announces Safari.
    let browser = if agent.contains("edg/") || agent.contains("edge/") {
        "edge"
    } else if agent.contains("opr/") || agent.contains("opera") {
        "opera"
    } else if agent.contains("firefox/") || agent.contains("fxios/") {
        "firefox"
    } else if agent.contains("chrome/") || agent.contains("crios/") {
        "chrome"
    } else if agent.contains("safari/") {
        "safari"
    } else {
        "other"
    };
    browser.to_string()
}

/// Search referrers count as organic unless a paid-click marker appears on the
/// landing page or the referrer itself.
pub fn infer_source(referrer: Option<&str>, page_url: Option<&str>) -> TrafficSource {
    let Some(host) = referrer.and_then(host_of) else {
        return TrafficSource::Direct;
    };

    if is_search_engine(&host) {
        let paid = [referrer, page_url].into_iter().flatten().any(has_paid_click_marker);
        return if paid { TrafficSource::Paid } else { TrafficSource::Organic };
    }

    if SOCIAL_DOMAINS.iter().any(|domain| domain_matches(&host, domain)) {
        return TrafficSource::Social;
    }

    TrafficSource::Referral
}

fn is_search_engine(host: &str) -> bool {
    host.split('.').any(|label| SEARCH_ENGINE_LABELS.contains(&label))
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain || host.strip_suffix(domain).map(|rest| rest.ends_with('.')).unwrap_or(false)
}

fn has_paid_click_marker(url: &str) -> bool {
    query_pairs(url).any(|(key, value)| {
        let key = key.to_ascii_lowercase();
        PAID_CLICK_PARAMS.contains(&key.as_str())
            || (key == "utm_medium" && PAID_MEDIUMS.contains(&value.to_ascii_lowercase().as_str()))
    })
}

/// Lower-cased host without scheme, credentials, port or a leading `www.`.
pub(crate) fn host_of(url: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }

    let without_scheme = match url.find("://") {
        Some(index) => &url[index + 3..],
        None => url.strip_prefix("//").unwrap_or(url),
    };
    let authority = without_scheme.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or(authority);
    let host = host_port.split(':').next().unwrap_or(host_port).trim_end_matches('.');
    let host = host.to_ascii_lowercase();
    let host = host.strip_prefix("www.").map(str::to_string).unwrap_or(host);

    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

fn query_pairs(url: &str) -> impl Iterator<Item = (&str, &str)> {
    let query = url
        .split_once('?')
        .map(|(_, rest)| rest.split('#').next().unwrap_or_default())
        .unwrap_or_default();
    query.split('&').filter(|pair| !pair.is_empty()).map(|pair| match pair.split_once('=') {
        Some((key, value)) => (key, value),
        None => (pair, ""),
    })
}

#[cfg(test)]
mod tests {
    use super::{classify_browser, classify_device, host_of, infer_source};
    use crate::domain::conversion::{DeviceClass, TrafficSource};

    #[test]
    fn device_thresholds_split_at_768_and_1024() {
        assert_eq!(classify_device(Some(375)), DeviceClass::Mobile);
        assert_eq!(classify_device(Some(767)), DeviceClass::Mobile);
        assert_eq!(classify_device(Some(768)), DeviceClass::Tablet);
        assert_eq!(classify_device(Some(1023)), DeviceClass::Tablet);
        assert_eq!(classify_device(Some(1024)), DeviceClass::Desktop);
        assert_eq!(classify_device(None), DeviceClass::Desktop);
    }

    #[test]
    fn browser_detection_respects_vendor_overlap() {
        let edge = "Mozilla/5.0 (Windows NT 10.0) AppleWebKit/537.36 Chrome/120.0 Safari/537.36 Edg/120.0";
        let chrome = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 Chrome/120.0 Safari/537.36";
        let safari = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0) AppleWebKit/605.1.15 Version/17.0 Safari/604.1";

        assert_eq!(classify_browser(Some(edge)), "edge");
        assert_eq!(classify_browser(Some(chrome)), "chrome");
        assert_eq!(classify_browser(Some(safari)), "safari");
        assert_eq!(classify_browser(Some("curl/8.0")), "other");
        assert_eq!(classify_browser(None), "unknown");
    }

    #[test]
    fn host_extraction_strips_noise() {
        assert_eq!(host_of("https://www.Google.com/search?q=trt").as_deref(), Some("google.com"));
        assert_eq!(host_of("http://user@m.facebook.com:8080/x").as_deref(), Some("m.facebook.com"));
        assert_eq!(host_of("   ").as_deref(), None);
    }

    #[test]
    fn search_referrer_is_organic_unless_paid_marker_present() {
        assert_eq!(
            infer_source(Some("https://www.google.com/"), Some("https://clinic.example/?ref=x")),
            TrafficSource::Organic
        );
        assert_eq!(
            infer_source(Some("https://www.google.com/"), Some("https://clinic.example/?gclid=abc")),
            TrafficSource::Paid
        );
        assert_eq!(
            infer_source(Some("https://www.bing.com/"), Some("https://clinic.example/?utm_medium=CPC")),
            TrafficSource::Paid
        );
        assert_eq!(infer_source(Some("https://duckduckgo.com/"), None), TrafficSource::Organic);
    }

    #[test]
    fn social_direct_and_referral_sources() {
        assert_eq!(infer_source(Some("https://l.instagram.com/"), None), TrafficSource::Social);
        assert_eq!(infer_source(Some("https://t.co/abc"), None), TrafficSource::Social);
        assert_eq!(infer_source(None, Some("https://clinic.example/")), TrafficSource::Direct);
        assert_eq!(infer_source(Some(""), None), TrafficSource::Direct);
        assert_eq!(infer_source(Some("https://healthblog.example/post"), None), TrafficSource::Referral);
        // Suffix match must respect label boundaries.
        assert_eq!(infer_source(Some("https://notx.com/"), None), TrafficSource::Referral);
    }
}
