use woothee::parser::Parser;

use crate::session::UaFields;

/// Wraps the woothee UA classifier. Constructed once per tracker worker and
/// consulted only at Session creation (§4.1, §9) — never shared across
/// tasks, never reused to re-derive UA fields on later events for the same
/// session.
pub struct UaParser {
    inner: Parser,
}

impl UaParser {
    pub fn new() -> Self {
        Self { inner: Parser::new() }
    }

    /// Classify a non-empty user-agent string into the fixed set of fields
    /// and boolean family flags from the sink schema (§6). An unparseable
    /// UA still yields a Session with all fields at their zero value.
    pub fn classify(&self, user_agent: &str) -> UaFields {
        let Some(result) = self.inner.parse(user_agent) else {
            return UaFields::default();
        };

        let browser = result.name.to_string();
        let os = result.os.to_string();
        let device = result.category.to_string();
        let browser_lower = browser.to_lowercase();
        let os_lower = os.to_lowercase();

        UaFields {
            browser_version: result.version.to_string(),
            is_desktop: device == "pc",
            is_mobile: device == "mobilephone",
            is_tablet: device == "smartphone" && os_lower.contains("ipad"),
            is_tv: os_lower.contains("tv") || browser_lower.contains("tv"),
            is_bot: device == "crawler",
            is_android: os_lower.contains("android"),
            is_ios: os_lower.contains("iphone")
                || os_lower.contains("ipad")
                || os_lower.contains("ios"),
            is_windows: os_lower.contains("windows"),
            is_linux: os_lower.contains("linux") && !os_lower.contains("android"),
            is_mac: os_lower.contains("mac os"),
            is_openbsd: os_lower.contains("openbsd"),
            is_chromeos: os_lower.contains("chrome os") || os_lower.contains("chromeos"),
            is_chrome: browser_lower.contains("chrome") && !browser_lower.contains("chromium"),
            is_firefox: browser_lower.contains("firefox"),
            is_safari: browser_lower.contains("safari") && !browser_lower.contains("chrome"),
            is_edge: browser_lower.contains("edge"),
            is_opera: browser_lower.contains("opera"),
            is_samsung_browser: browser_lower.contains("samsung"),
            is_vivaldi: browser_lower.contains("vivaldi"),
            is_yandex_browser: browser_lower.contains("yandex"),
            browser,
            device,
            os,
        }
    }
}

impl Default for UaParser {
    fn default() -> Self {
        Self::new()
    }
}
