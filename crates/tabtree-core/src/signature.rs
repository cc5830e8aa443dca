//! URL identity for tabs across browser sessions.
//!
//! Runtime tab ids are reassigned on every restart, so durable state keys
//! tabs by their normalized URL instead. Normalization drops the fragment and
//! nothing else: `https://a.test/p?q=1#top` and `https://a.test/p?q=1#end`
//! are the same page, `?q=1` and `?q=2` are not.

use crate::model::TabInfo;
use serde::{Deserialize, Serialize};
use url::Url;

/// Placeholder page shown in a fresh tab.
pub const NEW_TAB_URL: &str = "chrome://newtab/";

/// Scheme of the extension's own pages.
pub const EXTENSION_SCHEME_PREFIX: &str = "chrome-extension://";

const UNPINNABLE_PREFIXES: &[&str] = &[
    "chrome://",
    "moz-extension://",
    "safari-extension://",
    "about:",
    "data:text/html",
];

/// Strip the fragment from `raw`.
///
/// Parseable URLs go through WHATWG serialization; anything else keeps the
/// text before the first `#`.
pub fn normalize_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.into()
        }
        Err(_) => raw.split('#').next().unwrap_or_default().to_string(),
    }
}

/// Whether a normalized URL may appear in the durable relation log.
pub fn is_recordable_url(url: &str) -> bool {
    !url.trim().is_empty() && url != NEW_TAB_URL && !url.starts_with(EXTENSION_SCHEME_PREFIX)
}

/// Whether a URL may be pinned.
pub fn is_pinnable_url(url: &str) -> bool {
    !url.trim().is_empty() && !UNPINNABLE_PREFIXES.iter().any(|prefix| url.starts_with(prefix))
}

/// Session-independent identity of a tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabSignature {
    /// Normalized URL; the identity key
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fav_icon_url: Option<String>,
}

impl TabSignature {
    pub fn from_tab(tab: &TabInfo) -> Self {
        Self {
            url: normalize_url(tab.effective_url()),
            title: tab.title.clone(),
            fav_icon_url: tab.fav_icon_url.clone(),
        }
    }

    pub fn is_recordable(&self) -> bool {
        is_recordable_url(&self.url)
    }

    /// Identity equality: titles and icons may drift, the URL may not.
    pub fn same_identity(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_only_the_fragment() {
        assert_eq!(
            normalize_url("https://a.test/page?x=1&y=2#section"),
            "https://a.test/page?x=1&y=2"
        );
        assert_eq!(normalize_url("https://a.test/#"), "https://a.test/");
    }

    #[test]
    fn unparseable_input_falls_back_to_prefix() {
        assert_eq!(normalize_url("not a url#frag"), "not a url");
        assert_eq!(normalize_url(""), "");
        assert_eq!(normalize_url("#only"), "");
    }

    #[test]
    fn rejects_placeholder_and_extension_pages() {
        assert!(!is_recordable_url(""));
        assert!(!is_recordable_url("   "));
        assert!(!is_recordable_url(NEW_TAB_URL));
        assert!(!is_recordable_url("chrome-extension://abc/popup.html"));
        assert!(is_recordable_url("https://a.test/"));
        assert!(is_recordable_url("chrome://settings/"));
    }

    #[test]
    fn pin_rules_reject_internal_schemes() {
        for url in [
            "chrome://settings/",
            "moz-extension://x/",
            "safari-extension://x/",
            "about:blank",
            "data:text/html,<p>",
            "",
        ] {
            assert!(!is_pinnable_url(url), "{url} should not be pinnable");
        }
        assert!(is_pinnable_url("https://docs.rs/"));
    }

    #[test]
    fn signature_prefers_committed_url() {
        let mut tab = TabInfo::new(1, 1, 0, "").with_title("Docs");
        tab.pending_url = Some("https://docs.rs/#top".to_string());
        let sig = TabSignature::from_tab(&tab);
        assert_eq!(sig.url, "https://docs.rs/");
        assert_eq!(sig.title, "Docs");
        assert!(sig.is_recordable());

        let renamed = TabSignature {
            title: "Other".to_string(),
            ..sig.clone()
        };
        assert!(sig.same_identity(&renamed));
    }
}
