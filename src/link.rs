use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

// ── Lazy static regexes ──────────────────────────────────────────────────────

static SHORT_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://xhslink\.com/[A-Za-z0-9/]+").unwrap());

static POST_LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"https?://(?:www\.)?xiaohongshu\.com/(?:explore|discovery/item)/[A-Za-z0-9]+(?:\?[A-Za-z0-9_\-.=&%]*)?",
    )
    .unwrap()
});

static GENERIC_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https?://[^\s"'<>，。！？、；：“”‘’（）【】]+"#).unwrap()
});

/// Whether resolution may fall back to any `http(s)://` substring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveMode {
    Strict,
    #[default]
    WithFallback,
}

// ── Public API ───────────────────────────────────────────────────────────────

/// Pull the post URL out of pasted share text.
///
/// Domain links win over generic URLs regardless of position; the first
/// match of the highest-priority pattern is returned verbatim.
pub fn resolve_share_link(text: &str, mode: ResolveMode) -> Option<String> {
    for re in [&*SHORT_LINK_RE, &*POST_LINK_RE] {
        if let Some(m) = re.find(text) {
            return Some(m.as_str().to_string());
        }
    }

    if mode == ResolveMode::WithFallback {
        return GENERIC_URL_RE.find(text).map(|m| m.as_str().to_string());
    }

    None
}

/// `http://` or `https://` URL with a host. The parser alone is too lenient:
/// it reads `http:placeholder` as `http://placeholder/`.
pub fn is_absolute_http(candidate: &str) -> bool {
    let prefixed = candidate.starts_with("http://") || candidate.starts_with("https://");
    prefixed
        && Url::parse(candidate)
            .map(|u| u.host_str().is_some_and(|h| !h.is_empty()))
            .unwrap_or(false)
}
