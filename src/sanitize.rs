use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::models::ChatResponse;

static BOLD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap());
static ITALIC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*]+)\*").unwrap());
static UNDERLINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"__([^_]+)__").unwrap());
static UNDERSCORE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_([^_]+)_").unwrap());
static CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]+)`").unwrap());
static MULTI_NEWLINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

static SEARCH_INTENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:найди|ищи|поиск|в интернете|посмотри в интернете|где находится|адрес|контакт|кто ещ[её]|альтернатив|конкурент)",
    )
    .unwrap()
});

/// Plain-text rendering of a model answer: unified line endings, markdown
/// emphasis and inline code markers removed, at most one blank line in a row.
pub fn sanitize_for_display(text: &str) -> String {
    let mut t = text.replace("\r\n", "\n").replace('\r', "\n");
    // Stripping one marker pair can expose another; repeat until stable.
    loop {
        let next = strip_markers(&t);
        if next == t {
            break;
        }
        t = next;
    }
    MULTI_NEWLINE_RE.replace_all(&t, "\n\n").into_owned()
}

fn strip_markers(text: &str) -> String {
    let t = BOLD_RE.replace_all(text, "$1");
    let t = ITALIC_RE.replace_all(&t, "$1");
    let t = UNDERLINE_RE.replace_all(&t, "$1");
    let t = UNDERSCORE_RE.replace_all(&t, "$1");
    CODE_RE.replace_all(&t, "$1").into_owned()
}

/// Whether the user asked, in so many words, for a web search.
pub fn has_explicit_search_intent(message: &str) -> bool {
    SEARCH_INTENT_RE.is_match(&message.to_lowercase())
}

/// Source links worth calling out as "external": the backend searched, the
/// user asked for it, and the link leaves the current site.
pub fn external_sources(message: &str, response: &ChatResponse, page_url: Option<&str>) -> Vec<String> {
    if !response.used_search || response.sources.is_empty() || !has_explicit_search_intent(message) {
        return Vec::new();
    }
    // Without a known page host nothing can be called external.
    let Some(page_host) = page_url
        .and_then(|u| Url::parse(u).ok())
        .and_then(|u| u.host_str().map(str::to_string))
    else {
        return Vec::new();
    };

    response
        .sources
        .iter()
        .map(|s| s.url.as_str())
        .filter(|u| {
            Url::parse(u)
                .ok()
                .and_then(|parsed| parsed.host_str().map(|h| h != page_host))
                .unwrap_or(false)
        })
        .map(str::to_string)
        .collect()
}
