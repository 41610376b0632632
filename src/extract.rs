use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};

use crate::attributes::collect_attributes;
use crate::models::{PageContext, ProductRecord};
use crate::product::first_product;

// ── Constants ────────────────────────────────────────────────────────────────

pub const MAX_TEXT_CHARS: usize = 30_000;
const MIN_CONTAINER_LEN: usize = 200;
const MIN_BODY_LEN: usize = 100;

/// Content containers, most specific sites last; the first match in document
/// order wins.
const CONTENT_SELECTORS: &str = concat!(
    // Common HTML5
    r#"main,[role="main"],article,[role="article"],"#,
    // Blog platforms
    ".article__content,.tm-article-body,.post__text,",
    ".post-content,.entry-content,.content,",
    // Documentation
    ".wiki-content,.article-content,.page-content,",
    r#"[data-testid="page-content"],.ak-renderer-document,"#,
    // E-commerce
    ".product-page,.product,.product-card,.product-item",
);

/// Narrower list used to decide that late-loading content has arrived.
const WATCHED_SELECTORS: &str = concat!(
    r#"main,[role="main"],article,"#,
    ".article__content,.tm-article-body,.post__text,",
    ".post-content,.entry-content,.content,",
    ".product-page,.product,.product-card,.product-item",
);

const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "template", "head"];

const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "caption", "dd", "details", "dialog", "div",
    "dl", "dt", "fieldset", "figcaption", "figure", "footer", "form", "header", "hr", "li",
    "main", "nav", "ol", "section", "summary", "table", "tr", "ul",
];

const PARAGRAPH_TAGS: &[&str] = &["p", "pre", "h1", "h2", "h3", "h4", "h5", "h6"];

// ── Lazy statics ─────────────────────────────────────────────────────────────

static CONTENT_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse(CONTENT_SELECTORS).unwrap());
static WATCHED_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse(WATCHED_SELECTORS).unwrap());
static ARTICLE_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("article").unwrap());
static BODY_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("body").unwrap());
static TITLE_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());

static OG_TITLE_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="og:title"]"#).unwrap());
static TWITTER_TITLE_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[name="twitter:title"]"#).unwrap());
static OG_DESC_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="og:description"]"#).unwrap());
static DESC_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[name="description"]"#).unwrap());
static TWITTER_DESC_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[name="twitter:description"]"#).unwrap());

static DIAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"DIAG[^\n]*").unwrap());
static MULTI_NEWLINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static INLINE_SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]{2,}").unwrap());

// ── Public API ───────────────────────────────────────────────────────────────

/// Build a [`PageContext`] from raw HTML. Never fails: anything missing from
/// the document simply leaves its line out.
pub fn collect_page_context(html: &str, url: &str) -> PageContext {
    let document = Html::parse_document(html);
    page_context_from_document(&document, url)
}

pub fn page_context_from_document(document: &Html, url: &str) -> PageContext {
    let doc_title = document_title(document);
    let social_title = meta_content(document, &OG_TITLE_SEL)
        .or_else(|| meta_content(document, &TWITTER_TITLE_SEL));
    let summary = meta_content(document, &OG_DESC_SEL)
        .or_else(|| meta_content(document, &DESC_SEL))
        .or_else(|| meta_content(document, &TWITTER_DESC_SEL));

    let body = clean_text(&select_body_text(document));
    let body_len = body.chars().count();
    tracing::debug!(len = body_len, "final page text");
    if body_len < MIN_CONTAINER_LEN {
        tracing::warn!(
            len = body_len,
            url,
            sample = %truncate_chars(&body, 100),
            "very short text extracted"
        );
    }

    let title = social_title.or(doc_title).unwrap_or_default();

    let mut lines = ContextLines::default();
    lines.push("TITLE", &title);
    if let Some(product) = first_product(document) {
        push_product(&mut lines, &product);
    }
    for pair in collect_attributes(document) {
        lines.push_fact(pair.line());
    }
    if let Some(summary) = &summary {
        lines.push("SUMMARY", summary);
    }
    lines.push("PAGE", &body);

    PageContext {
        url: url.to_string(),
        title,
        text: truncate_chars(&lines.join(), MAX_TEXT_CHARS),
    }
}

/// True once a watched content container holds some text.
pub fn content_available(document: &Html) -> bool {
    document
        .select(&WATCHED_SEL)
        .next()
        .map(|el| !safe_text(el, TextScope::Full).is_empty())
        .unwrap_or(false)
}

/// Strip diagnostic markers, squeeze whitespace and cap the length.
pub fn clean_text(text: &str) -> String {
    let text = DIAG_RE.replace_all(text, "");
    let text = MULTI_NEWLINE_RE.replace_all(&text, "\n\n");
    let text = INLINE_SPACE_RE.replace_all(&text, " ");
    truncate_chars(text.trim(), MAX_TEXT_CHARS)
}

// ── Assembly ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ContextLines {
    lines: Vec<String>,
    seen: HashSet<String>,
}

impl ContextLines {
    fn push(&mut self, label: &str, value: &str) {
        if !value.is_empty() {
            self.lines.push(format!("{}: {}", label, value));
        }
    }

    /// Product and attribute facts are deduplicated across sources.
    fn push_fact(&mut self, line: String) {
        if self.seen.insert(line.clone()) {
            self.lines.push(line);
        }
    }

    fn push_labeled_fact(&mut self, label: &str, value: Option<&str>) {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            self.push_fact(format!("{}: {}", label, value));
        }
    }

    fn join(&self) -> String {
        self.lines.join("\n")
    }
}

fn push_product(lines: &mut ContextLines, product: &ProductRecord) {
    lines.push_labeled_fact("BRAND", product.brand.as_deref());
    lines.push_labeled_fact("PRODUCT", product.name.as_deref());
    let price = product.price.as_deref().map(|price| match &product.currency {
        Some(currency) => format!("{} {}", price, currency),
        None => price.to_string(),
    });
    lines.push_labeled_fact("PRICE", price.as_deref());
    lines.push_labeled_fact("MATERIAL", product.material.as_deref());
    lines.push_labeled_fact("COLOR", product.color.as_deref());
    lines.push_labeled_fact("SIZE", product.size.as_deref());
    lines.push_labeled_fact("COMPOSITION", product.composition.as_deref());
}

// ── Body text selection ──────────────────────────────────────────────────────

fn select_body_text(document: &Html) -> String {
    let mut text = String::new();

    if let Some(el) = document.select(&CONTENT_SEL).next() {
        tracing::debug!(element = %describe(el), "main content selector matched");
        text = safe_text(el, TextScope::Full);
    }

    if char_len(&text) < MIN_CONTAINER_LEN {
        if let Some(article) = document.select(&ARTICLE_SEL).next() {
            let candidate = safe_text(article, TextScope::Full);
            tracing::debug!(len = char_len(&candidate), "fallback to <article>");
            if !candidate.is_empty() {
                text = candidate;
            }
        }
    }

    if char_len(&text) < MIN_CONTAINER_LEN {
        if let Some(body) = document.select(&BODY_SEL).next() {
            let candidate = safe_text(body, TextScope::WithoutChrome);
            tracing::debug!(len = char_len(&candidate), "fallback to cleaned body");
            if !candidate.is_empty() {
                text = candidate;
            }
        }
    }

    if char_len(&text) < MIN_BODY_LEN {
        let candidate = safe_text(document.root_element(), TextScope::Full);
        tracing::debug!(len = char_len(&candidate), "last resort: whole document");
        if !candidate.is_empty() {
            text = candidate;
        }
    }

    text
}

fn describe(el: ElementRef<'_>) -> String {
    let classes = el.value().classes().collect::<Vec<_>>().join(".");
    if classes.is_empty() {
        el.value().name().to_string()
    } else {
        format!("{}.{}", el.value().name(), classes)
    }
}

// ── Rendered text ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TextScope {
    Full,
    /// Skips navigation, banners, headers and footers.
    WithoutChrome,
}

/// Visible text of an element, laid out roughly the way a browser's
/// `innerText` would, trimmed.
pub(crate) fn safe_text(el: ElementRef<'_>, scope: TextScope) -> String {
    let mut out = String::new();
    push_rendered(el, scope, false, &mut out);
    out.lines()
        .map(|line| line.trim_matches(' '))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn push_rendered(el: ElementRef<'_>, scope: TextScope, in_pre: bool, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => {
                if in_pre {
                    out.push_str(&text.text);
                } else {
                    push_collapsed(&text.text, out);
                }
            }
            Node::Element(_) => {
                let Some(child_el) = ElementRef::wrap(child) else {
                    continue;
                };
                let name = child_el.value().name();
                if SKIPPED_TAGS.contains(&name) {
                    continue;
                }
                if scope == TextScope::WithoutChrome && is_page_chrome(child_el) {
                    continue;
                }
                if name == "br" {
                    out.push('\n');
                    continue;
                }

                let breaks = if PARAGRAPH_TAGS.contains(&name) {
                    2
                } else if BLOCK_TAGS.contains(&name) {
                    1
                } else {
                    0
                };
                ensure_breaks(out, breaks);
                push_rendered(child_el, scope, in_pre || name == "pre", out);
                ensure_breaks(out, breaks);
                if matches!(name, "td" | "th") {
                    out.push('\t');
                }
            }
            _ => {}
        }
    }
}

fn push_collapsed(text: &str, out: &mut String) {
    let mut last_space = out.ends_with([' ', '\n']) || out.is_empty();
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(ch);
            last_space = false;
        }
    }
}

fn ensure_breaks(out: &mut String, count: usize) {
    if count == 0 || out.is_empty() {
        return;
    }
    let trailing = out.chars().rev().take_while(|&c| c == '\n').count();
    for _ in trailing..count {
        out.push('\n');
    }
}

fn is_page_chrome(el: ElementRef<'_>) -> bool {
    if matches!(el.value().name(), "nav" | "header" | "footer") {
        return true;
    }
    matches!(
        el.value().attr("role").map(|r| r.to_ascii_lowercase()).as_deref(),
        Some("navigation" | "banner")
    )
}

// ── DOM utility helpers ──────────────────────────────────────────────────────

fn meta_content(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .next()
        .and_then(|el| el.value().attr("content"))
        .map(|content| content.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn document_title(document: &Html) -> Option<String> {
    document
        .select(&TITLE_SEL)
        .next()
        .map(|el| normalize_text(&el.text().collect::<String>()))
        .filter(|s| !s.is_empty())
}

/// Collapse whitespace and trim.
pub(crate) fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
