use serde::{Deserialize, Serialize};

pub type TabId = u64;

/// Normalized snapshot of a page, used as conversational grounding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContext {
    pub url: String,
    pub title: String,
    pub text: String,
}

/// Product facts pulled from embedded JSON-LD.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductRecord {
    pub name: Option<String>,
    pub brand: Option<String>,
    pub price: Option<String>,
    pub currency: Option<String>,
    pub material: Option<String>,
    pub color: Option<String>,
    pub size: Option<String>,
    pub composition: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrKey {
    Material,
    Composition,
    Color,
    Size,
    Country,
    Brand,
    Model,
    Sku,
    Category,
}

impl AttrKey {
    pub fn label(self) -> &'static str {
        match self {
            AttrKey::Material => "MATERIAL",
            AttrKey::Composition => "COMPOSITION",
            AttrKey::Color => "COLOR",
            AttrKey::Size => "SIZE",
            AttrKey::Country => "COUNTRY",
            AttrKey::Brand => "BRAND",
            AttrKey::Model => "MODEL",
            AttrKey::Sku => "SKU",
            AttrKey::Category => "CATEGORY",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributePair {
    pub key: AttrKey,
    pub value: String,
}

impl AttributePair {
    pub fn line(&self) -> String {
        format!("{}: {}", self.key.label(), self.value)
    }
}

// ── Backend API ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatRequest {
    pub message: String,
    pub page_url: Option<String>,
    pub page_title: Option<String>,
    pub page_text: Option<String>,
    pub force_search: bool,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>, page: &PageContext) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            message: message.into(),
            page_url: non_empty(&page.url),
            page_title: non_empty(&page.title),
            page_text: Some(page.text.clone()),
            force_search: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Source {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub used_search: bool,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub streamed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportRequest {
    pub page_url: String,
    pub page_title: String,
    pub page_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TtsRequest {
    pub text: String,
}

// ── Cross-context messages ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextMessage {
    PageContext {
        #[serde(flatten)]
        context: PageContext,
        #[serde(default)]
        tab_id: Option<TabId>,
        #[serde(default)]
        ts: Option<u64>,
    },
    RequestContext,
}

/// Cache entry held by the relay for a tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedContext {
    pub tab_id: TabId,
    pub url: String,
    pub title: String,
    pub text: String,
    pub ts: u64,
}

#[derive(Debug, Deserialize)]
pub struct ExtractRequest {
    pub url: String,
    #[serde(default)]
    pub tab_id: Option<TabId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_context_message_is_flat_and_tagged() {
        let msg = ContextMessage::PageContext {
            context: PageContext {
                url: "https://shop.example/p/1".into(),
                title: "Shirt".into(),
                text: "TITLE: Shirt".into(),
            },
            tab_id: Some(7),
            ts: Some(1_700_000_000_000),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "PAGE_CONTEXT");
        assert_eq!(value["url"], "https://shop.example/p/1");
        assert_eq!(value["tab_id"], 7);

        let back: ContextMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn request_context_has_no_payload() {
        let value = serde_json::to_value(ContextMessage::RequestContext).unwrap();
        assert_eq!(value, serde_json::json!({"type": "REQUEST_CONTEXT"}));
    }

    #[test]
    fn chat_response_fields_default() {
        let resp: ChatResponse = serde_json::from_str(r#"{"answer":"hi"}"#).unwrap();
        assert_eq!(resp.answer, "hi");
        assert!(!resp.used_search);
        assert!(resp.sources.is_empty());
        assert!(resp.debug.is_none());
    }
}
