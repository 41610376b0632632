use async_trait::async_trait;
use url::Url;

use crate::extract::collect_page_context;
use crate::fetch::fetch_html;
use crate::messaging::SharedContextCache;
use crate::models::{ChatRequest, ChatResponse, PageContext, TabId};
use crate::relay::BackendClient;
use crate::sanitize::{external_sources, sanitize_for_display};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub role: Role,
    pub text: String,
    /// Filled chunk by chunk from a streamed answer.
    pub streamed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    pub id: TabId,
    pub url: String,
    pub title: String,
}

/// Where the session gets the page context for a tab.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn request_context(&self, tab: &TabInfo) -> Option<PageContext>;
}

/// Downloads the tab's URL and extracts its context.
#[derive(Debug, Clone, Default)]
pub struct FetchingProvider {
    pub insecure: bool,
}

#[async_trait]
impl ContextProvider for FetchingProvider {
    async fn request_context(&self, tab: &TabInfo) -> Option<PageContext> {
        match fetch_html(&tab.url, self.insecure).await {
            Ok(html) => Some(collect_page_context(&html, &tab.url)),
            Err(e) => {
                tracing::warn!(url = %tab.url, error = %e, "could not load page context");
                None
            }
        }
    }
}

/// Serves whatever the relay last cached for the tab.
#[async_trait]
impl ContextProvider for SharedContextCache {
    async fn request_context(&self, tab: &TabInfo) -> Option<PageContext> {
        self.read().await.get(tab.id).map(|cached| PageContext {
            url: cached.url.clone(),
            title: cached.title.clone(),
            text: cached.text.clone(),
        })
    }
}

/// Conversation state for one assistant panel.
#[derive(Debug, Default)]
pub struct ChatSession {
    current_tab: Option<TabInfo>,
    last_url: Option<String>,
    busy: bool,
    force_search: bool,
    log: Vec<ChatEntry>,
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_force_search(mut self, force_search: bool) -> Self {
        self.force_search = force_search;
        self
    }

    pub fn log(&self) -> &[ChatEntry] {
        &self.log
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn last_url(&self) -> Option<&str> {
        self.last_url.as_deref()
    }

    /// Switching to another tab starts a fresh conversation.
    pub fn activate_tab(&mut self, tab: TabInfo) {
        if self.current_tab.as_ref().map(|t| t.id) != Some(tab.id) {
            self.log.clear();
        }
        self.last_url = Some(tab.url.clone());
        self.current_tab = Some(tab);
    }

    /// A finished navigation in the current tab clears the conversation
    /// unless it stayed on the same host.
    pub fn tab_updated(&mut self, tab_id: TabId, url: &str) {
        let Some(current) = self.current_tab.as_mut() else {
            return;
        };
        if current.id != tab_id {
            return;
        }
        let same_host = match (self.last_url.as_deref().map(Url::parse), Url::parse(url)) {
            (Some(Ok(prev)), Ok(next)) => prev.host_str() == next.host_str(),
            _ => false,
        };
        if !same_host {
            self.log.clear();
        }
        current.url = url.to_string();
        self.last_url = Some(url.to_string());
    }

    /// Relay one user message and record the outcome in the log.
    ///
    /// `on_stream` sees the answer so far while a stream is being read.
    /// Failures end up as a single error entry; the session is never left
    /// busy.
    pub async fn send<P, F>(
        &mut self,
        client: &BackendClient,
        provider: &P,
        message: &str,
        mut on_stream: F,
    ) -> Option<ChatResponse>
    where
        P: ContextProvider + ?Sized,
        F: FnMut(&str),
    {
        let message = message.trim();
        if message.is_empty() {
            return None;
        }
        self.push(Role::User, message);

        let Some(tab) = self.current_tab.clone() else {
            self.push(Role::Assistant, "Could not determine the active tab.");
            return None;
        };

        let page = provider.request_context(&tab).await.unwrap_or_default();
        let page = PageContext {
            url: non_empty_or(page.url, &tab.url),
            title: non_empty_or(page.title, &tab.title),
            text: page.text,
        };
        self.last_url = Some(page.url.clone());

        let mut request = ChatRequest::new(message, &page);
        request.force_search = self.force_search;

        self.busy = true;
        let mut stream_entry: Option<usize> = None;
        let result = {
            let log = &mut self.log;
            client
                .chat(&request, |text| {
                    on_stream(text);
                    match stream_entry {
                        Some(idx) => log[idx].text = text.to_string(),
                        None => {
                            log.push(ChatEntry {
                                role: Role::Assistant,
                                text: text.to_string(),
                                streamed: true,
                            });
                            stream_entry = Some(log.len() - 1);
                        }
                    }
                })
                .await
        };
        self.busy = false;

        match result {
            Ok(response) => {
                match stream_entry {
                    Some(idx) => self.log[idx].text = response.answer.clone(),
                    None if !response.answer.is_empty() => self.log.push(ChatEntry {
                        role: Role::Assistant,
                        text: response.answer.clone(),
                        streamed: response.streamed,
                    }),
                    None => {}
                }
                let links = external_sources(message, &response, self.last_url.as_deref());
                if !links.is_empty() {
                    // URLs go in verbatim; the sanitizer would eat underscores.
                    self.log.push(ChatEntry {
                        role: Role::Assistant,
                        text: format!("External sources:\n{}", links.join("\n")),
                        streamed: false,
                    });
                }
                Some(response)
            }
            Err(e) => {
                tracing::warn!(error = %e, "chat request failed");
                self.push(Role::Assistant, &format!("Error: {}", e));
                None
            }
        }
    }

    /// Plain-text transcript, one block per entry.
    pub fn transcript(&self) -> String {
        self.log
            .iter()
            .map(|entry| {
                let who = match entry.role {
                    Role::User => "You",
                    Role::Assistant => "AI",
                };
                format!("{}: {}", who, entry.text)
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn push(&mut self, role: Role, text: &str) {
        self.log.push(ChatEntry {
            role,
            text: sanitize_for_display(text),
            streamed: false,
        });
    }
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tab(id: TabId, url: &str) -> TabInfo {
        TabInfo {
            id,
            url: url.into(),
            title: String::new(),
        }
    }

    fn seeded(entries: usize) -> ChatSession {
        let mut session = ChatSession::new();
        session.activate_tab(tab(1, "https://shop.example/a"));
        for i in 0..entries {
            session.push(Role::User, &format!("m{}", i));
        }
        session
    }

    #[test]
    fn switching_tabs_clears_log() {
        let mut session = seeded(2);
        session.activate_tab(tab(1, "https://shop.example/a"));
        assert_eq!(session.log().len(), 2);
        session.activate_tab(tab(2, "https://other.example"));
        assert!(session.log().is_empty());
        assert_eq!(session.last_url(), Some("https://other.example"));
    }

    #[test]
    fn same_host_navigation_keeps_log() {
        let mut session = seeded(1);
        session.tab_updated(1, "https://shop.example/b");
        assert_eq!(session.log().len(), 1);
        session.tab_updated(1, "https://elsewhere.example/");
        assert!(session.log().is_empty());
        assert_eq!(session.last_url(), Some("https://elsewhere.example/"));
    }

    #[test]
    fn updates_for_other_tabs_are_ignored() {
        let mut session = seeded(1);
        session.tab_updated(9, "https://elsewhere.example/");
        assert_eq!(session.log().len(), 1);
        assert_eq!(session.last_url(), Some("https://shop.example/a"));
    }

    #[test]
    fn transcript_labels_roles() {
        let mut session = seeded(1);
        session.push(Role::Assistant, "**hi**");
        assert_eq!(session.transcript(), "You: m0\n\nAI: hi");
    }
}
