use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{mpsc, RwLock};

use crate::models::{CachedContext, ContextMessage, PageContext, TabId};

pub const MAX_RETRIES: u32 = 3;
pub const RETRY_STEP: Duration = Duration::from_millis(500);

static TRANSIENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)context invalidated|receiving end does not exist").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Extension context invalidated")]
    ContextInvalidated,
    #[error("Could not establish connection. Receiving end does not exist.")]
    NoReceiver,
    #[error("{0}")]
    Other(String),
}

impl ChannelError {
    /// Errors that usually clear up once the other side (re)starts.
    pub fn is_transient(&self) -> bool {
        match self {
            ChannelError::ContextInvalidated | ChannelError::NoReceiver => true,
            ChannelError::Other(message) => TRANSIENT_RE.is_match(message),
        }
    }
}

/// Somewhere a context message can be delivered.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, message: ContextMessage) -> Result<(), ChannelError>;
}

#[async_trait]
impl MessageSink for mpsc::Sender<ContextMessage> {
    async fn send(&self, message: ContextMessage) -> Result<(), ChannelError> {
        mpsc::Sender::send(self, message)
            .await
            .map_err(|_| ChannelError::NoReceiver)
    }
}

/// Posts messages to a running relay service.
#[derive(Debug, Clone)]
pub struct HttpSink {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(relay_base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("{}/messages", relay_base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl MessageSink for HttpSink {
    async fn send(&self, message: ContextMessage) -> Result<(), ChannelError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&message)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    ChannelError::NoReceiver
                } else {
                    ChannelError::Other(e.to_string())
                }
            })?;
        if !response.status().is_success() {
            return Err(ChannelError::Other(format!(
                "relay answered {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Best-effort delivery: transient failures are retried with linear backoff,
/// anything else is dropped. Returns whether the message got through.
pub async fn send_message_safe<S>(sink: &S, message: ContextMessage) -> bool
where
    S: MessageSink + ?Sized,
{
    send_with_backoff(sink, message, RETRY_STEP).await
}

pub async fn send_with_backoff<S>(sink: &S, message: ContextMessage, step: Duration) -> bool
where
    S: MessageSink + ?Sized,
{
    let mut attempt = 0;
    loop {
        match sink.send(message.clone()).await {
            Ok(()) => return true,
            Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                attempt += 1;
                tracing::debug!(attempt, error = %e, "context message not delivered; retrying");
                tokio::time::sleep(step * attempt).await;
            }
            Err(e) => {
                tracing::debug!(error = %e, "dropping context message");
                return false;
            }
        }
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Receiving side ───────────────────────────────────────────────────────────

/// Last known context per tab plus the most recent one overall.
#[derive(Debug, Default)]
pub struct ContextCache {
    by_tab: HashMap<TabId, CachedContext>,
    last: Option<CachedContext>,
}

pub type SharedContextCache = Arc<RwLock<ContextCache>>;

impl ContextCache {
    pub fn shared() -> SharedContextCache {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn record(&mut self, tab_id: TabId, context: PageContext, ts: u64) -> CachedContext {
        let entry = CachedContext {
            tab_id,
            url: context.url,
            title: context.title,
            text: context.text,
            ts,
        };
        self.by_tab.insert(tab_id, entry.clone());
        self.last = Some(entry.clone());
        entry
    }

    /// Apply an incoming message. `PAGE_CONTEXT` without a tab id is ignored;
    /// `REQUEST_CONTEXT` is answered with the last recorded context.
    pub fn handle(&mut self, message: ContextMessage) -> Option<CachedContext> {
        match message {
            ContextMessage::PageContext {
                context,
                tab_id: Some(tab_id),
                ts,
            } => Some(self.record(tab_id, context, ts.unwrap_or_else(now_millis))),
            ContextMessage::PageContext { tab_id: None, .. } => {
                tracing::debug!("ignoring page context without a tab");
                None
            }
            ContextMessage::RequestContext => self.last.clone(),
        }
    }

    pub fn get(&self, tab_id: TabId) -> Option<&CachedContext> {
        self.by_tab.get(&tab_id)
    }

    pub fn last(&self) -> Option<&CachedContext> {
        self.last.as_ref()
    }

    /// Forget a closed tab. The "last" slot is left alone.
    pub fn remove_tab(&mut self, tab_id: TabId) -> Option<CachedContext> {
        self.by_tab.remove(&tab_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct FlakySink {
        failures: u32,
        error: fn() -> ChannelError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MessageSink for FlakySink {
        async fn send(&self, _message: ContextMessage) -> Result<(), ChannelError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err((self.error)())
            } else {
                Ok(())
            }
        }
    }

    fn page(url: &str) -> PageContext {
        PageContext {
            url: url.into(),
            title: "T".into(),
            text: "TITLE: T".into(),
        }
    }

    #[test]
    fn transient_errors_are_recognized() {
        assert!(ChannelError::NoReceiver.is_transient());
        assert!(ChannelError::ContextInvalidated.is_transient());
        assert!(ChannelError::Other("Error: Extension context invalidated.".into()).is_transient());
        assert!(!ChannelError::Other("message too large".into()).is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_with_linear_backoff() {
        let sink = FlakySink {
            failures: 3,
            error: || ChannelError::NoReceiver,
            calls: AtomicU32::new(0),
        };
        let start = tokio::time::Instant::now();
        assert!(send_message_safe(&sink, ContextMessage::RequestContext).await);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 4);
        // 500 + 1000 + 1500 ms
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(3000), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(3100), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_retries() {
        let sink = FlakySink {
            failures: 10,
            error: || ChannelError::ContextInvalidated,
            calls: AtomicU32::new(0),
        };
        assert!(!send_message_safe(&sink, ContextMessage::RequestContext).await);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_errors_are_dropped_without_retry() {
        let sink = FlakySink {
            failures: 1,
            error: || ChannelError::Other("quota exceeded".into()),
            calls: AtomicU32::new(0),
        };
        assert!(!send_message_safe(&sink, ContextMessage::RequestContext).await);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_channel_counts_as_missing_receiver() {
        let (tx, rx) = mpsc::channel::<ContextMessage>(1);
        drop(rx);
        let err = MessageSink::send(&tx, ContextMessage::RequestContext).await.unwrap_err();
        assert!(matches!(err, ChannelError::NoReceiver));
    }

    #[test]
    fn cache_tracks_tabs_and_last() {
        let mut cache = ContextCache::default();
        cache.handle(ContextMessage::PageContext {
            context: page("https://a.example"),
            tab_id: Some(1),
            ts: Some(10),
        });
        cache.handle(ContextMessage::PageContext {
            context: page("https://b.example"),
            tab_id: Some(2),
            ts: None,
        });
        assert_eq!(cache.get(1).unwrap().url, "https://a.example");
        assert_eq!(cache.get(1).unwrap().ts, 10);
        assert_eq!(cache.last().unwrap().tab_id, 2);
        assert!(cache.get(2).unwrap().ts > 0);

        let answered = cache.handle(ContextMessage::RequestContext).unwrap();
        assert_eq!(answered.url, "https://b.example");

        assert!(cache.remove_tab(2).is_some());
        assert!(cache.get(2).is_none());
        assert_eq!(cache.last().unwrap().tab_id, 2);
    }

    #[test]
    fn context_without_tab_is_ignored() {
        let mut cache = ContextCache::default();
        let stored = cache.handle(ContextMessage::PageContext {
            context: page("https://a.example"),
            tab_id: None,
            ts: None,
        });
        assert!(stored.is_none());
        assert!(cache.last().is_none());
    }
}
