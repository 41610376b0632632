use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use async_trait::async_trait;
use scraper::Html;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::extract::{collect_page_context, content_available};
use crate::fetch::fetch_html;
use crate::messaging::{now_millis, send_message_safe, MessageSink};
use crate::models::{ContextMessage, PageContext, TabId};

const LOAD_DELAYS: [Duration; 2] = [Duration::from_millis(500), Duration::from_millis(1500)];
const NAVIGATION_DELAYS: [Duration; 2] = [Duration::from_millis(300), Duration::from_millis(1500)];
const CONTENT_DELAY: Duration = Duration::from_millis(300);

/// Things that happen to a page and may warrant a fresh context.
#[derive(Debug)]
pub enum PageEvent {
    Loaded,
    /// History navigation or back/forward, with the new location.
    Navigated { href: String },
    VisibilityChanged { hidden: bool },
    /// The document changed; fires a run at most once per page load.
    ContentChanged,
    /// Someone wants the context now.
    ContextRequested { reply: oneshot::Sender<PageContext> },
}

/// Decides when to recompute the page context.
#[derive(Debug)]
pub struct ContextWatcher {
    last_href: String,
    content_fired: bool,
}

impl ContextWatcher {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            last_href: href.into(),
            content_fired: false,
        }
    }

    /// Delays after which an extraction run should happen. `content_ready`
    /// is consulted only for [`PageEvent::ContentChanged`].
    pub fn schedule(&mut self, event: &PageEvent, content_ready: impl FnOnce() -> bool) -> Vec<Duration> {
        match event {
            PageEvent::Loaded => LOAD_DELAYS.to_vec(),
            PageEvent::Navigated { href } => {
                if *href == self.last_href {
                    return Vec::new();
                }
                self.last_href = href.clone();
                NAVIGATION_DELAYS.to_vec()
            }
            PageEvent::VisibilityChanged { hidden: false } => vec![Duration::ZERO],
            PageEvent::VisibilityChanged { hidden: true } => Vec::new(),
            PageEvent::ContentChanged => {
                if self.content_fired || !content_ready() {
                    return Vec::new();
                }
                self.content_fired = true;
                vec![CONTENT_DELAY]
            }
            PageEvent::ContextRequested { .. } => Vec::new(),
        }
    }

    pub fn last_href(&self) -> &str {
        &self.last_href
    }

    /// Whether the one-shot content run has been scheduled for this page.
    pub fn content_fired(&self) -> bool {
        self.content_fired
    }
}

#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub url: String,
    pub html: String,
}

impl PageSnapshot {
    pub fn context(&self) -> PageContext {
        collect_page_context(&self.html, &self.url)
    }
}

/// Current state of the watched page.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn snapshot(&self) -> Option<PageSnapshot>;
}

/// A page re-downloaded on every snapshot.
#[derive(Debug, Clone)]
pub struct RemotePage {
    pub url: String,
    pub insecure: bool,
}

#[async_trait]
impl PageSource for RemotePage {
    async fn snapshot(&self) -> Option<PageSnapshot> {
        match fetch_html(&self.url, self.insecure).await {
            Ok(html) => Some(PageSnapshot {
                url: self.url.clone(),
                html,
            }),
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "page snapshot failed");
                None
            }
        }
    }
}

/// Drive a watcher until the event channel closes, posting a `PAGE_CONTEXT`
/// message for every scheduled run and every on-demand request.
pub async fn run_watcher<P, S>(
    mut watcher: ContextWatcher,
    page: P,
    sink: S,
    tab_id: Option<TabId>,
    mut events: mpsc::Receiver<PageEvent>,
) where
    P: PageSource,
    S: MessageSink,
{
    let mut due: BinaryHeap<Reverse<Instant>> = BinaryHeap::new();
    loop {
        let next = due.peek().map(|Reverse(at)| *at);
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    PageEvent::ContextRequested { reply } => {
                        if let Some(context) = page.snapshot().await.map(|s| s.context()) {
                            post_context(&sink, tab_id, context.clone()).await;
                            let _ = reply.send(context);
                        }
                    }
                    event => {
                        let snapshot = match event {
                            PageEvent::ContentChanged if !watcher.content_fired() => {
                                page.snapshot().await
                            }
                            _ => None,
                        };
                        let ready = || {
                            snapshot
                                .map(|s| content_available(&Html::parse_document(&s.html)))
                                .unwrap_or(false)
                        };
                        let now = Instant::now();
                        due.extend(
                            watcher
                                .schedule(&event, ready)
                                .into_iter()
                                .map(|delay| Reverse(now + delay)),
                        );
                    }
                }
            }
            _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                due.pop();
                if let Some(snapshot) = page.snapshot().await {
                    post_context(&sink, tab_id, snapshot.context()).await;
                }
            }
        }
    }
    tracing::debug!(href = watcher.last_href(), "watcher stopped");
}

async fn post_context<S: MessageSink + ?Sized>(sink: &S, tab_id: Option<TabId>, context: PageContext) {
    tracing::debug!(text_len = context.text.len(), url = %context.url, "sending context");
    send_message_safe(
        sink,
        ContextMessage::PageContext {
            context,
            tab_id,
            ts: Some(now_millis()),
        },
    )
    .await;
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn load_schedules_two_runs() {
        let mut watcher = ContextWatcher::new("https://a.example/");
        assert_eq!(watcher.schedule(&PageEvent::Loaded, || true), vec![ms(500), ms(1500)]);
    }

    #[test]
    fn navigation_only_fires_on_change() {
        let mut watcher = ContextWatcher::new("https://a.example/1");
        let same = PageEvent::Navigated {
            href: "https://a.example/1".into(),
        };
        assert!(watcher.schedule(&same, || true).is_empty());

        let moved = PageEvent::Navigated {
            href: "https://a.example/2".into(),
        };
        assert_eq!(watcher.schedule(&moved, || true), vec![ms(300), ms(1500)]);
        assert_eq!(watcher.last_href(), "https://a.example/2");
        assert!(watcher.schedule(&moved, || true).is_empty());
    }

    #[test]
    fn visibility_runs_only_when_shown() {
        let mut watcher = ContextWatcher::new("");
        assert!(watcher
            .schedule(&PageEvent::VisibilityChanged { hidden: true }, || true)
            .is_empty());
        assert_eq!(
            watcher.schedule(&PageEvent::VisibilityChanged { hidden: false }, || true),
            vec![Duration::ZERO]
        );
    }

    #[test]
    fn content_change_fires_once_when_ready() {
        let mut watcher = ContextWatcher::new("");
        assert!(watcher.schedule(&PageEvent::ContentChanged, || false).is_empty());
        assert_eq!(watcher.schedule(&PageEvent::ContentChanged, || true), vec![ms(300)]);
        assert!(watcher.schedule(&PageEvent::ContentChanged, || true).is_empty());
    }

    struct CountingPage {
        snapshots: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl PageSource for std::sync::Arc<CountingPage> {
        async fn snapshot(&self) -> Option<PageSnapshot> {
            self.snapshots.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Some(PageSnapshot {
                url: "https://a.example/".into(),
                html: "<html><body><main>Ready</main></body></html>".into(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn content_changes_after_one_shot_skip_snapshots() {
        use std::sync::atomic::Ordering;

        let (event_tx, event_rx) = mpsc::channel(8);
        let (msg_tx, mut msg_rx) = mpsc::channel(8);
        let page = std::sync::Arc::new(CountingPage {
            snapshots: Default::default(),
        });
        tokio::spawn(run_watcher(ContextWatcher::new(""), page.clone(), msg_tx, None, event_rx));

        event_tx.send(PageEvent::ContentChanged).await.unwrap();
        msg_rx.recv().await.unwrap();
        assert_eq!(page.snapshots.load(Ordering::SeqCst), 2);

        for _ in 0..3 {
            event_tx.send(PageEvent::ContentChanged).await.unwrap();
        }
        tokio::time::sleep(ms(1000)).await;
        assert!(msg_rx.try_recv().is_err());
        assert_eq!(page.snapshots.load(Ordering::SeqCst), 2);
    }

    struct StaticPage {
        html: Mutex<String>,
    }

    #[async_trait]
    impl PageSource for StaticPage {
        async fn snapshot(&self) -> Option<PageSnapshot> {
            Some(PageSnapshot {
                url: "https://a.example/".into(),
                html: self.html.lock().unwrap().clone(),
            })
        }
    }

    fn static_page(html: &str) -> StaticPage {
        StaticPage {
            html: Mutex::new(html.to_string()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn driver_posts_context_on_schedule() {
        let (event_tx, event_rx) = mpsc::channel(8);
        let (msg_tx, mut msg_rx) = mpsc::channel(8);
        let page = static_page("<html><head><title>Hello</title></head><body><main>Body</main></body></html>");
        let handle = tokio::spawn(run_watcher(
            ContextWatcher::new("https://a.example/"),
            page,
            msg_tx,
            Some(5),
            event_rx,
        ));

        let start = Instant::now();
        event_tx.send(PageEvent::Loaded).await.unwrap();

        let first = msg_rx.recv().await.unwrap();
        assert!(start.elapsed() >= ms(500) && start.elapsed() < ms(600));
        match first {
            ContextMessage::PageContext { context, tab_id, ts } => {
                assert_eq!(tab_id, Some(5));
                assert!(ts.is_some());
                assert_eq!(context.title, "Hello");
                assert!(context.text.contains("PAGE: Body"));
            }
            other => panic!("unexpected message {:?}", other),
        }

        msg_rx.recv().await.unwrap();
        assert!(start.elapsed() >= ms(1500) && start.elapsed() < ms(1600));

        drop(event_tx);
        handle.await.unwrap();
        assert!(msg_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn on_demand_request_replies_and_posts() {
        let (event_tx, event_rx) = mpsc::channel(8);
        let (msg_tx, mut msg_rx) = mpsc::channel(8);
        let page = static_page("<html><head><title>Now</title></head><body></body></html>");
        tokio::spawn(run_watcher(ContextWatcher::new(""), page, msg_tx, Some(1), event_rx));

        let (reply_tx, reply_rx) = oneshot::channel();
        event_tx
            .send(PageEvent::ContextRequested { reply: reply_tx })
            .await
            .unwrap();
        let context = reply_rx.await.unwrap();
        assert_eq!(context.title, "Now");
        assert!(matches!(
            msg_rx.recv().await,
            Some(ContextMessage::PageContext { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_content_does_not_consume_one_shot() {
        let (event_tx, event_rx) = mpsc::channel(8);
        let (msg_tx, mut msg_rx) = mpsc::channel(8);
        let page = std::sync::Arc::new(static_page("<html><body><main></main></body></html>"));

        struct Shared(std::sync::Arc<StaticPage>);
        #[async_trait]
        impl PageSource for Shared {
            async fn snapshot(&self) -> Option<PageSnapshot> {
                self.0.snapshot().await
            }
        }

        tokio::spawn(run_watcher(
            ContextWatcher::new(""),
            Shared(page.clone()),
            msg_tx,
            None,
            event_rx,
        ));

        event_tx.send(PageEvent::ContentChanged).await.unwrap();
        tokio::time::sleep(ms(1000)).await;
        assert!(msg_rx.try_recv().is_err());

        *page.html.lock().unwrap() = "<html><body><main>Arrived</main></body></html>".into();
        event_tx.send(PageEvent::ContentChanged).await.unwrap();
        event_tx.send(PageEvent::ContentChanged).await.unwrap();
        let start = Instant::now();
        msg_rx.recv().await.unwrap();
        assert!(start.elapsed() >= ms(300));
        tokio::time::sleep(ms(2000)).await;
        assert!(msg_rx.try_recv().is_err());
    }
}
