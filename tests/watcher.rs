use page_assistant::models::ContextMessage;
use page_assistant::watcher::{run_watcher, ContextWatcher, PageEvent, PageSource, RemotePage};
use tokio::sync::{mpsc, oneshot};
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

const PAGE: &str = "<html><head><title>Кофемолка</title></head>\
    <body><main>Жернова из керамики.</main></body></html>";

async fn page_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(matchers::method("GET"))
        .and(matchers::path("/grinder"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(PAGE, "text/html; charset=utf-8"))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn remote_page_snapshot_downloads_html() {
    let server = page_server().await;
    let page = RemotePage {
        url: format!("{}/grinder", server.uri()),
        insecure: false,
    };

    let snapshot = page.snapshot().await.unwrap();
    let context = snapshot.context();
    assert_eq!(context.title, "Кофемолка");
    assert!(context.text.contains("PAGE: Жернова из керамики."));
}

#[tokio::test]
async fn missing_remote_page_yields_no_snapshot() {
    let server = MockServer::start().await;
    Mock::given(matchers::any())
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let page = RemotePage {
        url: format!("{}/gone", server.uri()),
        insecure: false,
    };
    assert!(page.snapshot().await.is_none());
}

#[tokio::test]
async fn watcher_on_remote_page_answers_requests() {
    let server = page_server().await;
    let url = format!("{}/grinder", server.uri());
    let (event_tx, event_rx) = mpsc::channel(4);
    let (msg_tx, mut msg_rx) = mpsc::channel(4);
    let driver = tokio::spawn(run_watcher(
        ContextWatcher::new(url.as_str()),
        RemotePage {
            url: url.clone(),
            insecure: false,
        },
        msg_tx,
        Some(7),
        event_rx,
    ));

    let (reply_tx, reply_rx) = oneshot::channel();
    event_tx
        .send(PageEvent::ContextRequested { reply: reply_tx })
        .await
        .unwrap();
    assert_eq!(reply_rx.await.unwrap().url, url);

    match msg_rx.recv().await.unwrap() {
        ContextMessage::PageContext { context, tab_id, .. } => {
            assert_eq!(tab_id, Some(7));
            assert_eq!(context.title, "Кофемолка");
        }
        other => panic!("unexpected message {:?}", other),
    }

    drop(event_tx);
    driver.await.unwrap();
}
