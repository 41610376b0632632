use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};

use page_assistant::config::{self, Settings, BACKEND_URL_ENV};
use page_assistant::extract::collect_page_context;
use page_assistant::fetch::fetch_html;
use page_assistant::messaging::{ContextCache, HttpSink};
use page_assistant::models::{ExportRequest, PageContext};
use page_assistant::relay::{speech_text, BackendClient};
use page_assistant::server::{self, AppState};
use page_assistant::session::{ChatSession, FetchingProvider, Role, TabInfo};
use page_assistant::watcher::{run_watcher, ContextWatcher, PageEvent, RemotePage};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "page-assistant", version, about = "Ask an assistant backend about a web page")]
struct Cli {
    /// Backend base URL
    #[arg(long, global = true, env = BACKEND_URL_ENV)]
    backend: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the extracted page context
    Context {
        url: String,
        #[arg(long)]
        json: bool,
    },
    /// Ask a question about a page
    Chat {
        url: String,
        message: String,
        /// Ask the backend to search the web
        #[arg(long)]
        search: bool,
    },
    /// Export the page as Markdown through the backend
    Export {
        url: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run the context relay service
    Serve {
        #[arg(long, default_value = "0.0.0.0:8000")]
        listen: String,
    },
    /// Keep a relay's context for a page fresh
    Watch {
        url: String,
        /// Relay service base URL
        #[arg(long, default_value = "http://127.0.0.1:8000")]
        relay: String,
        #[arg(long, default_value_t = 0)]
        tab: u64,
        /// Seconds between refreshes
        #[arg(long, default_value_t = 30)]
        interval: u64,
    },
    /// Show or change the backend's own configuration
    RemoteConfig {
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
    /// Synthesize speech for a page
    Tts {
        url: String,
        #[arg(long)]
        summarize: bool,
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let insecure = config::insecure_ssl();

    match cli.command {
        Command::Context { url, json } => {
            let context = load_context(&url, insecure).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&context)?);
            } else {
                println!("{}", context.text);
            }
        }
        Command::Chat { url, message, search } => {
            let client = backend(cli.backend.as_deref())?;
            let mut session = ChatSession::new().with_force_search(search);
            session.activate_tab(TabInfo {
                id: 0,
                url: url.clone(),
                title: String::new(),
            });
            let provider = FetchingProvider { insecure };

            let mut printed = String::new();
            let before = session.log().len();
            let response = session
                .send(&client, &provider, &message, |text| {
                    if let Some(rest) = text.strip_prefix(printed.as_str()) {
                        print!("{}", rest);
                        let _ = std::io::stdout().flush();
                        printed = text.to_string();
                    }
                })
                .await;
            if !printed.is_empty() {
                println!();
            }
            for entry in session.log().iter().skip(before) {
                // A streamed entry is reprinted only if the live output drifted
                // from its final text.
                let shown = entry.streamed && printed.starts_with(entry.text.as_str());
                if entry.role == Role::Assistant && !shown {
                    println!("{}", entry.text);
                }
            }
            if response.is_none() {
                std::process::exit(1);
            }
        }
        Command::Export { url, out } => {
            let client = backend(cli.backend.as_deref())?;
            let context = load_context(&url, insecure).await?;
            let markdown = client
                .export_markdown(&ExportRequest {
                    page_url: context.url,
                    page_title: context.title,
                    page_text: context.text,
                })
                .await?;
            match out {
                Some(path) => std::fs::write(&path, markdown)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{}", markdown),
            }
        }
        Command::Serve { listen } => {
            let app = server::router(AppState {
                cache: ContextCache::shared(),
                insecure,
            });
            let listener = tokio::net::TcpListener::bind(&listen)
                .await
                .with_context(|| format!("binding {}", listen))?;
            tracing::info!("listening on {}", listener.local_addr()?);
            axum::serve(listener, app).await?;
        }
        Command::Watch {
            url,
            relay,
            tab,
            interval,
        } => {
            let page = RemotePage {
                url: url.clone(),
                insecure,
            };
            let (events, rx) = mpsc::channel(8);
            let driver = tokio::spawn(run_watcher(
                ContextWatcher::new(url.as_str()),
                page,
                HttpSink::new(&relay),
                Some(tab),
                rx,
            ));
            tracing::info!(%url, %relay, tab, "watching page");

            let mut refresh = tokio::time::interval(Duration::from_secs(interval.max(1)));
            refresh.tick().await;
            events
                .send(PageEvent::Loaded)
                .await
                .context("watcher stopped early")?;
            loop {
                tokio::select! {
                    _ = refresh.tick() => {
                        let shown = PageEvent::VisibilityChanged { hidden: false };
                        if events.send(shown).await.is_err() {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            drop(events);
            driver.await?;
        }
        Command::RemoteConfig { set } => {
            let client = backend(cli.backend.as_deref())?;
            let value = if set.is_empty() {
                client.remote_config().await?
            } else {
                client.update_remote_config(&parse_assignments(&set)?).await?
            };
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Command::Tts { url, summarize, out } => {
            let client = backend(cli.backend.as_deref())?;
            let context = load_context(&url, insecure).await?;
            let reply = if summarize {
                client.tts_summarize(&context.text).await?
            } else {
                client.tts_prepare(&context.text).await?
            };
            let audio = client
                .tts_synthesize(&speech_text(&reply, &context.text))
                .await?;
            std::fs::write(&out, audio).with_context(|| format!("writing {}", out.display()))?;
            tracing::info!(path = %out.display(), "audio written");
        }
    }
    Ok(())
}

fn backend(base_url: Option<&str>) -> anyhow::Result<BackendClient> {
    let settings = Settings::new(base_url.unwrap_or(config::DEFAULT_BACKEND_URL))?;
    Ok(BackendClient::new(settings)?)
}

async fn load_context(url: &str, insecure: bool) -> anyhow::Result<PageContext> {
    let html = fetch_html(url, insecure)
        .await
        .with_context(|| format!("fetching {}", url))?;
    Ok(collect_page_context(&html, url))
}

fn parse_assignments(pairs: &[String]) -> anyhow::Result<Value> {
    let mut map = Map::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("expected KEY=VALUE, got {:?}", pair);
        };
        map.insert(key.trim().to_string(), Value::String(value.trim().to_string()));
    }
    Ok(Value::Object(map))
}
