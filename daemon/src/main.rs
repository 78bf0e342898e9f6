use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use fail_ding::audio::ToneSink;
use fail_ding::classifier::Verdict;
use fail_ding::config::{self, Config};
use fail_ding::event::DaemonEvent;
use fail_ding::{hotkey, logging, paths};
use fail_ding::{HttpRequest, Monitor, ReqwestTransport, ResponseBody, WatchedClient};

/// How long the process stays alive after an alert so playback can finish.
const ALERT_LINGER: Duration = Duration::from_millis(600);

#[derive(Parser)]
#[command(name = "fail-ding")]
#[command(about = "Plays an alert when an AI generation request fails or returns nothing")]
#[command(version)]
struct Cli {
    /// Config file (default: <config dir>/fail-ding/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable diagnostic logging regardless of the config file
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in the background: self-test hotkey, audio unlock, config reload (default)
    Listen,

    /// Send one request as the host would, arming first, and alert if the round is bad
    Request {
        /// Target URL
        url: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "POST")]
        method: String,

        /// Extra header, "Name: value" (repeatable)
        #[arg(short = 'H', long = "header", value_name = "HEADER")]
        headers: Vec<String>,

        /// Request body
        #[arg(short = 'd', long, conflicts_with = "data_file")]
        data: Option<String>,

        /// Read the request body from a file
        #[arg(long, value_name = "PATH")]
        data_file: Option<PathBuf>,

        /// Give up waiting for the round verdict after this many seconds
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },

    /// Print whether a call would be watched as a generation request
    Classify {
        url: String,

        #[arg(short = 'X', long, default_value = "POST")]
        method: String,
    },

    /// Play the alert once
    Selftest,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(paths::config_file_path);
    let loaded = config::load_or_default(&config_path);
    let debug = cli.debug || loaded.as_ref().is_ok_and(|c| c.debug);
    let log = logging::init(debug);
    let config = loaded.unwrap_or_else(|e| {
        tracing::warn!(error = %format!("{e:#}"), "config error, using defaults");
        Config::default()
    });

    let result = match cli.command.unwrap_or(Commands::Listen) {
        Commands::Listen => listen(config_path, config, log, cli.debug).await,
        Commands::Request { url, method, headers, data, data_file, wait_secs } => {
            let body = match (data, data_file) {
                (Some(d), _) => Some(Ok(Bytes::from(d))),
                (None, Some(path)) => Some(read_body(&path).await),
                (None, None) => None,
            };
            match body.transpose() {
                Ok(body) => request(&config, &url, &method, &headers, body, wait_secs).await,
                Err(e) => Err(e),
            }
        }
        Commands::Classify { url, method } => classify(&config, &url, &method),
        Commands::Selftest => selftest(&config).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "fail-ding failed");
            ExitCode::FAILURE
        }
    }
}

fn build_monitor(config: &Config) -> Result<Arc<Monitor>> {
    let sink = ToneSink::new(config.effective_volume());
    Ok(Monitor::new(config.monitor_settings(), config.classifier()?, Arc::new(sink)))
}

// ── listen ────────────────────────────────────────────────────────────────────

async fn listen(
    config_path: PathBuf,
    config: Config,
    log: logging::LogHandle,
    force_debug: bool,
) -> Result<ExitCode> {
    let monitor = build_monitor(&config)?;
    let (event_tx, mut event_rx) = mpsc::channel::<DaemonEvent>(32);

    tokio::spawn(config::watch_config(config_path, event_tx.clone()));
    let hotkey_handle = hotkey::start(&config.hotkey, event_tx.clone())?;

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(DaemonEvent::Shutdown).await;
            }
        });
    }

    println!("fail-ding v{} listening (self-test: {})", env!("CARGO_PKG_VERSION"), config.hotkey);

    let mut current = config;
    while let Some(evt) = event_rx.recv().await {
        match evt {
            DaemonEvent::SelfTestRequested => {
                monitor.self_test();
            }

            DaemonEvent::UnlockGesture => {
                let monitor = Arc::clone(&monitor);
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = monitor.unlock_audio() {
                        tracing::debug!(error = %e, "audio unlock failed");
                    }
                });
            }

            DaemonEvent::ConfigReloaded(new_config) => {
                monitor.apply_settings(new_config.monitor_settings());
                log.set_debug(force_debug || new_config.debug);
                if new_config.hotkey != current.hotkey {
                    if let Err(e) = hotkey_handle.update_key(&new_config.hotkey) {
                        tracing::warn!(error = %e, hotkey = %new_config.hotkey, "self-test hotkey disabled");
                    }
                }
                if new_config.volume != current.volume
                    || new_config.extra_allow != current.extra_allow
                    || new_config.extra_deny != current.extra_deny
                {
                    tracing::warn!("volume and URL pattern changes take effect after restart");
                }
                current = new_config;
                println!("Config reloaded");
            }

            DaemonEvent::Shutdown => {
                println!("Shutting down");
                break;
            }
        }
    }

    hotkey_handle.stop();
    Ok(ExitCode::SUCCESS)
}

// ── request ───────────────────────────────────────────────────────────────────

async fn read_body(path: &Path) -> Result<Bytes> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read request body: {}", path.display()))?;
    Ok(Bytes::from(data))
}

fn parse_header(raw: &str) -> Result<(HeaderName, HeaderValue)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("Header must look like 'Name: value': {raw}"))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes())
        .with_context(|| format!("Invalid header name in '{raw}'"))?;
    let value = HeaderValue::from_str(value.trim())
        .with_context(|| format!("Invalid header value in '{raw}'"))?;
    Ok((name, value))
}

async fn request(
    config: &Config,
    url: &str,
    method: &str,
    headers: &[String],
    body: Option<Bytes>,
    wait_secs: u64,
) -> Result<ExitCode> {
    let monitor = build_monitor(config)?;
    let client = WatchedClient::new(ReqwestTransport::default(), Arc::clone(&monitor));

    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("Invalid method: {method}"))?;
    let watched = monitor.classifier().is_generation_request(url, method.as_str());
    if !watched {
        tracing::warn!(%url, %method, "not a generation request, the call is not watched");
    }

    let mut request = HttpRequest::new(method, url);
    for raw in headers {
        let (name, value) = parse_header(raw)?;
        request.headers.append(name, value);
    }
    request.body = body;

    let mut outcomes = monitor.subscribe();
    // The host arms right before sending; the payload passes through untouched.
    let request = monitor.intercept(request);

    let sent = client.execute(request).await;
    let copied = match sent {
        Ok(response) => {
            tracing::debug!(status = %response.status, "response received");
            copy_to_stdout(response.body).await
        }
        Err(e) => Err(anyhow::Error::new(e).context("Request failed")),
    };

    let mut code = ExitCode::SUCCESS;
    if watched {
        match tokio::time::timeout(Duration::from_secs(wait_secs), outcomes.recv()).await {
            Ok(Ok(outcome)) => {
                if outcome.should_notify() {
                    code = ExitCode::from(2);
                }
                if outcome.notified {
                    tokio::time::sleep(ALERT_LINGER).await;
                }
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "round outcome unavailable"),
            Err(_) => tracing::warn!(wait_secs, "gave up waiting for the round verdict"),
        }
    }

    copied?;
    Ok(code)
}

async fn copy_to_stdout(body: ResponseBody) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    match body {
        ResponseBody::Buffered(bytes) => stdout.write_all(&bytes).await?,
        ResponseBody::Streaming(mut stream) => {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.context("Response body interrupted")?;
                stdout.write_all(&chunk).await?;
            }
        }
    }
    stdout.flush().await?;
    Ok(())
}

// ── classify / selftest ───────────────────────────────────────────────────────

fn classify(config: &Config, url: &str, method: &str) -> Result<ExitCode> {
    let classifier = config.classifier()?;
    let verdict = classifier.verdict(url, &method.to_ascii_uppercase());
    let text = match verdict {
        Verdict::Allowed(i) => format!("generation (allow rule {i})"),
        Verdict::Denied(i) => format!("not generation (deny rule {i})"),
        Verdict::NotPost => "not generation (method is not POST)".to_string(),
        Verdict::Unmatched => "not generation (no allow rule matched)".to_string(),
    };
    println!("{text}");
    Ok(if verdict.is_generation() { ExitCode::SUCCESS } else { ExitCode::from(1) })
}

async fn selftest(config: &Config) -> Result<ExitCode> {
    let monitor = build_monitor(config)?;
    monitor.self_test();
    tokio::time::sleep(ALERT_LINGER).await;
    Ok(ExitCode::SUCCESS)
}
