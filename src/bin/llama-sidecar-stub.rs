//! Stand-in for `llama-server` used by integration tests and local demos.
//!
//! Accepts the same `--model/--host/--port/--threads` flags and serves
//! `GET /health`. Behaviour knobs come from the environment:
//!
//! - `STUB_READY_AFTER_MS`: answer 503 until this long after startup
//! - `STUB_NEVER_READY`: always answer 503
//! - `STUB_IGNORE_INTERRUPT`: keep running on SIGINT (SIGTERM still stops it)
//! - `STUB_EXIT_AFTER_MS`: exit with status 3 this long after startup

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};
use tokio::time::Instant;

struct StubArgs {
    model: PathBuf,
    host: String,
    port: u16,
    threads: u32,
}

#[derive(Clone, Copy)]
struct Behavior {
    ready_after: Duration,
    never_ready: bool,
    ignore_interrupt: bool,
    exit_after: Option<Duration>,
}

impl Behavior {
    fn from_env() -> Self {
        let millis = |key: &str| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
        };
        let flag = |key: &str| std::env::var(key).map(|v| v != "0" && !v.is_empty()).unwrap_or(false);
        Self {
            ready_after: millis("STUB_READY_AFTER_MS").unwrap_or_default(),
            never_ready: flag("STUB_NEVER_READY"),
            ignore_interrupt: flag("STUB_IGNORE_INTERRUPT"),
            exit_after: millis("STUB_EXIT_AFTER_MS"),
        }
    }
}

#[derive(Clone)]
struct AppState {
    started: Instant,
    behavior: Behavior,
}

fn parse_args() -> anyhow::Result<StubArgs> {
    let mut model = None;
    let mut host = "127.0.0.1".to_string();
    let mut port = 8080;
    let mut threads = 4;

    let mut args = std::env::args().skip(1);
    while let Some(flag) = args.next() {
        let mut value = || args.next().with_context(|| format!("missing value for {}", flag));
        match flag.as_str() {
            "-m" | "--model" => model = Some(PathBuf::from(value()?)),
            "--host" => host = value()?,
            "--port" => port = value()?.parse().context("invalid --port")?,
            "-t" | "--threads" => threads = value()?.parse().context("invalid --threads")?,
            other => tracing::warn!("Ignoring unknown argument '{}'", other),
        }
    }

    Ok(StubArgs {
        model: model.context("--model is required")?,
        host,
        port,
        threads,
    })
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let loading = state.behavior.never_ready || state.started.elapsed() < state.behavior.ready_after;
    if loading {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": { "code": 503, "message": "Loading model" } })),
        )
    } else {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = parse_args()?;
    if !args.model.exists() {
        bail!("failed to load model '{}'", args.model.display());
    }

    let behavior = Behavior::from_env();
    let state = AppState {
        started: Instant::now(),
        behavior,
    };
    let router = Router::new().route("/health", get(health)).with_state(state);

    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("couldn't bind to {}:{}", args.host, args.port))?;
    tracing::info!(threads = args.threads, "loading model '{}'", args.model.display());
    println!("server is listening on http://{}:{}", args.host, args.port);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(behavior))
        .await?;

    tracing::info!("cleaning up before exit");
    Ok(())
}

async fn shutdown_signal(behavior: Behavior) {
    let crash = async {
        match behavior.exit_after {
            Some(delay) => tokio::time::sleep(delay).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(crash);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (Ok(mut interrupt), Ok(mut terminate)) =
            (signal(SignalKind::interrupt()), signal(SignalKind::terminate()))
        else {
            tracing::error!("failed to install signal handlers");
            return;
        };

        loop {
            tokio::select! {
                _ = interrupt.recv() => {
                    if behavior.ignore_interrupt {
                        tracing::warn!("received SIGINT, ignoring");
                        continue;
                    }
                    tracing::info!("received SIGINT, shutting down");
                    return;
                }
                _ = terminate.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    return;
                }
                _ = &mut crash => simulate_crash(),
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = &mut crash => simulate_crash(),
        }
    }
}

fn simulate_crash() -> ! {
    tracing::error!("simulated crash");
    std::process::exit(3)
}
