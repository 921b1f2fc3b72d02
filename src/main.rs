use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use notify::{RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use scribe_rs::api::CoordinatorClient;
use scribe_rs::engines::{
    AlignmentEngine, DiarizationEngine, EngineSet, SubprocessEngine, TranscriptionEngine,
};
use scribe_rs::sync::SyncClient;
use scribe_rs::utils::logger;
use scribe_rs::worker::{TaskDispatcher, WorkerLoop};
use scribe_rs::LOG_DIR;

/// Worker for the scribe collaborative transcription platform.
#[derive(Parser, Debug, Clone)]
#[command(name = "scribe-worker")]
struct Args {
    /// Url of the task coordinator backend
    #[arg(long, default_value = "http://localhost:8000")]
    coordinator: String,

    /// Url of the websocket sync endpoint; derived from the coordinator url
    /// when omitted
    #[arg(long)]
    websocket_base_url: Option<String>,

    /// Worker token
    #[arg(long)]
    token: String,

    /// Command run for TRANSCRIBE tasks (program and arguments, whitespace
    /// separated)
    #[arg(long)]
    transcribe_command: Option<String>,

    /// Command run for ALIGN tasks
    #[arg(long)]
    align_command: Option<String>,

    /// Command run for IDENTIFY_SPEAKERS tasks
    #[arg(long)]
    diarize_command: Option<String>,

    /// Claim a single task, run it, and exit without reporting completion
    #[arg(long)]
    run_once_and_dont_complete: bool,

    /// Restart the worker subprocess on source changes (development only)
    #[arg(long)]
    reload: bool,
}

fn main() -> Result<()> {
    scribe_rs::init_env();
    let args = Args::parse();
    let _guard = logger::init(LOG_DIR.clone())?;

    if args.reload {
        return supervise(&args);
    }

    tokio::runtime::Runtime::new()?.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let coordinator_url = Url::parse(&args.coordinator).context("invalid coordinator url")?;
    let api_base = join_path(&coordinator_url, "api/v1/tasks/");
    let ws_base = match &args.websocket_base_url {
        Some(raw) => Url::parse(raw).context("invalid websocket base url")?,
        None => derive_sync_url(&coordinator_url)?,
    };

    let engines = EngineSet {
        transcription: subprocess_engine(args.transcribe_command.as_deref())?
            .map(|e| Arc::new(e) as Arc<dyn TranscriptionEngine>),
        alignment: subprocess_engine(args.align_command.as_deref())?
            .map(|e| Arc::new(e) as Arc<dyn AlignmentEngine>),
        diarization: subprocess_engine(args.diarize_command.as_deref())?
            .map(|e| Arc::new(e) as Arc<dyn DiarizationEngine>),
    };
    if engines.is_empty() {
        bail!(
            "no engine commands configured; pass at least one of \
             --transcribe-command, --align-command, --diarize-command"
        );
    }
    let task_types = engines.task_types();
    info!(?task_types, coordinator = %coordinator_url, "worker starting");

    let coordinator = Arc::new(CoordinatorClient::new(api_base, args.token.clone()));
    let sync = Arc::new(SyncClient::new(ws_base, args.token.clone()));
    let dispatcher = TaskDispatcher::new(coordinator.clone(), sync, engines, coordinator_url);

    let mut worker = WorkerLoop::new(coordinator, dispatcher, task_types);
    if args.run_once_and_dont_complete {
        worker = worker.single_shot();
    }

    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("stop requested, finishing current iteration");
                stop.cancel();
            }
        });
    }

    worker.run(stop).await;
    Ok(())
}

/// Appends `suffix` to the url path, keeping any existing path prefix.
fn join_path(base: &Url, suffix: &str) -> Url {
    let mut url = base.clone();
    let path = format!("{}/{}", url.path().trim_end_matches('/'), suffix);
    url.set_path(&path);
    url
}

/// Rewrites the coordinator url into the websocket sync endpoint:
/// http becomes ws, https becomes wss, and the sync path is appended.
fn derive_sync_url(coordinator: &Url) -> Result<Url> {
    let mut url = join_path(coordinator, "api/v1/documents/sync/");
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => bail!("coordinator url must be http or https, got '{other}'"),
    };
    if url.set_scheme(scheme).is_err() {
        bail!("could not derive websocket scheme for {url}");
    }
    Ok(url)
}

fn subprocess_engine(command: Option<&str>) -> Result<Option<SubprocessEngine>> {
    command
        .map(|cmd| {
            let parts: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
            SubprocessEngine::new(parts).map_err(anyhow::Error::from)
        })
        .transpose()
}

/// Supervises the worker as a child process, restarting it whenever the
/// source tree changes. The old child is always waited for before a new one
/// starts, so two copies never run the same iteration concurrently.
fn supervise(args: &Args) -> Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher =
        notify::recommended_watcher(move |event: std::result::Result<notify::Event, notify::Error>| {
            if let Ok(event) = event {
                if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                    let _ = tx.send(());
                }
            }
        })?;
    watcher.watch(Path::new("src"), RecursiveMode::Recursive)?;

    let exe = std::env::current_exe().context("cannot locate worker executable")?;
    loop {
        info!("starting worker subprocess");
        let mut child = std::process::Command::new(&exe)
            .args(worker_args(args))
            .spawn()
            .context("failed to spawn worker subprocess")?;

        if rx.recv().is_err() {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(());
        }
        // collapse the rest of the save burst into one restart
        while rx.try_recv().is_ok() {}

        info!("source change detected, reloading worker");
        let _ = child.kill();
        child
            .wait()
            .context("worker subprocess did not exit for reload")?;
    }
}

fn worker_args(args: &Args) -> Vec<String> {
    let mut out = vec![
        "--coordinator".to_string(),
        args.coordinator.clone(),
        "--token".to_string(),
        args.token.clone(),
    ];
    let optional = [
        ("--websocket-base-url", &args.websocket_base_url),
        ("--transcribe-command", &args.transcribe_command),
        ("--align-command", &args.align_command),
        ("--diarize-command", &args.diarize_command),
    ];
    for (flag, value) in optional {
        if let Some(value) = value {
            out.push(flag.to_string());
            out.push(value.clone());
        }
    }
    if args.run_once_and_dont_complete {
        out.push("--run-once-and-dont-complete".to_string());
    }
    out
}
