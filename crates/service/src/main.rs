//! `runlogd`: wires one or more `Stream`s end-to-end over a
//! newline-delimited JSON front door on stdin/stdout. The process-boundary
//! IPC transport itself is out of scope; this is only a runnable stand-in
//! for it.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use runlog_core::{RunId, Settings};
use runlog_pipeline::{BUFFER_SIZE, collab::fake::FakeCollaborators, reader::RunIdentityOverlay, sender::Collaborators, stream::Stream};
use runlog_proto::Record;
use tokio::{
  io::{AsyncBufReadExt, BufReader},
  sync::mpsc,
};
use tracing::{info, warn};

mod error;
mod logging;
mod protocol;
mod registry;

use error::ServiceError;
use protocol::{EgressLine, IngressLine};
use registry::RunRegistry;

#[derive(Parser)]
#[command(name = "runlogd")]
#[command(about = "Per-run ingestion and durability pipeline service")]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the ingestion front door: newline-delimited JSON commands in on
  /// stdin, newline-delimited JSON responses out on stdout.
  Run {
    /// Directory holding each run's transaction log.
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
    /// Log to the console instead of a rolling file.
    #[arg(long)]
    foreground: bool,
  },
  /// Replay a closed transaction log as if it were a live session,
  /// overlaying a (possibly different) entity/project/run-id onto it.
  Sync {
    /// Path to the transaction log to replay.
    log_path: PathBuf,
    #[arg(long)]
    entity: String,
    #[arg(long)]
    project: String,
    #[arg(long = "run-id")]
    run_id: String,
    #[arg(long, default_value = "sync")]
    client_id: String,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  match cli.command {
    Commands::Run { log_dir, foreground } => {
      let log_dir = log_dir.unwrap_or_else(logging::default_log_dir);
      let _guard = logging::init(foreground, &log_dir);
      cmd_run(log_dir).await
    }
    Commands::Sync {
      log_path,
      entity,
      project,
      run_id,
      client_id,
    } => {
      let _guard = logging::init(true, &logging::default_log_dir());
      cmd_sync(log_path, entity, project, run_id, client_id).await
    }
  }
}

/// Reads [`protocol::IngressLine`]s from stdin until EOF, driving a
/// [`RunRegistry`] of concurrently open runs, and writes every reply as a
/// [`protocol::EgressLine`] to stdout.
async fn cmd_run(log_dir: PathBuf) -> Result<()> {
  std::fs::create_dir_all(&log_dir).with_context(|| format!("creating log directory {}", log_dir.display()))?;
  let settings = Arc::new(Settings::load_for_project(&std::env::current_dir()?)?);
  let registry = Arc::new(RunRegistry::new());

  let (egress_tx, mut egress_rx) = mpsc::channel::<EgressLine>(BUFFER_SIZE);
  let stdout_task = tokio::spawn(async move {
    while let Some(line) = egress_rx.recv().await {
      match serde_json::to_string(&line) {
        Ok(json) => println!("{json}"),
        Err(err) => warn!(error = %err, "failed to encode an egress line"),
      }
    }
  });

  let stdin = tokio::io::stdin();
  let mut lines = BufReader::new(stdin).lines();
  while let Some(line) = lines.next_line().await? {
    if line.trim().is_empty() {
      continue;
    }
    let ingress: IngressLine = match serde_json::from_str(&line) {
      Ok(ingress) => ingress,
      Err(err) => {
        warn!(error = %err, "malformed ingress line; skipping");
        continue;
      }
    };

    if let Err(err) = handle_ingress_line(&registry, &log_dir, &settings, &egress_tx, ingress).await {
      warn!(error = %err, "failed to process ingress line");
    }
  }

  // Stdin closed: wind down whatever is still open rather than leaving
  // runs stranded mid-stage.
  registry.shutdown().await;
  drop(egress_tx);
  let _ = stdout_task.await;
  Ok(())
}

async fn handle_ingress_line(
  registry: &Arc<RunRegistry>,
  log_dir: &std::path::Path,
  settings: &Arc<Settings>,
  egress_tx: &mpsc::Sender<EgressLine>,
  ingress: IngressLine,
) -> Result<(), ServiceError> {
  match ingress {
    IngressLine::Start { run_id, client_id } => {
      let log_path = log_dir.join(format!("{client_id}.bin"));
      let stream = Stream::start(settings.clone(), client_id, &log_path, fake_collaborators())?;

      let (conn_tx, mut conn_rx) = mpsc::channel::<Record>(BUFFER_SIZE);
      stream.add_responder("stdout", conn_tx);
      let tagged_run_id = run_id.clone();
      let egress_tx = egress_tx.clone();
      tokio::spawn(async move {
        while let Some(record) = conn_rx.recv().await {
          if egress_tx
            .send(EgressLine {
              run_id: tagged_run_id.clone(),
              record,
            })
            .await
            .is_err()
          {
            break;
          }
        }
      });

      registry.insert(RunId::new(run_id), stream)?;
      info!("run started");
      Ok(())
    }
    IngressLine::Record { run_id, record } => registry.handle_record(&RunId::new(run_id), record).await,
    IngressLine::Finish { run_id, exit_code } => registry.finish(&RunId::new(run_id), exit_code).await,
  }
}

/// Production wiring of a real GraphQL/file-stream/file-transfer backend is
/// out of scope; every collaborator is backed by the same
/// in-process fake, one fresh instance per run.
fn fake_collaborators() -> Collaborators {
  let fake = Arc::new(FakeCollaborators::default());
  Collaborators {
    graphql: fake.clone(),
    file_stream: fake.clone(),
    file_transfer: fake.clone(),
    runfiles: fake.clone(),
    artifacts: fake.clone(),
    system_monitor: fake.clone(),
    tensorboard: fake.clone(),
    terminal_printer: fake.clone(),
    operations_tracker: fake.clone(),
    telemetry: fake.clone(),
    job_builder: fake,
  }
}

async fn cmd_sync(log_path: PathBuf, entity: String, project: String, run_id: String, client_id: String) -> Result<()> {
  let settings = Arc::new(Settings::default().with_primary_node(false));
  let overlay = RunIdentityOverlay { entity, project, run_id };

  let stream = Stream::replay(settings, client_id, &log_path, overlay, fake_collaborators())?;
  let (conn_tx, mut conn_rx) = mpsc::channel::<Record>(BUFFER_SIZE);
  stream.add_responder("stdout", conn_tx);

  let printer = tokio::spawn(async move {
    while let Some(record) = conn_rx.recv().await {
      if let Ok(json) = serde_json::to_string(&record) {
        println!("{json}");
      }
    }
  });

  // Sync mode terminates itself: the Reader closes its output at end of log,
  // which drains the Handler and Sender in turn (close() without
  // finish is used in sync replay).
  stream.close().await;
  let _ = printer.await;
  Ok(())
}
