// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, IsTerminal};
use dodo_engine::{protocol::Event, EventSender, SessionManager};
use dodo_retrieval::{
    DefaultChunker, Embedder, HashEmbedder, Indexer, KeywordIndex, RetrievalEngine, Store,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let repo_root = cli
        .repo_root()
        .canonicalize()
        .unwrap_or_else(|_| cli.repo_root());

    if let Some(Commands::ShowConfig) = &cli.command {
        let config = dodo_config::load(&repo_root, cli.config.as_deref())?;
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let config = dodo_config::load(&repo_root, cli.config.as_deref())?;
    dodo_config::apply_env(&config);

    // Whether the repo had opted into indexing before we touch it: opening
    // the index database creates `.dodo/`, so check first.
    let had_permission = repo_root.join(".dodo").is_dir();

    let store = Arc::new(
        Store::open(&repo_root.join(".dodo").join("index.db"))
            .context("opening retrieval index")?,
    );
    let keyword = Arc::new(KeywordIndex::new());
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());
    let engine = Arc::new(RetrievalEngine::new(
        Arc::clone(&store),
        Arc::clone(&keyword),
        Arc::clone(&embedder),
        &repo_root,
        config.retrieval.code_file_boost,
    ));

    let (events, events_rx) = EventSender::channel();
    let manager = Arc::new(
        SessionManager::new(&repo_root, config.clone(), Arc::clone(&engine), events)
            .with_permission(had_permission),
    );

    let shutdown = CancellationToken::new();
    spawn_indexing(
        Arc::clone(&manager),
        Arc::clone(&engine),
        store,
        keyword,
        embedder,
        &repo_root,
        &config,
        shutdown.clone(),
    );

    let result = if cli.is_stdio() {
        info!(repo = %repo_root.display(), "engine starting in stdio mode");
        dodo_engine::run(manager, tokio::io::stdin(), tokio::io::stdout(), events_rx).await
    } else {
        repl(manager, events_rx).await
    };

    shutdown.cancel();
    result
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dodo={default_level},warn")));
    // Logs always go to stderr: stdout is reserved for protocol events in
    // stdio mode and for assistant text in the REPL.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Start the background indexer (and watcher) once indexing permission is
/// in place.  For repos without `.dodo/` this waits for the client to grant
/// `project_permission`.
#[allow(clippy::too_many_arguments)]
fn spawn_indexing(
    manager: Arc<SessionManager>,
    engine: Arc<RetrievalEngine>,
    store: Arc<Store>,
    keyword: Arc<KeywordIndex>,
    embedder: Arc<dyn Embedder>,
    repo_root: &std::path::Path,
    config: &dodo_config::Config,
    shutdown: CancellationToken,
) {
    let repo_root = repo_root.to_path_buf();
    let retrieval_config = config.retrieval.clone();
    tokio::spawn(async move {
        while !manager.permission_granted() {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }

        let repo_id = repo_root.to_string_lossy().to_string();
        if retrieval_config.watch {
            let invalidate_engine = Arc::clone(&engine);
            match dodo_retrieval::spawn_watcher(
                Arc::clone(&store),
                repo_root.clone(),
                repo_id.clone(),
                retrieval_config.max_file_size_kb,
                Duration::from_millis(retrieval_config.debounce_ms),
                Arc::new(move || invalidate_engine.invalidate_workspace_context()),
                shutdown.clone(),
            ) {
                Ok(_handle) => info!("filesystem watcher running"),
                Err(e) => warn!("watcher unavailable: {e}"),
            }
        }

        let indexer = Arc::new(Indexer::new(
            store,
            keyword,
            embedder,
            Arc::new(DefaultChunker::new()),
            retrieval_config,
            repo_id,
            repo_root,
        ));
        indexer.run(shutdown).await;
    });
}

/// Minimal interactive loop: one session, stdin lines in, assistant text
/// out.  The full experience lives in external clients speaking the stdio
/// protocol.
async fn repl(
    manager: Arc<SessionManager>,
    mut events: tokio::sync::mpsc::Receiver<Event>,
) -> anyhow::Result<()> {
    let session_id = "repl".to_string();
    manager.start_session(Some(session_id.clone()), None).await;

    // Printer task: render events to stdout as they arrive.
    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = events.recv().await {
            let rendered = match event {
                Event::AssistantText {
                    content,
                    is_final: false,
                    ..
                } => Some(content),
                Event::AssistantText { is_final: true, .. } => Some("\n".to_string()),
                Event::ToolEvent {
                    tool, phase, ..
                } if phase == "start" => Some(format!("[{tool}...]\n")),
                Event::Done { .. } => Some("\n".to_string()),
                Event::Error { kind, message, .. } => Some(format!("error ({kind}): {message}\n")),
                Event::Cancelled { .. } => Some("[cancelled]\n".to_string()),
                _ => None,
            };
            if let Some(text) = rendered {
                if stdout.write_all(text.as_bytes()).await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
        }
    });

    let interactive = std::io::stdin().is_terminal();
    if interactive {
        println!("dodo · type a task, 'exit' to quit");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "exit" || text == "quit" {
            break;
        }
        manager.user_message(&session_id, text).await;
    }

    manager.shutdown().await;
    printer.abort();
    Ok(())
}
