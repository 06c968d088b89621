use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crewscope_core::wire::DEFAULT_MAX_FRAME_BYTES;
use crewscope_core::{build_graph, CrewDefinition, ExecutionState};
use crewscope_watch::config::parse_inputs;
use crewscope_watch::logging::init_logging;
use crewscope_watch::render::{render_graph, render_json, TextRenderer};
use crewscope_watch::{EngineClient, RunSnapshot, RunWatcher, StopOutcome, WatchConfig};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "crewscope")]
#[command(about = "Watch crew runs on an execution engine", long_about = None)]
struct Cli {
    /// Engine base url (falls back to CREWSCOPE_ENGINE_URL)
    #[arg(long, global = true, default_value = "")]
    engine_url: String,
    /// Log directory (falls back to CREWSCOPE_LOG_DIR)
    #[arg(long, global = true, default_value = "")]
    log_dir: String,
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Follow a crew run until it finishes or the connection drops
    Watch {
        crew_id: String,
        #[arg(long)]
        crew_file: Option<PathBuf>,
        /// Print the final snapshot as JSON instead of streaming text
        #[arg(long)]
        json: bool,
    },
    /// Start a crew run and follow it
    Run {
        crew_id: String,
        /// Input variable as key=value, repeatable
        #[arg(long = "input", short = 'i')]
        inputs: Vec<String>,
        #[arg(long)]
        crew_file: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List the input variables a crew requires
    Variables { crew_id: String },
    /// Ask the engine to stop a crew run
    Stop { crew_id: String },
    /// Print the static crew graph
    Graph {
        crew_id: String,
        #[arg(long)]
        crew_file: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

impl Commands {
    fn crew_id(&self) -> &str {
        match self {
            Commands::Watch { crew_id, .. }
            | Commands::Run { crew_id, .. }
            | Commands::Variables { crew_id }
            | Commands::Stop { crew_id }
            | Commands::Graph { crew_id, .. } => crew_id,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = WatchConfig::resolve(&cli.engine_url, &cli.log_dir, cli.max_frame_bytes)
        .context("invalid configuration")?;
    let _log_guard = init_logging(&config.log_dir, cli.command.crew_id(), config.log_stderr);
    let engine = EngineClient::new(&config.engine_url);

    match cli.command {
        Commands::Watch {
            crew_id,
            crew_file,
            json,
        } => {
            let definition = load_definition(&engine, &crew_id, crew_file.as_deref(), false).await?;
            follow(&config, &crew_id, definition, json, None).await?;
        }
        Commands::Run {
            crew_id,
            inputs,
            crew_file,
            json,
        } => {
            let inputs = parse_inputs(&inputs)?;
            let definition = load_definition(&engine, &crew_id, crew_file.as_deref(), false).await?;
            follow(&config, &crew_id, definition, json, Some((&engine, inputs))).await?;
        }
        Commands::Variables { crew_id } => {
            let variables = engine
                .required_variables(&crew_id)
                .await
                .with_context(|| format!("failed to read variables of crew {crew_id}"))?;
            if variables.is_empty() {
                println!("crew {crew_id} requires no inputs");
            }
            for name in variables {
                println!("{name}");
            }
        }
        Commands::Stop { crew_id } => match engine.stop_run(&crew_id).await? {
            StopOutcome::Accepted => println!("stop requested for crew {crew_id}"),
            StopOutcome::Rejected { status } => {
                println!("engine does not support stopping crew {crew_id} (status {status}); nothing changed")
            }
        },
        Commands::Graph {
            crew_id,
            crew_file,
            json,
        } => {
            let definition = load_definition(&engine, &crew_id, crew_file.as_deref(), true)
                .await?
                .context("crew definition unavailable")?;
            let graph = build_graph(&definition, &ExecutionState::new());
            if json {
                println!("{}", render_json(&graph)?);
            } else {
                print!("{}", render_graph(&graph));
            }
        }
    }

    Ok(())
}

/// A crew file takes precedence over the engine. Outside `required` mode a failed fetch
/// only costs the graph.
async fn load_definition(
    engine: &EngineClient,
    crew_id: &str,
    crew_file: Option<&Path>,
    required: bool,
) -> Result<Option<CrewDefinition>> {
    if let Some(path) = crew_file {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read crew file {}", path.display()))?;
        let definition: CrewDefinition = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse crew file {}", path.display()))?;
        definition
            .validate()
            .with_context(|| format!("invalid crew file {}", path.display()))?;
        return Ok(Some(definition));
    }
    match engine.fetch_definition(crew_id).await {
        Ok(definition) => Ok(Some(definition)),
        Err(err) if !required => {
            warn!("crew_definition_unavailable: {err}");
            Ok(None)
        }
        Err(err) => Err(err).with_context(|| format!("failed to load crew {crew_id}")),
    }
}

async fn follow(
    config: &WatchConfig,
    crew_id: &str,
    definition: Option<CrewDefinition>,
    json: bool,
    start: Option<(&EngineClient, std::collections::BTreeMap<String, String>)>,
) -> Result<()> {
    let mut watcher = RunWatcher::new(config.ws_base.clone(), definition)
        .with_max_frame_bytes(config.max_frame_bytes);
    let printer = (!json).then(|| tokio::spawn(print_snapshots(watcher.snapshots())));
    watcher.watch(crew_id).await?;

    if let Some((engine, inputs)) = start {
        if !watcher.wait_until_open().await {
            watcher.stop().await;
            drop(watcher);
            if let Some(printer) = printer {
                let _ = printer.await;
            }
            bail!("connection to crew {crew_id} is not open; run not started");
        }
        engine
            .start_run(crew_id, &inputs)
            .await
            .with_context(|| format!("failed to start crew {crew_id}"))?;
        info!(crew_id, "run_started");
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        let finished = watcher.session().map(|s| s.is_finished()).unwrap_or(true);
        if finished {
            break;
        }
        tokio::select! {
            _ = &mut ctrl_c => {
                info!(crew_id, "interrupted");
                break;
            }
            progressed = watcher.next() => {
                if !progressed {
                    break;
                }
            }
        }
    }
    watcher.stop().await;

    let last = watcher.session().map(|session| session.snapshot());
    drop(watcher);
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    if json {
        if let Some(snapshot) = last {
            println!("{}", render_json(&snapshot)?);
        }
    }
    Ok(())
}

async fn print_snapshots(mut snapshots: watch::Receiver<RunSnapshot>) {
    let mut renderer = TextRenderer::default();
    while snapshots.changed().await.is_ok() {
        let text = {
            let snapshot = snapshots.borrow_and_update();
            renderer.render(&snapshot)
        };
        if !text.is_empty() {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        }
    }
}
