use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Value, json};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pixel_fleet_console::{
    CommandKind, Console, ConsoleEvent, ConsoleHandle, Coordinator, HttpCoordinator, StartRequest,
};
use pixel_fleet_core::client_state::ClientStateStore;
use pixel_fleet_core::config::{Config, LoggingConfig};
use pixel_fleet_core::types::{ProjectMode, Strategy};
use pixel_fleet_preview::{Layer, PreviewEngine};

mod watch;

/// Width of the preview panel the PPM export is fitted into.
const PREVIEW_PANEL_WIDTH: u32 = 640;

#[derive(Parser)]
#[command(
    name = "pixel-fleet",
    about = "Operator console for a fleet of pixel-painting agents",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Coordinator base URL (overrides config and the last-used address)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the live fleet and accept commands on stdin
    Watch {
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Print a snapshot of agents, selection, session and plan
    Status,

    /// Create a project and session, then start it
    Start {
        /// Project name
        name: String,

        #[arg(long, value_enum, default_value_t = ModeArg::Guard)]
        mode: ModeArg,

        /// Project config as JSON, or @path to a JSON file
        #[arg(long)]
        project_config: Option<String>,

        #[arg(long, value_enum, default_value_t = StrategyArg::Balanced)]
        strategy: StrategyArg,

        /// Agents to run (repeatable; defaults to the current selection)
        #[arg(long = "agent")]
        agents: Vec<String>,
    },

    /// Pause the active session
    Pause,
    /// Resume the paused session
    Resume,
    /// Stop the active session
    Stop,
    /// Run one cooperative batch on the active session
    OneBatch,

    /// Replace the agent selection
    Select { agents: Vec<String> },

    /// Make an agent the preview source
    Favorite { agent: String },

    /// Guard mode operations
    Guard {
        #[command(subcommand)]
        action: GuardAction,
    },

    /// Fetch the favorite agent's preview and print its stats
    Preview {
        /// Write the rendered preview as a PPM image
        #[arg(long)]
        out: Option<PathBuf>,

        /// Layers to leave out of the render (repeatable)
        #[arg(long)]
        hide: Vec<Layer>,
    },

    /// Project management
    Projects {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum GuardAction {
    /// Show the coordinator's guard config
    Config,
    /// Change one guard config field
    Set { key: String, value: String },
    /// Send guard data (a JSON file) to the favorite agent
    Upload { file: PathBuf },
    /// Clear guard data on all agents
    Clear,
    /// Ask the favorite agent to re-check the protected area
    Check,
}

#[derive(Subcommand)]
enum ProjectAction {
    /// List projects
    List,
    /// Delete a project
    Delete { id: String },
    /// Delete all projects and their sessions
    Clear,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration for problems
    Validate,
    /// Get a specific config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Image,
    Guard,
}

impl From<ModeArg> for ProjectMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Image => ProjectMode::Image,
            ModeArg::Guard => ProjectMode::Guard,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Balanced,
    Drain,
    Priority,
}

impl From<StrategyArg> for Strategy {
    fn from(strategy: StrategyArg) -> Self {
        match strategy {
            StrategyArg::Balanced => Strategy::Balanced,
            StrategyArg::Drain => Strategy::Drain,
            StrategyArg::Priority => Strategy::Priority,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)?;

    init_tracing(&config.logging(), cli.verbose);

    let command = match cli.command {
        Commands::Config { action } => return config_command(action, config, &config_path),
        command => command,
    };

    let store = ClientStateStore::new(config.state_path());
    choose_coordinator(&mut config, cli.url, &store);
    let config = Arc::new(config);
    let coordinator: Arc<dyn Coordinator> = Arc::new(HttpCoordinator::new(
        config.coordinator_url(),
        config.request_timeout(),
    )?);

    match command {
        Commands::Watch { json } => watch::run(config, coordinator, store, json).await?,
        Commands::Status => console_request(config, coordinator, store, CommandKind::Snapshot).await?,
        Commands::Start {
            name,
            mode,
            project_config,
            strategy,
            agents,
        } => {
            let request = StartRequest {
                name,
                mode: mode.into(),
                config: project_config.as_deref().map(read_json_arg).transpose()?.unwrap_or(json!({})),
                strategy: strategy.into(),
                agent_ids: agents,
            };
            console_request(config, coordinator, store, CommandKind::Start(request)).await?;
        }
        Commands::Pause => console_request(config, coordinator, store, CommandKind::Pause).await?,
        Commands::Resume => console_request(config, coordinator, store, CommandKind::Resume).await?,
        Commands::Stop => console_request(config, coordinator, store, CommandKind::Stop).await?,
        Commands::OneBatch => console_request(config, coordinator, store, CommandKind::OneBatch).await?,
        Commands::Select { agents } => {
            console_request(config, coordinator, store, CommandKind::Select(agents)).await?;
        }
        Commands::Favorite { agent } => {
            console_request(config, coordinator, store, CommandKind::Favorite(agent)).await?;
        }
        Commands::Guard { action } => guard_command(action, coordinator.as_ref()).await?,
        Commands::Preview { out, hide } => {
            preview_command(&config, coordinator.as_ref(), &store, out, hide).await?;
        }
        Commands::Projects { action } => match action {
            ProjectAction::List => {
                let projects = coordinator.list_projects().await?;
                if projects.is_empty() {
                    println!("No projects");
                }
                for p in projects {
                    println!("{}  {:<6} {}", p.id, p.mode.to_string(), p.name);
                }
            }
            ProjectAction::Delete { id } => {
                coordinator.delete_project(&id).await?;
                println!("Deleted project {id}");
            }
            ProjectAction::Clear => {
                let cleared = coordinator.clear_all_projects().await?;
                println!(
                    "Deleted {} projects and {} sessions",
                    cleared.projects_deleted, cleared.sessions_deleted
                );
            }
        },
        Commands::Config { .. } => {}
    }

    Ok(())
}

/// `RUST_LOG` wins, then `--verbose`, then `logging.level`.
fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose {
            "debug"
        } else {
            logging.level.as_deref().unwrap_or("info")
        };
        let mut directives = vec![level.to_string()];
        directives.extend(logging.filters.iter().cloned());
        EnvFilter::new(directives.join(","))
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (logging.format.as_str(), logging.output.as_str()) {
        ("json", "stdout") => builder.json().with_writer(std::io::stdout).init(),
        ("json", _) => builder.json().with_writer(std::io::stderr).init(),
        (_, "stdout") => builder.with_writer(std::io::stdout).init(),
        _ => builder.with_writer(std::io::stderr).init(),
    }
}

/// `--url`, then the config file, then the address used last time.
fn choose_coordinator(config: &mut Config, url: Option<String>, store: &ClientStateStore) {
    let url = url.or_else(|| {
        if config.coordinator.is_some() {
            None
        } else {
            store.load().coordinator_url
        }
    });
    if let Some(url) = url {
        let mut coordinator = config.coordinator.take().unwrap_or_default();
        coordinator.url = url;
        config.coordinator = Some(coordinator);
    }
}

/// Start a console, wait for the coordinator snapshot, run one command.
async fn console_request(
    config: Arc<Config>,
    coordinator: Arc<dyn Coordinator>,
    store: ClientStateStore,
    kind: CommandKind,
) -> anyhow::Result<()> {
    let wait = config.request_timeout();
    let url = config.coordinator_url();
    let (console, handle) = Console::new(config, coordinator, store);
    let events = handle.subscribe();
    let task = tokio::spawn(console.run());

    let result = match tokio::time::timeout(wait, wait_for_sync(events)).await {
        Ok(Ok(())) => request(&handle, kind).await,
        Ok(Err(e)) => Err(e),
        Err(_) => Err(anyhow::anyhow!("no snapshot from {url} within {wait:?}")),
    };

    let _ = handle.shutdown().await;
    let _ = task.await;
    result
}

async fn request(handle: &ConsoleHandle, kind: CommandKind) -> anyhow::Result<()> {
    let reply = handle.request(kind).await?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

async fn wait_for_sync(mut events: broadcast::Receiver<ConsoleEvent>) -> anyhow::Result<()> {
    loop {
        match events.recv().await {
            Ok(ConsoleEvent::Synced { agents, session_id, .. }) => {
                info!(agents, session = session_id.as_deref().unwrap_or("-"), "Synced with coordinator");
                return Ok(());
            }
            Ok(ConsoleEvent::LinkLost { attempts }) => {
                bail!("coordinator unreachable after {attempts} attempts")
            }
            Ok(ConsoleEvent::LinkDown { reason }) => warn!(%reason, "Link down while waiting for snapshot"),
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => bail!("console stopped before syncing"),
        }
    }
}

async fn guard_command(action: GuardAction, coordinator: &dyn Coordinator) -> anyhow::Result<()> {
    match action {
        GuardAction::Config => {
            let config = coordinator.guard_config().await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        GuardAction::Set { key, value } => {
            let patch = json!({ key: watch::parse_value(&value) });
            let changed = coordinator.save_guard_config(&patch).await?;
            println!("{}", serde_json::to_string_pretty(&changed)?);
        }
        GuardAction::Upload { file } => {
            let data = read_json_file(&file)?;
            let filename = file.file_name().and_then(|n| n.to_str());
            let agent = coordinator.upload_guard(filename, &data).await?;
            println!("Guard data sent to {agent}");
        }
        GuardAction::Clear => {
            let agents = coordinator.clear_guard().await?;
            println!("Cleared guard data on {} agents", agents.len());
        }
        GuardAction::Check => {
            let agent = coordinator.guard_check().await?;
            println!("Re-check requested from {agent}");
        }
    }
    Ok(())
}

async fn preview_command(
    config: &Config,
    coordinator: &dyn Coordinator,
    store: &ClientStateStore,
    out: Option<PathBuf>,
    hide: Vec<Layer>,
) -> anyhow::Result<()> {
    let preview = coordinator.guard_preview().await?;
    let mut engine = PreviewEngine::new(&config.preview());
    for layer in hide {
        engine.set_layer(layer, false);
    }

    let now = Instant::now();
    let stats = engine.ingest(&preview.data, now);
    println!(
        "{}: {} original, {} correct, {} incorrect, {} missing ({:.1}% accurate)",
        preview.agent_id,
        stats.original,
        stats.correct,
        stats.incorrect,
        stats.missing,
        stats.accuracy()
    );

    if let Some(out) = out {
        engine.fit_view(PREVIEW_PANEL_WIDTH, store.load().preview_panel_height);
        let Some(raster) = engine.render(now) else {
            bail!("preview has nothing to render");
        };
        std::fs::write(&out, raster.to_ppm())
            .with_context(|| format!("writing {}", out.display()))?;
        println!("Wrote {}x{} preview to {}", raster.width, raster.height, out.display());
    }
    Ok(())
}

fn config_command(action: ConfigAction, mut config: Config, path: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{json}");
        }
        ConfigAction::Validate => {
            let (warnings, errors) = config.validate();
            for w in &warnings {
                println!("warning: {w}");
            }
            for e in &errors {
                println!("error: {e}");
            }
            if !errors.is_empty() {
                bail!("{} config errors in {}", errors.len(), path.display());
            }
            println!("Config OK ({} warnings)", warnings.len());
        }
        ConfigAction::Get { key } => match config.get_path(&key) {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => bail!("no config value at '{key}'"),
        },
        ConfigAction::Set { key, value } => {
            config.set_path(&key, watch::parse_value(&value))?;
            config.save(path)?;
            println!("Set {key} in {}", path.display());
        }
    }
    Ok(())
}

/// Inline JSON, or `@path` to read it from a file.
fn read_json_arg(arg: &str) -> anyhow::Result<Value> {
    match arg.strip_prefix('@') {
        Some(path) => read_json_file(Path::new(path)),
        None => serde_json::from_str(arg).context("project config is not valid JSON"),
    }
}

fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixel_fleet_core::config::CoordinatorConfig;

    #[test]
    fn test_parse_start() {
        let cli = Cli::try_parse_from([
            "pixel-fleet",
            "start",
            "wall",
            "--mode",
            "image",
            "--strategy",
            "drain",
            "--agent",
            "a",
            "--agent",
            "b",
        ])
        .unwrap();
        let Commands::Start { name, mode, strategy, agents, .. } = cli.command else {
            panic!("expected start");
        };
        assert_eq!(name, "wall");
        assert_eq!(ProjectMode::from(mode), ProjectMode::Image);
        assert_eq!(Strategy::from(strategy), Strategy::Drain);
        assert_eq!(agents, ["a", "b"]);
    }

    #[test]
    fn test_parse_preview_layers() {
        let cli = Cli::try_parse_from(["pixel-fleet", "preview", "--hide", "correct", "--hide", "recent"]).unwrap();
        let Commands::Preview { hide, out } = cli.command else {
            panic!("expected preview");
        };
        assert_eq!(hide, [Layer::Correct, Layer::RecentRepairs]);
        assert!(out.is_none());
        assert!(Cli::try_parse_from(["pixel-fleet", "preview", "--hide", "sky"]).is_err());
    }

    #[test]
    fn test_coordinator_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClientStateStore::new(dir.path().join("state.json"));
        store
            .update(|s| s.coordinator_url = Some("http://10.0.0.5:8008".into()))
            .unwrap();

        // last-used address fills in when the config names none
        let mut config = Config::default();
        choose_coordinator(&mut config, None, &store);
        assert_eq!(config.coordinator_url(), "http://10.0.0.5:8008");

        let mut config = Config {
            coordinator: Some(CoordinatorConfig {
                url: "http://coord:9000".into(),
                ..CoordinatorConfig::default()
            }),
            ..Config::default()
        };
        choose_coordinator(&mut config, None, &store);
        assert_eq!(config.coordinator_url(), "http://coord:9000");

        choose_coordinator(&mut config, Some("http://override:1".into()), &store);
        assert_eq!(config.coordinator_url(), "http://override:1");
    }

    #[test]
    fn test_read_json_arg() {
        assert_eq!(read_json_arg(r#"{"x": 1}"#).unwrap(), json!({"x": 1}));
        assert!(read_json_arg("{nope").is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.json");
        std::fs::write(&path, r#"{"area": {"x1": 0}}"#).unwrap();
        let arg = format!("@{}", path.display());
        assert_eq!(read_json_arg(&arg).unwrap(), json!({"area": {"x1": 0}}));
    }
}
