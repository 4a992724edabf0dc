//! cairn CLI entrypoint.
//!
//! This is the main entrypoint for the cairn command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use cairn_reconcile::cli::{Cli, Commands, OutputFormatter, StateCommands};
use cairn_reconcile::config::{
    ConfigParser, ConfigValidator, InfraConfig, StateBackend, find_config_file,
};
use cairn_reconcile::engine::{Engine, RunOutcome};
use cairn_reconcile::error::{CairnError, ConfigError, Result, StateError};
use cairn_reconcile::executor::{ExecutorOptions, RunStatus};
use cairn_reconcile::graph::{ResourceId, build_graph};
use cairn_reconcile::planner::{Plan, PlanMode, Planner};
use cairn_reconcile::provider::HttpProvider;
use cairn_reconcile::state::{
    LocalStateStore, MemoryStateStore, S3StateStore, STATE_DIR, StateStore,
};

use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_json);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| ExitCode::SUCCESS),
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Plan { destroy, detailed } => {
            let mode = if destroy { PlanMode::Destroy } else { PlanMode::Apply };
            cmd_plan(config_path, mode, detailed, &formatter).await
        }
        Commands::Apply { yes } => cmd_run(config_path, PlanMode::Apply, yes, &formatter).await,
        Commands::Destroy { yes } => cmd_run(config_path, PlanMode::Destroy, yes, &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new cairn project in: {}", path.display());

    let config_path = path.join("cairn.infra.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Declaration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/cairn.infra.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", state_entry.as_str()]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# cairn")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and set the provider endpoint and token");
    eprintln!("  2. Edit cairn.infra.yaml with your resources");
    eprintln!("  3. Run 'cairn validate' to check the declarations");
    eprintln!("  4. Run 'cairn plan' to see what will change");
    eprintln!("  5. Run 'cairn apply' to converge");

    Ok(())
}

/// Validate declarations and the resource graph.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(base_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    if result.is_valid() {
        let graph = build_graph(&config.resources)?;
        debug!(resources = graph.len(), "Resource graph is acyclic");
    }

    emit(formatter, &formatter.format_validation(&config, &result, show_warnings))?;

    Ok(if result.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Show the plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    mode: PlanMode,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, store) = load_config_and_state(config_path).await?;
    let graph = build_graph(&config.resources)?;

    let snapshot = store.load().await?;
    let plan = Planner::new().plan(&graph, &snapshot, mode)?;

    emit(formatter, &formatter.format_plan(&plan, detailed))?;
    Ok(ExitCode::SUCCESS)
}

/// Apply or destroy.
async fn cmd_run(
    config_path: Option<&PathBuf>,
    mode: PlanMode,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, store) = load_config_and_state(config_path).await?;
    let graph = build_graph(&config.resources)?;
    let provider = create_provider(&config)?;
    info!(project = %config.qualified_name(), mode = %mode, "Starting run");

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let engine = Engine::new(&*store, provider, ExecutorOptions::from_config(&config.execution))
        .with_cancellation(cancel_rx);

    let outcome = engine
        .run(&graph, mode, |plan| {
            let confirmed = confirm(plan, mode, auto_approve, formatter);
            if confirmed {
                // Installed only once the prompt is answered so Ctrl-C still aborts it
                cancel_on_interrupt(cancel_tx);
            }
            confirmed
        })
        .await?;

    match outcome {
        RunOutcome::Declined(_) => {
            eprintln!("{} cancelled.", capitalize(&mode.to_string()));
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::Executed { report, .. } => {
            emit(formatter, &formatter.format_report(&report))?;
            Ok(if report.status == RunStatus::Success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (_config, store) = load_config_and_state(config_path).await?;

    match command {
        StateCommands::List => {
            let snapshot = store.load().await?;
            emit(formatter, &formatter.format_state_list(&snapshot))?;
        }
        StateCommands::Show { id } => {
            let id = parse_id(&id)?;
            match store.get(&id).await? {
                Some(record) => emit(formatter, &formatter.format_record(&record))?,
                None => {
                    eprintln!("No record for {id}.");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        StateCommands::Rm { id } => {
            let id = parse_id(&id)?;
            let lock = store.acquire_lock("", "state rm").await?;
            let removed = match store.get(&id).await {
                Ok(Some(_)) => store.remove(&id).await.map(|()| true),
                Ok(None) => Ok(false),
                Err(e) => Err(e),
            };
            store.release_lock(&lock.lock_id).await?;

            if removed? {
                warn!(resource = %id, "Record removed; the provider resource was not touched");
                emit(formatter, &formatter.format_message(&format!("Removed {id} from state")))?;
            } else {
                eprintln!("No record for {id}.");
                return Ok(ExitCode::FAILURE);
            }
        }
        StateCommands::Lock { holder } => {
            let lock = store
                .acquire_lock(holder.as_deref().unwrap_or(""), "manual lock")
                .await?;
            emit(formatter, &formatter.format_lock(&lock))?;
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                emit(formatter, &formatter.format_message("State forcefully unlocked"))?;
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                emit(formatter, &formatter.format_message("State unlocked"))?;
            } else {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Writes JSON to stdout and text to stderr.
fn emit(formatter: &OutputFormatter, output: &str) -> Result<()> {
    if formatter.is_json() {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(output.as_bytes())?;
        stdout.write_all(b"\n")?;
        stdout.flush()?;
    } else {
        eprint!("{output}");
    }
    Ok(())
}

/// Shows the plan and asks for confirmation unless `auto_approve` is set.
fn confirm(plan: &Plan, mode: PlanMode, auto_approve: bool, formatter: &OutputFormatter) -> bool {
    eprintln!("{}", formatter.format_plan(plan, true));
    if auto_approve {
        return true;
    }

    let (prompt, expected) = match mode {
        PlanMode::Apply => ("Do you want to apply this plan? [y/N]: ", "y"),
        PlanMode::Destroy => ("This action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy"),
    };
    eprint!("{prompt}");

    let mut input = String::new();
    if let Err(e) = std::io::stderr()
        .flush()
        .and_then(|()| std::io::stdin().read_line(&mut input))
    {
        warn!("Failed to read confirmation: {e}");
        return false;
    }
    input.trim().eq_ignore_ascii_case(expected)
}

/// Turns the first Ctrl-C into a cancellation request.
fn cancel_on_interrupt(cancel: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight operations");
            let _ = cancel.send(true);
        }
    });
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars
        .next()
        .map(|first| first.to_uppercase().chain(chars).collect())
        .unwrap_or_default()
}

fn parse_id(id: &str) -> Result<ResourceId> {
    ResourceId::parse(id).map_err(|reason| {
        CairnError::Config(ConfigError::validation(
            format!("Invalid resource identifier '{id}': {reason}"),
            "id",
        ))
    })
}

fn base_dir(config_file: &Path) -> &Path {
    config_file.parent().unwrap_or_else(|| Path::new("."))
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(path.clone()),
        None => find_config_file(std::env::current_dir()?),
    }
}

/// Loads configuration and creates appropriate state store.
async fn load_config_and_state(
    config_path: Option<&PathBuf>,
) -> Result<(InfraConfig, Box<dyn StateStore>)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(base_dir(&config_file));
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().validate(&config)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }

    let store: Box<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let path = config.state.path.as_ref().map_or_else(
                || base_dir(&config_file).join(STATE_DIR),
                PathBuf::from,
            );
            Box::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| StateError::s3("S3 bucket not configured"))?;
            let prefix = config.state.prefix.as_deref();
            let region = config.state.region.as_deref();
            Box::new(S3StateStore::new(bucket, prefix, region).await)
        }
        StateBackend::Memory => {
            warn!("Using in-memory state; nothing will be persisted");
            Box::new(MemoryStateStore::new())
        }
    };

    Ok((config, store))
}

/// Creates the provider from configuration and the token variable.
fn create_provider(config: &InfraConfig) -> Result<Arc<HttpProvider>> {
    let endpoint = config.provider.endpoint.as_deref().ok_or_else(|| {
        ConfigError::validation(
            "A provider endpoint is required to apply or destroy",
            "provider.endpoint",
        )
    })?;

    let token = ConfigParser::provider_token(&config.provider.token_env).ok();
    if token.is_none() {
        debug!(variable = %config.provider.token_env, "No provider token set");
    }

    Ok(Arc::new(HttpProvider::new(
        endpoint,
        token,
        config.provider.timeout_secs,
    )?))
}
