//! Statecraft CLI entrypoint.
//!
//! This is the main entrypoint for the statecraft command-line tool.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use statecraft::build::{Builder, CommandBuilder};
use statecraft::cli::{Cli, Commands, LogFormat, OutputFormatter};
use statecraft::config::{
    ConfigParser, ConfigValidator, CredentialResolver, NetworkSpec, Settings, YamlCompiler,
    find_config_file,
};
use statecraft::confirm::TerminalConfirm;
use statecraft::engine::{self, Collaborators, Deployment};
use statecraft::error::{DeployError, EngineError, Result, StateError};
use statecraft::provider::{Providers, RestProvider};
use statecraft::remote::SshExecutor;
use statecraft::resource::{ResourceRegistry, SshDefaults};
use statecraft::state::{DeploymentLock, STATE_DIR, StateDb};

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_format);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    let result = runtime.block_on(async {
        tokio::select! {
            result = run(&cli, &formatter) => result,
            _ = tokio::signal::ctrl_c() => Err(EngineError::Aborted {
                reason: String::from("interrupted"),
            }
            .into()),
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", formatter.error(&e.to_string()));
            if let DeployError::Aggregate(aggregate) = &e {
                for (name, err) in &aggregate.failures {
                    eprintln!("  {name}: {err}");
                }
            }
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Writes command output to stdout.
#[allow(clippy::print_stdout)]
fn emit(output: &str) {
    println!("{}", output.trim_end());
}

/// Main async entry point.
async fn run(cli: &Cli, formatter: &OutputFormatter) -> Result<()> {
    let context = Context::load(cli)?;

    match &cli.command {
        Commands::Create { name, description } => {
            let deployment = Deployment::create(
                context.db.clone(),
                context.env.clone(),
                name.as_deref().or(context.spec.deployment.name.as_deref()),
                description
                    .as_deref()
                    .or(context.spec.deployment.description.as_deref()),
                Some(&context.config_file),
            )?;
            deployment.set_rollback_enabled(context.spec.deployment.rollback_enabled)?;
            emit(&formatter.success(&format!("Created deployment {}", deployment.uuid())));
        }
        Commands::List => {
            emit(&formatter.format_deployments(&engine::list_deployments(&context.db)));
        }
        Commands::Info => {
            let deployment = context.open(cli)?;
            let summary = engine::list_deployments(&context.db)
                .into_iter()
                .find(|s| s.uuid == deployment.uuid())
                .ok_or_else(|| StateError::DeploymentNotFound {
                    id: deployment.uuid().to_string(),
                })?;
            emit(&formatter.format_info(&summary, &deployment.info()));
        }
        Commands::Delete { force } => {
            let deployment = context.open(cli)?;
            let uuid = deployment.uuid().to_string();
            deployment.delete(*force)?;
            emit(&formatter.success(&format!("Deleted deployment {uuid}")));
        }
        Commands::Deploy { .. } => {
            let options = cli.command.deploy_options().unwrap_or_default();
            let mut deployment = context.open(cli)?;
            deployment.deploy(&options).await?;
            emit(&formatter.success("Deployment finished"));
        }
        Commands::Destroy { filter, wipe } => {
            let mut deployment = context.open(cli)?;
            deployment.destroy_resources(&filter.to_filter(), *wipe).await?;
            emit(&formatter.success("Resources destroyed"));
        }
        Commands::Start { filter } => {
            context.open(cli)?.start(&filter.to_filter()).await?;
            emit(&formatter.success("Machines started"));
        }
        Commands::Stop { filter } => {
            context.open(cli)?.stop(&filter.to_filter()).await?;
            emit(&formatter.success("Machines stopped"));
        }
        Commands::Check { filter } => {
            let reports = context.open(cli)?.check(&filter.to_filter()).await?;
            emit(&formatter.format_checks(&reports));
        }
        Commands::Rollback { generation, .. } => {
            let options = cli.command.deploy_options().unwrap_or_default();
            let mut deployment = context.open(cli)?;
            deployment.rollback(*generation, &options).await?;
            emit(&formatter.success(&format!("Rolled back to generation {generation}")));
        }
        Commands::ListGenerations => {
            let deployment = context.open(cli)?;
            emit(&formatter.format_generations(
                &deployment.generations()?,
                deployment.current_generation()?,
            ));
        }
        Commands::Backup { filter, devices } => {
            let id = context
                .open(cli)?
                .backup(&filter.to_filter(), devices)
                .await?;
            emit(&formatter.success(&format!("Backup {id} taken")));
        }
        Commands::Backups { filter } => {
            let backups = context.open(cli)?.get_backups(&filter.to_filter()).await?;
            emit(&formatter.format_backups(&backups));
        }
        Commands::Restore {
            filter,
            backup_id,
            devices,
        } => {
            let id = context
                .open(cli)?
                .restore(&filter.to_filter(), backup_id.as_deref(), devices)
                .await?;
            emit(&formatter.success(&format!("Restored backup {id}")));
        }
        Commands::RemoveBackup {
            backup_id,
            keep_physical,
        } => {
            context
                .open(cli)?
                .remove_backup(backup_id, *keep_physical)
                .await?;
            emit(&formatter.success(&format!("Removed backup {backup_id}")));
        }
        Commands::Unlock { force } => {
            let uuid = context.select(cli)?;
            let current = DeploymentLock::current(&context.state_dir, &uuid)?;
            emit(&formatter.format_lock(current.as_ref()));
            if *force && current.is_some() {
                DeploymentLock::force_unlock(&context.state_dir, &uuid)?;
                emit(&formatter.success("Lock removed"));
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Everything loaded from the network file.
struct Context {
    config_file: PathBuf,
    spec: NetworkSpec,
    state_dir: PathBuf,
    db: StateDb,
    env: Collaborators,
}

impl Context {
    fn load(cli: &Cli) -> Result<Self> {
        let config_file = resolve_config_path(cli.config.as_ref())?;
        debug!("Loading network file from: {}", config_file.display());
        let base_dir = config_file
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        let parser = ConfigParser::new().with_base_path(&base_dir);
        parser.load_dotenv()?;
        let mut spec = parser.load_with_env(&config_file)?;
        if cli.yes {
            spec.settings.auto_response = Some(true);
        }

        let registry = ResourceRegistry::with_builtin_kinds();
        ConfigValidator::new(&registry).validate(&spec)?;

        let state_dir = cli.state_dir.clone().unwrap_or_else(|| {
            spec.state
                .dir
                .as_ref()
                .map_or_else(|| base_dir.join(STATE_DIR), |dir| base_dir.join(dir))
        });
        let db = StateDb::open_local(&state_dir)?;

        let settings = Arc::new(spec.settings.clone());
        let providers = create_providers(&spec, &settings)?;
        let builder = spec.build.as_ref().map(|build| {
            Arc::new(CommandBuilder::new(build.command.clone(), &base_dir)) as Arc<dyn Builder>
        });
        let remote = SshExecutor::new(spec.ssh.options.clone(), spec.ssh.remote_dir.clone())
            .with_timing(
                settings.duration(settings.poll_interval_secs),
                settings.duration(settings.ssh_timeout_secs),
            );

        let env = Collaborators {
            compiler: Arc::new(YamlCompiler::new(&config_file, &registry)),
            registry,
            providers,
            builder,
            remote: Arc::new(remote),
            confirm: Arc::new(TerminalConfirm::new(settings.auto_response)),
            settings,
            ssh: SshDefaults {
                user: spec.ssh.user.clone(),
                port: spec.ssh.port,
            },
            state_dir: Some(state_dir.clone()),
        };

        Ok(Self {
            config_file,
            spec,
            state_dir,
            db,
            env,
        })
    }

    /// Resolves the deployment named on the command line, or the only one
    /// created from this network file.
    fn select(&self, cli: &Cli) -> Result<String> {
        if let Some(query) = &cli.deployment {
            return engine::find_deployment(&self.db, query);
        }
        let spec_path = self.config_file.to_string_lossy().to_string();
        let matching: Vec<String> = engine::list_deployments(&self.db)
            .into_iter()
            .filter(|d| d.spec_path.as_deref() == Some(spec_path.as_str()))
            .map(|d| d.uuid)
            .collect();
        match matching.as_slice() {
            [uuid] => Ok(uuid.clone()),
            [] => Err(DeployError::internal(
                "no deployment for this network file; run 'statecraft create' first",
            )),
            _ => Err(StateError::AmbiguousDeployment { id: spec_path }.into()),
        }
    }

    fn open(&self, cli: &Cli) -> Result<Deployment> {
        let uuid = self.select(cli)?;
        info!(deployment = %uuid, "Using deployment");
        Deployment::open(self.db.clone(), &uuid, self.env.clone())
    }
}

/// Resolves the network file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    let path = config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))?;
    Ok(std::fs::canonicalize(&path).unwrap_or(path))
}

/// Creates a REST client per configured provider.
fn create_providers(spec: &NetworkSpec, settings: &Settings) -> Result<Providers> {
    let credentials = CredentialResolver::new();
    let mut providers = Providers::new();
    for (name, config) in &spec.providers {
        let token = credentials.resolve(name, config)?;
        let client = RestProvider::new(name, &config.endpoint, &token)?
            .with_retry(settings.retry_policy())
            .with_transient_codes(&config.transient_codes);
        providers.register(name.clone(), Arc::new(client));
    }
    Ok(providers)
}
