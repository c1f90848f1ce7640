//! kubeplan CLI entrypoint.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use kubeplan::cli::{Cli, Commands, OutputFormatter, StateCommands};
use kubeplan::config::{ClusterManifest, ManifestParser, SpecValidator, StateBackend, find_manifest};
use kubeplan::error::{ConfigError, ReconcilerError, Result};
use kubeplan::provider::{HttpTransport, SimulatedCloud, Transport, provider_for};
use kubeplan::reconciler::Reconciler;
use kubeplan::state::{LocalStateStore, MemoryStateStore, S3StateStore, STATE_DIR, StateStore};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Installs the tracing subscriber. `RUST_LOG` wins over the verbosity flag.
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

/// Writes command output to stdout.
fn emit(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{output}")?;
    Ok(())
}

/// Runs one command. `Ok(false)` means the command ran but did not converge.
async fn run(cli: Cli) -> Result<bool> {
    let formatter = OutputFormatter::new(cli.format);
    let manifest_path = resolve_manifest_path(cli.manifest.as_ref())?;
    let manifest = load_manifest(&manifest_path)?;

    match cli.command {
        Commands::Validate { warnings } => {
            let result = SpecValidator::new().validate_manifest(&manifest)?;
            emit(&formatter.format_validation(&manifest.spec, &result, warnings))?;
            Ok(true)
        }
        Commands::Plan { detailed } => {
            let reconciler = build_reconciler(&manifest, &manifest_path, cli.simulate).await?;
            let report = reconciler.plan(&manifest.spec).await?;
            emit(&formatter.format_plan(&report, detailed))?;
            Ok(true)
        }
        Commands::Apply { yes } => {
            let reconciler = build_reconciler(&manifest, &manifest_path, cli.simulate).await?;
            let report = reconciler.plan(&manifest.spec).await?;
            if report.plan.is_empty() {
                emit(&formatter.format_plan(&report, false))?;
                return Ok(true);
            }
            emit(&formatter.format_plan(&report, false))?;

            if !yes && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
                eprintln!("Apply cancelled.");
                return Ok(true);
            }

            cancel_on_ctrl_c(reconciler.cancellation_token());
            let result = reconciler.reconcile(&manifest.spec).await?;
            emit(&formatter.format_reconciliation(&result))?;
            Ok(result.success)
        }
        Commands::Drift => {
            let reconciler = build_reconciler(&manifest, &manifest_path, cli.simulate).await?;
            let report = reconciler.check_drift(&manifest.spec).await?;
            emit(&formatter.format_drift(&report))?;
            Ok(report.is_converged())
        }
        Commands::Destroy { yes } => {
            let reconciler = build_reconciler(&manifest, &manifest_path, cli.simulate).await?;
            if !yes
                && !confirm(
                    "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
                    "destroy",
                )?
            {
                eprintln!("Destruction cancelled.");
                return Ok(true);
            }

            cancel_on_ctrl_c(reconciler.cancellation_token());
            let result = reconciler.destroy().await?;
            emit(&formatter.format_reconciliation(&result))?;
            Ok(result.success)
        }
        Commands::State { command } => {
            let store = build_store(&manifest, &manifest_path, cli.simulate).await?;
            cmd_state(store.as_ref(), command, &formatter).await?;
            Ok(true)
        }
    }
}

async fn cmd_state(store: &dyn StateStore, command: StateCommands, formatter: &OutputFormatter) -> Result<()> {
    match command {
        StateCommands::Show => {
            let snapshot = store.list().await?;
            let lock = store.get_lock_info().await?.filter(|l| !l.is_expired());
            emit(&formatter.format_state(&snapshot, lock.as_ref()))?;
        }
        StateCommands::Lock { holder } => {
            let lock = store.acquire_lock(holder.as_deref().unwrap_or("")).await?;
            emit(&formatter.format_message(true, &format!("State locked: {}", lock.lock_id)))?;
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                emit(&formatter.format_message(true, "State forcefully unlocked."))?;
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                emit(&formatter.format_message(true, "State unlocked."))?;
            } else {
                emit(&formatter.format_message(false, "Please provide --lock-id or use --force"))?;
            }
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn resolve_manifest_path(path: Option<&PathBuf>) -> Result<PathBuf> {
    path.map_or_else(|| find_manifest("."), |path| Ok(path.clone()))
}

fn manifest_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Loads `.env`, the manifest and its environment overrides.
fn load_manifest(path: &Path) -> Result<ClusterManifest> {
    debug!("Loading manifest from: {}", path.display());
    let parser = ManifestParser::new().with_base_path(manifest_dir(path));
    parser.load_dotenv()?;
    parser.load_with_env(path)
}

fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; waiting for in-flight operations to finish");
            token.cancel();
        }
    });
}

/// Creates the state store named by the manifest.
async fn build_store(
    manifest: &ClusterManifest,
    manifest_path: &Path,
    simulate: bool,
) -> Result<Arc<dyn StateStore>> {
    let backend = if simulate { StateBackend::Memory } else { manifest.state.backend };
    let cluster = &manifest.spec.cluster.name;

    let store: Arc<dyn StateStore> = match backend {
        StateBackend::Local => {
            let base = manifest.state.path.as_ref().map_or_else(
                || manifest_dir(manifest_path).join(STATE_DIR),
                PathBuf::from,
            );
            Arc::new(LocalStateStore::with_base_dir(base.join(cluster)))
        }
        StateBackend::S3 => {
            let bucket = manifest.state.bucket.as_deref().ok_or_else(|| {
                ReconcilerError::Config(ConfigError::validation(
                    "S3 bucket name is required when using S3 backend",
                    "state.bucket",
                ))
            })?;
            Arc::new(
                S3StateStore::new(
                    bucket,
                    manifest.state.prefix.as_deref(),
                    manifest.state.region.as_deref(),
                    cluster,
                )
                .await?,
            )
        }
        StateBackend::Memory => Arc::new(MemoryStateStore::new()),
    };

    debug!("Using {} state backend", store.backend_type());
    Ok(store)
}

/// Creates the transport: the simulated cloud, or HTTP against `provider.endpoint`.
fn build_transport(manifest: &ClusterManifest, simulate: bool) -> Result<Arc<dyn Transport>> {
    if simulate {
        info!("Running against the simulated cloud");
        return Ok(Arc::new(SimulatedCloud::new()));
    }

    let endpoint = manifest.provider.endpoint.as_deref().ok_or_else(|| {
        ReconcilerError::Config(ConfigError::validation(
            "provider.endpoint is required unless --simulate is set",
            "provider.endpoint",
        ))
    })?;
    let token = ManifestParser::api_token()?;
    Ok(Arc::new(HttpTransport::with_timeout(
        endpoint,
        &token,
        manifest.provider.timeout_secs,
    )?))
}

async fn build_reconciler(
    manifest: &ClusterManifest,
    manifest_path: &Path,
    simulate: bool,
) -> Result<Reconciler> {
    SpecValidator::new().validate_manifest(manifest)?;

    let transport = build_transport(manifest, simulate)?;
    let provider = provider_for(manifest.spec.cloud, &manifest.provider, transport)?;
    let store = build_store(manifest, manifest_path, simulate).await?;

    Reconciler::from_manifest(manifest, provider, store)
}
