use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reaper_service::{
    CancelHandle, CoverageInput, ReaperConfig, ReaperService, RecordKind, SafetyProfile,
    ScanRequest,
};
use reaper_source_index::FunctionId;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "reaper")]
#[command(about = "Find never-executed JavaScript and remove it reversibly", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (TOML, or JSON by extension)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Storage directory (overrides config and REAPER_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors (stdout is reserved for JSON)
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Map coverage onto sources and classify every function
    Scan(ScanArgs),

    /// Generate a removal patch from a scan
    Patch(PatchArgs),

    /// Write a patch to disk
    Apply(PatchIdArgs),

    /// Replay the scan's interaction plan against an applied patch
    Verify(PatchIdArgs),

    /// Restore the files a patch touched
    Rollback(PatchIdArgs),

    /// Print a stored record
    Show(ShowArgs),
}

#[derive(Args)]
struct ScanArgs {
    /// Project root the coverage URLs resolve against
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Precise-coverage JSON, as `PATH` or `SESSION=PATH` (repeatable)
    #[arg(long = "coverage", required = true)]
    coverage: Vec<String>,

    /// Restrict the scan to these files (relative to the root)
    #[arg(long = "file")]
    files: Vec<String>,

    /// Interaction plan token handed to the replay command at verification
    #[arg(long, default_value = "")]
    plan: String,
}

#[derive(Args)]
struct PatchArgs {
    /// Scan id
    scan: String,

    #[arg(long, value_enum, default_value = "conservative")]
    profile: ProfileArg,

    /// Only consider these candidate ids (repeatable)
    #[arg(long = "only")]
    only: Vec<String>,
}

#[derive(Args)]
struct PatchIdArgs {
    /// Patch id
    patch: String,
}

#[derive(Args)]
struct ShowArgs {
    #[arg(value_enum)]
    kind: ShowKind,

    /// Record id (a scan id for `records`)
    id: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProfileArg {
    Conservative,
    Balanced,
    Aggressive,
}

impl From<ProfileArg> for SafetyProfile {
    fn from(value: ProfileArg) -> Self {
        match value {
            ProfileArg::Conservative => Self::Conservative,
            ProfileArg::Balanced => Self::Balanced,
            ProfileArg::Aggressive => Self::Aggressive,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ShowKind {
    Scan,
    Patch,
    Application,
    Verification,
    /// Every record stored for a scan
    Records,
}

pub async fn main_entry() -> Result<()> {
    let cli = Cli::parse();

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    let mut config = ReaperConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    let service = ReaperService::new(config);

    match cli.command {
        Commands::Scan(args) => run_scan(&service, args).await,
        Commands::Patch(args) => {
            let selection = (!args.only.is_empty()).then(|| {
                args.only
                    .iter()
                    .map(|id| FunctionId::from(id.as_str()))
                    .collect::<BTreeSet<_>>()
            });
            let patch = service
                .generate_patch(&args.scan, args.profile.into(), selection)
                .await?;
            print_json(&patch)
        }
        Commands::Apply(args) => print_json(&service.apply_patch(&args.patch).await?),
        Commands::Verify(args) => run_verify(&service, &args.patch).await,
        Commands::Rollback(args) => print_json(&service.rollback_patch(&args.patch).await?),
        Commands::Show(args) => {
            let kind = match args.kind {
                ShowKind::Records => return print_json(&service.list(&args.id).await?),
                ShowKind::Scan => RecordKind::Scan,
                ShowKind::Patch => RecordKind::Patch,
                ShowKind::Application => RecordKind::Application,
                ShowKind::Verification => RecordKind::Verification,
            };
            print_json(&service.show(kind, &args.id).await?)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// `SESSION=PATH`, or `PATH` with the file stem as the session id
fn coverage_arg(raw: &str) -> (String, PathBuf) {
    if let Some((session, path)) = raw.split_once('=') {
        if !session.is_empty() && !path.is_empty() {
            return (session.to_string(), PathBuf::from(path));
        }
    }
    let path = PathBuf::from(raw);
    let session = Path::new(raw)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(raw)
        .to_string();
    (session, path)
}

async fn run_scan(service: &ReaperService, args: ScanArgs) -> Result<()> {
    let mut coverage = Vec::with_capacity(args.coverage.len());
    for raw in &args.coverage {
        let (session_id, path) = coverage_arg(raw);
        let payload = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read coverage {}", path.display()))?;
        coverage.push(CoverageInput::V8 {
            session_id,
            payload,
        });
    }

    let record = service
        .scan_and_analyze(ScanRequest {
            root: args.root,
            files: args.files,
            coverage,
            plan: args.plan,
        })
        .await?;
    print_json(&record)
}

async fn run_verify(service: &ReaperService, patch_id: &str) -> Result<()> {
    let (handle, token) = CancelHandle::new();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received, cancelling verification");
            handle.cancel();
        }
    });

    let outcome = service.verify_patch(patch_id, token).await;
    watcher.abort();
    let outcome = outcome?;

    let label = outcome.as_str();
    let result = outcome.into_result(patch_id)?;
    print_json(&json!({ "outcome": label, "result": result }))
}
