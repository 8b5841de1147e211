use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use vidgraph_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use vidgraph_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use vidgraph_core::model_registry::ModelRegistry;
use vidgraph_core::{ExtensionActivation, ParamSet, WorkflowBuilder};

#[derive(Parser)]
#[command(
    name = "vidgraph",
    about = "Builds node-graph workflows for image and video generation"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a workflow from a JSON parameter file.
    Build(BuildArgs),
    /// List the pipeline stages in run order.
    Stages(StagesArgs),
    /// List the known models.
    Models(ModelsArgs),
}

#[derive(Args)]
struct BuildArgs {
    #[arg(help = "Path to the request parameters JSON file")]
    params: PathBuf,
    #[arg(
        short = 'o',
        long,
        help = "Write the workflow here instead of the configured output directory"
    )]
    output: Option<PathBuf>,
    #[arg(long, conflicts_with = "output", help = "Print the workflow to stdout")]
    stdout: bool,
    #[arg(long, value_name = "CATALOG", help = "Extra model catalog JSON")]
    models: Option<PathBuf>,
    #[arg(long, help = "Build with the stock stages only")]
    no_extension: bool,
}

#[derive(Args)]
struct ModelsArgs {
    #[arg(long, value_name = "CATALOG", help = "Extra model catalog JSON")]
    models: Option<PathBuf>,
}

#[derive(Args)]
struct StagesArgs {
    #[arg(long, help = "Show the stock stages only")]
    no_extension: bool,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let config = load_config(&resolved_data_dir);
    init_logging(
        &resolved_data_dir,
        cli.verbose,
        cli.log_filter.as_deref(),
        config.logging.retention_files,
    );
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    match cli.command {
        Commands::Build(args) => run_build(&config, &resolved_data_dir, args),
        Commands::Stages(args) => run_stages(&config, &resolved_data_dir, args.no_extension),
        Commands::Models(args) => run_models(&config, &resolved_data_dir, args.models.as_deref()),
    }
}

/// Loads `config.toml`, creating the data dir with defaults on first run.
/// Failures fall back to the built-in defaults.
fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(error) = initialize_data_dir(data_dir) {
        eprintln!("Warning: could not initialize data directory: {error:#}");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("Warning: {error:#}. Using default configuration.");
            AppConfig::default()
        }
    }
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>, retention_files: usize) {
    let init_options = LoggingInitOptions {
        data_dir: Some(data_dir.to_path_buf()),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        retention_files,
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let filter = init_plan.filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(parse_env_filter_with_fallback(&filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

/// Built-in catalog merged with the configured one and an explicit `extra`.
fn load_models(config: &AppConfig, data_dir: &Path, extra: Option<&Path>) -> Result<ModelRegistry> {
    let mut models = ModelRegistry::with_builtin_models();
    let configured = resolve_relative_to(data_dir, &config.paths.model_catalog);
    if configured.exists() {
        models.load_from_path(&configured)?;
    }
    if let Some(path) = extra {
        models.load_from_path(path)?;
    }
    Ok(models)
}

fn make_builder(
    config: &AppConfig,
    data_dir: &Path,
    extra_models: Option<&Path>,
    no_extension: bool,
) -> Result<WorkflowBuilder> {
    let models = load_models(config, data_dir, extra_models)?;
    let builder = WorkflowBuilder::new(models, config.generation.clone());
    if no_extension {
        return Ok(builder);
    }
    Ok(builder.with_extension(&ExtensionActivation::new()))
}

fn run_build(config: &AppConfig, data_dir: &Path, args: BuildArgs) -> Result<()> {
    let builder = make_builder(config, data_dir, args.models.as_deref(), args.no_extension)?;
    let params = ParamSet::load_from_path(&args.params)?;
    let graph = builder.build(&params)?;
    let encoded = serde_json::to_string_pretty(&graph).context("failed to serialize workflow")?;

    if args.stdout {
        println!("{encoded}");
        return Ok(());
    }
    let path = match args.output {
        Some(path) => path,
        None => default_output_path(config, data_dir, &args.params),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create output directory: {}", parent.display())
        })?;
    }
    fs::write(&path, encoded)
        .with_context(|| format!("failed to write workflow: {}", path.display()))?;
    info!(path = %path.display(), nodes = graph.len(), "Wrote workflow");
    Ok(())
}

/// `<output_dir>/<params stem>.json`, with `output_dir` relative to the data dir.
fn default_output_path(config: &AppConfig, data_dir: &Path, params: &Path) -> PathBuf {
    let stem = params
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workflow".to_string());
    resolve_relative_to(data_dir, &config.paths.output_dir).join(format!("{stem}.json"))
}

fn run_stages(config: &AppConfig, data_dir: &Path, no_extension: bool) -> Result<()> {
    let builder = make_builder(config, data_dir, None, no_extension)?;
    for line in format_stages(&builder) {
        println!("{line}");
    }
    Ok(())
}

fn run_models(config: &AppConfig, data_dir: &Path, extra: Option<&Path>) -> Result<()> {
    let models = load_models(config, data_dir, extra)?;
    for entry in models.list() {
        println!("{:<32} {}", entry.name, entry.compat_class);
    }
    Ok(())
}

fn format_stages(builder: &WorkflowBuilder) -> Vec<String> {
    builder
        .registry()
        .stages()
        .into_iter()
        .map(|(priority, name)| format!("{priority:>6.1}  {name}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn cli_parses_build_with_globals() {
        let cli = Cli::try_parse_from([
            "vidgraph",
            "-vv",
            "build",
            "req.json",
            "-o",
            "out.json",
            "--no-extension",
            "--data-dir",
            "/tmp/vg",
        ])
        .expect("cli should parse");

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/vg")));
        let Commands::Build(args) = cli.command else {
            panic!("expected build command");
        };
        assert_eq!(args.params, PathBuf::from("req.json"));
        assert_eq!(args.output, Some(PathBuf::from("out.json")));
        assert!(args.no_extension);
        assert!(args.models.is_none());
    }

    #[test]
    fn cli_requires_a_command() {
        assert!(Cli::try_parse_from(["vidgraph"]).is_err());
    }

    #[test]
    fn stage_listing_reflects_extension() {
        let config = AppConfig::default();
        let dir = tempdir().expect("tempdir should be created");

        let stock = make_builder(&config, dir.path(), None, true).expect("stock builder");
        let patched = make_builder(&config, dir.path(), None, false).expect("patched builder");

        let stock_lines = format_stages(&stock);
        let patched_lines = format_stages(&patched);
        assert_eq!(stock_lines.len(), patched_lines.len());
        assert!(stock_lines.iter().any(|line| line.ends_with(" image-to-video")));
        assert!(patched_lines
            .iter()
            .any(|line| line.ends_with(" latent-upscale-image-to-video")));
    }

    #[test]
    fn build_writes_workflow_file() {
        let dir = tempdir().expect("tempdir should be created");
        let params_path = dir.path().join("req.json");
        fs::write(
            &params_path,
            r#"{"model": "sd-xl-base-1.0", "prompt": "a tall tree", "seed": 3}"#,
        )
        .expect("params should be written");
        let output = dir.path().join("out").join("workflow.json");

        run_build(
            &AppConfig::default(),
            dir.path(),
            BuildArgs {
                params: params_path,
                output: Some(output.clone()),
                stdout: false,
                models: None,
                no_extension: false,
            },
        )
        .expect("build should succeed");

        let written = fs::read_to_string(&output).expect("workflow should exist");
        let value: serde_json::Value = serde_json::from_str(&written).expect("valid json");
        assert_eq!(value["9"]["class_type"], "SwarmSaveImageWS");
        assert_eq!(value["10"]["inputs"]["noise_seed"], 3);
    }

    #[test]
    fn extra_model_catalog_is_merged() {
        let dir = tempdir().expect("tempdir should be created");
        let catalog = dir.path().join("extra.json");
        fs::write(
            &catalog,
            r#"[{"name": "ltx-distilled", "compat_class": "ltxv2", "standard_width": 768, "standard_height": 512}]"#,
        )
        .expect("catalog should be written");

        let models = load_models(&AppConfig::default(), dir.path(), Some(&catalog))
            .expect("catalog should load");
        assert!(models.get("ltx-distilled").is_some());
        assert!(models.get("ltx-2-19b-dev").is_some());
    }

    #[test]
    fn build_without_output_uses_configured_dir() {
        let dir = tempdir().expect("tempdir should be created");
        let params_path = dir.path().join("lighthouse.json");
        fs::write(&params_path, r#"{"model": "sd-xl-base-1.0", "seed": 7}"#)
            .expect("params should be written");
        let mut config = AppConfig::default();
        config.paths.output_dir = PathBuf::from("renders");

        run_build(
            &config,
            dir.path(),
            BuildArgs {
                params: params_path,
                output: None,
                stdout: false,
                models: None,
                no_extension: true,
            },
        )
        .expect("build should succeed");

        let written = fs::read_to_string(dir.path().join("renders").join("lighthouse.json"))
            .expect("workflow should land in the output dir");
        let value: serde_json::Value = serde_json::from_str(&written).expect("valid json");
        assert_eq!(value["10"]["inputs"]["noise_seed"], 7);
    }

    #[test]
    fn cli_rejects_stdout_with_output() {
        let result =
            Cli::try_parse_from(["vidgraph", "build", "req.json", "-o", "out.json", "--stdout"]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_parses_models_catalog() {
        let cli = Cli::try_parse_from(["vidgraph", "models", "--models", "extra.json"])
            .expect("cli should parse");
        let Commands::Models(args) = cli.command else {
            panic!("expected models command");
        };
        assert_eq!(args.models, Some(PathBuf::from("extra.json")));
    }
}
