mod bootstrap;
mod config;
mod doctor;
mod env_store;
mod error;
mod inject;
mod reconcile;
mod runner;
mod secrets;
mod stack;
mod startup;
mod toolchain;
mod yaml_lines;

use bootstrap::{run_bootstrap, BootstrapContext, BootstrapReport};
use clap::{Parser, Subcommand};
use config::{build_default_config_yaml, load_config};
use dialoguer::console::style;
use dirs::home_dir;
use doctor::collect_doctor_checks;
use error::{HearthError, ProcessErrorDetails};
use runner::{current_uid, Elevation, SystemRunner};
use serde::Serialize;
use serde_json::json;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const CONFIG_FILE_NAME: &str = "hearth.yaml";
const LOG_ENV: &str = "HEARTH_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "hearth",
    version,
    about = "Bootstrap and reconcile a home-automation container stack"
)]
struct Cli {
    /// Stack root directory (defaults to the current directory).
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding the bundled compose descriptor and templates.
    #[arg(long, global = true)]
    bundle_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile tooling, files and secrets, then start the stack.
    Bootstrap {
        #[arg(long, default_value_t = false)]
        skip_startup: bool,
    },
    /// Read-only readiness checks.
    Doctor {
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Show,
    Validate,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

#[derive(Debug, Clone)]
struct Context {
    root: PathBuf,
    config_path: PathBuf,
    bundle_dir: PathBuf,
    json: bool,
}

fn main() -> Result<(), HearthError> {
    init_tracing();
    let cli = Cli::parse();
    let ctx = build_context(&cli)?;
    let runner = SystemRunner;

    let result = match cli.command {
        Commands::Bootstrap { skip_startup } => handle_bootstrap(&ctx, skip_startup, &runner),
        Commands::Doctor { strict } => handle_doctor(&ctx, strict, &runner),
        Commands::Config { command } => handle_config(&ctx, command),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: err.details(),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn build_context(cli: &Cli) -> Result<Context, HearthError> {
    let root = resolve_root(cli.root.as_ref())?;
    let config_path = resolve_config_path(cli.config.as_ref(), &root);
    let bundle_dir = resolve_bundle_dir(cli.bundle_dir.as_ref(), &root);
    Ok(Context {
        root,
        config_path,
        bundle_dir,
        json: cli.json,
    })
}

fn expand_path(input: &Path) -> PathBuf {
    if let Ok(stripped) = input.strip_prefix("~") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    input.to_path_buf()
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

fn resolve_root(override_path: Option<&PathBuf>) -> Result<PathBuf, HearthError> {
    let root = match override_path.cloned().or_else(|| env_path("HEARTH_ROOT")) {
        Some(path) => expand_path(&path),
        None => env::current_dir()?,
    };
    if root.is_absolute() {
        return Ok(root);
    }
    Ok(env::current_dir()?.join(root))
}

fn resolve_config_path(override_path: Option<&PathBuf>, root: &Path) -> PathBuf {
    override_path
        .cloned()
        .or_else(|| env_path("HEARTH_CONFIG"))
        .map(|path| expand_path(&path))
        .unwrap_or_else(|| root.join(CONFIG_FILE_NAME))
}

/// The bundle defaults to the directory holding the executable when it ships
/// a compose descriptor, otherwise the stack root itself.
fn resolve_bundle_dir(override_path: Option<&PathBuf>, root: &Path) -> PathBuf {
    if let Some(path) = override_path.cloned().or_else(|| env_path("HEARTH_BUNDLE_DIR")) {
        return expand_path(&path);
    }
    let exe_dir = env::current_exe()
        .ok()
        .and_then(|exe| fs::canonicalize(exe).ok())
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    if let Some(dir) = exe_dir {
        if dir.join("docker-compose.yml").exists() {
            return dir;
        }
    }
    root.to_path_buf()
}

/// The login that should join the engine group: the invoking user under sudo.
fn invoking_user() -> Option<String> {
    env::var("SUDO_USER")
        .ok()
        .or_else(|| env::var("USER").ok())
        .filter(|user| !user.is_empty() && user != "root")
}

fn handle_bootstrap(
    ctx: &Context,
    skip_startup: bool,
    runner: &SystemRunner,
) -> Result<(), HearthError> {
    let cfg = load_config(&ctx.config_path)?;
    let bootstrap_ctx = BootstrapContext {
        root: ctx.root.clone(),
        bundle_dir: ctx.bundle_dir.clone(),
        privilege: Elevation::for_uid(current_uid()),
        user: invoking_user(),
        skip_startup,
    };
    let report = run_bootstrap(runner, &cfg, &bootstrap_ctx)?;
    if ctx.json {
        return output(ctx, serde_json::to_value(&report)?);
    }
    print_bootstrap_summary(&report);
    Ok(())
}

fn print_bootstrap_summary(report: &BootstrapReport) {
    println!(
        "{} stack at {}",
        style("ready").green().bold(),
        report.root.display()
    );
    println!("  engine:  {}", report.toolchain.engine);
    println!("  compose: {}", report.toolchain.compose);
    let fs_report = &report.filesystem;
    println!(
        "  files:   {} created, {} copied, {} appended, {} unchanged",
        fs_report.created.len(),
        fs_report.copied.len(),
        fs_report.appended.len(),
        fs_report.unchanged.len()
    );
    println!("  token:   {}", report.secrets.token_origin.as_str());
    if report.integration.changed() {
        println!("  integration updated");
    }
    if report.startup.is_none() {
        println!("  startup skipped");
    }
    for warning in report.warnings() {
        println!("  {} {}", style("warning:").yellow(), warning);
    }
}

fn handle_doctor(ctx: &Context, strict: bool, runner: &SystemRunner) -> Result<(), HearthError> {
    let cfg = load_config(&ctx.config_path)?;
    let checks = collect_doctor_checks(runner, &cfg, &ctx.root, &ctx.bundle_dir);
    let has_error = checks
        .iter()
        .any(|check| !check.ok && check.severity == "error");
    let has_strict_warning = checks.iter().any(|check| !check.ok && check.strict_fail);
    let ok = !has_error && (!strict || !has_strict_warning);
    let primary_error = checks
        .iter()
        .find(|check| !check.ok && check.severity == "error")
        .or_else(|| checks.iter().find(|check| !check.ok && strict && check.strict_fail))
        .map(|check| check.message.clone());

    if ctx.json {
        let payload = JsonResult {
            ok,
            result: Some(json!({ "checks": checks, "strict": strict })),
            error: if ok { None } else { primary_error },
            error_details: None,
        };
        print_json(&payload)?;
        if !ok {
            std::process::exit(1);
        }
        return Ok(());
    }

    for check in &checks {
        let state = if check.ok {
            style("ok").green()
        } else if check.severity == "error" {
            style("fail").red()
        } else {
            style("warn").yellow()
        };
        println!("[{}] {} - {}", state, check.id, check.message);
        if !check.ok {
            println!("  remediation: {}", check.remediation);
        }
    }
    if ok {
        return Ok(());
    }
    Err(HearthError::Process(primary_error.unwrap_or_else(|| {
        "one or more readiness checks failed".to_string()
    })))
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), HearthError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            if let Some(parent) = ctx.config_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&ctx.config_path, build_default_config_yaml()?)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Show => {
            let cfg = load_config(&ctx.config_path)?;
            if ctx.json {
                return output(ctx, serde_json::to_value(&cfg)?);
            }
            print!("{}", serde_yaml::to_string(&cfg)?);
            Ok(())
        }
        ConfigCommand::Validate => {
            if !ctx.config_path.exists() {
                return Err(HearthError::Config(format!(
                    "{} does not exist; run `hearth config init`",
                    ctx.config_path.display()
                )));
            }
            let _cfg = load_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
    }
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), HearthError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), HearthError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tilde_expands_to_home() {
        let Some(home) = home_dir() else {
            return;
        };
        assert_eq!(expand_path(Path::new("~/stack")), home.join("stack"));
        assert_eq!(expand_path(Path::new("/srv/stack")), PathBuf::from("/srv/stack"));
    }

    #[test]
    fn explicit_config_path_wins() {
        let path = resolve_config_path(Some(&PathBuf::from("/etc/hearth.yaml")), Path::new("/srv"));
        assert_eq!(path, PathBuf::from("/etc/hearth.yaml"));
    }
}
