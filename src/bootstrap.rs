use crate::config::Config;
use crate::env_store::EnvStore;
use crate::error::HearthError;
use crate::inject::{ensure_integration, IntegrationReport, IntegrationSecrets};
use crate::reconcile::{FilesystemReconciler, ReconcileReport};
use crate::runner::{CommandRunner, Elevation, FileWriter};
use crate::secrets::{
    ensure_store_settings, ensure_token, TokenOrigin, BUCKET_KEY, ORG_KEY, TOKEN_KEY,
};
use crate::stack::{stack_artifacts, StackPaths};
use crate::startup::{StartupReport, StartupSequencer};
use crate::toolchain::{ToolchainBinding, ToolchainResolver};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

/// Where a bootstrap run operates and with which rights.
#[derive(Debug, Clone)]
pub struct BootstrapContext {
    pub root: PathBuf,
    pub bundle_dir: PathBuf,
    pub privilege: Elevation,
    pub user: Option<String>,
    pub skip_startup: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecretsReport {
    pub env_file: PathBuf,
    pub token_origin: TokenOrigin,
    pub written_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub root: PathBuf,
    pub toolchain: ToolchainBinding,
    pub filesystem: ReconcileReport,
    pub secrets: SecretsReport,
    pub integration: IntegrationReport,
    pub startup: Option<StartupReport>,
}

impl BootstrapReport {
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = self.filesystem.warnings.clone();
        if let Some(startup) = &self.startup {
            warnings.extend(startup.warnings.iter().cloned());
        }
        warnings
    }
}

/// Runs every phase in order; each one completes before the next starts and
/// the first fatal error stops the run.
pub fn run_bootstrap<R: CommandRunner>(
    runner: &R,
    cfg: &Config,
    ctx: &BootstrapContext,
) -> Result<BootstrapReport, HearthError> {
    let started_at = Utc::now();
    let paths = StackPaths::new(&ctx.root, cfg);
    info!(root = %ctx.root.display(), "bootstrap started");

    let toolchain =
        ToolchainResolver::new(runner, &cfg.host, ctx.privilege, ctx.user.clone()).resolve()?;
    info!(engine = %toolchain.engine, compose = %toolchain.compose, "toolchain resolved");

    let filesystem = FilesystemReconciler::new(&ctx.root, &ctx.bundle_dir, runner, ctx.privilege)
        .reconcile(&stack_artifacts(cfg), &cfg.permissions)?;
    info!(
        changed = filesystem.changed(),
        created = filesystem.created.len(),
        copied = filesystem.copied.len(),
        appended = filesystem.appended.len(),
        "filesystem reconciled"
    );

    let writer = FileWriter::new(runner, ctx.privilege);
    let mut store = EnvStore::load(&paths.env_file);
    let token = ensure_token(
        &mut store,
        &paths.store_marker,
        &cfg.influxdb.token_sentinel,
        &writer,
    )?;
    let mut written_keys = match token.origin {
        TokenOrigin::Generated => vec![TOKEN_KEY.to_string()],
        _ => Vec::new(),
    };
    written_keys.extend(ensure_store_settings(
        &mut store,
        &paths.store_marker,
        &cfg.influxdb,
        &writer,
    )?);

    let integration_secrets = IntegrationSecrets {
        token: token.value.clone(),
        org: store.get(ORG_KEY).unwrap_or(cfg.influxdb.org.as_str()).to_string(),
        bucket: store.get(BUCKET_KEY).unwrap_or(cfg.influxdb.bucket.as_str()).to_string(),
    };
    let integration = ensure_integration(
        &paths.automation_config,
        &paths.automation_secrets,
        &cfg.services.store,
        &integration_secrets,
        &cfg.influxdb.token_sentinel,
        &writer,
    )?;

    let startup = if ctx.skip_startup {
        info!("startup skipped");
        None
    } else {
        Some(StartupSequencer::new(runner, &toolchain, &paths, cfg).run()?)
    };

    info!("bootstrap finished");
    Ok(BootstrapReport {
        started_at,
        finished_at: Utc::now(),
        root: ctx.root.clone(),
        toolchain,
        filesystem,
        secrets: SecretsReport {
            env_file: paths.env_file.clone(),
            token_origin: token.origin,
            written_keys,
        },
        integration,
        startup,
    })
}
