use crate::config::Config;
use crate::env_store::EnvStore;
use crate::error::HearthError;
use crate::inject::INTEGRATION_BLOCK;
use crate::runner::{probe, CommandRunner};
use crate::secrets::{store_initialized, TOKEN_KEY};
use crate::stack::StackPaths;
use crate::toolchain::{find_bad_repo_entries, read_os_release, ENGINE, LEGACY_COMPOSE, PACKAGE_MANAGER};
use crate::yaml_lines::has_top_level_block;
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
pub struct DoctorCheck {
    pub id: String,
    pub ok: bool,
    pub severity: String,
    pub strict_fail: bool,
    pub message: String,
    pub remediation: String,
    pub details: serde_json::Value,
}

fn doctor_check(
    id: &str,
    ok: bool,
    severity: &str,
    strict_fail: bool,
    message: impl Into<String>,
    remediation: impl Into<String>,
    details: serde_json::Value,
) -> DoctorCheck {
    DoctorCheck {
        id: id.to_string(),
        ok,
        severity: severity.to_string(),
        strict_fail,
        message: message.into(),
        remediation: remediation.into(),
        details,
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

/// Read-only readiness report. Nothing here writes to the host.
pub fn collect_doctor_checks<R: CommandRunner>(
    runner: &R,
    cfg: &Config,
    root: &Path,
    bundle_dir: &Path,
) -> Vec<DoctorCheck> {
    let mut checks = Vec::new();
    let paths = StackPaths::new(root, cfg);

    let os = read_os_release(Path::new(&cfg.host.os_release));
    checks.push(match &os {
        Ok(os) => doctor_check(
            "host_release",
            true,
            "error",
            true,
            format!(
                "{} {}",
                os.id,
                os.codename.as_deref().unwrap_or("(no codename)")
            ),
            "",
            json!({"id": os.id, "codename": os.codename}),
        ),
        Err(err) => doctor_check(
            "host_release",
            false,
            "error",
            true,
            err.to_string(),
            format!("make {} readable or set host.os_release", cfg.host.os_release),
            json!({"path": cfg.host.os_release}),
        ),
    });

    if let Ok(os) = &os {
        let entries = find_bad_repo_entries(&cfg.host, os);
        let protected = entries.iter().any(|entry| entry.protected);
        checks.push(doctor_check(
            "package_sources",
            entries.is_empty(),
            if protected { "error" } else { "warning" },
            true,
            if entries.is_empty() {
                "no known-bad repository entries".to_string()
            } else if protected {
                format!(
                    "{} contains an entry that breaks package updates on this release",
                    cfg.host.apt_sources
                )
            } else {
                format!("{} repository file(s) will be removed by bootstrap", entries.len())
            },
            "remove the listed entries by hand or let `hearth bootstrap` remove them",
            json!({"entries": entries}),
        ));
    }

    let package_manager = runner.locate(PACKAGE_MANAGER).is_some();
    checks.push(doctor_check(
        "package_manager",
        package_manager,
        "warning",
        true,
        if package_manager {
            "apt-get available"
        } else {
            "apt-get not found; missing tooling cannot be installed"
        },
        "run on a Debian-family host or preinstall docker and compose",
        json!({}),
    ));

    let engine_installed = runner.locate(ENGINE).is_some();
    let engine_reachable = engine_installed && probe(runner, &args(&[ENGINE, "info"]));
    checks.push(doctor_check(
        "container_engine",
        engine_reachable,
        "warning",
        true,
        if engine_reachable {
            "docker daemon reachable"
        } else if engine_installed {
            "docker is installed but the daemon is unreachable for this user"
        } else {
            "docker is not installed; bootstrap will install it"
        },
        "start the docker service or rerun after logging in again to pick up the docker group",
        json!({"installed": engine_installed}),
    ));

    let plugin = engine_installed && probe(runner, &args(&[ENGINE, "compose", "version"]));
    let legacy = !plugin
        && runner.locate(LEGACY_COMPOSE).is_some()
        && probe(runner, &args(&[LEGACY_COMPOSE, "version"]));
    checks.push(doctor_check(
        "compose",
        plugin || legacy,
        "warning",
        true,
        if plugin {
            "docker compose plugin available"
        } else if legacy {
            "legacy docker-compose available"
        } else {
            "no compose implementation usable without elevation"
        },
        "run `hearth bootstrap` to install a compose package",
        json!({"plugin": plugin, "legacy": legacy}),
    ));

    let bundled = bundle_dir.join(&cfg.project.compose_file);
    let descriptor = paths.compose_file.exists() || bundled.exists();
    checks.push(doctor_check(
        "compose_file",
        descriptor,
        "error",
        true,
        if descriptor {
            "compose descriptor present"
        } else {
            "compose descriptor missing from stack root and bundle directory"
        },
        format!(
            "place {} in {} or pass --bundle-dir",
            cfg.project.compose_file,
            root.display()
        ),
        json!({"root": paths.compose_file, "bundle": bundled}),
    ));

    let descriptor_path = if paths.compose_file.exists() {
        Some(paths.compose_file.clone())
    } else if bundled.exists() {
        Some(bundled.clone())
    } else {
        None
    };
    if let Some(descriptor_path) = descriptor_path {
        checks.push(compose_services_check(cfg, &descriptor_path));
    }

    let store = EnvStore::load(&paths.env_file);
    checks.push(match store_initialized(&paths.store_marker) {
        Ok(initialized) => store_token_check(&store, cfg, &paths, initialized),
        Err(err) => doctor_check(
            "store_token",
            false,
            "error",
            true,
            err.to_string(),
            err.details().and_then(|details| details.hint).unwrap_or_default(),
            json!({"env_file": paths.env_file, "marker": paths.store_marker}),
        ),
    });

    let block = fs::read_to_string(&paths.automation_config)
        .map(|content| has_top_level_block(&content, INTEGRATION_BLOCK))
        .unwrap_or(false);
    checks.push(doctor_check(
        "integration_block",
        block,
        "warning",
        true,
        if block {
            "automation engine is wired to the store"
        } else {
            "store integration not configured yet"
        },
        "run `hearth bootstrap`",
        json!({"path": paths.automation_config}),
    ));

    checks
}

/// Service names from the descriptor's top-level `services:` mapping.
fn declared_services(path: &Path) -> Result<Vec<String>, HearthError> {
    let content = fs::read_to_string(path)?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&content)?;
    let names = doc
        .get("services")
        .and_then(serde_yaml::Value::as_mapping)
        .map(|services| {
            services
                .keys()
                .filter_map(serde_yaml::Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(names)
}

fn compose_services_check(cfg: &Config, descriptor: &Path) -> DoctorCheck {
    let expected = [
        ("broker", &cfg.services.broker),
        ("automation", &cfg.services.automation),
        ("store", &cfg.services.store),
        ("flows", &cfg.services.flows),
        ("web", &cfg.services.web),
    ];
    let declared = match declared_services(descriptor) {
        Ok(declared) => declared,
        Err(err) => {
            return doctor_check(
                "compose_services",
                false,
                "error",
                true,
                format!("{} is not readable YAML: {err}", descriptor.display()),
                "fix the compose descriptor syntax",
                json!({"path": descriptor}),
            )
        }
    };
    let missing: Vec<String> = expected
        .iter()
        .filter(|(_, name)| !declared.iter().any(|candidate| candidate == *name))
        .map(|(role, name)| format!("{role}={name}"))
        .collect();
    doctor_check(
        "compose_services",
        missing.is_empty(),
        "warning",
        true,
        if missing.is_empty() {
            "compose descriptor declares every configured service".to_string()
        } else {
            format!("compose descriptor lacks configured services: {}", missing.join(", "))
        },
        "align the services section of hearth.yaml with the compose descriptor",
        json!({"path": descriptor, "declared": declared, "missing": missing}),
    )
}

fn store_token_check(
    store: &EnvStore,
    cfg: &Config,
    paths: &StackPaths,
    initialized: bool,
) -> DoctorCheck {
    let token = store.get(TOKEN_KEY).filter(|value| !value.is_empty());
    let usable = token.is_some_and(|value| value != cfg.influxdb.token_sentinel);
    let (ok, severity, message) = match (initialized, token.is_some(), usable) {
        (true, false, _) => (
            false,
            "error",
            "store is initialized but the env file has no token",
        ),
        (_, _, true) => (true, "warning", "store token present"),
        (true, true, false) => (
            true,
            "warning",
            "store is bound to the placeholder token",
        ),
        (false, _, false) => (false, "warning", "no store token yet; bootstrap will generate one"),
    };
    doctor_check(
        "store_token",
        ok,
        severity,
        !initialized,
        message,
        format!(
            "restore {TOKEN_KEY} in {} from a backup, or remove the store data to start over",
            paths.env_file.display()
        ),
        json!({"env_file": paths.env_file, "initialized": initialized}),
    )
}
