use crate::error::HearthError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub project: Project,
    pub host: Host,
    pub services: Services,
    pub influxdb: Influxdb,
    pub homeassistant: HomeAssistant,
    pub web: Web,
    pub permissions: Vec<OwnedDir>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Project {
    pub name: String,
    pub compose_file: String,
    pub env_file: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Host {
    pub os_release: String,
    pub apt_sources: String,
    pub apt_sources_dir: String,
    pub engine_packages: Vec<String>,
    pub compose_packages: Vec<String>,
    pub bad_repos: Vec<BadRepo>,
}

/// A package-repository entry known to break `apt-get update` on some releases.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BadRepo {
    pub pattern: String,
    #[serde(default)]
    pub codenames: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Services {
    pub broker: String,
    pub automation: String,
    pub store: String,
    pub flows: String,
    pub web: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Influxdb {
    pub marker: String,
    pub org: String,
    pub bucket: String,
    pub username: String,
    pub token_sentinel: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct HomeAssistant {
    pub config_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Web {
    pub init_marker: String,
    pub scaffold_command: String,
}

/// A data directory that a container process mounts as a fixed numeric user.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OwnedDir {
    pub path: String,
    pub uid: u32,
    pub gid: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            project: Project::default(),
            host: Host::default(),
            services: Services::default(),
            influxdb: Influxdb::default(),
            homeassistant: HomeAssistant::default(),
            web: Web::default(),
            permissions: vec![
                OwnedDir {
                    path: "nodered/data".to_string(),
                    uid: 1000,
                    gid: 1000,
                },
                OwnedDir {
                    path: "influxdb/data".to_string(),
                    uid: 1000,
                    gid: 1000,
                },
            ],
        }
    }
}

impl Default for Project {
    fn default() -> Self {
        Self {
            name: "hearth".to_string(),
            compose_file: "docker-compose.yml".to_string(),
            env_file: ".env".to_string(),
        }
    }
}

impl Default for Host {
    fn default() -> Self {
        Self {
            os_release: "/etc/os-release".to_string(),
            apt_sources: "/etc/apt/sources.list".to_string(),
            apt_sources_dir: "/etc/apt/sources.list.d".to_string(),
            engine_packages: vec!["docker.io".to_string()],
            compose_packages: vec![
                "docker-compose-plugin".to_string(),
                "docker-compose".to_string(),
            ],
            bad_repos: vec![BadRepo {
                pattern: "download.docker.com".to_string(),
                codenames: vec!["trixie".to_string()],
            }],
        }
    }
}

impl Default for Services {
    fn default() -> Self {
        Self {
            broker: "mosquitto".to_string(),
            automation: "homeassistant".to_string(),
            store: "influxdb".to_string(),
            flows: "nodered".to_string(),
            web: "web".to_string(),
        }
    }
}

impl Default for Influxdb {
    fn default() -> Self {
        Self {
            marker: "influxdb/data/influxd.bolt".to_string(),
            org: "home".to_string(),
            bucket: "home_assistant".to_string(),
            username: "admin".to_string(),
            token_sentinel: "changeme-token".to_string(),
        }
    }
}

impl Default for HomeAssistant {
    fn default() -> Self {
        Self {
            config_dir: "homeassistant/config".to_string(),
        }
    }
}

impl Default for Web {
    fn default() -> Self {
        Self {
            init_marker: "web/app/composer.json".to_string(),
            scaffold_command:
                "test -f composer.json || composer create-project --no-interaction laravel/laravel ."
                    .to_string(),
        }
    }
}

pub fn build_default_config_yaml() -> Result<String, HearthError> {
    let body = serde_yaml::to_string(&Config::default())?;
    Ok(format!(
        "# hearth bootstrap configuration. Paths are relative to the stack root.\n{body}"
    ))
}

pub fn read_config_from_str(content: &str) -> Result<Config, HearthError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != CONFIG_VERSION {
        return Err(HearthError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

/// Loads the config file, falling back to built-in defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<Config, HearthError> {
    match fs::read_to_string(path) {
        Ok(content) => read_config_from_str(&content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
        Err(err) => Err(err.into()),
    }
}

fn require_relative(field: &str, value: &str) -> Result<(), HearthError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(HearthError::Config(format!("{field} must be non-empty")));
    }
    let path = Path::new(trimmed);
    if path.is_absolute() || path.components().any(|c| c == Component::ParentDir) {
        return Err(HearthError::Config(format!(
            "{field} must be a path inside the stack root: {trimmed}"
        )));
    }
    Ok(())
}

fn require_non_empty(field: &str, value: &str) -> Result<(), HearthError> {
    if value.trim().is_empty() {
        return Err(HearthError::Config(format!("{field} must be non-empty")));
    }
    Ok(())
}

pub fn validate_config(cfg: &Config) -> Result<(), HearthError> {
    require_non_empty("project.name", &cfg.project.name)?;
    require_relative("project.compose_file", &cfg.project.compose_file)?;
    require_relative("project.env_file", &cfg.project.env_file)?;
    require_non_empty("host.os_release", &cfg.host.os_release)?;
    if cfg.host.engine_packages.is_empty() {
        return Err(HearthError::Config(
            "host.engine_packages must list at least one package".to_string(),
        ));
    }
    if cfg.host.compose_packages.is_empty() {
        return Err(HearthError::Config(
            "host.compose_packages must list at least one package".to_string(),
        ));
    }
    for repo in &cfg.host.bad_repos {
        require_non_empty("host.bad_repos[].pattern", &repo.pattern)?;
    }
    for (field, value) in [
        ("services.broker", &cfg.services.broker),
        ("services.automation", &cfg.services.automation),
        ("services.store", &cfg.services.store),
        ("services.flows", &cfg.services.flows),
        ("services.web", &cfg.services.web),
    ] {
        require_non_empty(field, value)?;
    }
    require_relative("influxdb.marker", &cfg.influxdb.marker)?;
    require_non_empty("influxdb.org", &cfg.influxdb.org)?;
    require_non_empty("influxdb.bucket", &cfg.influxdb.bucket)?;
    require_non_empty("influxdb.username", &cfg.influxdb.username)?;
    require_non_empty("influxdb.token_sentinel", &cfg.influxdb.token_sentinel)?;
    require_relative("homeassistant.config_dir", &cfg.homeassistant.config_dir)?;
    require_relative("web.init_marker", &cfg.web.init_marker)?;
    require_non_empty("web.scaffold_command", &cfg.web.scaffold_command)?;
    for owned in &cfg.permissions {
        require_relative("permissions[].path", &owned.path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_unknown_field_errors() {
        let yaml = r#"
version: 1
unknown: true
"#;
        let result: Result<Config, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn config_defaults_apply() {
        let cfg = read_config_from_str("version: 1").expect("config");
        assert_eq!(cfg.project.compose_file, "docker-compose.yml");
        assert_eq!(cfg.influxdb.token_sentinel, "changeme-token");
        assert_eq!(cfg.services.store, "influxdb");
        assert_eq!(cfg.permissions.len(), 2);
    }

    #[test]
    fn config_rejects_wrong_version() {
        let err = read_config_from_str("version: 7").expect_err("version mismatch");
        assert!(err.to_string().contains("unsupported config version 7"));
    }

    #[test]
    fn config_rejects_paths_escaping_root() {
        let yaml = "version: 1\ninfluxdb:\n  marker: ../elsewhere/influxd.bolt\n";
        let err = read_config_from_str(yaml).expect_err("escaping marker");
        assert!(err.to_string().contains("influxdb.marker"));
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let cfg = load_config(&dir.path().join("hearth.yaml")).unwrap();
        assert_eq!(cfg.project.name, "hearth");
    }

    #[test]
    fn default_yaml_round_trips_through_validation() {
        let yaml = build_default_config_yaml().unwrap();
        let cfg = read_config_from_str(&yaml).unwrap();
        assert_eq!(cfg.host.bad_repos[0].codenames, vec!["trixie".to_string()]);
    }
}
