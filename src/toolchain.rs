//! Detects (and if needed installs) the container engine and a compose
//! frontend, deciding once whether they must be invoked through `sudo`.

use crate::config::{BadRepo, Host};
use crate::error::HearthError;
use crate::runner::{execute, probe, CommandRunner, Elevation, FileWriter, Invocation};
use serde::Serialize;
use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const ENGINE: &str = "docker";
pub const LEGACY_COMPOSE: &str = "docker-compose";
pub const PACKAGE_MANAGER: &str = "apt-get";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OsRelease {
    pub id: String,
    pub codename: Option<String>,
}

fn os_release_value(raw: &str) -> String {
    raw.trim().trim_matches('"').trim_matches('\'').to_string()
}

pub fn parse_os_release(content: &str) -> OsRelease {
    let mut id = String::new();
    let mut codename = None;
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "ID" => id = os_release_value(value),
            "VERSION_CODENAME" => {
                let value = os_release_value(value);
                if !value.is_empty() {
                    codename = Some(value);
                }
            }
            _ => {}
        }
    }
    OsRelease { id, codename }
}

pub fn read_os_release(path: &Path) -> Result<OsRelease, HearthError> {
    let content = fs::read_to_string(path).map_err(|err| {
        HearthError::fatal(
            format!("cannot read distro detection file {}: {err}", path.display()),
            "run hearth on a Debian-family host that provides /etc/os-release, or point host.os_release at it",
        )
    })?;
    Ok(parse_os_release(&content))
}

/// A repository source file that contains a known-bad entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BadRepoEntry {
    pub path: PathBuf,
    pub pattern: String,
    /// The main sources list is never edited automatically.
    pub protected: bool,
}

fn rule_applies(rule: &BadRepo, os: &OsRelease) -> bool {
    rule.codenames.is_empty()
        || os
            .codename
            .as_deref()
            .is_some_and(|codename| rule.codenames.iter().any(|c| c == codename))
}

fn file_matches(path: &Path, pattern: &str) -> bool {
    fs::read_to_string(path)
        .map(|content| {
            content.lines().any(|line| {
                let trimmed = line.trim_start();
                !trimmed.starts_with('#') && trimmed.contains(pattern)
            })
        })
        .unwrap_or(false)
}

pub fn find_bad_repo_entries(host: &Host, os: &OsRelease) -> Vec<BadRepoEntry> {
    let mut entries = Vec::new();
    let mut source_files: Vec<PathBuf> = fs::read_dir(&host.apt_sources_dir)
        .map(|dir| {
            dir.filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| {
                    path.extension()
                        .is_some_and(|ext| ext == "list" || ext == "sources")
                })
                .collect()
        })
        .unwrap_or_default();
    source_files.sort();

    for rule in host.bad_repos.iter().filter(|rule| rule_applies(rule, os)) {
        let main_list = Path::new(&host.apt_sources);
        if file_matches(main_list, &rule.pattern) {
            entries.push(BadRepoEntry {
                path: main_list.to_path_buf(),
                pattern: rule.pattern.clone(),
                protected: true,
            });
        }
        for path in &source_files {
            if file_matches(path, &rule.pattern) && !entries.iter().any(|e| &e.path == path) {
                entries.push(BadRepoEntry {
                    path: path.clone(),
                    pattern: rule.pattern.clone(),
                    protected: false,
                });
            }
        }
    }
    entries
}

/// The resolved engine and compose invocations. A binding cannot exist
/// without a working compose invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ToolchainBinding {
    pub engine: Invocation,
    pub compose: Invocation,
    pub installed: Vec<String>,
    pub removed_repos: Vec<PathBuf>,
}

pub struct ToolchainResolver<'a, R: CommandRunner> {
    runner: &'a R,
    host: &'a Host,
    privilege: Elevation,
    user: Option<String>,
    prepared: Cell<bool>,
}

impl<'a, R: CommandRunner> ToolchainResolver<'a, R> {
    /// `privilege` is what package installation needs (`sudo` unless root);
    /// `user` is the login that should join the engine's group.
    pub fn new(runner: &'a R, host: &'a Host, privilege: Elevation, user: Option<String>) -> Self {
        Self {
            runner,
            host,
            privilege,
            user,
            prepared: Cell::new(false),
        }
    }

    pub fn resolve(&self) -> Result<ToolchainBinding, HearthError> {
        let os = read_os_release(Path::new(&self.host.os_release))?;
        info!(id = %os.id, codename = os.codename.as_deref().unwrap_or("unknown"), "detected host");
        let mut installed = Vec::new();
        let mut removed_repos = Vec::new();

        if self.runner.locate(ENGINE).is_none() {
            info!("container engine not found; installing");
            removed_repos.extend(self.prepare_install(&os)?);
            for package in &self.host.engine_packages {
                self.apt(&["install", "-y", package.as_str()])?;
                installed.push(package.clone());
            }
            if self.runner.locate(ENGINE).is_none() {
                return Err(HearthError::fatal(
                    format!("`{ENGINE}` is still missing after installing {}", self.host.engine_packages.join(", ")),
                    "install the container engine manually and rerun hearth",
                ));
            }
            self.join_engine_group();
        }

        let engine_elevation = self.engine_elevation();
        let engine = Invocation::new(engine_elevation, &[ENGINE]);

        let compose = match self.probe_compose(&engine, engine_elevation) {
            Some(compose) => compose,
            None => {
                info!("no working compose invocation; installing");
                removed_repos.extend(self.prepare_install(&os)?);
                let mut found = None;
                for package in &self.host.compose_packages {
                    if let Err(err) = self.apt(&["install", "-y", package.as_str()]) {
                        warn!(%package, %err, "compose package install failed; trying next");
                        continue;
                    }
                    installed.push(package.clone());
                    found = self.probe_compose(&engine, engine_elevation);
                    if found.is_some() {
                        break;
                    }
                }
                found.ok_or_else(|| {
                    HearthError::fatal(
                        format!(
                            "no working compose invocation after trying packages: {}",
                            self.host.compose_packages.join(", ")
                        ),
                        "install Docker Compose (`docker compose` plugin or `docker-compose`) and rerun hearth",
                    )
                })?
            }
        };
        info!(engine = %engine, compose = %compose, "toolchain ready");

        Ok(ToolchainBinding {
            engine,
            compose,
            installed,
            removed_repos,
        })
    }

    fn engine_elevation(&self) -> Elevation {
        if probe(self.runner, &[ENGINE.to_string(), "info".to_string()]) {
            return Elevation::None;
        }
        if self.privilege == Elevation::Sudo {
            warn!(
                "`{ENGINE}` is not usable without elevation in this session (group membership needs a new login); using sudo"
            );
            return Elevation::Sudo;
        }
        warn!("`{ENGINE} info` failed; the engine daemon may not be running yet");
        Elevation::None
    }

    fn probe_compose(&self, engine: &Invocation, elevation: Elevation) -> Option<Invocation> {
        let builtin = Invocation::new(elevation, &[ENGINE, "compose"]);
        if probe(self.runner, &engine.with(&["compose", "version"])) {
            return Some(builtin);
        }
        if self.runner.locate(LEGACY_COMPOSE).is_some() {
            let legacy = Invocation::new(elevation, &[LEGACY_COMPOSE]);
            if probe(self.runner, &legacy.with(&["version"])) {
                return Some(legacy);
            }
        }
        None
    }

    /// Package-manager preconditions, bad-repo cleanup and an index refresh.
    /// Runs at most once per resolution.
    fn prepare_install(&self, os: &OsRelease) -> Result<Vec<PathBuf>, HearthError> {
        if self.prepared.get() {
            return Ok(Vec::new());
        }
        if self.runner.locate(PACKAGE_MANAGER).is_none() {
            return Err(HearthError::fatal(
                format!("supported package manager `{PACKAGE_MANAGER}` not found"),
                "hearth can only install the container toolchain on Debian-family hosts; install Docker and Compose manually",
            ));
        }
        if self.privilege == Elevation::Sudo && self.runner.locate("sudo").is_none() {
            return Err(HearthError::fatal(
                "installing packages requires root but `sudo` is not available",
                "rerun hearth as root or install sudo",
            ));
        }

        let entries = find_bad_repo_entries(self.host, os);
        if let Some(protected) = entries.iter().find(|entry| entry.protected) {
            warn!(path = %protected.path.display(), pattern = %protected.pattern, "incompatible repository entry in protected file");
            return Err(HearthError::fatal(
                format!(
                    "{} contains a repository entry matching `{}` that is incompatible with this release",
                    protected.path.display(),
                    protected.pattern
                ),
                format!(
                    "remove or comment out the `{}` line in {} manually, then rerun hearth",
                    protected.pattern,
                    protected.path.display()
                ),
            ));
        }
        let writer = FileWriter::new(self.runner, self.privilege);
        let mut removed = Vec::new();
        for entry in entries {
            writer.remove_file(&entry.path)?;
            warn!(path = %entry.path.display(), pattern = %entry.pattern, "removed incompatible repository source");
            removed.push(entry.path);
        }

        self.apt(&["update"])?;
        self.prepared.set(true);
        Ok(removed)
    }

    fn apt(&self, args: &[&str]) -> Result<(), HearthError> {
        let mut argv = vec![PACKAGE_MANAGER];
        argv.extend_from_slice(args);
        execute(self.runner, &self.privilege.wrap(&argv), None, None, true)?;
        Ok(())
    }

    fn join_engine_group(&self) {
        let Some(user) = self.user.as_deref().filter(|user| *user != "root") else {
            return;
        };
        let argv = self.privilege.wrap(&["usermod", "-aG", ENGINE, user]);
        match execute(self.runner, &argv, None, None, true) {
            Ok(_) => info!(%user, "added user to the `{ENGINE}` group; takes effect on next login"),
            Err(err) => warn!(%user, %err, "could not add user to the `{ENGINE}` group"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::MockRunner;
    use tempfile::{tempdir, TempDir};

    fn fake_host(codename: &str) -> (TempDir, Host) {
        let dir = tempdir().unwrap();
        let os_release = dir.path().join("os-release");
        fs::write(
            &os_release,
            format!("PRETTY_NAME=\"Debian GNU/Linux\"\nID=debian\nVERSION_CODENAME={codename}\n"),
        )
        .unwrap();
        let sources_dir = dir.path().join("sources.list.d");
        fs::create_dir_all(&sources_dir).unwrap();
        fs::write(dir.path().join("sources.list"), "deb http://deb.debian.org/debian main\n").unwrap();
        let host = Host {
            os_release: os_release.to_string_lossy().to_string(),
            apt_sources: dir.path().join("sources.list").to_string_lossy().to_string(),
            apt_sources_dir: sources_dir.to_string_lossy().to_string(),
            ..Host::default()
        };
        (dir, host)
    }

    #[test]
    fn os_release_parses_quoted_values() {
        let os = parse_os_release("ID=\"raspbian\"\nVERSION_CODENAME='bookworm'\n");
        assert_eq!(os.id, "raspbian");
        assert_eq!(os.codename.as_deref(), Some("bookworm"));
    }

    #[test]
    fn missing_os_release_is_fatal() {
        let (_dir, mut host) = fake_host("bookworm");
        host.os_release = "/nonexistent/os-release".to_string();
        let runner = MockRunner::default();
        let err = ToolchainResolver::new(&runner, &host, Elevation::Sudo, None)
            .resolve()
            .expect_err("fatal");
        assert!(matches!(err, HearthError::Fatal { .. }));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn ready_toolchain_needs_no_installation() {
        let (_dir, host) = fake_host("bookworm");
        let runner = MockRunner::with_programs(&["docker", "apt-get", "sudo"]);
        let binding = ToolchainResolver::new(&runner, &host, Elevation::Sudo, None)
            .resolve()
            .unwrap();
        assert_eq!(binding.engine.argv(), ["docker"]);
        assert_eq!(binding.compose.argv(), ["docker", "compose"]);
        assert!(binding.installed.is_empty());
        assert_eq!(runner.lines(), vec!["docker info", "docker compose version"]);
    }

    #[test]
    fn fresh_host_installs_engine_and_falls_back_to_sudo() {
        let (_dir, host) = fake_host("bookworm");
        let runner = MockRunner::with_programs(&["apt-get", "sudo"]).provides("docker.io", "docker");
        runner.fail_when("docker info");
        let binding = ToolchainResolver::new(&runner, &host, Elevation::Sudo, Some("pi".to_string()))
            .resolve()
            .unwrap();
        assert_eq!(binding.engine.argv(), ["sudo", "docker"]);
        assert_eq!(binding.compose.argv(), ["sudo", "docker", "compose"]);
        assert_eq!(binding.installed, vec!["docker.io".to_string()]);
        assert_eq!(
            runner.lines(),
            vec![
                "sudo apt-get update",
                "sudo apt-get install -y docker.io",
                "sudo usermod -aG docker pi",
                "docker info",
                "sudo docker compose version",
            ]
        );
    }

    #[test]
    fn missing_package_manager_is_fatal() {
        let (_dir, host) = fake_host("bookworm");
        let runner = MockRunner::with_programs(&["sudo"]);
        let err = ToolchainResolver::new(&runner, &host, Elevation::Sudo, None)
            .resolve()
            .expect_err("fatal");
        assert!(err.to_string().contains("apt-get"));
    }

    #[test]
    fn compose_falls_back_to_legacy_binary() {
        let (_dir, host) = fake_host("bookworm");
        let runner = MockRunner::with_programs(&["docker", "docker-compose"]);
        runner.fail_when("docker compose version");
        let binding = ToolchainResolver::new(&runner, &host, Elevation::None, None)
            .resolve()
            .unwrap();
        assert_eq!(binding.compose.argv(), ["docker-compose"]);
    }

    #[test]
    fn compose_packages_are_tried_in_order() {
        let (_dir, host) = fake_host("bookworm");
        let runner = MockRunner::with_programs(&["docker", "apt-get"])
            .provides("docker-compose", "docker-compose");
        runner.fail_when("docker compose version");
        runner.fail_when("install -y docker-compose-plugin");
        let binding = ToolchainResolver::new(&runner, &host, Elevation::None, None)
            .resolve()
            .unwrap();
        assert_eq!(binding.compose.argv(), ["docker-compose"]);
        assert_eq!(binding.installed, vec!["docker-compose".to_string()]);
        let lines = runner.lines();
        assert!(lines.contains(&"apt-get install -y docker-compose-plugin".to_string()));
        assert!(lines.contains(&"apt-get install -y docker-compose".to_string()));
    }

    #[test]
    fn no_compose_after_installs_is_fatal() {
        let (_dir, host) = fake_host("bookworm");
        let runner = MockRunner::with_programs(&["docker", "apt-get"]);
        runner.fail_when("compose");
        let err = ToolchainResolver::new(&runner, &host, Elevation::None, None)
            .resolve()
            .expect_err("fatal");
        assert!(matches!(err, HearthError::Fatal { .. }));
    }

    #[test]
    fn bad_repo_file_is_removed_before_install() {
        let (dir, host) = fake_host("trixie");
        let bad = dir.path().join("sources.list.d").join("docker.list");
        fs::write(&bad, "deb [arch=arm64] https://download.docker.com/linux/debian trixie stable\n").unwrap();
        let unrelated = dir.path().join("sources.list.d").join("other.list");
        fs::write(&unrelated, "deb http://example.org/repo stable main\n").unwrap();
        let runner = MockRunner::with_programs(&["apt-get"]).provides("docker.io", "docker");
        let binding = ToolchainResolver::new(&runner, &host, Elevation::None, None)
            .resolve()
            .unwrap();
        assert!(!bad.exists());
        assert!(unrelated.exists());
        assert_eq!(binding.removed_repos, vec![bad]);
    }

    #[test]
    fn bad_repo_rule_ignores_other_releases() {
        let (dir, host) = fake_host("bookworm");
        let listed = dir.path().join("sources.list.d").join("docker.list");
        fs::write(&listed, "deb https://download.docker.com/linux/debian bookworm stable\n").unwrap();
        let os = read_os_release(Path::new(&host.os_release)).unwrap();
        assert!(find_bad_repo_entries(&host, &os).is_empty());
    }

    #[test]
    fn bad_repo_in_protected_list_is_fatal() {
        let (dir, host) = fake_host("trixie");
        fs::write(
            dir.path().join("sources.list"),
            "deb http://deb.debian.org/debian trixie main\ndeb https://download.docker.com/linux/debian trixie stable\n",
        )
        .unwrap();
        let runner = MockRunner::with_programs(&["apt-get"]);
        let err = ToolchainResolver::new(&runner, &host, Elevation::None, None)
            .resolve()
            .expect_err("fatal");
        assert!(err.to_string().contains("manually"));
        assert!(!runner.lines().iter().any(|line| line.contains("install")));
    }

    #[test]
    fn commented_repo_lines_are_ignored() {
        let (dir, host) = fake_host("trixie");
        fs::write(
            dir.path().join("sources.list"),
            "# deb https://download.docker.com/linux/debian trixie stable\n",
        )
        .unwrap();
        let os = read_os_release(Path::new(&host.os_release)).unwrap();
        assert!(find_bad_repo_entries(&host, &os).is_empty());
    }
}
