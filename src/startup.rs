use crate::config::Config;
use crate::error::HearthError;
use crate::runner::{execute, CommandRunner};
use crate::stack::StackPaths;
use crate::toolchain::ToolchainBinding;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupPhase {
    NotStarted,
    StoreReady,
    AllUp,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaffoldOutcome {
    AlreadyInitialized,
    Ran,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    pub phase: StartupPhase,
    pub scaffold: ScaffoldOutcome,
    pub restarted: bool,
    pub warnings: Vec<String>,
}

/// Brings the stack up so that nothing sees the store mid-initialization:
/// the store is recreated alone first (so its wrapper entrypoint takes
/// effect), then everything else starts, then one-time web scaffolding runs
/// and the automation engine restarts to load appended configuration.
pub struct StartupSequencer<'a, R: CommandRunner> {
    runner: &'a R,
    binding: &'a ToolchainBinding,
    paths: &'a StackPaths,
    cfg: &'a Config,
}

impl<'a, R: CommandRunner> StartupSequencer<'a, R> {
    pub fn new(
        runner: &'a R,
        binding: &'a ToolchainBinding,
        paths: &'a StackPaths,
        cfg: &'a Config,
    ) -> Self {
        Self {
            runner,
            binding,
            paths,
            cfg,
        }
    }

    fn compose_args(&self, verb: &[&str]) -> Vec<String> {
        let env_file = self.paths.env_file.to_string_lossy().to_string();
        let compose_file = self.paths.compose_file.to_string_lossy().to_string();
        let mut argv = self.binding.compose.with(&[
            "--env-file",
            env_file.as_str(),
            "-p",
            self.cfg.project.name.as_str(),
            "-f",
            compose_file.as_str(),
        ]);
        argv.extend(verb.iter().map(|arg| arg.to_string()));
        argv
    }

    fn compose(&self, verb: &[&str]) -> Result<(), HearthError> {
        let argv = self.compose_args(verb);
        execute(self.runner, &argv, Some(&self.paths.root), None, true)?;
        Ok(())
    }

    pub fn run(&self) -> Result<StartupReport, HearthError> {
        let services = &self.cfg.services;
        let mut report = StartupReport {
            phase: StartupPhase::NotStarted,
            scaffold: ScaffoldOutcome::AlreadyInitialized,
            restarted: false,
            warnings: Vec::new(),
        };

        info!(service = %services.store, "recreating store service");
        self.compose(&[
            "up",
            "-d",
            "--remove-orphans",
            "--force-recreate",
            services.store.as_str(),
        ])?;
        report.phase = StartupPhase::StoreReady;

        info!("starting remaining services");
        self.compose(&["up", "-d", "--remove-orphans"])?;
        report.phase = StartupPhase::AllUp;

        report.scaffold = self.scaffold_web(&mut report.warnings);

        info!(service = %services.automation, "restarting to load configuration");
        match self.compose(&["restart", services.automation.as_str()]) {
            Ok(()) => report.restarted = true,
            Err(err) => {
                let warning = format!(
                    "restart of {} failed; appended configuration loads on its next restart: {err}",
                    services.automation
                );
                warn!("{warning}");
                report.warnings.push(warning);
            }
        }
        report.phase = StartupPhase::Ready;
        Ok(report)
    }

    fn scaffold_web(&self, warnings: &mut Vec<String>) -> ScaffoldOutcome {
        if self.paths.web_marker.exists() {
            info!(marker = %self.paths.web_marker.display(), "web application already scaffolded");
            return ScaffoldOutcome::AlreadyInitialized;
        }
        info!(service = %self.cfg.services.web, "scaffolding web application");
        let result = self.compose(&[
            "exec",
            "-T",
            self.cfg.services.web.as_str(),
            "sh",
            "-c",
            self.cfg.web.scaffold_command.as_str(),
        ]);
        match result {
            Ok(()) => ScaffoldOutcome::Ran,
            Err(err) => {
                let warning = format!("web scaffolding failed; rerun hearth to retry: {err}");
                warn!("{warning}");
                warnings.push(warning);
                ScaffoldOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::MockRunner;
    use crate::runner::{Elevation, Invocation};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn binding() -> ToolchainBinding {
        ToolchainBinding {
            engine: Invocation::new(Elevation::None, &["docker"]),
            compose: Invocation::new(Elevation::None, &["docker", "compose"]),
            installed: Vec::new(),
            removed_repos: Vec::<PathBuf>::new(),
        }
    }

    fn verbs(runner: &MockRunner) -> Vec<String> {
        runner
            .calls()
            .iter()
            .map(|call| call.argv[8..].join(" "))
            .collect()
    }

    #[test]
    fn store_is_recreated_alone_before_everything_else() {
        let root = tempdir().unwrap();
        let cfg = Config::default();
        let paths = StackPaths::new(root.path(), &cfg);
        let runner = MockRunner::default();
        let binding = binding();
        let report = StartupSequencer::new(&runner, &binding, &paths, &cfg)
            .run()
            .unwrap();

        assert_eq!(report.phase, StartupPhase::Ready);
        assert_eq!(report.scaffold, ScaffoldOutcome::Ran);
        assert!(report.restarted);
        let first = &runner.calls()[0].argv;
        assert_eq!(&first[..8], &[
            "docker".to_string(),
            "compose".to_string(),
            "--env-file".to_string(),
            root.path().join(".env").to_string_lossy().to_string(),
            "-p".to_string(),
            "hearth".to_string(),
            "-f".to_string(),
            root.path().join("docker-compose.yml").to_string_lossy().to_string(),
        ]);
        assert_eq!(
            verbs(&runner),
            vec![
                "up -d --remove-orphans --force-recreate influxdb".to_string(),
                "up -d --remove-orphans".to_string(),
                format!("exec -T web sh -c {}", cfg.web.scaffold_command),
                "restart homeassistant".to_string(),
            ]
        );
    }

    #[test]
    fn scaffold_is_skipped_once_marker_exists() {
        let root = tempdir().unwrap();
        let cfg = Config::default();
        let paths = StackPaths::new(root.path(), &cfg);
        fs::create_dir_all(paths.web_marker.parent().unwrap()).unwrap();
        fs::write(&paths.web_marker, "{}").unwrap();
        let runner = MockRunner::default();
        let binding = binding();
        let report = StartupSequencer::new(&runner, &binding, &paths, &cfg)
            .run()
            .unwrap();
        assert_eq!(report.scaffold, ScaffoldOutcome::AlreadyInitialized);
        assert!(!verbs(&runner).iter().any(|verb| verb.starts_with("exec")));
    }

    #[test]
    fn store_failure_is_fatal_and_stops_the_sequence() {
        let root = tempdir().unwrap();
        let cfg = Config::default();
        let paths = StackPaths::new(root.path(), &cfg);
        let runner = MockRunner::default();
        runner.fail_when("--force-recreate");
        let binding = binding();
        StartupSequencer::new(&runner, &binding, &paths, &cfg)
            .run()
            .expect_err("store failure");
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn scaffold_and_restart_failures_are_warnings() {
        let root = tempdir().unwrap();
        let cfg = Config::default();
        let paths = StackPaths::new(root.path(), &cfg);
        let runner = MockRunner::default();
        runner.fail_when("exec -T web");
        runner.fail_when("restart homeassistant");
        let binding = binding();
        let report = StartupSequencer::new(&runner, &binding, &paths, &cfg)
            .run()
            .unwrap();
        assert_eq!(report.phase, StartupPhase::Ready);
        assert_eq!(report.scaffold, ScaffoldOutcome::Failed);
        assert!(!report.restarted);
        assert_eq!(report.warnings.len(), 2);
    }
}
