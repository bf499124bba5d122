//! Process seam: every external program (package manager, container engine,
//! compose, sudo) is reached through [`CommandRunner`] so the reconciliation
//! phases can be driven by a recording mock in tests.

use crate::error::{HearthError, ProcessErrorDetails};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

pub trait CommandRunner {
    fn run(
        &self,
        argv: &[String],
        cwd: Option<&Path>,
        stdin: Option<&[u8]>,
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error>;

    fn locate(&self, program: &str) -> Option<PathBuf>;
}

pub struct SystemRunner;

fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(if status.success() { 0 } else { 1 })
}

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        argv: &[String],
        cwd: Option<&Path>,
        stdin: Option<&[u8]>,
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error> {
        let Some((program, args)) = argv.split_first() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty command line",
            ));
        };
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        if capture_output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }
        let mut child = cmd.spawn()?;
        // Fed from a thread so a child echoing stdin (tee) cannot fill its
        // stdout pipe while we are still writing.
        let feeder = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => {
                let input = input.to_vec();
                Some(thread::spawn(move || pipe.write_all(&input)))
            }
            _ => None,
        };
        let output = child.wait_with_output()?;
        if let Some(feeder) = feeder {
            feeder
                .join()
                .map_err(|_| io::Error::other("stdin writer panicked"))??;
        }
        Ok(CommandOutput {
            status_code: exit_code(output.status),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

/// Whether privileged operations need a `sudo` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Elevation {
    None,
    Sudo,
}

impl Elevation {
    pub fn for_uid(uid: u32) -> Self {
        if uid == 0 {
            Elevation::None
        } else {
            Elevation::Sudo
        }
    }

    pub fn prefix(self) -> Vec<String> {
        match self {
            Elevation::None => Vec::new(),
            Elevation::Sudo => vec!["sudo".to_string()],
        }
    }

    pub fn wrap(self, args: &[&str]) -> Vec<String> {
        let mut argv = self.prefix();
        argv.extend(args.iter().map(|arg| arg.to_string()));
        argv
    }
}

/// An argv prefix such as `sudo docker` or `docker compose`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Invocation(Vec<String>);

impl Invocation {
    pub fn new(elevation: Elevation, program: &[&str]) -> Self {
        Invocation(elevation.wrap(program))
    }

    #[cfg(test)]
    pub fn argv(&self) -> &[String] {
        &self.0
    }

    pub fn with<S: AsRef<str>>(&self, args: &[S]) -> Vec<String> {
        let mut argv = self.0.clone();
        argv.extend(args.iter().map(|arg| arg.as_ref().to_string()));
        argv
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render_command(&self.0))
    }
}

pub fn render_command(argv: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    argv.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn spawn_error_details(err: &io::Error, command: &str, program: &str) -> ProcessErrorDetails {
    if err.kind() == io::ErrorKind::NotFound {
        return ProcessErrorDetails {
            error_code: "program_not_found".to_string(),
            hint: Some(format!("Install `{program}` and ensure it is on your PATH.")),
            command: Some(command.to_string()),
            raw_stderr: None,
        };
    }
    ProcessErrorDetails {
        error_code: "process_command_failed".to_string(),
        hint: None,
        command: Some(command.to_string()),
        raw_stderr: None,
    }
}

fn classify_command_failure(stderr: &str) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();

    if lower.contains("is not a docker command") || lower.contains("unknown command: docker compose")
    {
        return (
            "compose_unavailable".to_string(),
            Some("Docker Compose is unavailable. Rerun `hearth bootstrap` to install it.".to_string()),
        );
    }

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("permission denied while trying to connect")
    {
        return (
            "docker_daemon_unreachable".to_string(),
            Some(
                "Docker daemon is unreachable. Start it with `sudo systemctl start docker`, or log out and back in to activate docker group membership."
                    .to_string(),
            ),
        );
    }

    if lower.contains("a password is required") || lower.contains("no tty present") {
        return (
            "sudo_password_required".to_string(),
            Some("Run hearth from an interactive shell so sudo can prompt, or as root.".to_string()),
        );
    }

    if lower.contains("could not get lock") || lower.contains("unable to acquire the dpkg") {
        return (
            "package_manager_locked".to_string(),
            Some("Another package manager process is running. Wait for it to finish and retry.".to_string()),
        );
    }

    if lower.contains("unable to locate package") || lower.contains("has no installation candidate") {
        return (
            "package_unavailable".to_string(),
            Some("The package is not available from the configured repositories.".to_string()),
        );
    }

    if lower.contains("port is already allocated") || lower.contains("address already in use") {
        return (
            "docker_port_conflict".to_string(),
            Some("A required host port is already in use. Free it and retry.".to_string()),
        );
    }

    ("process_command_failed".to_string(), None)
}

/// Runs `argv` and turns a spawn failure or nonzero exit into a detailed error.
pub fn execute<R: CommandRunner>(
    runner: &R,
    argv: &[String],
    cwd: Option<&Path>,
    stdin: Option<&[u8]>,
    capture_output: bool,
) -> Result<CommandOutput, HearthError> {
    let command = render_command(argv);
    debug!(%command, "running");
    let program = argv.first().map(String::as_str).unwrap_or_default();
    let cmd_output = runner
        .run(argv, cwd, stdin, capture_output)
        .map_err(|err| HearthError::ProcessDetailed {
            message: format!("failed to run command `{command}`: {err}"),
            details: spawn_error_details(&err, &command, program),
        })?;
    if !cmd_output.success() {
        let stderr = String::from_utf8_lossy(&cmd_output.stderr)
            .trim()
            .to_string();
        let (error_code, hint) = classify_command_failure(&stderr);
        let mut message = format!(
            "command failed with status {} while running `{}`",
            cmd_output.status_code, command
        );
        if !stderr.is_empty() {
            message = format!("{message}: {stderr}");
        }
        if let Some(ref hint_message) = hint {
            message = format!("{message}\nHint: {hint_message}");
        }
        return Err(HearthError::ProcessDetailed {
            message,
            details: ProcessErrorDetails {
                error_code,
                hint,
                command: Some(command),
                raw_stderr: if stderr.is_empty() {
                    None
                } else {
                    Some(stderr)
                },
            },
        });
    }
    Ok(cmd_output)
}

/// True when `argv` can be spawned and exits 0. Output is swallowed.
pub fn probe<R: CommandRunner>(runner: &R, argv: &[String]) -> bool {
    match runner.run(argv, None, None, true) {
        Ok(output) => output.success(),
        Err(err) => {
            debug!(command = %render_command(argv), %err, "probe could not spawn");
            false
        }
    }
}

pub fn current_uid() -> u32 {
    #[cfg(unix)]
    {
        let output = Command::new("id").arg("-u").output();
        if let Ok(output) = output {
            if output.status.success() {
                let text = String::from_utf8_lossy(&output.stdout);
                if let Ok(value) = text.trim().parse::<u32>() {
                    return value;
                }
            }
        }
    }
    0
}

fn write_atomic(path: &Path, content: &[u8], mode: Option<u32>) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "hearth".to_string()),
        pid,
        ts
    ));

    fs::write(&tmp_path, content)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        if let Err(err) = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
    }
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

#[cfg(unix)]
fn existing_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).ok().map(|m| m.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn existing_mode(_path: &Path) -> Option<u32> {
    None
}

/// Filesystem mutations that fall back to an elevated helper for the single
/// operation when the unprivileged attempt is refused.
pub struct FileWriter<'a, R: CommandRunner> {
    runner: &'a R,
    elevation: Elevation,
}

impl<'a, R: CommandRunner> FileWriter<'a, R> {
    pub fn new(runner: &'a R, elevation: Elevation) -> Self {
        Self { runner, elevation }
    }

    fn elevated(&self, io_err: io::Error) -> Result<Elevation, HearthError> {
        if io_err.kind() == io::ErrorKind::PermissionDenied && self.elevation == Elevation::Sudo {
            Ok(self.elevation)
        } else {
            Err(io_err.into())
        }
    }

    /// Writes `content` to `path`. An existing file keeps its permission bits
    /// unless `mode` is given.
    pub fn write(&self, path: &Path, content: &[u8], mode: Option<u32>) -> Result<(), HearthError> {
        let mode = mode.or_else(|| existing_mode(path));
        let Err(err) = write_atomic(path, content, mode) else {
            return Ok(());
        };
        let elevation = self.elevated(err)?;
        let target = path.to_string_lossy().to_string();
        debug!(path = %target, "retrying write with elevation");
        execute(
            self.runner,
            &elevation.wrap(&["tee", target.as_str()]),
            None,
            Some(content),
            true,
        )?;
        if let Some(mode) = mode {
            let mode = format!("{mode:o}");
            execute(self.runner, &elevation.wrap(&["chmod", mode.as_str(), target.as_str()]), None, None, true)?;
        }
        Ok(())
    }

    pub fn create_dir_all(&self, path: &Path) -> Result<(), HearthError> {
        let Err(err) = fs::create_dir_all(path) else {
            return Ok(());
        };
        let elevation = self.elevated(err)?;
        let target = path.to_string_lossy().to_string();
        execute(self.runner, &elevation.wrap(&["mkdir", "-p", target.as_str()]), None, None, true)?;
        Ok(())
    }

    pub fn remove_file(&self, path: &Path) -> Result<(), HearthError> {
        let Err(err) = fs::remove_file(path) else {
            return Ok(());
        };
        if err.kind() == io::ErrorKind::NotFound {
            return Ok(());
        }
        let elevation = self.elevated(err)?;
        let target = path.to_string_lossy().to_string();
        execute(self.runner, &elevation.wrap(&["rm", "-f", target.as_str()]), None, None, true)?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockRunner;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn render_command_quotes_whitespace() {
        let argv = vec!["sh".to_string(), "-c".to_string(), "echo hi".to_string()];
        assert_eq!(render_command(&argv), "sh -c \"echo hi\"");
    }

    #[test]
    fn elevation_follows_uid() {
        assert_eq!(Elevation::for_uid(0), Elevation::None);
        assert_eq!(Elevation::for_uid(1000).wrap(&["docker"]), vec!["sudo", "docker"]);
    }

    #[test]
    fn execute_reports_classified_failure() {
        let runner = MockRunner::default();
        runner.fail_when("apt-get");
        let err = execute(&runner, &["apt-get".to_string(), "update".to_string()], None, None, true)
            .expect_err("mock failure");
        let details = err.details().expect("details");
        assert_eq!(details.error_code, "process_command_failed");
        assert_eq!(details.command.as_deref(), Some("apt-get update"));
    }

    #[test]
    fn classify_detects_daemon_permission_problem() {
        let (code, hint) = classify_command_failure(
            "permission denied while trying to connect to the Docker daemon socket",
        );
        assert_eq!(code, "docker_daemon_unreachable");
        assert!(hint.unwrap().contains("docker group"));
    }

    #[test]
    fn writer_writes_without_elevation_when_allowed() {
        let dir = tempdir().unwrap();
        let runner = MockRunner::default();
        let writer = FileWriter::new(&runner, Elevation::Sudo);
        let path = dir.path().join("a.txt");
        writer.write(&path, b"hello\n", None).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello\n");
        assert!(runner.calls().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn writer_preserves_existing_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let runner = MockRunner::default();
        let writer = FileWriter::new(&runner, Elevation::None);
        let path = dir.path().join("secret");
        fs::write(&path, "a").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        writer.write(&path, b"b", None).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn remove_missing_file_is_noop() {
        let dir = tempdir().unwrap();
        let runner = MockRunner::default();
        let writer = FileWriter::new(&runner, Elevation::Sudo);
        writer.remove_file(&dir.path().join("absent.list")).unwrap();
        assert!(runner.calls().is_empty());
    }
}
