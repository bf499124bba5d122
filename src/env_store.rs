use crate::error::HearthError;
use crate::runner::{CommandRunner, FileWriter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Mode for a newly created env file; it carries the store credentials.
const ENV_FILE_MODE: u32 = 0o600;

/// A `KEY=value` file edited one line at a time. Lines that are not
/// assignments (comments, blanks) and the order of all keys are kept verbatim.
#[derive(Debug, Clone)]
pub struct EnvStore {
    path: PathBuf,
    lines: Vec<String>,
}

fn split_assignment(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let (key, value) = trimmed.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value))
}

impl EnvStore {
    /// Loads the store. A missing or unreadable file is an empty store.
    pub fn load(path: &Path) -> Self {
        let lines = match fs::read_to_string(path) {
            Ok(content) => content.lines().map(str::to_string).collect(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                warn!(path = %path.display(), %err, "env file unreadable; treating every key as absent");
                Vec::new()
            }
        };
        Self {
            path: path.to_path_buf(),
            lines,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .filter_map(|line| split_assignment(line))
            .find(|(candidate, _)| *candidate == key)
            .map(|(_, value)| value)
    }

    fn render(&self) -> String {
        let mut content = self.lines.join("\n");
        content.push('\n');
        content
    }

    /// Sets `key`, replacing its line in place or appending a new one, and
    /// persists the file. Returns whether anything was written.
    pub fn set<R: CommandRunner>(
        &mut self,
        key: &str,
        value: &str,
        writer: &FileWriter<'_, R>,
    ) -> Result<bool, HearthError> {
        if self.get(key) == Some(value) {
            return Ok(false);
        }
        let assignment = format!("{key}={value}");
        let existing = self
            .lines
            .iter()
            .position(|line| split_assignment(line).is_some_and(|(candidate, _)| candidate == key));
        match existing {
            Some(idx) => self.lines[idx] = assignment,
            None => self.lines.push(assignment),
        }
        // Duplicate definitions of the key would shadow the rewritten line.
        let mut seen = false;
        self.lines.retain(|line| match split_assignment(line) {
            Some((candidate, _)) if candidate == key => !std::mem::replace(&mut seen, true),
            _ => true,
        });
        debug!(path = %self.path.display(), key, "writing env key");
        let mode = (!self.path.exists()).then_some(ENV_FILE_MODE);
        writer.write(&self.path, self.render().as_bytes(), mode)?;
        Ok(true)
    }

    /// Sets `key` only when it is absent or empty.
    pub fn set_default<R: CommandRunner>(
        &mut self,
        key: &str,
        value: &str,
        writer: &FileWriter<'_, R>,
    ) -> Result<bool, HearthError> {
        match self.get(key) {
            Some(existing) if !existing.is_empty() => Ok(false),
            _ => self.set(key, value, writer),
        }
    }
}
