use crate::config::OwnedDir;
use crate::error::HearthError;
use crate::runner::{execute, CommandRunner, Elevation, FileWriter};
use crate::yaml_lines::{append_fragment, has_top_level_block};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactKind {
    Directory,
    /// `default` is `None` for artifacts that only exist as a shipped companion.
    File {
        default: Option<String>,
        mode: Option<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceRule {
    /// Write only when the path is missing. An empty file counts as present.
    SkipIfExists,
    /// Append the artifact content unless a top-level `block:` key is present.
    SkipIfBlockPresent { block: String },
    /// Create whenever missing, including after an operator deleted it.
    OverwriteIfAbsent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigArtifact {
    /// Relative to the stack root.
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub rule: PresenceRule,
    /// File name in the bundle directory that overrides the generated default.
    pub companion: Option<String>,
}

impl ConfigArtifact {
    pub fn dir(path: &str) -> Self {
        Self {
            path: PathBuf::from(path),
            kind: ArtifactKind::Directory,
            rule: PresenceRule::OverwriteIfAbsent,
            companion: None,
        }
    }

    pub fn file(path: &str, default: impl Into<String>) -> Self {
        Self {
            path: PathBuf::from(path),
            kind: ArtifactKind::File {
                default: Some(default.into()),
                mode: None,
            },
            rule: PresenceRule::SkipIfExists,
            companion: None,
        }
    }

    /// A file that must be shipped in the bundle directory.
    pub fn required_companion(path: &str, companion: &str) -> Self {
        Self {
            path: PathBuf::from(path),
            kind: ArtifactKind::File {
                default: None,
                mode: None,
            },
            rule: PresenceRule::SkipIfExists,
            companion: Some(companion.to_string()),
        }
    }

    pub fn block(path: &str, block: &str, fragment: impl Into<String>) -> Self {
        Self {
            path: PathBuf::from(path),
            kind: ArtifactKind::File {
                default: Some(fragment.into()),
                mode: None,
            },
            rule: PresenceRule::SkipIfBlockPresent {
                block: block.to_string(),
            },
            companion: None,
        }
    }

    pub fn with_companion(mut self, companion: &str) -> Self {
        self.companion = Some(companion.to_string());
        self
    }

    pub fn with_mode(mut self, new_mode: u32) -> Self {
        if let ArtifactKind::File { mode, .. } = &mut self.kind {
            *mode = Some(new_mode);
        }
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub created: Vec<PathBuf>,
    pub copied: Vec<PathBuf>,
    pub appended: Vec<PathBuf>,
    pub unchanged: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        !self.created.is_empty() || !self.copied.is_empty() || !self.appended.is_empty()
    }
}

pub struct FilesystemReconciler<'a, R: CommandRunner> {
    root: &'a Path,
    bundle_dir: &'a Path,
    runner: &'a R,
    privilege: Elevation,
}

fn path_collision(path: &Path, expected: &str) -> HearthError {
    HearthError::fatal(
        format!("{} exists but is not a {expected}", path.display()),
        format!(
            "move {} out of the way (hearth will not delete it) and rerun",
            path.display()
        ),
    )
}

impl<'a, R: CommandRunner> FilesystemReconciler<'a, R> {
    pub fn new(root: &'a Path, bundle_dir: &'a Path, runner: &'a R, privilege: Elevation) -> Self {
        Self {
            root,
            bundle_dir,
            runner,
            privilege,
        }
    }

    pub fn reconcile(
        &self,
        artifacts: &[ConfigArtifact],
        owned_dirs: &[OwnedDir],
    ) -> Result<ReconcileReport, HearthError> {
        let writer = FileWriter::new(self.runner, self.privilege);
        let mut report = ReconcileReport::default();
        for artifact in artifacts {
            self.apply(artifact, &writer, &mut report)?;
        }
        for owned in owned_dirs {
            if let Err(warning) = self.fix_ownership(owned) {
                warn!("{warning}");
                report.warnings.push(warning);
            }
        }
        Ok(report)
    }

    /// Fails on any path component that exists as something other than a directory.
    fn check_ancestors(&self, relative: &Path) -> Result<(), HearthError> {
        let mut current = self.root.to_path_buf();
        let Some(parent) = relative.parent() else {
            return Ok(());
        };
        for component in parent.components() {
            current.push(component);
            match fs::metadata(&current) {
                Ok(meta) if !meta.is_dir() => return Err(path_collision(&current, "directory")),
                _ => {}
            }
        }
        Ok(())
    }

    fn apply(
        &self,
        artifact: &ConfigArtifact,
        writer: &FileWriter<'_, R>,
        report: &mut ReconcileReport,
    ) -> Result<(), HearthError> {
        self.check_ancestors(&artifact.path)?;
        let path = self.root.join(&artifact.path);
        let existing = match fs::metadata(&path) {
            Ok(meta) => Some(meta),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        let (default, mode) = match &artifact.kind {
            ArtifactKind::Directory => {
                match existing {
                    Some(meta) if meta.is_dir() => report.unchanged.push(artifact.path.clone()),
                    Some(_) => return Err(path_collision(&path, "directory")),
                    None => {
                        writer.create_dir_all(&path)?;
                        info!(path = %path.display(), "created directory");
                        report.created.push(artifact.path.clone());
                    }
                }
                return Ok(());
            }
            ArtifactKind::File { default, mode } => (default.as_deref(), *mode),
        };
        if existing.as_ref().is_some_and(|meta| meta.is_dir()) {
            return Err(path_collision(&path, "file"));
        }
        if let Some(parent) = path.parent() {
            writer.create_dir_all(parent)?;
        }

        match &artifact.rule {
            PresenceRule::SkipIfBlockPresent { block } => {
                let fragment = default.unwrap_or_default();
                let content = match existing {
                    Some(_) => fs::read_to_string(&path)?,
                    None => String::new(),
                };
                if has_top_level_block(&content, block) {
                    debug!(path = %path.display(), %block, "block present");
                    report.unchanged.push(artifact.path.clone());
                    return Ok(());
                }
                let updated = append_fragment(&content, fragment);
                writer.write(&path, updated.as_bytes(), mode)?;
                info!(path = %path.display(), %block, "appended block");
                report.appended.push(artifact.path.clone());
            }
            PresenceRule::SkipIfExists | PresenceRule::OverwriteIfAbsent => {
                if existing.is_some() {
                    report.unchanged.push(artifact.path.clone());
                    return Ok(());
                }
                let companion = artifact
                    .companion
                    .as_deref()
                    .map(|name| self.bundle_dir.join(name))
                    .filter(|candidate| candidate.is_file());
                if let Some(companion) = companion {
                    let bytes = fs::read(&companion)?;
                    writer.write(&path, &bytes, mode)?;
                    info!(path = %path.display(), from = %companion.display(), "copied companion file");
                    report.copied.push(artifact.path.clone());
                    return Ok(());
                }
                let Some(default) = default else {
                    let expected = artifact
                        .companion
                        .as_deref()
                        .map(|name| self.bundle_dir.join(name))
                        .unwrap_or_else(|| path.clone());
                    return Err(HearthError::fatal(
                        format!("missing required file {}", expected.display()),
                        format!(
                            "place {} next to hearth (or in --bundle-dir) and rerun",
                            expected.display()
                        ),
                    ));
                };
                writer.write(&path, default.as_bytes(), mode)?;
                info!(path = %path.display(), "created default file");
                report.created.push(artifact.path.clone());
            }
        }
        Ok(())
    }

    /// Best-effort recursive re-own and rwx grant; failures are returned as
    /// warnings, never as errors.
    fn fix_ownership(&self, owned: &OwnedDir) -> Result<(), String> {
        let path = self.root.join(&owned.path);
        if !path.is_dir() {
            return Err(format!(
                "skipping ownership fix for {}: not a directory",
                path.display()
            ));
        }
        let target = path.to_string_lossy().to_string();
        let owner = format!("{}:{}", owned.uid, owned.gid);
        for argv in [
            self.privilege.wrap(&["chown", "-R", owner.as_str(), target.as_str()]),
            self.privilege.wrap(&["chmod", "-R", "ug+rwx", target.as_str()]),
        ] {
            execute(self.runner, &argv, None, None, true).map_err(|err| {
                format!(
                    "could not set ownership {owner} on {}; containers may still work if the directory is already accessible: {err}",
                    path.display()
                )
            })?;
        }
        debug!(path = %path.display(), %owner, "ownership fixed");
        Ok(())
    }
}
