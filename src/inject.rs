use crate::error::HearthError;
use crate::runner::{CommandRunner, FileWriter};
use crate::yaml_lines::{append_fragment, double_quoted, has_top_level_block, parse_scalar_line};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, info};

pub const INTEGRATION_BLOCK: &str = "influxdb";
pub const TOKEN_SECRET: &str = "influxdb_token";
pub const ORG_SECRET: &str = "influxdb_org";
pub const BUCKET_SECRET: &str = "influxdb_bucket";

const SECRETS_MODE: u32 = 0o600;

/// Live values for the three secret names the integration block references.
#[derive(Debug, Clone)]
pub struct IntegrationSecrets {
    pub token: String,
    pub org: String,
    pub bucket: String,
}

impl IntegrationSecrets {
    fn entries(&self) -> [(&'static str, &str); 3] {
        [
            (TOKEN_SECRET, self.token.as_str()),
            (ORG_SECRET, self.org.as_str()),
            (BUCKET_SECRET, self.bucket.as_str()),
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrationReport {
    pub block_appended: bool,
    pub secrets_added: Vec<String>,
    pub placeholders_replaced: Vec<String>,
}

impl IntegrationReport {
    pub fn changed(&self) -> bool {
        self.block_appended || !self.secrets_added.is_empty() || !self.placeholders_replaced.is_empty()
    }
}

pub fn integration_block(store_host: &str) -> String {
    format!(
        "{INTEGRATION_BLOCK}:
  api_version: 2
  ssl: false
  host: {store_host}
  port: 8086
  token: !secret {TOKEN_SECRET}
  organization: !secret {ORG_SECRET}
  bucket: !secret {BUCKET_SECRET}
  max_retries: 3
"
    )
}

fn read_optional(path: &Path) -> Result<Option<String>, HearthError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Appends the store integration block to `target` when absent and makes
/// sure `secrets_file` defines every name the block references. The only
/// existing secret lines that get rewritten are ones holding `sentinel`.
pub fn ensure_integration<R: CommandRunner>(
    target: &Path,
    secrets_file: &Path,
    store_host: &str,
    secrets: &IntegrationSecrets,
    sentinel: &str,
    writer: &FileWriter<'_, R>,
) -> Result<IntegrationReport, HearthError> {
    let mut report = IntegrationReport::default();

    let config = read_optional(target)?.unwrap_or_default();
    if has_top_level_block(&config, INTEGRATION_BLOCK) {
        debug!(path = %target.display(), "integration block already present");
    } else {
        let updated = append_fragment(&config, &integration_block(store_host));
        writer.write(target, updated.as_bytes(), None)?;
        info!(path = %target.display(), block = INTEGRATION_BLOCK, "appended integration block");
        report.block_appended = true;
    }

    let existing = read_optional(secrets_file)?;
    let mut lines: Vec<String> = existing
        .as_deref()
        .map(|content| content.lines().map(str::to_string).collect())
        .unwrap_or_default();
    for (name, value) in secrets.entries() {
        let rendered = format!("{name}: {}", double_quoted(value));
        let mut found = false;
        for line in lines.iter_mut() {
            let Some((key, current)) = parse_scalar_line(line.as_str()) else {
                continue;
            };
            if key != name {
                continue;
            }
            found = true;
            if current == sentinel && value != sentinel {
                *line = rendered.clone();
                report.placeholders_replaced.push(name.to_string());
            }
        }
        if !found {
            lines.push(rendered);
            report.secrets_added.push(name.to_string());
        }
    }
    if !report.secrets_added.is_empty() || !report.placeholders_replaced.is_empty() {
        let mut content = lines.join("\n");
        content.push('\n');
        let mode = existing.is_none().then_some(SECRETS_MODE);
        writer.write(secrets_file, content.as_bytes(), mode)?;
        info!(
            path = %secrets_file.display(),
            added = report.secrets_added.len(),
            replaced = report.placeholders_replaced.len(),
            "updated integration secrets"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::MockRunner;
    use crate::runner::Elevation;
    use tempfile::tempdir;

    const SENTINEL: &str = "changeme-token";

    fn secrets() -> IntegrationSecrets {
        IntegrationSecrets {
            token: "a".repeat(64),
            org: "home".to_string(),
            bucket: "home_assistant".to_string(),
        }
    }

    #[test]
    fn block_and_secrets_are_added_once() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("configuration.yaml");
        let secrets_file = dir.path().join("secrets.yaml");
        fs::write(&target, "# mine\ndefault_config:\n").unwrap();
        let runner = MockRunner::default();
        let writer = FileWriter::new(&runner, Elevation::None);

        let first =
            ensure_integration(&target, &secrets_file, "influxdb", &secrets(), SENTINEL, &writer)
                .unwrap();
        assert!(first.block_appended);
        assert_eq!(first.secrets_added.len(), 3);

        let config_after_first = fs::read_to_string(&target).unwrap();
        let secrets_after_first = fs::read_to_string(&secrets_file).unwrap();

        let second =
            ensure_integration(&target, &secrets_file, "influxdb", &secrets(), SENTINEL, &writer)
                .unwrap();
        assert!(!second.changed());
        assert_eq!(fs::read_to_string(&target).unwrap(), config_after_first);
        assert_eq!(fs::read_to_string(&secrets_file).unwrap(), secrets_after_first);

        assert!(config_after_first.starts_with("# mine\ndefault_config:\n\ninfluxdb:\n"));
        assert_eq!(config_after_first.matches("\ninfluxdb:").count(), 1);
        assert_eq!(secrets_after_first.matches("influxdb_token:").count(), 1);
        assert!(config_after_first.contains("token: !secret influxdb_token"));
        assert!(!config_after_first.contains(&"a".repeat(64)));
    }

    #[test]
    fn existing_block_with_odd_spacing_is_detected() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("configuration.yaml");
        fs::write(&target, "influxdb  :\n  host: elsewhere\n").unwrap();
        let runner = MockRunner::default();
        let writer = FileWriter::new(&runner, Elevation::None);
        let report = ensure_integration(
            &target,
            &dir.path().join("secrets.yaml"),
            "influxdb",
            &secrets(),
            SENTINEL,
            &writer,
        )
        .unwrap();
        assert!(!report.block_appended);
        assert_eq!(
            fs::read_to_string(&target).unwrap(),
            "influxdb  :\n  host: elsewhere\n"
        );
    }

    #[test]
    fn block_after_byte_order_mark_is_not_duplicated() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("configuration.yaml");
        let original = "\u{feff}influxdb:\n  host: influxdb\n";
        fs::write(&target, original).unwrap();
        let runner = MockRunner::default();
        let writer = FileWriter::new(&runner, Elevation::None);
        let report = ensure_integration(
            &target,
            &dir.path().join("secrets.yaml"),
            "influxdb",
            &secrets(),
            SENTINEL,
            &writer,
        )
        .unwrap();
        assert!(!report.block_appended);
        assert_eq!(fs::read_to_string(&target).unwrap(), original);
    }

    #[test]
    fn placeholder_is_rewritten_and_neighbours_untouched() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("configuration.yaml");
        let secrets_file = dir.path().join("secrets.yaml");
        fs::write(&target, "influxdb:\n").unwrap();
        fs::write(
            &secrets_file,
            "# secrets\nwifi_password: \"hunter2\"\ninfluxdb_token: \"changeme-token\"\ninfluxdb_org: \"family\"\ninfluxdb_bucket: ha\n",
        )
        .unwrap();
        let runner = MockRunner::default();
        let writer = FileWriter::new(&runner, Elevation::None);

        let report =
            ensure_integration(&target, &secrets_file, "influxdb", &secrets(), SENTINEL, &writer)
                .unwrap();
        assert_eq!(report.placeholders_replaced, vec![TOKEN_SECRET.to_string()]);
        assert!(report.secrets_added.is_empty());

        let content = fs::read_to_string(&secrets_file).unwrap();
        assert_eq!(
            content,
            format!(
                "# secrets\nwifi_password: \"hunter2\"\ninfluxdb_token: \"{}\"\ninfluxdb_org: \"family\"\ninfluxdb_bucket: ha\n",
                "a".repeat(64)
            )
        );
    }

    #[test]
    fn commented_secret_lines_do_not_count() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("configuration.yaml");
        let secrets_file = dir.path().join("secrets.yaml");
        fs::write(&target, "influxdb:\n").unwrap();
        fs::write(&secrets_file, "# influxdb_org: \"old\"\n").unwrap();
        let runner = MockRunner::default();
        let writer = FileWriter::new(&runner, Elevation::None);
        let report =
            ensure_integration(&target, &secrets_file, "influxdb", &secrets(), SENTINEL, &writer)
                .unwrap();
        assert_eq!(report.secrets_added.len(), 3);
        let content = fs::read_to_string(&secrets_file).unwrap();
        assert!(content.starts_with("# influxdb_org: \"old\"\n"));
        assert!(content.contains("\ninfluxdb_org: \"home\"\n"));
    }
}
