use crate::config::Influxdb;
use crate::env_store::EnvStore;
use crate::error::HearthError;
use crate::runner::{CommandRunner, FileWriter};
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng, TryRngCore};
use serde::Serialize;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

pub const TOKEN_KEY: &str = "INFLUXDB_TOKEN";
pub const ORG_KEY: &str = "INFLUXDB_ORG";
pub const BUCKET_KEY: &str = "INFLUXDB_BUCKET";
pub const USERNAME_KEY: &str = "INFLUXDB_USERNAME";
pub const PASSWORD_KEY: &str = "INFLUXDB_PASSWORD";

const TOKEN_BYTES: usize = 32;
const PASSWORD_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenOrigin {
    /// The store has initialized; the stored value is authoritative.
    Preserved,
    /// Not yet initialized, but a usable value was already stored.
    Existing,
    /// Freshly generated on this run.
    Generated,
}

impl TokenOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenOrigin::Preserved => "preserved",
            TokenOrigin::Existing => "existing",
            TokenOrigin::Generated => "generated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretToken {
    pub value: String,
    pub origin: TokenOrigin,
}

/// Returns `len` random bytes, hex encoded. Falls back to a clock-seeded
/// generator only when the operating system source is unavailable.
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    if let Err(err) = OsRng.try_fill_bytes(&mut bytes) {
        warn!(%err, "OS random source unavailable; using degraded pseudo-random fallback");
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let seed = nanos ^ (u64::from(std::process::id()) << 32);
        StdRng::seed_from_u64(seed).fill_bytes(&mut bytes);
    }
    hex::encode(bytes)
}

pub fn generate_token() -> String {
    random_hex(TOKEN_BYTES)
}

/// Whether the store has written its initialization marker. A marker that
/// cannot be checked is an error, never "absent".
pub fn store_initialized(marker: &Path) -> Result<bool, HearthError> {
    marker.try_exists().map_err(|err| {
        HearthError::fatal(
            format!(
                "cannot tell whether the time-series store is initialized: {}: {err}",
                marker.display()
            ),
            format!(
                "make {} and its parent directories readable by this user (or rerun with sudo), then rerun hearth",
                marker.display()
            ),
        )
    })
}

/// The shared store token, bound to the store's own initialization marker.
///
/// Once `marker` exists the stored value is returned as-is, even when it is
/// the sentinel: the store has already bound to it. Before that, an absent or
/// sentinel value is replaced by a freshly generated token.
pub fn ensure_token<R: CommandRunner>(
    store: &mut EnvStore,
    marker: &Path,
    sentinel: &str,
    writer: &FileWriter<'_, R>,
) -> Result<SecretToken, HearthError> {
    let stored = store.get(TOKEN_KEY).map(str::to_string);
    if store_initialized(marker)? {
        return match stored {
            Some(value) => Ok(SecretToken {
                value,
                origin: TokenOrigin::Preserved,
            }),
            None => Err(HearthError::fatal(
                format!(
                    "time-series store is initialized ({}) but {} has no {TOKEN_KEY}",
                    marker.display(),
                    store.path().display()
                ),
                format!(
                    "restore the original token as {TOKEN_KEY}=<token> in {}; a new token would not match the initialized store",
                    store.path().display()
                ),
            )),
        };
    }
    match stored {
        Some(value) if !value.is_empty() && value != sentinel => Ok(SecretToken {
            value,
            origin: TokenOrigin::Existing,
        }),
        _ => {
            let value = generate_token();
            store.set(TOKEN_KEY, &value, writer)?;
            info!(path = %store.path().display(), "generated new store token");
            Ok(SecretToken {
                value,
                origin: TokenOrigin::Generated,
            })
        }
    }
}

/// Writes the store's companion settings. Org, bucket and username are only
/// filled when absent; the admin password obeys the same first-run-only rule
/// as the token.
pub fn ensure_store_settings<R: CommandRunner>(
    store: &mut EnvStore,
    marker: &Path,
    settings: &Influxdb,
    writer: &FileWriter<'_, R>,
) -> Result<Vec<String>, HearthError> {
    let initialized = store_initialized(marker)?;
    let mut written = Vec::new();
    for (key, value) in [
        (ORG_KEY, settings.org.as_str()),
        (BUCKET_KEY, settings.bucket.as_str()),
        (USERNAME_KEY, settings.username.as_str()),
    ] {
        if store.set_default(key, value, writer)? {
            written.push(key.to_string());
        }
    }
    if initialized {
        if store.get(PASSWORD_KEY).is_none() {
            warn!("store is initialized without {PASSWORD_KEY} in the env file; leaving it unset");
        }
    } else if store.get(PASSWORD_KEY).map_or(true, str::is_empty)
        && store.set(PASSWORD_KEY, &random_hex(PASSWORD_BYTES), writer)?
    {
        written.push(PASSWORD_KEY.to_string());
    }
    Ok(written)
}
