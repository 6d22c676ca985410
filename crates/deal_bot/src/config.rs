use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;
use marketplace_api::{Credentials, ItemId, PipelineConfig, SearchArea};
use serde::Deserialize;
use tracing::{info, warn};

use crate::TimestampRounding;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("Invalid value {value:?} for {name}")]
    InvalidVar {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
    },

    /// A configuration file could not be read or written.
    #[error("Failed to access {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The item list file is not valid TOML.
    #[error("Invalid item lists in {path}: {source}")]
    ItemLists {
        /// File path.
        path: PathBuf,
        /// Parse error.
        #[source]
        source: toml::de::Error,
    },

    /// The credentials file is not valid JSON.
    #[error("Invalid credentials in {path}: {source}")]
    Credentials {
        /// File path.
        path: PathBuf,
        /// Parse error.
        #[source]
        source: serde_json::Error,
    },
}

/// Static sets of item ids consulted for logging and alerting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ItemLists {
    /// Tracked, but changes are logged at debug and never acted on.
    pub ignored: BTreeSet<ItemId>,
    /// Known to be inactive; their first sighting is not alarming.
    pub inactive: BTreeSet<ItemId>,
    /// Tracked from start-up.
    pub tracked: BTreeSet<ItemId>,
}

impl ItemLists {
    /// Parses lists from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Loads lists from a TOML file. A missing file yields empty lists.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Item lists not found at {}, using empty lists", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let lists = Self::from_toml_str(&text).map_err(|source| ConfigError::ItemLists {
            path: path.to_path_buf(),
            source,
        })?;
        info!(
            "Loaded item lists: {} ignored, {} inactive, {} tracked",
            lists.ignored.len(),
            lists.inactive.len(),
            lists.tracked.len()
        );
        Ok(lists)
    }

    /// Whether changes to `id` are only logged.
    pub fn is_ignored(&self, id: ItemId) -> bool {
        self.ignored.contains(&id)
    }

    /// Whether `id` is known to be inactive.
    pub fn is_inactive(&self, id: ItemId) -> bool {
        self.inactive.contains(&id)
    }

    /// Ids tracked from start-up: the ignored and tracked lists.
    pub fn initially_tracked(&self) -> impl Iterator<Item = ItemId> + '_ {
        self.ignored.union(&self.tracked).copied()
    }
}

/// Timing knobs of the bot workflows.
#[derive(Debug, Clone)]
pub struct BotTimings {
    /// Delay after a reservation expires before it is re-reserved (default: 1 second)
    pub catch_delay: TimeDelta,

    /// How long a snipe registry entry outlives its snipe (default: 2 minutes)
    pub flapping_cooldown: TimeDelta,

    /// Item detail polls per snipe (default: 6)
    pub snipe_max_attempts: u32,

    /// Period of the favorites scan (default: 2 seconds)
    pub check_favorites_interval: Duration,
}

impl Default for BotTimings {
    fn default() -> Self {
        Self {
            catch_delay: TimeDelta::seconds(1),
            flapping_cooldown: TimeDelta::minutes(2),
            snipe_max_attempts: 6,
            check_favorites_interval: Duration::from_secs(2),
        }
    }
}

/// Everything the binary needs to start the bot.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// HTTP transport settings.
    pub pipeline: PipelineConfig,
    /// ntfy server root.
    pub ntfy_base_url: String,
    /// ntfy topic; notifications are only logged when unset.
    pub ntfy_topic: Option<String>,
    /// JSON file holding the access and refresh tokens.
    pub credentials_path: PathBuf,
    /// TOML file holding the item lists.
    pub items_path: PathBuf,
    /// Favorites search origin.
    pub area: SearchArea,
    /// Workflow timings.
    pub timings: BotTimings,
    /// Rounding applied to reservation timestamps when comparing them to sold-out times.
    pub rounding: TimestampRounding,
}

impl BotConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, falling back to defaults for unset variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = PipelineConfig::default();
        let area_defaults = SearchArea::default();
        let timing_defaults = BotTimings::default();

        let interval_secs = parse_var(
            &lookup,
            "CHECK_FAVORITES_INTERVAL_SECS",
            timing_defaults.check_favorites_interval.as_secs(),
        )?;
        if interval_secs == 0 {
            return Err(ConfigError::InvalidVar {
                name: "CHECK_FAVORITES_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            pipeline: PipelineConfig {
                base_url: with_trailing_slash(
                    lookup("MARKETPLACE_BASE_URL").unwrap_or(defaults.base_url.clone()),
                ),
                ..defaults
            },
            ntfy_base_url: lookup("NTFY_BASE_URL").unwrap_or_else(|| "https://ntfy.sh/".to_string()),
            ntfy_topic: lookup("NTFY_TOPIC").filter(|topic| !topic.is_empty()),
            credentials_path: lookup("CREDENTIALS_PATH")
                .unwrap_or_else(|| "credentials.json".to_string())
                .into(),
            items_path: lookup("ITEMS_PATH")
                .unwrap_or_else(|| "items.toml".to_string())
                .into(),
            area: SearchArea {
                latitude: parse_var(&lookup, "LATITUDE", area_defaults.latitude)?,
                longitude: parse_var(&lookup, "LONGITUDE", area_defaults.longitude)?,
                radius_km: parse_var(&lookup, "RADIUS_KM", area_defaults.radius_km)?,
            },
            timings: BotTimings {
                check_favorites_interval: Duration::from_secs(interval_secs),
                ..timing_defaults
            },
            rounding: TimestampRounding::default(),
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidVar { name, value }),
    }
}

fn with_trailing_slash(mut url: String) -> String {
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

/// Reads credentials from a JSON file.
pub fn load_credentials(path: &Path) -> Result<Credentials, ConfigError> {
    let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ConfigError::Credentials {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes credentials to a JSON file.
pub fn save_credentials(path: &Path, credentials: &Credentials) -> Result<(), ConfigError> {
    let json = serde_json::to_vec_pretty(credentials).map_err(|source| ConfigError::Credentials {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, json).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!("Saved credentials to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BotConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.pipeline.base_url, "https://apptoogoodtogo.com/api/");
        assert_eq!(config.pipeline.operation_attempts, 3);
        assert_eq!(config.ntfy_topic, None);
        assert_eq!(config.credentials_path, PathBuf::from("credentials.json"));
        assert_eq!(config.timings.check_favorites_interval, Duration::from_secs(2));
        assert_eq!(config.timings.snipe_max_attempts, 6);
    }

    #[test]
    fn test_overrides() {
        let config = BotConfig::from_lookup(lookup(&[
            ("MARKETPLACE_BASE_URL", "http://localhost:9000/api"),
            ("NTFY_TOPIC", "deals"),
            ("LATITUDE", "52.37"),
            ("CHECK_FAVORITES_INTERVAL_SECS", "5"),
        ]))
        .unwrap();

        assert_eq!(config.pipeline.base_url, "http://localhost:9000/api/");
        assert_eq!(config.ntfy_topic.as_deref(), Some("deals"));
        assert_eq!(config.area.latitude, 52.37);
        assert_eq!(config.timings.check_favorites_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let result = BotConfig::from_lookup(lookup(&[("RADIUS_KM", "far")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidVar {
                name: "RADIUS_KM",
                ..
            })
        ));

        let result = BotConfig::from_lookup(lookup(&[("CHECK_FAVORITES_INTERVAL_SECS", "0")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_item_lists_from_toml() {
        let lists = ItemLists::from_toml_str("ignored = [1, 2]\ninactive = [42]\n").unwrap();

        assert!(lists.is_ignored(2));
        assert!(lists.is_inactive(42));
        assert!(lists.tracked.is_empty());
        assert_eq!(lists.initially_tracked().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_missing_item_lists_file_is_empty() {
        let lists = ItemLists::load(Path::new("/nonexistent/items.toml")).unwrap();
        assert_eq!(lists, ItemLists::default());
    }

    #[test]
    fn test_credentials_round_trip_through_file() {
        let path = env::temp_dir().join(format!("deal-bot-credentials-{}.json", std::process::id()));
        let credentials = Credentials {
            access_token: "access".into(),
            refresh_token: "refresh".into(),
        };

        save_credentials(&path, &credentials).unwrap();
        assert_eq!(load_credentials(&path).unwrap(), credentials);
        std::fs::remove_file(&path).unwrap();
    }
}
