//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Trigger and client configuration snapshot and loading."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::protection::DataProtection;
use crate::wire::WireFormat;
use crate::{EdgewireError, Result};

/// Configuration section name inside the service configuration file.
pub const CONFIG_SECTION: &str = "WatermillTrigger";

/// Backend, topic, wire format, and encryption settings for one trigger or client.
///
/// Field names follow the PascalCase layout used by EdgeX service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WatermillConfig {
    /// Backend type name, e.g. `nats` or `kafka`.
    #[serde(rename = "Type", default)]
    pub backend_type: String,
    #[serde(default)]
    pub broker_url: String,
    #[serde(default)]
    pub client_id: String,
    /// Comma separated topic list.
    #[serde(default)]
    pub subscribe_topics: String,
    #[serde(default)]
    pub publish_topic: String,
    /// One of `raw`, `rawinput`, `rawoutput`, `edgex`; empty selects `edgex`.
    #[serde(default)]
    pub wire_format: String,
    #[serde(default)]
    pub consumer_group: String,
    #[serde(default)]
    pub encryption_algorithm: String,
    /// Hex encoded key for `encryption_algorithm`.
    #[serde(default)]
    pub encryption_key: String,
    /// Free-form backend specific tuning.
    #[serde(default)]
    pub optional: IndexMap<String, String>,
}

/// Wrapper matching the `[WatermillTrigger]` section of a service configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermillConfigWrapper {
    #[serde(rename = "WatermillTrigger", default)]
    pub watermill_trigger: WatermillConfig,
}

/// Configuration together with the file it was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: WatermillConfig,
    pub source: PathBuf,
}

impl WatermillConfig {
    pub const ENV_CONFIG_PATH: &'static str = "EDGEWIRE_CONFIG";

    /// Load configuration from the first existing candidate, respecting `EDGEWIRE_CONFIG`.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedConfig {
                    config,
                    source: path.to_path_buf(),
                });
            }
        }

        Err(EdgewireError::Configuration(format!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    /// Read and validate the `[WatermillTrigger]` section of a TOML file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path).map_err(|err| {
            EdgewireError::Configuration(format!(
                "unable to read config file {}: {err}",
                path.display()
            ))
        })?;
        contents.parse()
    }

    /// Validate encryption settings; wire format and topics are always accepted.
    pub fn validate(&self) -> Result<()> {
        DataProtection::from_config(self).map(|_| ())
    }

    /// Topics to subscribe to; see [`parse_topics`].
    pub fn subscribe_topic_list(&self) -> Vec<String> {
        parse_topics(&self.subscribe_topics)
    }

    /// Selected wire format.
    pub fn wire_format(&self) -> WireFormat {
        WireFormat::from_config_name(&self.wire_format)
    }

    /// Look up an optional setting.
    pub fn optional_value(&self, key: &str) -> Option<&str> {
        self.optional.get(key).map(String::as_str)
    }

    /// Look up an optional boolean setting, treating unparsable values as absent.
    pub fn optional_bool(&self, key: &str) -> Option<bool> {
        self.optional_value(key)
            .and_then(|raw| raw.trim().to_ascii_lowercase().parse::<bool>().ok())
    }
}

impl FromStr for WatermillConfig {
    type Err = EdgewireError;

    fn from_str(content: &str) -> Result<Self> {
        let wrapper: WatermillConfigWrapper = toml::from_str(content).map_err(|err| {
            EdgewireError::Configuration(format!("failed to parse configuration: {err}"))
        })?;
        let config = wrapper.watermill_trigger;
        config.validate()?;
        Ok(config)
    }
}

/// Split a comma separated topic list, trimming entries and dropping empties.
///
/// A blank list yields a single empty topic, which backends treat as a catch-all
/// subscription.
pub fn parse_topics(raw: &str) -> Vec<String> {
    let topics: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|topic| !topic.is_empty())
        .map(str::to_owned)
        .collect();
    if topics.is_empty() {
        vec![String::new()]
    } else {
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[WatermillTrigger]
Type = "nats"
BrokerUrl = "nats://localhost:4222"
ClientId = "edgewire"
SubscribeTopics = "events, commands"
PublishTopic = "responses"
WireFormat = "RAW"
ConsumerGroup = "workers"

[WatermillTrigger.Optional]
JetstreamDisabled = "true"
"#;

    #[test]
    fn topic_list_is_trimmed_and_compacted() {
        assert_eq!(parse_topics("a, b ,,c"), vec!["a", "b", "c"]);
        assert_eq!(parse_topics("single"), vec!["single"]);
    }

    #[test]
    fn blank_topic_list_means_catch_all() {
        assert_eq!(parse_topics(""), vec![""]);
        assert_eq!(parse_topics("   "), vec![""]);
        assert_eq!(parse_topics(" , ,"), vec![""]);
    }

    #[test]
    fn parses_edgex_style_section() {
        let config: WatermillConfig = SAMPLE.parse().expect("valid config");
        assert_eq!(config.backend_type, "nats");
        assert_eq!(config.broker_url, "nats://localhost:4222");
        assert_eq!(config.subscribe_topic_list(), vec!["events", "commands"]);
        assert_eq!(config.publish_topic, "responses");
        assert_eq!(config.wire_format(), WireFormat::Raw);
        assert_eq!(config.consumer_group, "workers");
        assert_eq!(config.optional_bool("JetstreamDisabled"), Some(true));
        assert_eq!(config.optional_bool("Missing"), None);
    }

    #[test]
    fn invalid_encryption_is_rejected_at_load() {
        let content = r#"
[WatermillTrigger]
Type = "nats"
EncryptionAlgorithm = "des"
EncryptionKey = "00"
"#;
        let err = content.parse::<WatermillConfig>().expect_err("bad algorithm");
        assert!(matches!(err, EdgewireError::Configuration(_)));
    }

    #[test]
    fn load_picks_first_existing_candidate() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(SAMPLE.as_bytes()).expect("write config");
        let missing = PathBuf::from("/nonexistent/edgewire.toml");
        let loaded =
            WatermillConfig::load_with_source(&[missing, file.path().to_path_buf()]).expect("load");
        assert_eq!(loaded.source, file.path());
        assert_eq!(loaded.config.client_id, "edgewire");
    }

    #[test]
    fn load_reports_inspected_candidates() {
        let err = WatermillConfig::load(&[PathBuf::from("/nonexistent/a.toml")])
            .expect_err("nothing to load");
        assert!(err.to_string().contains("/nonexistent/a.toml"));
    }
}
