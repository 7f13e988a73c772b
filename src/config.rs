use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Settings of a session.
///
/// Every field has a default, so an empty JSON object is a valid config.
///
/// ```json
/// {
///     "out-dir": "generated",
///     "fail-fast": true,
///     "manifest": "generated/manifest.json"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Config {
    /// Root directory artifacts are written under.
    pub out_dir: Utf8PathBuf,
    /// Abort [`Session::begin`](crate::Session::begin) on the first task
    /// failure instead of continuing with the tasks that could be built.
    pub fail_fast: bool,
    /// Where to write the artifact manifest after rendering, if anywhere.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Utf8PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            out_dir: Utf8PathBuf::from("generated"),
            fail_fast: false,
            manifest: None,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }
}
