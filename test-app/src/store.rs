// Settings file support for the test application.
//
// Reader settings live in a flat TOML table keyed by parameter path:
//
//   "/reader/region/id" = "NA"
//   "/reader/gen2/session" = "S1"
//   "/reader/read/plan/antennas" = "1,2"
//
// Integers and booleans are accepted and stored as their text form; nested
// tables and arrays are skipped with a warning.

use std::path::PathBuf;

use rfidlib::{Error, Properties, PropertyStore};
use tracing::warn;

/// A [`PropertyStore`] backed by a TOML file.
#[derive(Debug, Clone)]
pub struct TomlFileStore {
    path: PathBuf,
}

impl TomlFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TomlFileStore { path: path.into() }
    }
}

/// Parse a settings document into properties.
pub fn parse_properties(text: &str) -> rfidlib::Result<Properties> {
    let table: toml::Table = toml::from_str(text)
        .map_err(|e| Error::InvalidParameter(format!("settings file: {e}")))?;

    let mut props = Properties::new();
    for (key, value) in table {
        let text = match value {
            toml::Value::String(s) => s,
            toml::Value::Integer(n) => n.to_string(),
            toml::Value::Boolean(b) => b.to_string(),
            toml::Value::Float(f) => f.to_string(),
            other => {
                warn!(key = %key, kind = other.type_str(), "skipping non-scalar setting");
                continue;
            }
        };
        props.insert(key, text);
    }
    Ok(props)
}

impl PropertyStore for TomlFileStore {
    /// A missing file is an empty property set.
    fn load(&self) -> rfidlib::Result<Properties> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => parse_properties(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Properties::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, props: &Properties) -> rfidlib::Result<()> {
        let text = toml::to_string(props)
            .map_err(|e| Error::InvalidParameter(format!("settings file: {e}")))?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}
