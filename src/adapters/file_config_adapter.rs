//! INI configuration adapter over `configparser`.
//!
//! Section and key names are case-insensitive. Values are returned trimmed
//! and uninterpreted; numeric parsing happens in `config_validation` so a
//! malformed number is reported instead of silently defaulted.

use crate::domain::error::QuantlabError;
use crate::ports::config_port::ConfigPort;
use configparser::ini::Ini;
use std::path::Path;

#[derive(Debug)]
pub struct FileConfigAdapter {
    ini: Ini,
}

impl FileConfigAdapter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, QuantlabError> {
        let path = path.as_ref();
        let mut ini = Ini::new();
        ini.load(path).map_err(|reason| QuantlabError::ConfigParse {
            file: path.display().to_string(),
            reason,
        })?;
        Ok(Self { ini })
    }

    pub fn from_string(content: &str) -> Result<Self, QuantlabError> {
        let mut ini = Ini::new();
        ini.read(content.to_string())
            .map_err(|reason| QuantlabError::ConfigParse {
                file: "<string>".to_string(),
                reason,
            })?;
        Ok(Self { ini })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

impl ConfigPort for FileConfigAdapter {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.ini.get(section, key).map(|v| v.trim().to_string())
    }

    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        self.get_string(section, key)
            .and_then(|v| parse_bool(&v))
            .unwrap_or(default)
    }

    fn sections(&self) -> Vec<String> {
        let mut sections: Vec<String> = self
            .ini
            .get_map_ref()
            .keys()
            .filter(|s| s.as_str() != "default")
            .cloned()
            .collect();
        sections.sort();
        sections
    }

    fn keys(&self, section: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .ini
            .get_map_ref()
            .get(&section.to_lowercase())
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[Data]
price_dir = data/prices
symbols = AAPL, MSFT,,NVDA

[optimizer]
Risk_Aversion = 3.0
long_only = no
"#;

    #[test]
    fn names_are_case_insensitive() {
        let adapter = FileConfigAdapter::from_string(SAMPLE).unwrap();
        assert_eq!(
            adapter.get_string("data", "price_dir"),
            Some("data/prices".to_string())
        );
        assert_eq!(
            adapter.get_string("OPTIMIZER", "risk_aversion"),
            Some("3.0".to_string())
        );
    }

    #[test]
    fn list_values_drop_empty_entries() {
        let adapter = FileConfigAdapter::from_string(SAMPLE).unwrap();
        assert_eq!(adapter.get_list("data", "symbols"), vec!["AAPL", "MSFT", "NVDA"]);
        assert!(adapter.get_list("data", "missing").is_empty());
    }

    #[test]
    fn sections_and_keys_are_listed() {
        let adapter = FileConfigAdapter::from_string(SAMPLE).unwrap();
        assert_eq!(adapter.sections(), vec!["data", "optimizer"]);
        assert_eq!(adapter.keys("optimizer"), vec!["long_only", "risk_aversion"]);
        assert!(adapter.keys("report").is_empty());
    }

    #[test]
    fn bool_spellings() {
        let adapter = FileConfigAdapter::from_string(
            "[optimizer]\na = true\nb = Yes\nc = on\nd = false\ne = no\nf = 0\ng = maybe\n",
        )
        .unwrap();
        for key in ["a", "b", "c"] {
            assert!(adapter.get_bool("optimizer", key, false), "{key}");
        }
        for key in ["d", "e", "f"] {
            assert!(!adapter.get_bool("optimizer", key, true), "{key}");
        }
        assert!(adapter.get_bool("optimizer", "g", true));
        assert!(!adapter.get_bool("optimizer", "missing", false));
    }

    #[test]
    fn from_file_reads_config() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[report]\noutput_dir = out/reports\n").unwrap();
        let adapter = FileConfigAdapter::from_file(file.path()).unwrap();
        assert_eq!(
            adapter.get_string("report", "output_dir"),
            Some("out/reports".to_string())
        );
    }

    #[test]
    fn from_file_missing_is_parse_error() {
        let err = FileConfigAdapter::from_file("/nonexistent/path/config.ini").unwrap_err();
        assert!(matches!(err, QuantlabError::ConfigParse { file, .. } if file.contains("config.ini")));
    }
}
