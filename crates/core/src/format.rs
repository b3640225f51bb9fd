//! Typed document loaders.
//!
//! Every loader maps the underlying parser error into the matching
//! [`Error`] variant so callers never see serde_* error types.

use std::path::Path;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::result::Result;

/// Read a whole file into a string.
///
/// # Errors
///
/// Returns [`Error::FileReadFailed`] when the file cannot be read.
pub fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::file_read_failed(path, e.to_string()))
}

/// Parse a TOML document.
///
/// # Errors
///
/// Returns [`Error::TomlParseFailed`] on malformed input.
pub fn from_toml<T: DeserializeOwned>(input: &str) -> Result<T> {
    toml::from_str(input).map_err(|e| Error::toml_parse_failed(e.to_string()))
}

/// Parse a JSON document.
///
/// # Errors
///
/// Returns [`Error::JsonParseFailed`] on malformed input.
pub fn from_json<T: DeserializeOwned>(input: &str) -> Result<T> {
    serde_json::from_str(input).map_err(|e| Error::json_parse_failed(e.to_string()))
}

/// Parse every document of a multi-document YAML stream.
///
/// Empty documents (a trailing `---`, comment-only blocks) are skipped.
///
/// # Errors
///
/// Returns [`Error::YamlParseFailed`] if any document fails to parse.
pub fn from_yaml_documents<T: DeserializeOwned>(input: &str) -> Result<Vec<T>> {
    serde_yaml::Deserializer::from_str(input)
        .map(|document| {
            serde_yaml::Value::deserialize(document)
                .map_err(|e| Error::yaml_parse_failed(e.to_string()))
        })
        .filter(|value| !matches!(value, Ok(serde_yaml::Value::Null)))
        .map(|value| {
            value.and_then(|v| {
                serde_yaml::from_value(v).map_err(|e| Error::yaml_parse_failed(e.to_string()))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Doc {
        name: String,
    }

    #[test]
    fn yaml_stream_skips_empty_documents() {
        let input = "name: a\n---\n# only a comment\n---\nname: b\n---\n";
        let docs: Vec<Doc> = from_yaml_documents(input).unwrap();
        assert_eq!(
            docs,
            vec![
                Doc { name: "a".into() },
                Doc { name: "b".into() }
            ]
        );
    }

    #[test]
    fn yaml_error_is_typed() {
        let result: Result<Vec<Doc>> = from_yaml_documents("name: [unclosed");
        assert!(matches!(result, Err(Error::YamlParseFailed { .. })));
    }

    #[test]
    fn toml_error_is_typed() {
        let result: Result<Doc> = from_toml("name = ");
        assert!(matches!(result, Err(Error::TomlParseFailed { .. })));
    }

    #[test]
    fn read_file_reports_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let result = read_file(&missing);
        assert!(matches!(result, Err(Error::FileReadFailed { .. })));
    }
}
