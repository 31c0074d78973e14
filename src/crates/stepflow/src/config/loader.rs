//! YAML loader with include and environment variable support
//!
//! Used for both stepflow configuration files and workflow definition files:
//! - `$include` directives splice in another YAML file (relative to the
//!   including file)
//! - `${ENV_VAR:default}` expands environment variables inside strings

use crate::error::{Result, StepflowError};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

static ENV_VAR_REGEX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([^:}]+)(?::([^}]*))?\}").ok());

/// Load a YAML file with includes resolved and variables expanded
pub fn load_yaml_file<P: AsRef<Path>>(path: P) -> Result<YamlValue> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        StepflowError::Config(format!("Failed to read YAML file {:?}: {}", path, e))
    })?;

    let mut value: YamlValue = serde_yaml::from_str(&content).map_err(|e| {
        StepflowError::Config(format!("Failed to parse YAML file {:?}: {}", path, e))
    })?;

    let base_dir = path
        .parent()
        .ok_or_else(|| StepflowError::Config(format!("Invalid file path {:?}", path)))?;

    process_includes(&mut value, base_dir)?;
    expand_variables(&mut value);

    Ok(value)
}

/// Load a YAML file and deserialize it into `T`
pub fn load_yaml_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let yaml = load_yaml_file(path)?;
    let json = yaml_to_json(&yaml)?;

    serde_json::from_value(json).map_err(|e| {
        StepflowError::Config(format!("Failed to deserialize configuration: {}", e))
    })
}

/// Load a YAML or JSON document as a JSON value
///
/// `.json` files are parsed directly; everything else goes through the YAML
/// loader, so includes and `${ENV}` expansion work in definition files too.
pub fn load_document<P: AsRef<Path>>(path: P) -> Result<JsonValue> {
    let path = path.as_ref();
    if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
        let content = fs::read_to_string(path).map_err(|e| {
            StepflowError::Config(format!("Failed to read JSON file {:?}: {}", path, e))
        })?;
        return Ok(serde_json::from_str(&content)?);
    }
    yaml_to_json(&load_yaml_file(path)?)
}

fn process_includes(value: &mut YamlValue, base_dir: &Path) -> Result<()> {
    match value {
        YamlValue::Mapping(map) => {
            if let Some(YamlValue::String(include_path)) =
                map.get(YamlValue::String("$include".to_string()))
            {
                let included = load_yaml_file(base_dir.join(include_path))?;
                *value = included;
                return Ok(());
            }

            for (_, v) in map.iter_mut() {
                process_includes(v, base_dir)?;
            }
        }
        YamlValue::Sequence(seq) => {
            for item in seq.iter_mut() {
                process_includes(item, base_dir)?;
            }
        }
        _ => {}
    }

    Ok(())
}

fn expand_variables(value: &mut YamlValue) {
    match value {
        YamlValue::String(s) => {
            if let Some(expanded) = expand_env_in_string(s) {
                *s = expanded;
            }
        }
        YamlValue::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                expand_variables(v);
            }
        }
        YamlValue::Sequence(seq) => {
            for item in seq.iter_mut() {
                expand_variables(item);
            }
        }
        _ => {}
    }
}

/// Expand `${ENV_VAR:default}` occurrences; `None` when there are none
fn expand_env_in_string(s: &str) -> Option<String> {
    if !s.contains("${") {
        return None;
    }

    let re = ENV_VAR_REGEX.as_ref()?;
    let expanded = re.replace_all(s, |caps: &regex::Captures<'_>| {
        let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        env::var(&caps[1]).unwrap_or_else(|_| default_value.to_string())
    });

    Some(expanded.into_owned())
}

/// Convert a YAML value into JSON
pub fn yaml_to_json(yaml: &YamlValue) -> Result<JsonValue> {
    match yaml {
        YamlValue::Null => Ok(JsonValue::Null),
        YamlValue::Bool(b) => Ok(JsonValue::Bool(*b)),
        YamlValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(JsonValue::Number(i.into()))
            } else if let Some(u) = n.as_u64() {
                Ok(JsonValue::Number(u.into()))
            } else if let Some(f) = n.as_f64() {
                serde_json::Number::from_f64(f)
                    .map(JsonValue::Number)
                    .ok_or_else(|| StepflowError::Config(format!("Invalid number: {}", f)))
            } else {
                Err(StepflowError::Config("Invalid number".to_string()))
            }
        }
        YamlValue::String(s) => Ok(JsonValue::String(s.clone())),
        YamlValue::Sequence(seq) => {
            let items: Result<Vec<JsonValue>> = seq.iter().map(yaml_to_json).collect();
            Ok(JsonValue::Array(items?))
        }
        YamlValue::Mapping(map) => {
            let mut json_map = serde_json::Map::new();
            for (k, v) in map {
                let key = match k {
                    YamlValue::String(s) => s.clone(),
                    YamlValue::Number(n) => n.to_string(),
                    YamlValue::Bool(b) => b.to_string(),
                    _ => {
                        return Err(StepflowError::Config(
                            "Map keys must be strings".to_string(),
                        ))
                    }
                };
                json_map.insert(key, yaml_to_json(v)?);
            }
            Ok(JsonValue::Object(json_map))
        }
        YamlValue::Tagged(tagged) => yaml_to_json(&tagged.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_expand_env_in_string() {
        env::set_var("STEPFLOW_TEST_VAR", "test_value");

        let result = expand_env_in_string("prefix ${STEPFLOW_TEST_VAR} suffix");
        assert_eq!(result, Some("prefix test_value suffix".to_string()));

        env::remove_var("STEPFLOW_TEST_VAR");
    }

    #[test]
    fn test_expand_env_with_default() {
        let result = expand_env_in_string("value: ${STEPFLOW_MISSING_VAR:default_val}");
        assert_eq!(result, Some("value: default_val".to_string()));
        assert_eq!(expand_env_in_string("plain"), None);
    }

    #[test]
    fn test_yaml_to_json() {
        let yaml: YamlValue = serde_yaml::from_str(
            r#"
            string: "hello"
            number: 42
            float: 0.5
            bool: true
            null_val: null
            array: [1, 2, 3]
            object:
              nested: "value"
        "#,
        )
        .unwrap();
        let json = yaml_to_json(&yaml).unwrap();

        assert_eq!(json["string"], "hello");
        assert_eq!(json["number"], 42);
        assert_eq!(json["float"], 0.5);
        assert_eq!(json["bool"], true);
        assert!(json["null_val"].is_null());
        assert_eq!(json["array"].as_array().unwrap().len(), 3);
        assert_eq!(json["object"]["nested"], "value");
    }

    #[test]
    fn test_include_relative_to_file() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("execution.yaml"), "max_concurrent: 7\n")?;
        fs::write(
            dir.path().join("main.yaml"),
            "execution:\n  $include: execution.yaml\n",
        )?;

        let json = yaml_to_json(&load_yaml_file(dir.path().join("main.yaml"))?)?;
        assert_eq!(json["execution"]["max_concurrent"], 7);
        Ok(())
    }

    #[test]
    fn test_load_document_json_and_yaml() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("a.json"), r#"{"name": "json-flow"}"#)?;
        fs::write(dir.path().join("b.yaml"), "name: yaml-flow\n")?;

        assert_eq!(load_document(dir.path().join("a.json"))?["name"], "json-flow");
        assert_eq!(load_document(dir.path().join("b.yaml"))?["name"], "yaml-flow");
        Ok(())
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let result = load_yaml_file("/definitely/not/here.yaml");
        assert!(matches!(result, Err(StepflowError::Config(_))));
    }

    #[test]
    fn test_load_yaml_file() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut temp_file = NamedTempFile::new()?;
        write!(
            temp_file,
            r#"
test: "value"
number: 42
        "#
        )?;

        let json = yaml_to_json(&load_yaml_file(temp_file.path())?)?;
        assert_eq!(json["test"], "value");
        assert_eq!(json["number"], 42);
        Ok(())
    }
}
