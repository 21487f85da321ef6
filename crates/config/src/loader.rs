//! JSON configuration loading with environment overrides.

use std::path::Path;

use anyhow::{Context, bail};
use indoc::indoc;
use serde_json::Value;

use crate::Config;

/// Prefix for environment variables that override configuration keys.
///
/// `RCC_SERVER_PORT=8080` overrides `server.port`; path segments are joined
/// with underscores and matched case-insensitively against camelCase keys.
const ENV_PREFIX: &str = "RCC_";

pub(crate) fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;

    let mut raw: Value = serde_json::from_str(&content)
        .with_context(|| format!("configuration file {} is not valid JSON", path.display()))?;

    apply_env_overrides(&mut raw, std::env::vars());

    let config: Config = serde_json::from_value(raw).context("configuration did not match the expected shape")?;
    validate(&config)?;

    Ok(config)
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    if config.providers.is_empty() {
        bail!(
            "{}",
            indoc! {r#"
                No providers configured. rcc requires at least one upstream provider to route to.

                Example configuration:

                  {
                    "providers": {
                      "openai": {
                        "kind": "openai",
                        "credentialRef": "OPENAI_API_KEY",
                        "models": [{ "name": "gpt-4o", "maxTokens": 128000 }]
                      }
                    }
                  }
            "#}
        );
    }

    for (category_name, category) in &config.routing.categories {
        for entry in category.primary.iter().chain(&category.emergency) {
            let Some(provider) = config.providers.get(&entry.provider) else {
                bail!(
                    "Routing category '{category_name}' references unknown provider '{}'",
                    entry.provider
                );
            };

            if provider.model(&entry.model).is_none() {
                log::warn!(
                    "Routing category '{category_name}' references model '{}' not declared on provider '{}'",
                    entry.model,
                    entry.provider
                );
            }
        }
    }

    for (override_model, category) in &config.routing.classifier.model_overrides {
        if config.routing.category(category).is_none() {
            bail!("Classifier override for '{override_model}' names unknown category '{category}'");
        }
    }

    Ok(())
}

/// Apply `RCC_*` environment variables onto the raw JSON tree.
///
/// Only scalar leaves can be overridden. Values parse as JSON when possible
/// (numbers, booleans) and fall back to plain strings.
fn apply_env_overrides(raw: &mut Value, vars: impl Iterator<Item = (String, String)>) {
    for (key, value) in vars {
        let Some(path) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };

        let segments: Vec<&str> = path.split('_').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            continue;
        }

        if override_path(raw, &segments, &value) {
            log::debug!("configuration override from environment: {key}");
        } else {
            log::warn!("environment override {key} does not match any configuration key");
        }
    }
}

fn override_path(value: &mut Value, segments: &[&str], raw: &str) -> bool {
    let Some(object) = value.as_object_mut() else {
        return false;
    };

    let segment = segments[0];
    let Some(existing_key) = object.keys().find(|k| k.eq_ignore_ascii_case(segment)).cloned() else {
        return false;
    };

    if segments.len() == 1 {
        let parsed = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        object.insert(existing_key, parsed);
        true
    } else {
        object
            .get_mut(&existing_key)
            .is_some_and(|nested| override_path(nested, &segments[1..], raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use std::io::Write;

    fn raw_config() -> Value {
        serde_json::from_str(indoc! {r#"
            {
              "server": { "host": "127.0.0.1", "port": 3456 },
              "pool": { "maxConnections": 100 }
            }
        "#})
        .unwrap()
    }

    #[test]
    fn env_override_replaces_scalar_leaf() {
        let mut raw = raw_config();
        let vars = vec![("RCC_SERVER_PORT".to_string(), "8080".to_string())];

        apply_env_overrides(&mut raw, vars.into_iter());

        assert_eq!(raw["server"]["port"], 8080);
    }

    #[test]
    fn env_override_matches_camel_case_keys() {
        let mut raw = raw_config();
        let vars = vec![("RCC_POOL_MAXCONNECTIONS".to_string(), "3".to_string())];

        apply_env_overrides(&mut raw, vars.into_iter());

        assert_eq!(raw["pool"]["maxConnections"], 3);
    }

    #[test]
    fn env_override_ignores_unknown_paths() {
        let mut raw = raw_config();
        let before = raw.clone();
        let vars = vec![("RCC_SERVER_NOSUCHKEY".to_string(), "1".to_string())];

        apply_env_overrides(&mut raw, vars.into_iter());

        assert_eq!(raw, before);
    }

    #[test]
    fn load_rejects_empty_provider_set() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{}}").unwrap();

        let error = load(file.path()).expect_err("empty config must fail validation");
        assert!(error.to_string().contains("No providers configured"));
    }
}
