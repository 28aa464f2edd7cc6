use std::{collections::HashMap, fmt::Write, path::Path, sync::OnceLock};

use anyhow::bail;
use indoc::indoc;
use regex::Regex;
use serde::Deserialize;
use toml::Value;

use crate::Config;

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref().to_path_buf();
    let content = std::fs::read_to_string(&path)?;
    let mut raw_config: Value = toml::from_str(&content)?;

    expand_env_placeholders(&mut Vec::new(), &mut raw_config)?;

    let config = Config::deserialize(raw_config)?;
    validate_has_providers(&config)?;
    validate_routes(&config)?;

    for warning in provider_warnings(&config) {
        log::warn!("{warning}");
    }

    Ok(config)
}

pub(crate) fn validate_has_providers(config: &Config) -> anyhow::Result<()> {
    if !config.relay.enabled {
        return Ok(());
    }

    if !config.relay.has_providers() {
        bail!(indoc! {r#"
            No upstream providers configured. The relay requires at least one provider to function.

            Example configuration:

              [relay.providers.openai]
              type = "openai"
              api_key = "{{ env.OPENAI_API_KEY }}"
              models = ["gpt-4o"]
        "#});
    }

    if !config.relay.path.starts_with('/') {
        bail!("Relay path must start with '/', got '{}'", config.relay.path);
    }

    if config.relay.stream_buffer == 0 {
        bail!("relay.stream_buffer must be greater than zero");
    }

    Ok(())
}

/// Every model route may belong to a single provider only.
pub(crate) fn validate_routes(config: &Config) -> anyhow::Result<()> {
    let mut owners: HashMap<&str, &str> = HashMap::new();

    for (provider_name, provider) in &config.relay.providers {
        for route in &provider.models {
            if let Some(owner) = owners.insert(route.as_str(), provider_name.as_str()) {
                bail!("Model route '{route}' is configured for both '{owner}' and '{provider_name}' providers");
            }
        }
    }

    Ok(())
}

fn provider_warnings(config: &Config) -> Vec<String> {
    config
        .relay
        .providers
        .iter()
        .filter(|(_, provider)| provider.models.is_empty())
        .map(|(name, _)| format!("Provider '{name}' has no model routes configured and will never receive requests"))
        .collect()
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*env\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern is valid")
    })
}

fn expand_string(input: &str) -> Result<String, String> {
    let mut output = String::with_capacity(input.len());
    let mut last = 0;

    for captures in placeholder().captures_iter(input) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };

        let value = std::env::var(name.as_str())
            .map_err(|_| format!("environment variable '{}' is not set", name.as_str()))?;

        output.push_str(&input[last..whole.start()]);
        output.push_str(&value);
        last = whole.end();
    }

    output.push_str(&input[last..]);

    Ok(output)
}

fn expand_env_placeholders<'a>(path: &mut Vec<Result<&'a str, usize>>, value: &'a mut Value) -> anyhow::Result<()> {
    match value {
        Value::String(s) => match expand_string(s) {
            Ok(out) => *s = out,
            Err(err) => {
                let mut p = String::new();

                for segment in path.iter() {
                    match segment {
                        Ok(s) => {
                            p.push_str(s);
                            p.push('.');
                        }
                        Err(i) => write!(p, "[{i}]")?,
                    }
                }

                if p.ends_with('.') {
                    p.pop();
                }

                bail!("Failed to expand environment variable at path '{p}': {err}");
            }
        },
        Value::Array(values) => {
            for (i, value) in values.iter_mut().enumerate() {
                path.push(Err(i));
                expand_env_placeholders(path, value)?;
                path.pop();
            }
        }
        Value::Table(map) => {
            for (key, value) in map {
                path.push(Ok(key.as_str()));
                expand_env_placeholders(path, value)?;
                path.pop();
            }
        }
        Value::Integer(_) | Value::Float(_) | Value::Boolean(_) | Value::Datetime(_) => (),
    }

    Ok(())
}
