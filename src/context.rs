//! Generator context preparation.
//!
//! Fills context variables from template defaults, decrypts variables the
//! template flags as encrypted, and expands `{{key}}` placeholders in URLs and
//! header values.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::crypto::{decrypt_context_value, derive_context_key};
use crate::error::CollectorError;
use crate::models::Generator;

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

fn placeholder_regex() -> &'static Regex {
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_$][A-Za-z0-9_$.\-]*)\s*\}\}")
            .unwrap_or_else(|_| unreachable!("placeholder pattern is a valid regex"))
    })
}

/// Fill context keys the generator does not set from the template defaults.
pub fn apply_defaults(generator: &mut Generator) {
    for (key, definition) in &generator.generator_template.context_definition {
        if !generator.context.contains_key(key)
            && let Some(default) = &definition.default
        {
            generator.context.insert(key.clone(), default.clone());
        }
    }
}

/// Populate defaults and decrypt encrypted values in `generator.context`.
///
/// `timestamp` is the heartbeat timestamp the control plane used when
/// encrypting. Decryption needs both it and the generator's `token`.
pub fn prepare_context(
    generator: &mut Generator,
    timestamp: Option<&str>,
) -> Result<(), CollectorError> {
    apply_defaults(generator);
    let definitions = generator.generator_template.context_definition.clone();

    let encrypted: Vec<&String> = definitions
        .iter()
        .filter(|(key, definition)| definition.encrypted && generator.context.contains_key(*key))
        .map(|(key, _)| key)
        .collect();
    if encrypted.is_empty() {
        return Ok(());
    }

    let token = generator
        .token
        .as_deref()
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            CollectorError::validation(format!(
                "generator {} has encrypted context but no collector token",
                generator.name
            ))
        })?;
    let timestamp = timestamp.ok_or_else(|| {
        CollectorError::validation(format!(
            "cannot decrypt context for generator {} without a heartbeat timestamp",
            generator.name
        ))
    })?;
    let key = derive_context_key(token, timestamp);

    for variable in encrypted {
        let Some(Value::String(ciphertext)) = generator.context.get(variable) else {
            warn!(
                generator = %generator.name,
                variable = %variable,
                "Encrypted context variable is not a string; leaving as-is"
            );
            continue;
        };
        let plaintext = decrypt_context_value(&key, variable, ciphertext).map_err(|err| {
            CollectorError::validation(format!(
                "failed to decrypt context variable {} for generator {}: {}",
                variable, generator.name, err
            ))
        })?;
        generator
            .context
            .insert(variable.clone(), Value::String(plaintext));
        debug!(generator = %generator.name, variable = %variable, "Decrypted context variable");
    }

    Ok(())
}

/// Expand `{{key}}` placeholders in `template`.
///
/// A bare key is looked up in `ctx` first and then in `args`; dotted keys
/// such as `subject.absolutePath` walk into `args`.
pub fn expand_template(
    template: &str,
    ctx: &Map<String, Value>,
    args: &Map<String, Value>,
) -> Result<String, CollectorError> {
    let mut missing = None;
    let expanded = placeholder_regex().replace_all(template, |caps: &Captures<'_>| {
        let key = &caps[1];
        match lookup(key, ctx, args) {
            Some(value) => value,
            None => {
                missing.get_or_insert_with(|| key.to_string());
                String::new()
            }
        }
    });

    if let Some(key) = missing {
        return Err(CollectorError::validation(format!(
            "Unresolved template variable: {}",
            key
        )));
    }
    Ok(expanded.into_owned())
}

fn lookup(key: &str, ctx: &Map<String, Value>, args: &Map<String, Value>) -> Option<String> {
    let mut segments = key.split('.');
    let first = segments.next()?;
    let root = ctx.get(first).or_else(|| args.get(first))?;

    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    match current {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::encrypt_context_value;
    use serde_json::json;

    fn generator(value: Value) -> Generator {
        Generator::from_value(&value).unwrap()
    }

    #[test]
    fn test_defaults_fill_missing_keys_only() {
        let mut generator = generator(json!({
            "name": "g",
            "context": {"port": 9000},
            "generatorTemplate": {
                "contextDefinition": {
                    "port": {"default": 80},
                    "path": {"default": "/status"}
                }
            }
        }));

        prepare_context(&mut generator, None).unwrap();
        assert_eq!(generator.context.get("port"), Some(&json!(9000)));
        assert_eq!(generator.context.get("path"), Some(&json!("/status")));
    }

    #[test]
    fn test_encrypted_values_are_decrypted() {
        let key = derive_context_key("tok", "1700000000000");
        let secret = encrypt_context_value(&key, "password", "hunter2").unwrap();
        let mut generator = generator(json!({
            "name": "g",
            "token": "tok",
            "context": {"password": secret},
            "generatorTemplate": {
                "contextDefinition": {"password": {"encrypted": true}}
            }
        }));

        prepare_context(&mut generator, Some("1700000000000")).unwrap();
        assert_eq!(generator.context.get("password"), Some(&json!("hunter2")));
    }

    #[test]
    fn test_encrypted_without_token_is_validation_error() {
        let mut generator = generator(json!({
            "name": "g",
            "context": {"password": "abc"},
            "generatorTemplate": {
                "contextDefinition": {"password": {"encrypted": true}}
            }
        }));

        let err = prepare_context(&mut generator, Some("1")).unwrap_err();
        assert_eq!(err.name(), "ValidationError");
    }

    #[test]
    fn test_expand_template_from_ctx_and_args() {
        let ctx = json!({"host": "example.com", "port": 8080});
        let args = json!({"subject": {"absolutePath": "Root.A"}});
        let url = expand_template(
            "https://{{host}}:{{ port }}/q?s={{subject.absolutePath}}",
            ctx.as_object().unwrap(),
            args.as_object().unwrap(),
        )
        .unwrap();
        assert_eq!(url, "https://example.com:8080/q?s=Root.A");
    }

    #[test]
    fn test_expand_template_reports_unresolved_key() {
        let err = expand_template("https://{{missing}}/", &Map::new(), &Map::new()).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_expand_template_without_placeholders_is_identity() {
        let url = expand_template("https://example.com/a", &Map::new(), &Map::new()).unwrap();
        assert_eq!(url, "https://example.com/a");
    }
}
