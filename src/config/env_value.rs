// ABOUTME: Service environment values from rollout.yml, resolved against the deploying shell.
// ABOUTME: Strings may interpolate ${VAR} or ${VAR:-default}; an {env, default} map reads one variable.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    /// Text with `${VAR}` references expanded; `$$` writes a single `$`.
    Literal(String),
    FromEnv {
        #[serde(rename = "env")]
        var: String,
        #[serde(default)]
        default: Option<String>,
    },
}

enum Unresolved {
    Unset(String),
    Malformed(String),
}

fn is_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Expand `${VAR}`, `${VAR:-default}` and `$$` in `text`.
///
/// `:-` falls back when the variable is unset or empty. A `$` not followed by
/// `{` or `$` is kept as written.
fn interpolate<F>(text: &str, lookup: &F) -> std::result::Result<String, Unresolved>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(at) = rest.find('$') {
        out.push_str(&rest[..at]);
        let after = &rest[at + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
            continue;
        }
        let Some(body) = after.strip_prefix('{') else {
            out.push('$');
            rest = after;
            continue;
        };

        let end = body
            .find('}')
            .ok_or_else(|| Unresolved::Malformed(format!("unclosed `${{` in `{}`", text)))?;
        let (name, default) = match body[..end].split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (&body[..end], None),
        };
        if !is_var_name(name) {
            return Err(Unresolved::Malformed(format!(
                "`{}` is not a variable name in `{}`",
                name, text
            )));
        }

        let value = lookup(name).filter(|v| default.is_none() || !v.is_empty());
        match value.or_else(|| default.map(str::to_string)) {
            Some(value) => out.push_str(&value),
            None => return Err(Unresolved::Unset(name.to_string())),
        }
        rest = &body[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

impl EnvValue {
    /// Resolve the value set for `key`, reading variables through `lookup`.
    pub fn resolve_with<F>(&self, key: &str, lookup: &F) -> Result<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let resolved = match self {
            EnvValue::Literal(text) => interpolate(text, lookup),
            EnvValue::FromEnv { var, default } => lookup(var)
                .or_else(|| default.clone())
                .ok_or_else(|| Unresolved::Unset(var.clone())),
        };
        resolved.map_err(|e| match e {
            Unresolved::Unset(var) => Error::MissingEnvVar {
                key: key.to_string(),
                var,
            },
            Unresolved::Malformed(reason) => {
                Error::InvalidConfig(format!("env {}: {}", key, reason))
            }
        })
    }
}

/// Resolve every value from the process environment.
pub fn resolve_env_map(map: &BTreeMap<String, EnvValue>) -> Result<BTreeMap<String, String>> {
    resolve_env_map_with(map, &|var| std::env::var(var).ok())
}

/// Resolve every value through `lookup`, failing on the first unset variable without a default.
pub fn resolve_env_map_with<F>(
    map: &BTreeMap<String, EnvValue>,
    lookup: &F,
) -> Result<BTreeMap<String, String>>
where
    F: Fn(&str) -> Option<String>,
{
    map.iter()
        .map(|(key, value)| Ok((key.clone(), value.resolve_with(key, lookup)?)))
        .collect()
}
