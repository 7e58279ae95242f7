//! Late resolution of `$VAR` placeholders in header and env values.
//!
//! Supported forms: `$VAR`, `$env:VAR`, `${VAR}`, `${VAR:-default}`.
//! Resolution happens at transport-creation time; malformed placeholders are
//! rejected rather than passed through.

use crate::error::{McpError, McpResult};
use std::collections::HashMap;

/// Environment lookup, injectable for testing.
pub trait EnvLookup: Send + Sync {
    /// Get an environment variable.
    fn get(&self, key: &str) -> Option<String>;
}

/// Production lookup reading the process environment.
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Lookup backed by a fixed map.
#[derive(Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

impl EnvLookup for MapEnv {
    fn get(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Resolve all placeholders in a value.
pub fn resolve(input: &str, env: &dyn EnvLookup) -> McpResult<String> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek().map(|(_, c)| *c) {
            Some('{') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(McpError::invalid_config(format!(
                        "unterminated placeholder at offset {pos} in '{input}'"
                    )));
                }
                let (var, default) = match name.split_once(":-") {
                    Some((var, default)) => (var.to_string(), Some(default.to_string())),
                    None => (name, None),
                };
                if var.is_empty() || !var.chars().all(is_ident_char) {
                    return Err(McpError::invalid_config(format!(
                        "malformed placeholder '${{{var}}}' in '{input}'"
                    )));
                }
                match env.get(&var) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(default.as_deref().unwrap_or("")),
                }
            }
            Some(c) if is_ident_char(c) => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if is_ident_char(*c) {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                // `$env:VAR` spelling
                if name == "env" && matches!(chars.peek(), Some((_, ':'))) {
                    chars.next();
                    name.clear();
                    while let Some((_, c)) = chars.peek() {
                        if is_ident_char(*c) {
                            name.push(*c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if name.is_empty() {
                        return Err(McpError::invalid_config(format!(
                            "malformed placeholder '$env:' in '{input}'"
                        )));
                    }
                }
                out.push_str(&env.get(&name).unwrap_or_default());
            }
            _ => {
                return Err(McpError::invalid_config(format!(
                    "dangling '$' at offset {pos} in '{input}'"
                )));
            }
        }
    }

    Ok(out)
}

/// Resolve every value of a map, dropping entries that resolve to blank.
pub fn resolve_map(
    map: &HashMap<String, String>,
    env: &dyn EnvLookup,
) -> McpResult<HashMap<String, String>> {
    let mut out = HashMap::with_capacity(map.len());
    for (key, value) in map {
        let resolved = resolve(value, env)?;
        if resolved.trim().is_empty() {
            continue;
        }
        out.insert(key.clone(), resolved);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> MapEnv {
        MapEnv::new()
            .with_var("TOKEN", "secret")
            .with_var("HOST", "api.example.com")
            .with_var("EMPTY", "")
    }

    #[test]
    fn test_plain_text_passes_through() {
        assert_eq!(resolve("no placeholders", &env()).unwrap(), "no placeholders");
    }

    #[test]
    fn test_dollar_var() {
        assert_eq!(resolve("Bearer $TOKEN", &env()).unwrap(), "Bearer secret");
    }

    #[test]
    fn test_env_prefixed_var() {
        assert_eq!(resolve("Bearer $env:TOKEN", &env()).unwrap(), "Bearer secret");
    }

    #[test]
    fn test_braced_var() {
        assert_eq!(resolve("https://${HOST}/v1", &env()).unwrap(), "https://api.example.com/v1");
    }

    #[test]
    fn test_braced_default_used_when_unset() {
        assert_eq!(resolve("${MISSING:-fallback}", &env()).unwrap(), "fallback");
    }

    #[test]
    fn test_braced_default_ignored_when_set() {
        assert_eq!(resolve("${TOKEN:-fallback}", &env()).unwrap(), "secret");
    }

    #[test]
    fn test_missing_var_resolves_empty() {
        assert_eq!(resolve("x$MISSING/y", &env()).unwrap(), "x/y");
    }

    #[test]
    fn test_unterminated_brace_rejected() {
        assert!(resolve("${TOKEN", &env()).is_err());
    }

    #[test]
    fn test_dangling_dollar_rejected() {
        assert!(resolve("cost: $ 5", &env()).is_err());
        assert!(resolve("ends with $", &env()).is_err());
    }

    #[test]
    fn test_malformed_braced_name_rejected() {
        assert!(resolve("${BAD NAME}", &env()).is_err());
        assert!(resolve("${}", &env()).is_err());
    }

    #[test]
    fn test_env_prefix_requires_name() {
        assert!(resolve("$env:", &env()).is_err());
    }

    #[test]
    fn test_resolve_map_drops_blanks() {
        let mut map = HashMap::new();
        map.insert("Authorization".to_string(), "Bearer $TOKEN".to_string());
        map.insert("X-Blank".to_string(), "$EMPTY".to_string());
        map.insert("X-Missing".to_string(), "$MISSING".to_string());

        let resolved = resolve_map(&map, &env()).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved.get("Authorization").unwrap(), "Bearer secret");
    }

    #[test]
    fn test_resolve_map_propagates_errors() {
        let mut map = HashMap::new();
        map.insert("X-Bad".to_string(), "${OOPS".to_string());
        assert!(resolve_map(&map, &env()).is_err());
    }
}
