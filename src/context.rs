//! String-interpolation context for configuration fields and script
//! fragments.
//!
//! The context is an immutable snapshot taken once per resolve/launch
//! call: environment variables, the current timestamp, a fresh run id,
//! and the working directory, plus any user extras. Two sequential runs
//! therefore see distinct ids and timestamps. Tests construct a fixed
//! context so composition stays deterministic.

use std::collections::BTreeMap;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use uuid::Uuid;

use crate::config::ConfigError;

/// Timestamp rendering used for a bare `{now}` placeholder.
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H%M%S";

/// Immutable interpolation context.
///
/// Placeholders have the form `{name}`, with two special names: `{now}`
/// (optionally `{now:%H%M}` with a strftime spec) and `{uuid}` (the run
/// id). Literal braces are written `{{` and `}}`. Every other name is
/// looked up in the value table, which carries `env.NAME` entries for
/// the environment snapshot, `cwd`, `pypaths.host`/`pypaths.container`
/// once mounts are known, and user extras.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Context {
    timestamp: DateTime<Local>,
    run_id: String,
    values: BTreeMap<String, String>,
}

impl Context {
    /// Captures a fresh context from the live process environment.
    #[must_use]
    pub fn capture(extras: &BTreeMap<String, String>) -> Self {
        let mut values = BTreeMap::new();
        for (key, value) in std::env::vars() {
            values.insert(format!("env.{key}"), value);
        }
        let cwd = std::env::current_dir()
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_default();
        values.insert(String::from("cwd"), cwd);
        for (key, value) in extras {
            values.insert(key.clone(), value.clone());
        }
        Self {
            timestamp: Local::now(),
            run_id: Uuid::new_v4().simple().to_string(),
            values,
        }
    }

    /// Builds a context from fixed parts. Intended for tests that need
    /// deterministic rendering.
    #[must_use]
    pub fn fixed(
        timestamp: DateTime<Local>,
        run_id: impl Into<String>,
        values: BTreeMap<String, String>,
    ) -> Self {
        Self {
            timestamp,
            run_id: run_id.into(),
            values,
        }
    }

    /// Returns the run id substituted for `{uuid}`.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Returns the timestamp substituted for `{now}`.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    /// Returns a copy of this context with the Python-path aggregates
    /// filled in from the resolved mount set.
    #[must_use]
    pub fn with_pypaths(mut self, host: &str, container: &str) -> Self {
        self.values
            .insert(String::from("pypaths.host"), host.to_owned());
        self.values
            .insert(String::from("pypaths.container"), container.to_owned());
        self
    }

    /// Returns a copy of this context with one extra value.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Looks up a plain value by name.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Renders `template`, substituting every placeholder.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnresolvedPlaceholder`] for an unknown or
    /// unterminated placeholder and
    /// [`ConfigError::InvalidTimestampFormat`] for a bad `{now:..}`
    /// spec.
    pub fn render(&self, template: &str) -> Result<String, ConfigError> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut token = String::new();
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        if inner == '}' {
                            closed = true;
                            break;
                        }
                        token.push(inner);
                    }
                    if !closed {
                        return Err(ConfigError::UnresolvedPlaceholder { placeholder: token });
                    }
                    out.push_str(&self.expand(&token)?);
                }
                other => out.push(other),
            }
        }
        Ok(out)
    }

    fn expand(&self, token: &str) -> Result<String, ConfigError> {
        let (name, spec) = match token.split_once(':') {
            Some((name, spec)) => (name, Some(spec)),
            None => (token, None),
        };
        match name {
            "now" => self.format_timestamp(spec.unwrap_or(DEFAULT_TIMESTAMP_FORMAT)),
            "uuid" => Ok(self.run_id.clone()),
            _ => self
                .values
                .get(name)
                .cloned()
                .ok_or_else(|| ConfigError::UnresolvedPlaceholder {
                    placeholder: name.to_owned(),
                }),
        }
    }

    fn format_timestamp(&self, spec: &str) -> Result<String, ConfigError> {
        let items: Vec<Item<'_>> = StrftimeItems::new(spec).collect();
        if items.iter().any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::InvalidTimestampFormat {
                spec: spec.to_owned(),
            });
        }
        Ok(self.timestamp.format_with_items(items.into_iter()).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_context() -> Context {
        let timestamp = Local
            .with_ymd_and_hms(2024, 5, 17, 13, 45, 9)
            .single()
            .unwrap_or_else(|| panic!("timestamp should be unambiguous"));
        let mut values = BTreeMap::new();
        values.insert(String::from("cwd"), String::from("/work"));
        values.insert(String::from("env.USER"), String::from("ada"));
        values.insert(String::from("project"), String::from("demo"));
        Context::fixed(timestamp, "cafef00d", values)
    }

    #[test]
    fn renders_plain_values_and_uuid() {
        let ctx = fixed_context();
        let rendered = ctx
            .render("{project}-{uuid} in {cwd} by {env.USER}")
            .unwrap_or_else(|err| panic!("render: {err}"));
        assert_eq!(rendered, "demo-cafef00d in /work by ada");
    }

    #[test]
    fn renders_timestamp_with_and_without_spec() {
        let ctx = fixed_context();
        assert_eq!(
            ctx.render("{now}").unwrap_or_else(|err| panic!("{err}")),
            "2024-05-17-134509"
        );
        assert_eq!(
            ctx.render("{now:%H%M}")
                .unwrap_or_else(|err| panic!("{err}")),
            "1345"
        );
    }

    #[test]
    fn escaped_braces_stay_literal() {
        let ctx = fixed_context();
        let rendered = ctx
            .render("awk '{{print $2}}'")
            .unwrap_or_else(|err| panic!("render: {err}"));
        assert_eq!(rendered, "awk '{print $2}'");
    }

    #[test]
    fn unknown_placeholder_is_an_error() {
        let ctx = fixed_context();
        let err = ctx
            .render("{missing}")
            .expect_err("unknown placeholder should fail");
        assert!(matches!(
            err,
            ConfigError::UnresolvedPlaceholder { ref placeholder } if placeholder == "missing"
        ));
    }

    #[test]
    fn unterminated_placeholder_is_an_error() {
        let ctx = fixed_context();
        assert!(matches!(
            ctx.render("{project"),
            Err(ConfigError::UnresolvedPlaceholder { .. })
        ));
    }

    #[test]
    fn invalid_timestamp_spec_is_an_error() {
        let ctx = fixed_context();
        assert!(matches!(
            ctx.render("{now:%Q}"),
            Err(ConfigError::InvalidTimestampFormat { .. })
        ));
    }

    #[test]
    fn capture_produces_distinct_run_ids() {
        let extras = BTreeMap::new();
        let first = Context::capture(&extras);
        let second = Context::capture(&extras);
        assert_ne!(first.run_id(), second.run_id());
    }
}
