//! Indirect secret references in test plans.
//!
//! A plan never embeds a credential directly: it either carries an opaque
//! literal (redacted on serialization) or a `{type, id}` reference resolved
//! at use time. The `env` resolver is the only built-in; callers can supply
//! their own [`SecretResolver`] without any change to the plan schema.

use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Errors raised while resolving secret references.
#[derive(Error, Debug)]
pub enum SecretError {
    /// The resolver had no value for the identifier.
    #[error("secret `{0}` could not be resolved")]
    NotFound(String),
}

/// Resolves a secret identifier to its value.
pub trait SecretResolver: Send + Sync {
    /// Resolve `id`, returning `None` when unknown.
    fn resolve(&self, id: &str) -> Option<String>;
}

/// Built-in resolver reading the process environment at use time.
pub struct EnvResolver;

impl SecretResolver for EnvResolver {
    fn resolve(&self, id: &str) -> Option<String> {
        std::env::var(id).ok()
    }
}

/// The kind of secret store a [`SecretRef`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecretSource {
    /// Resolve the identifier against the process environment.
    #[default]
    Env,
}

/// A `{type, id}` descriptor for a secret fetched at use time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    /// Which store to resolve against.
    #[serde(rename = "type", default)]
    pub source: SecretSource,
    /// The public identifier used to fetch the secret.
    pub id: String,
}

/// An opaque literal secret. Serializes and debugs redacted.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

const REDACTED: &str = "**********";

impl SecretString {
    /// Wrap a literal value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the wrapped value.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl Serialize for SecretString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

/// A secret-bearing plan field: either a reference or an inline literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SecretValue {
    /// A `{type, id}` reference resolved at use time.
    Reference(SecretRef),
    /// An inline literal, redacted on serialization.
    Literal(SecretString),
}

impl SecretValue {
    /// Resolve this value with the built-in resolver set.
    pub fn resolve(&self) -> Result<String, SecretError> {
        self.resolve_with(&EnvResolver)
    }

    /// Resolve this value, using `resolver` for references.
    pub fn resolve_with(&self, resolver: &dyn SecretResolver) -> Result<String, SecretError> {
        match self {
            Self::Literal(literal) => Ok(literal.expose().to_string()),
            Self::Reference(reference) => resolver
                .resolve(&reference.id)
                .ok_or_else(|| SecretError::NotFound(reference.id.clone())),
        }
    }
}

impl From<&str> for SecretValue {
    fn from(value: &str) -> Self {
        Self::Literal(SecretString::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_resolves_to_itself() {
        let value = SecretValue::from("hunter2");
        assert_eq!(value.resolve().expect("resolve"), "hunter2");
    }

    #[test]
    fn env_reference_resolves_at_use_time() {
        std::env::set_var("YCHAOS_TEST_SECRET", "tops3cret");
        let value: SecretValue =
            serde_yaml::from_str("{type: env, id: YCHAOS_TEST_SECRET}").expect("parse");
        assert_eq!(value.resolve().expect("resolve"), "tops3cret");
    }

    #[test]
    fn missing_reference_is_an_error() {
        let value = SecretValue::Reference(SecretRef {
            source: SecretSource::Env,
            id: "YCHAOS_TEST_SECRET_MISSING".into(),
        });
        assert!(matches!(value.resolve(), Err(SecretError::NotFound(_))));
    }

    #[test]
    fn literal_never_appears_in_dumps() {
        let value = SecretValue::from("hunter2");
        let dumped = serde_yaml::to_string(&value).expect("dump");
        assert!(!dumped.contains("hunter2"));
        assert!(format!("{value:?}").contains("**********"));
    }

    struct MapResolver;

    impl SecretResolver for MapResolver {
        fn resolve(&self, id: &str) -> Option<String> {
            (id == "token").then(|| "from-vault".to_string())
        }
    }

    #[test]
    fn custom_resolver_plugs_in_without_schema_changes() {
        let value: SecretValue = serde_yaml::from_str("{id: token}").expect("parse");
        assert_eq!(value.resolve_with(&MapResolver).expect("resolve"), "from-vault");
    }
}
