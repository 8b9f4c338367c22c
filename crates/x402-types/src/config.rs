//! Configuration helpers shared by the x402 crates.
//!
//! The [`LiteralOrEnv`] wrapper lets a configuration value be written either
//! literally or as a reference to an environment variable:
//!
//! ```json
//! {
//!   "rpc": "https://api.devnet.solana.com",   // Literal value
//!   "signer": "$FACILITATOR_PRIVATE_KEY",     // Simple env var
//!   "defaultRecipient": "${FACILITATOR_WALLET}"  // Braced env var
//! }
//! ```
//!
//! Secrets stay out of configuration files while still being loaded at runtime.

use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::str::FromStr;

/// A transparent wrapper that resolves environment variables during deserialization.
///
/// Supports both literal values and environment variable references:
/// - Literal: `"5Kd3..."`
/// - Simple env var: `"$FACILITATOR_PRIVATE_KEY"`
/// - Braced env var: `"${FACILITATOR_PRIVATE_KEY}"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn from_literal(value: T) -> Self {
        Self(value)
    }

    pub fn inner(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }

    /// Returns the variable name if the string matches `$VAR` or `${VAR}` syntax.
    fn parse_env_var_syntax(s: &str) -> Option<&str> {
        if let Some(braced) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
            return Some(braced);
        }
        let name = s.strip_prefix('$')?;
        let valid = !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_');
        valid.then_some(name)
    }
}

impl<T: FromStr> LiteralOrEnv<T>
where
    T::Err: std::fmt::Display,
{
    /// Resolves `value` the same way deserialization does.
    pub fn resolve(value: &str) -> Result<Self, String> {
        let resolved = match Self::parse_env_var_syntax(value) {
            Some(var_name) => std::env::var(var_name).map_err(|_| {
                format!("Environment variable '{var_name}' not found (referenced as '{value}')")
            })?,
            None => value.to_string(),
        };
        resolved
            .parse::<T>()
            .map(LiteralOrEnv)
            .map_err(|e| format!("Failed to parse value: {e}"))
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::resolve(&s).map_err(serde::de::Error::custom)
    }
}

impl<T: Serialize> Serialize for LiteralOrEnv<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_values_pass_through() {
        let v: LiteralOrEnv<u16> = serde_json::from_str("\"8403\"").unwrap();
        assert_eq!(*v, 8403);
    }

    #[test]
    fn env_references_resolve() {
        // SAFETY: test-local variable name, not read concurrently elsewhere.
        unsafe { std::env::set_var("X402_TYPES_TEST_PORT", "9000") };
        let simple: LiteralOrEnv<u16> = serde_json::from_str("\"$X402_TYPES_TEST_PORT\"").unwrap();
        let braced: LiteralOrEnv<u16> =
            serde_json::from_str("\"${X402_TYPES_TEST_PORT}\"").unwrap();
        assert_eq!(*simple, 9000);
        assert_eq!(*braced, 9000);
    }

    #[test]
    fn missing_env_is_an_error() {
        let err = serde_json::from_str::<LiteralOrEnv<String>>("\"$X402_TYPES_DEFINITELY_UNSET\"")
            .unwrap_err();
        assert!(err.to_string().contains("X402_TYPES_DEFINITELY_UNSET"));
    }
}
