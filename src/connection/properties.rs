//! Session property parsing.
//!
//! Session properties are supplied as `key:value` tokens (typically from the
//! command line) and are sent to the server as call headers.

use crate::error::ConfigError;
use std::fmt;
use std::str::FromStr;

/// A single `key:value` session property.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionProperty {
    key: String,
    value: String,
}

impl SessionProperty {
    /// Create a session property from an already split key and value.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Get the property key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the property value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Consume the property into its key and value.
    pub fn into_parts(self) -> (String, String) {
        (self.key, self.value)
    }
}

impl FromStr for SessionProperty {
    type Err = ConfigError;

    /// Parse a `key:value` token.
    ///
    /// The first colon separates key from value; any further colons belong to
    /// the value.
    ///
    /// ```
    /// # use adhoc_flight::connection::SessionProperty;
    /// let prop: SessionProperty = "schema:$scratch".parse()?;
    /// assert_eq!(prop.key(), "schema");
    /// assert_eq!(prop.value(), "$scratch");
    ///
    /// let prop: SessionProperty = "url:http://host:9047".parse()?;
    /// assert_eq!(prop.value(), "http://host:9047");
    /// # Ok::<(), adhoc_flight::error::ConfigError>(())
    /// ```
    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token.split_once(':') {
            Some((key, value)) if !key.is_empty() => Ok(Self::new(key, value)),
            _ => Err(ConfigError::MalformedProperty {
                token: token.to_string(),
            }),
        }
    }
}

impl fmt::Display for SessionProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

/// Parse an ordered list of `key:value` tokens.
///
/// Input order is preserved. An empty input yields an empty list; the first
/// token without a colon (or with an empty key) fails the whole parse.
pub fn parse_session_properties<I, S>(tokens: I) -> Result<Vec<SessionProperty>, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tokens
        .into_iter()
        .map(|token| token.as_ref().parse())
        .collect()
}
