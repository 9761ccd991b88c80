//! Startup parameters handed from the parent to the worker.
//!
//! The parameters are an ordered list of `(key, value)` string pairs. On the command line they
//! travel as one opaque token: the list as JSON, then base64 (URL-safe alphabet, no padding) so
//! the token never contains shell-significant characters.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

/// Session id shared by both channel endpoints.
pub const SESSION_ID: &str = "session_id";
/// Name of the message serializer the worker must construct.
pub const SERIALIZER: &str = "serializer";
/// Registry key of the hosted type.
pub const HOSTED_TYPE: &str = "hosted_type";
/// Socket directory when filesystem sockets are used. Absent means abstract namespace.
pub const CHANNEL_DIR: &str = "channel_dir";
pub const CONNECT_TIMEOUT_MS: &str = "connect_timeout_ms";
pub const SHUTDOWN_GRACE_MS: &str = "shutdown_grace_ms";
pub const MAX_FRAME_LENGTH: &str = "max_frame_length";

#[derive(Debug, thiserror::Error)]
pub enum StartupParametersError {
    #[error("no startup token on the command line")]
    MissingToken,

    #[error("startup token is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("startup token is not a parameter list: {0}")]
    Json(#[from] serde_json::Error),

    #[error("required startup parameter '{0}' is missing")]
    MissingKey(&'static str),

    #[error("startup parameter '{key}' has invalid value '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

/// Ordered `(key, value)` pairs. Duplicate keys are kept; lookups return the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StartupParameters(Vec<(String, String)>);

impl StartupParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(key, value);
        self
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn require(&self, key: &'static str) -> Result<&str, StartupParametersError> {
        self.get(key).ok_or(StartupParametersError::MissingKey(key))
    }

    /// Optional duration stored as whole milliseconds.
    pub fn duration_ms(&self, key: &'static str) -> Result<Option<Duration>, StartupParametersError> {
        self.get(key)
            .map(|v| {
                v.parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|_| StartupParametersError::InvalidValue {
                        key,
                        value: v.to_string(),
                    })
            })
            .transpose()
    }

    pub fn usize(&self, key: &'static str) -> Result<Option<usize>, StartupParametersError> {
        self.get(key)
            .map(|v| {
                v.parse::<usize>()
                    .map_err(|_| StartupParametersError::InvalidValue {
                        key,
                        value: v.to_string(),
                    })
            })
            .transpose()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode as a single command-line argument.
    pub fn to_token(&self) -> Result<String, StartupParametersError> {
        let json = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn from_token(token: &str) -> Result<Self, StartupParametersError> {
        let json = URL_SAFE_NO_PAD.decode(token.trim())?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Parse the token from a process argument list (program name first). The token is the
    /// last argument.
    pub fn from_args<I, S>(args: I) -> Result<Self, StartupParametersError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let token = args
            .into_iter()
            .skip(1)
            .last()
            .ok_or(StartupParametersError::MissingToken)?;
        Self::from_token(token.as_ref())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StartupParameters {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_wins() {
        let params = StartupParameters::new()
            .with("mode", "first")
            .with("other", "x")
            .with("mode", "second");
        assert_eq!(params.get("mode"), Some("first"));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn token_roundtrip_preserves_order_and_duplicates() {
        let params: StartupParameters = [
            (SESSION_ID, "abc"),
            (SERIALIZER, "json"),
            ("extra", "with spaces & 'quotes'"),
            ("extra", "dup"),
        ]
        .into_iter()
        .collect();

        let token = params.to_token().unwrap();
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );

        let parsed = StartupParameters::from_token(&token).unwrap();
        assert_eq!(parsed, params);
        let keys: Vec<_> = parsed.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![SESSION_ID, SERIALIZER, "extra", "extra"]);
    }

    #[test]
    fn from_args_takes_last_argument() {
        let token = StartupParameters::new()
            .with(SESSION_ID, "s1")
            .to_token()
            .unwrap();
        let parsed =
            StartupParameters::from_args(["worker", "--flag", token.as_str()]).unwrap();
        assert_eq!(parsed.get(SESSION_ID), Some("s1"));
    }

    #[test]
    fn from_args_without_token_fails() {
        let err = StartupParameters::from_args(["worker"]).unwrap_err();
        assert!(matches!(err, StartupParametersError::MissingToken));
    }

    #[test]
    fn malformed_token_fails() {
        assert!(matches!(
            StartupParameters::from_token("!!!"),
            Err(StartupParametersError::Base64(_))
        ));
        let not_a_list = URL_SAFE_NO_PAD.encode(b"{\"a\":1}");
        assert!(matches!(
            StartupParameters::from_token(&not_a_list),
            Err(StartupParametersError::Json(_))
        ));
    }

    #[test]
    fn typed_lookups() {
        let params = StartupParameters::new()
            .with(CONNECT_TIMEOUT_MS, "250")
            .with(MAX_FRAME_LENGTH, "nope");
        assert_eq!(
            params.duration_ms(CONNECT_TIMEOUT_MS).unwrap(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(params.duration_ms(SHUTDOWN_GRACE_MS).unwrap(), None);
        assert!(params.usize(MAX_FRAME_LENGTH).is_err());
        assert!(matches!(
            params.require(HOSTED_TYPE),
            Err(StartupParametersError::MissingKey(HOSTED_TYPE))
        ));
    }
}
