use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::DriverError;

/// Hot Rod port used when the URL names a host without one
pub const DEFAULT_PORT: &str = "11222";

/// Connection property names understood by the driver
pub mod keys {
    pub const HOST: &str = "host";
    pub const PORT: &str = "port";
    pub const CACHE: &str = "cache";
    pub const USERNAME: &str = "username";
    pub const PASSWORD: &str = "password";
    pub const SASL_MECHANISM: &str = "saslMechanism";
    pub const AUTHENTICATION_REALM: &str = "authenticationRealm";
    pub const AUTHENTICATION_SERVER_NAME: &str = "authenticationServerName";
    pub const PROTOBUF: &str = "protobuf";
    pub const CACHE_TEMPLATE: &str = "cacheTemplate";

    pub const RECOGNIZED: &[&str] = &[
        HOST,
        PORT,
        CACHE,
        USERNAME,
        PASSWORD,
        SASL_MECHANISM,
        AUTHENTICATION_REALM,
        AUTHENTICATION_SERVER_NAME,
        PROTOBUF,
        CACHE_TEMPLATE,
    ];
}

/// Flat key/value configuration produced from a connection URL
///
/// Keys are kept in sorted order so two parses of the same URL compare equal.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProperties {
    entries: BTreeMap<String, String>,
}

impl ConnectionProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, replacing any previous value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Builder-style variant of [`ConnectionProperties::set`]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn host(&self) -> Option<&str> {
        self.get(keys::HOST)
    }

    pub fn port(&self) -> Option<&str> {
        self.get(keys::PORT)
    }

    pub fn cache(&self) -> Option<&str> {
        self.get(keys::CACHE)
    }

    pub fn username(&self) -> Option<&str> {
        self.get(keys::USERNAME)
    }

    pub fn password(&self) -> Option<&str> {
        self.get(keys::PASSWORD)
    }

    pub fn sasl_mechanism(&self) -> Option<&str> {
        self.get(keys::SASL_MECHANISM)
    }

    pub fn authentication_realm(&self) -> Option<&str> {
        self.get(keys::AUTHENTICATION_REALM)
    }

    pub fn authentication_server_name(&self) -> Option<&str> {
        self.get(keys::AUTHENTICATION_SERVER_NAME)
    }

    pub fn protobuf(&self) -> Option<&str> {
        self.get(keys::PROTOBUF)
    }

    pub fn cache_template(&self) -> Option<&str> {
        self.get(keys::CACHE_TEMPLATE)
    }

    /// `host[:port]` entry for the client server list
    pub fn server_address(&self) -> Option<String> {
        let host = self.host()?;
        Some(match self.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        })
    }

    /// Properties the driver does not interpret, passed through to the cache client
    pub fn extensions(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter(|(k, _)| !keys::RECOGNIZED.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Password values never reach logs or panic messages
impl fmt::Debug for ConnectionProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.entries {
            if key == keys::PASSWORD {
                map.entry(key, &"***");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConnectionProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// SASL mechanisms accepted by the cache client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SaslMechanism {
    #[serde(rename = "CRAM-MD5")]
    CramMd5,
    #[serde(rename = "DIGEST-MD5")]
    DigestMd5,
    #[serde(rename = "PLAIN")]
    Plain,
}

impl SaslMechanism {
    pub const ALL: [SaslMechanism; 3] = [
        SaslMechanism::CramMd5,
        SaslMechanism::DigestMd5,
        SaslMechanism::Plain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::CramMd5 => "CRAM-MD5",
            SaslMechanism::DigestMd5 => "DIGEST-MD5",
            SaslMechanism::Plain => "PLAIN",
        }
    }
}

impl FromStr for SaslMechanism {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SaslMechanism::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                DriverError::InvalidProperty(format!(
                    "unsupported saslMechanism '{}', expected one of CRAM-MD5, DIGEST-MD5, PLAIN",
                    s
                ))
            })
    }
}

impl fmt::Display for SaslMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of one connection property, for driver registries and tooling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverPropertyInfo {
    pub name: String,
    pub value: Option<String>,
    pub description: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
}

impl DriverPropertyInfo {
    pub fn new(name: &str, value: Option<&str>, description: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.map(str::to_string),
            description: description.to_string(),
            required: false,
            choices: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_choices(mut self, choices: &[&str]) -> Self {
        self.choices = choices.iter().map(|c| c.to_string()).collect();
        self
    }
}
