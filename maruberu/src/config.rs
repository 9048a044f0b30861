//! Configuration types for the bell service.
//!
//! Values are validated when they are constructed, so a service assembled
//! from these types never discovers a malformed setting at runtime.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::ConfigError;

/// Settings for the physical bell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BellConfig {
    /// Program run as `<ring_command> <duration_ms>` for every ring.
    pub ring_command: String,
}

impl Default for BellConfig {
    fn default() -> Self {
        Self {
            ring_command: "echo".to_string(),
        }
    }
}

/// Which storage backend holds the resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    /// Process-local map, lost on restart.
    #[default]
    Memory,
    /// Shared PostgreSQL database.
    Postgres,
}

impl StorageKind {
    /// Resolves an environment name.
    ///
    /// `ON_MEMORY` selects the in-memory store and `POSTGRES` the database.
    /// `REDIS` is still accepted as the name of the remote store. Anything
    /// else falls back to the in-memory store.
    pub fn from_name(name: &str) -> Self {
        match name {
            "ON_MEMORY" => Self::Memory,
            "POSTGRES" | "REDIS" => Self::Postgres,
            other => {
                warn!(
                    env = other,
                    "[config.storage] env '{}' is not found (ON_MEMORY will be used)", other
                );
                Self::Memory
            }
        }
    }
}

/// Location of the remote store, written `(user:pass@)host:port/dbname`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatabaseAddress {
    credentials: Option<(String, String)>,
    host: String,
    port: u16,
    dbname: String,
}

impl DatabaseAddress {
    /// Host name of the database server.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port of the database server.
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Database name.
    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    /// User name, if credentials were given.
    pub fn username(&self) -> Option<&str> {
        self.credentials.as_ref().map(|(user, _)| user.as_str())
    }

    /// Password, if credentials were given.
    ///
    /// Returned verbatim; drivers that take a URL must percent-encode it.
    pub fn password(&self) -> Option<&str> {
        self.credentials
            .as_ref()
            .map(|(_, password)| password.as_str())
    }
}

impl Default for DatabaseAddress {
    fn default() -> Self {
        Self {
            credentials: None,
            host: "localhost".to_string(),
            port: 5432,
            dbname: "maruberu".to_string(),
        }
    }
}

/// Parses `host:port/dbname`.
fn parse_location(location: &str) -> Option<(String, u16, String)> {
    let (host, remain) = location.split_once(':')?;
    let (port, dbname) = remain.split_once('/')?;
    if host.is_empty() || dbname.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?, dbname.to_string()))
}

impl FromStr for DatabaseAddress {
    type Err = ConfigError;

    fn from_str(address: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidDatabaseAddress(address.to_string());

        let (credentials, location) = match address.rsplit_once('@') {
            Some((credentials, location)) => {
                let (user, password) = credentials.split_once(':').ok_or_else(invalid)?;
                if user.is_empty() {
                    return Err(invalid());
                }
                (Some((user.to_string(), password.to_string())), location)
            }
            None => (None, address),
        };
        let (host, port, dbname) = parse_location(location).ok_or_else(invalid)?;

        Ok(Self {
            credentials,
            host,
            port,
            dbname,
        })
    }
}

impl TryFrom<String> for DatabaseAddress {
    type Error = ConfigError;

    fn try_from(address: String) -> Result<Self, Self::Error> {
        address.parse()
    }
}

impl From<DatabaseAddress> for String {
    fn from(address: DatabaseAddress) -> Self {
        address.to_string()
    }
}

impl fmt::Display for DatabaseAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some((user, password)) = &self.credentials {
            write!(f, "{user}:{password}@")?;
        }
        write!(f, "{}:{}/{}", self.host, self.port, self.dbname)
    }
}

impl fmt::Debug for DatabaseAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseAddress")
            .field("username", &self.username())
            .field("password", &self.credentials.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .finish()
    }
}
