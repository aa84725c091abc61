use crate::core::{OdmError, Result};
use serde::{Deserialize, Serialize};

const URL_SCHEME: &str = "docmap://";

/// Mapper configuration
///
/// Built with chained setters or parsed from a connection string. `host`,
/// `port` and `database` are connection metadata: the mapper does not
/// interpret them beyond tagging its spans, they are carried for drivers
/// that open network connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Store host
    pub host: String,

    /// Store port
    pub port: u16,

    /// Database name
    pub database: String,

    /// Default dereference depth for query sets
    pub max_depth: usize,

    /// Resolve references of loaded documents without `select_related`
    pub auto_dereference: bool,

    /// Emit compiled queries as DEBUG events
    pub log_queries: bool,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 27017,
            database: "docmap".to_string(),
            max_depth: 1,
            auto_dereference: false,
            log_queries: false,
        }
    }
}

impl MapperConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn database(mut self, database: &str) -> Self {
        self.database = database.to_string();
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn auto_dereference(mut self, enabled: bool) -> Self {
        self.auto_dereference = enabled;
        self
    }

    pub fn log_queries(mut self, enabled: bool) -> Self {
        self.log_queries = enabled;
        self
    }

    /// Parse from connection string
    ///
    /// Format: "docmap://host:port/database?max_depth=2&auto_dereference=true"
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let config = MapperConfig::from_url("docmap://localhost:27017/blog?max_depth=2")?;
    /// ```
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| invalid(format!("URL must start with '{URL_SCHEME}'")))?;
        let (location, params) = rest.split_once('?').unwrap_or((rest, ""));
        let (host_port, database) = location
            .split_once('/')
            .ok_or_else(|| invalid("Invalid host/database format"))?;
        if database.is_empty() {
            return Err(invalid("Database name cannot be empty"));
        }

        let mut config = Self::new().database(database);
        match host_port.split_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| invalid(format!("Invalid port '{port}'")))?;
                config = config.host(host).port(port);
            }
            None if !host_port.is_empty() => config = config.host(host_port),
            None => {}
        }

        for pair in params.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid(format!("Invalid parameter '{pair}'")))?;
            config = match key {
                "max_depth" => config.max_depth(
                    value
                        .parse()
                        .map_err(|_| invalid(format!("Invalid max_depth '{value}'")))?,
                ),
                "auto_dereference" => config.auto_dereference(parse_flag(key, value)?),
                "log_queries" => config.log_queries(parse_flag(key, value)?),
                other => return Err(invalid(format!("Unknown parameter '{other}'"))),
            };
        }
        Ok(config)
    }

    /// Parse from a JSON document; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_url(&self) -> String {
        format!(
            "{URL_SCHEME}{}:{}/{}?max_depth={}",
            self.host, self.port, self.database, self.max_depth
        )
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(invalid(format!("Invalid {key} '{value}'"))),
    }
}

fn invalid(message: impl Into<String>) -> OdmError {
    OdmError::Operation(format!("config: {}", message.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MapperConfig::new();
        assert_eq!(config.max_depth, 1);
        assert!(!config.auto_dereference);
    }

    #[test]
    fn test_from_url() {
        let config = MapperConfig::from_url("docmap://db.local:27018/blog?max_depth=2&log_queries=true").unwrap();
        assert_eq!(config.host, "db.local");
        assert_eq!(config.port, 27018);
        assert_eq!(config.database, "blog");
        assert_eq!(config.max_depth, 2);
        assert!(config.log_queries);
        assert_eq!(MapperConfig::from_url(&config.to_url()).unwrap().max_depth, 2);
    }

    #[test]
    fn test_from_json_keeps_defaults() {
        let config = MapperConfig::from_json(r#"{"max_depth": 3, "auto_dereference": true}"#).unwrap();
        assert_eq!(config.max_depth, 3);
        assert!(config.auto_dereference);
        assert_eq!(config.port, 27017);
        assert!(matches!(MapperConfig::from_json("[1]"), Err(OdmError::Serialization(_))));
    }

    #[test]
    fn test_from_url_rejects_bad_input() {
        assert!(MapperConfig::from_url("mongodb://x/y").is_err());
        assert!(MapperConfig::from_url("docmap://x:port/y").is_err());
        assert!(MapperConfig::from_url("docmap://x/y?depth=2").is_err());
    }
}
