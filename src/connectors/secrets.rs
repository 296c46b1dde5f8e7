//! Connection secrets: declarative credential sets validated against a
//! per-backend JSON Schema before first use. A missing or malformed secret
//! is a configuration error, not a connector error.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::core::errors::{EngineError, Result};

fn validate_against(key: &str, schema: &JsonValue, secrets: &JsonValue) -> Result<()> {
    let compiled_schema = jsonschema::validator_for(schema)
        .map_err(|e| EngineError::validation(format!("failed to compile secrets schema: {}", e)))?;
    if let Err(errors) = compiled_schema.validate(secrets) {
        return Err(EngineError::validation_field(
            format!("invalid secrets for connection '{}': {}", key, errors),
            "secrets",
        ));
    }
    Ok(())
}

fn decode<T: for<'de> Deserialize<'de>>(key: &str, secrets: &JsonValue) -> Result<T> {
    serde_json::from_value(secrets.clone()).map_err(|e| {
        EngineError::validation(format!("secrets for connection '{}' did not decode: {}", key, e))
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresSecrets {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_postgres_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub dbname: Option<String>,
}

fn default_postgres_port() -> u16 {
    5432
}

impl PostgresSecrets {
    pub fn parse(key: &str, secrets: &JsonValue) -> Result<Self> {
        let schema = json!({
            "type": "object",
            "properties": {
                "url": {"type": "string"},
                "host": {"type": "string"},
                "port": {"type": "integer", "minimum": 1, "maximum": 65535},
                "username": {"type": "string"},
                "password": {"type": "string"},
                "dbname": {"type": "string"}
            },
            "anyOf": [
                {"required": ["url"]},
                {"required": ["host", "username", "dbname"]}
            ]
        });
        validate_against(key, &schema, secrets)?;
        decode(key, secrets)
    }

    /// Connection URI; an explicit `url` wins over the component form.
    pub fn uri(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let user = self.username.as_deref().unwrap_or_default();
        let auth = match &self.password {
            Some(password) => format!("{}:{}@", user, password),
            None => format!("{}@", user),
        };
        format!(
            "postgres://{}{}:{}/{}",
            auth,
            self.host.as_deref().unwrap_or("localhost"),
            self.port,
            self.dbname.as_deref().unwrap_or_default()
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteSecrets {
    /// Filesystem path of the database file.
    pub path: String,
}

impl SqliteSecrets {
    pub fn parse(key: &str, secrets: &JsonValue) -> Result<Self> {
        let schema = json!({
            "type": "object",
            "properties": {"path": {"type": "string", "minLength": 1}},
            "required": ["path"]
        });
        validate_against(key, &schema, secrets)?;
        decode(key, secrets)
    }

    pub fn uri(&self) -> String {
        format!("sqlite:{}", self.path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoSecrets {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub defaultauthdb: Option<String>,
}

impl MongoSecrets {
    pub fn parse(key: &str, secrets: &JsonValue) -> Result<Self> {
        let schema = json!({
            "type": "object",
            "properties": {
                "url": {"type": "string"},
                "host": {"type": "string"},
                "port": {"type": "integer", "minimum": 1, "maximum": 65535},
                "username": {"type": "string"},
                "password": {"type": "string"},
                "defaultauthdb": {"type": "string"}
            },
            "anyOf": [
                {"required": ["url"]},
                {"required": ["host"]}
            ]
        });
        validate_against(key, &schema, secrets)?;
        decode(key, secrets)
    }

    /// `mongodb://[username:password@]host[:port][/defaultauthdb]`
    pub fn uri(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let mut auth = String::new();
        let mut auth_db = String::new();
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            auth = format!("{}:{}@", username, password);
            if let Some(db) = &self.defaultauthdb {
                auth_db = format!("/{}", db);
            }
        }
        let port = self.port.map(|p| format!(":{}", p)).unwrap_or_default();
        format!(
            "mongodb://{}{}{}{}",
            auth,
            self.host.as_deref().unwrap_or("localhost"),
            port,
            auth_db
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_requires_url_or_components() {
        let err = PostgresSecrets::parse("pg", &json!({"port": 5432})).unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));

        let ok = PostgresSecrets::parse(
            "pg",
            &json!({"host": "db.internal", "username": "app", "password": "pw", "dbname": "app"}),
        )
        .unwrap();
        assert_eq!(ok.uri(), "postgres://app:pw@db.internal:5432/app");
    }

    #[test]
    fn test_explicit_url_wins() {
        let secrets = PostgresSecrets::parse("pg", &json!({"url": "postgres://u@h/d"})).unwrap();
        assert_eq!(secrets.uri(), "postgres://u@h/d");
    }

    #[test]
    fn test_mongo_uri_shapes() {
        let bare = MongoSecrets::parse("mg", &json!({"host": "mongo.internal"})).unwrap();
        assert_eq!(bare.uri(), "mongodb://mongo.internal");

        let full = MongoSecrets::parse(
            "mg",
            &json!({
                "host": "mongo.internal",
                "port": 27018,
                "username": "app",
                "password": "pw",
                "defaultauthdb": "admin"
            }),
        )
        .unwrap();
        assert_eq!(full.uri(), "mongodb://app:pw@mongo.internal:27018/admin");
    }

    #[test]
    fn test_sqlite_path_required() {
        assert!(SqliteSecrets::parse("sq", &json!({})).is_err());
        let secrets = SqliteSecrets::parse("sq", &json!({"path": "/tmp/app.db"})).unwrap();
        assert_eq!(secrets.uri(), "sqlite:/tmp/app.db");
    }
}
