use serde::{Deserialize, Serialize};
use shared::Role;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_VAR: &str = "DETECTOR_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/detector.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid value for {key}: {value}")]
    Override { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub inference: InferenceConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub static_dir: Option<PathBuf>,
    pub max_upload_bytes: usize,
    pub max_model_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            static_dir: Some(PathBuf::from("static")),
            max_upload_bytes: 50 * 1024 * 1024,
            max_model_bytes: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub uploads_dir: PathBuf,
    pub results_dir: PathBuf,
    pub models_dir: PathBuf,
    pub model_config: PathBuf,
    /// Bundled model copied into `models_dir` at startup if missing there.
    pub default_model: Option<PathBuf>,
}

impl StorageConfig {
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            uploads_dir: root.join("uploads"),
            results_dir: root.join("results"),
            models_dir: root.join("models"),
            model_config: root.join("model_config.json"),
            default_model: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::rooted_at(Path::new("data"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// External detection program; see `CommandBackend` for placeholders.
    pub program: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub model_extension: String,
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            program: "yolo-detect".to_string(),
            args: Vec::new(),
            timeout_secs: 120,
            model_extension: "pt".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl_hours: i64,
    pub users: Vec<UserEntry>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl_hours: 24,
            users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    /// Lowercase hex SHA-256 of the password.
    pub password_sha256: String,
    #[serde(default = "default_role")]
    pub role: Role,
}

fn default_role() -> Role {
    Role::User
}

impl AppConfig {
    /// Reads the YAML file named by `DETECTOR_CONFIG` (defaults apply when it
    /// does not exist), then environment overrides, then validation.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn static_dir_if_present(&self) -> Option<PathBuf> {
        self.server.static_dir.clone().filter(|dir| dir.is_dir())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                log::info!("Loading configuration from {}", path.display());
                Self::from_yaml_str(&raw)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.port = port.trim().parse().map_err(|_| ConfigError::Override {
                key: "PORT",
                value: port.clone(),
            })?;
        }
        if let Some(host) = lookup("BIND_HOST") {
            self.server.host = host;
        }
        if let Some(secret) = lookup("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(root) = lookup("DETECTOR_DATA_DIR") {
            let default_model = self.storage.default_model.take();
            self.storage = StorageConfig::rooted_at(Path::new(&root));
            self.storage.default_model = default_model;
        }
        if let Some(program) = lookup("INFERENCE_PROGRAM") {
            self.inference.program = program;
        }
        if let Some(timeout) = lookup("INFERENCE_TIMEOUT_SECS") {
            self.inference.timeout_secs =
                timeout.trim().parse().map_err(|_| ConfigError::Override {
                    key: "INFERENCE_TIMEOUT_SECS",
                    value: timeout.clone(),
                })?;
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.auth.jwt_secret.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "auth.jwt_secret is empty; set it in the config file or JWT_SECRET".into(),
            ));
        }
        if self.auth.token_ttl_hours <= 0 {
            return Err(ConfigError::Invalid("auth.token_ttl_hours must be positive".into()));
        }
        if self.inference.timeout_secs == 0 {
            return Err(ConfigError::Invalid("inference.timeout_secs must be positive".into()));
        }
        if self.server.max_upload_bytes == 0 || self.server.max_model_bytes == 0 {
            return Err(ConfigError::Invalid("upload size limits must be positive".into()));
        }

        let extension = self
            .inference
            .model_extension
            .trim()
            .trim_start_matches('.')
            .to_ascii_lowercase();
        if extension.is_empty() {
            return Err(ConfigError::Invalid("inference.model_extension is empty".into()));
        }
        self.inference.model_extension = extension;

        for user in &mut self.auth.users {
            if user.username.trim().is_empty() {
                return Err(ConfigError::Invalid("auth.users contains an empty username".into()));
            }
            user.password_sha256 = user.password_sha256.trim().to_ascii_lowercase();
            if user.password_sha256.len() != 64
                || !user.password_sha256.chars().all(|c| c.is_ascii_hexdigit())
            {
                return Err(ConfigError::Invalid(format!(
                    "password_sha256 for {} is not a SHA-256 hex digest",
                    user.username
                )));
            }
        }
        if self.auth.users.is_empty() {
            log::warn!("No users configured; every login will be rejected");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
server:
  port: 9000
  static_dir: ~
storage:
  models_dir: /srv/models
  default_model: bundled/yolo11n.pt
inference:
  program: /usr/local/bin/detect
  args: ["--weights", "{model}", "--source", "{image}", "--project", "{output}"]
  timeout_secs: 30
  model_extension: ".PT"
auth:
  jwt_secret: s3cret
  users:
    - username: admin
      password_sha256: 240BE518FABD2724DDB6F04EEB1DA5967448D7E831C08C8FA822809F74C720A9
      role: admin
    - username: user
      password_sha256: e606e38b0d8c19b24cf0ee3808183162ea7cd63ff7912dbb22b5e803286b4446
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn parses_yaml_and_fills_defaults() {
        let mut config = AppConfig::from_yaml_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.static_dir, None);
        assert_eq!(config.server.max_upload_bytes, 50 * 1024 * 1024);
        assert_eq!(config.storage.models_dir, PathBuf::from("/srv/models"));
        assert_eq!(config.storage.uploads_dir, PathBuf::from("data/uploads"));
        assert_eq!(config.inference.timeout(), Duration::from_secs(30));
        assert_eq!(config.inference.model_extension, "pt");
        assert_eq!(config.auth.users.len(), 2);
        assert_eq!(config.auth.users[0].role, Role::Admin);
        assert_eq!(config.auth.users[1].role, Role::User);
        assert!(config.auth.users[0]
            .password_sha256
            .chars()
            .all(|c| !c.is_ascii_uppercase()));
    }

    #[test]
    fn environment_overrides_win() {
        let mut config = AppConfig::from_yaml_str(SAMPLE).unwrap();
        config
            .apply_overrides(env(&[
                ("PORT", "8181"),
                ("JWT_SECRET", "from-env"),
                ("DETECTOR_DATA_DIR", "/var/lib/detector"),
                ("INFERENCE_TIMEOUT_SECS", "5"),
            ]))
            .unwrap();

        assert_eq!(config.server.port, 8181);
        assert_eq!(config.auth.jwt_secret, "from-env");
        assert_eq!(
            config.storage.results_dir,
            PathBuf::from("/var/lib/detector/results")
        );
        assert_eq!(
            config.storage.model_config,
            PathBuf::from("/var/lib/detector/model_config.json")
        );
        assert_eq!(
            config.storage.default_model,
            Some(PathBuf::from("bundled/yolo11n.pt"))
        );
        assert_eq!(config.inference.timeout_secs, 5);
    }

    #[test]
    fn malformed_override_is_an_error() {
        let mut config = AppConfig::default();
        let err = config.apply_overrides(env(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::Override { key: "PORT", .. }));
    }

    #[test]
    fn validation_rejects_unusable_values() {
        let mut config = AppConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AppConfig::from_yaml_str(SAMPLE).unwrap();
        config.inference.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::from_yaml_str(SAMPLE).unwrap();
        config.auth.users[1].password_sha256 = "user123".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_means_defaults() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = AppConfig::from_file(&temp.path().join("absent.yaml")).unwrap();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.inference.model_extension, "pt");
    }

    #[test]
    fn bad_yaml_is_reported() {
        let err = AppConfig::from_yaml_str("server: [unterminated").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
