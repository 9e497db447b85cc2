use serde::Deserialize;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "configuration io failure"),
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Invalid => write!(f, "configuration value invalid"),
        }
    }
}

impl Error for ConfigError {}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub game_port: u16,
    pub http_port: u16,
    pub server_name: String,
    pub welcome_message: Option<String>,
    pub http_service: bool,
    pub admin_token: Option<String>,
    pub view_token: Option<String>,
    pub admin_data_path: String,
    pub api_base_url: String,
    pub welcome_exempt_id: Option<i32>,
    #[serde(skip)]
    pub home: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            game_port: 12346,
            http_port: 12347,
            server_name: "phira-mp".to_string(),
            welcome_message: None,
            http_service: true,
            admin_token: None,
            view_token: None,
            admin_data_path: "admin_data.json".to_string(),
            api_base_url: "https://api.phira.cn".to_string(),
            welcome_exempt_id: None,
            home: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Loads `config.json` (or the file named by `PHIRA_MP_CONFIG`) and
    /// applies environment overrides. A missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("PHIRA_MP_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let mut config = if Path::new(&path).exists() {
            Self::from_file(Path::new(&path))?
        } else {
            Self::default()
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
        serde_json::from_str(&contents).map_err(|_| ConfigError::Parse)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = override_env("HTTP_SERVICE")? {
            self.http_service = match value.as_str() {
                "1" | "true" => true,
                "0" | "false" => false,
                _ => return Err(ConfigError::Invalid),
            };
        }
        if let Some(value) = override_env("HTTP_PORT")? {
            self.http_port = value.parse().map_err(|_| ConfigError::Invalid)?;
        }
        if let Some(value) = override_env("ADMIN_TOKEN")? {
            self.admin_token = Some(value);
        }
        if let Some(value) = override_env("ADMIN_DATA_PATH")? {
            self.admin_data_path = value;
        }
        if let Some(value) = override_env("PHIRA_MP_HOME")? {
            self.home = PathBuf::from(value);
        }
        Ok(())
    }

    /// Base directory for replay recordings.
    pub fn record_dir(&self) -> PathBuf {
        self.home.join("record")
    }

    /// On-disk location of the admin ban store.
    pub fn admin_data_file(&self) -> PathBuf {
        let path = Path::new(&self.admin_data_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.home.join(path)
        }
    }
}

fn override_env(key: &str) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(_) => Err(ConfigError::Invalid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.game_port, 12346);
        assert_eq!(config.http_port, 12347);
        assert!(config.http_service);
        assert!(config.admin_token.is_none());
        assert_eq!(config.admin_data_file(), PathBuf::from("./admin_data.json"));
    }

    #[test]
    fn parse_configuration_file() {
        let mut path = env::temp_dir();
        path.push("phira_mp_test_config.json");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            br#"{
                "gamePort": 23456,
                "serverName": "test-mp",
                "welcomeMessage": "welcome!",
                "adminToken": "secret",
                "viewToken": "peek"
            }"#,
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.game_port, 23456);
        assert_eq!(config.http_port, 12347);
        assert_eq!(config.server_name, "test-mp");
        assert_eq!(config.welcome_message.as_deref(), Some("welcome!"));
        assert_eq!(config.admin_token.as_deref(), Some("secret"));
        assert_eq!(config.view_token.as_deref(), Some("peek"));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_malformed_file() {
        let mut path = env::temp_dir();
        path.push("phira_mp_test_config_bad.json");
        fs::write(&path, "{ nope").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::Parse)
        ));
        fs::remove_file(path).unwrap();
    }
}
