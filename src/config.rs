use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// How credentials are sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Salted md5 token (`t` + `s` query params). The server never sees the
    /// plain password.
    #[default]
    Token,
    /// Legacy `p=enc:<hex>` password param, for servers pre-dating token auth.
    HexPassword,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub auth_mode: AuthMode,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_cache_file")]
    pub cache_file: PathBuf,
}

fn default_api_version() -> String {
    "1.13.0".to_string()
}

fn default_cache_file() -> PathBuf {
    let mut path = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("subfs");
    path.push("catalog.dat");
    path
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4040".to_string(),
            username: String::new(),
            password: String::new(),
            auth_mode: AuthMode::Token,
            api_version: default_api_version(),
            cache_file: default_cache_file(),
        }
    }
}

impl ServerConfig {
    pub fn get_config_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("subfs");
        std::fs::create_dir_all(&path).ok();
        path.push("config.toml");
        path
    }

    pub fn load() -> Self {
        Self::load_from(&Self::get_config_path())
    }

    pub fn load_from(path: &PathBuf) -> Self {
        if path.exists() {
            if let Ok(content) = fs::read_to_string(path) {
                if let Ok(config) = toml::from_str(&content) {
                    return config;
                }
            }
        }
        Self::default()
    }

    pub fn save(&self) {
        let path = Self::get_config_path();
        if let Ok(content) = toml::to_string_pretty(self) {
            let _ = fs::write(path, content);
        }
    }
}
