use std::path::Path;

use serde::Deserialize;

use crate::errors::{Error, Result};

/// User-facing settings. The repository's `.ori/config.toml` wins over
/// `~/.ori.toml`; a missing file just means defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub author: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            author: default_author(),
        }
    }
}

fn default_author() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "anonymous".to_string())
}

impl Config {
    pub fn load(ori_dir: &Path) -> Result<Config> {
        let repo_config = ori_dir.join("config.toml");
        if repo_config.exists() {
            return Self::parse_file(&repo_config);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".ori.toml");
            if user_config.exists() {
                return Self::parse_file(&user_config);
            }
        }

        Ok(Config::default())
    }

    fn parse_file(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| Error::parse(format!("bad config {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn missing_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert!(!config.author.is_empty());
    }

    #[test]
    fn repo_config_is_read() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("config.toml"), "author = \"alice\"\n").unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.author, "alice");
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("config.toml"), "author = [\n").unwrap();
        assert!(Config::load(dir.path()).is_err());
    }
}
