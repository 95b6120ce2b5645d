use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub submit: SubmitConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SubmitConfig {
    pub cache_root: PathBuf,
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: home_dir().join(".hubrun").join("cache"),
        }
    }
}

impl Default for SubmitConfig {
    fn default() -> Self {
        // location the hub's submit tooling has always used
        Self {
            cache_root: home_dir().join("data").join("results").join(".submit_cache"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            submit: SubmitConfig::default(),
        }
    }
}

impl Config {
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path();

        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path();
        if let Some(config_dir) = config_path.parent() {
            fs::create_dir_all(config_dir)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;
        Ok(())
    }

    fn get_config_path() -> PathBuf {
        home_dir().join(".hubrun").join("config.toml")
    }

    /// Cache root for plain runs: CLI flag, then the CACHEDIR environment
    /// variable, then the configured default.
    pub fn cache_root(&self, flag: Option<&Path>) -> PathBuf {
        if let Some(dir) = flag {
            return dir.to_path_buf();
        }
        if let Ok(dir) = std::env::var("CACHEDIR") {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        self.cache.root.clone()
    }

    /// Cache root for submit runs; the CLI flag still wins.
    pub fn submit_cache_root(&self, flag: Option<&Path>) -> PathBuf {
        match flag {
            Some(dir) => dir.to_path_buf(),
            None => self.submit.cache_root.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.cache.root.ends_with(".hubrun/cache"));
        assert!(config
            .submit
            .cache_root
            .ends_with("data/results/.submit_cache"));
    }

    #[test]
    fn test_flag_overrides_cache_root() {
        let config = Config::default();
        let flag = PathBuf::from("/tmp/somewhere");
        assert_eq!(config.cache_root(Some(&flag)), flag);
        assert_eq!(config.submit_cache_root(Some(&flag)), flag);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config = toml::from_str("[cache]\nroot = '/srv/cache'\n").unwrap();
        assert_eq!(config.cache.root, PathBuf::from("/srv/cache"));
        assert!(config
            .submit
            .cache_root
            .ends_with("data/results/.submit_cache"));
    }
}
