//! Engine configuration: a tiny hand-parsed TOML subset (`key = value`
//! per line, quoted strings or bare integers), generated with sane
//! defaults on first run.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::{
    CONFIG_FILE_NAME, DEFAULT_CACHE_BRANCH_SIZE, DEFAULT_PAGE_SIZE, DEFAULT_TREE_DOMAIN, GENERATED_PASSWORD_LEN,
};
use crate::errors::{DbError, Result};
use crate::fs as dbfs;

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_path: PathBuf,
    pub work_path: PathBuf,
    pub page_size: usize,
    pub user_name: String,
    pub password: String,
    pub tree_domain: usize,
    pub cache_branch_size: usize,
}

impl Settings {
    pub fn config_path(work_path: &Path) -> PathBuf {
        work_path.join(CONFIG_FILE_NAME)
    }

    fn generate_password() -> String {
        let seed = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
        let mut state = seed as u64 ^ 0x9E3779B97F4A7C15;
        let alphabet: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        let mut out = String::with_capacity(GENERATED_PASSWORD_LEN);
        for _ in 0..GENERATED_PASSWORD_LEN {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            out.push(alphabet[(state as usize) % alphabet.len()] as char);
        }
        out
    }

    pub fn default_at(work_path: PathBuf) -> Self {
        Settings {
            data_path: work_path.join("data"),
            work_path,
            page_size: DEFAULT_PAGE_SIZE,
            user_name: "root".to_string(),
            password: Self::generate_password(),
            tree_domain: DEFAULT_TREE_DOMAIN,
            cache_branch_size: DEFAULT_CACHE_BRANCH_SIZE,
        }
    }

    pub fn to_toml(&self) -> String {
        format!(
            "data_path = \"{}\"\nwork_path = \"{}\"\npage_size = {}\nuser_name = \"{}\"\npassword = \"{}\"\ntree_domain = {}\ncache_branch_size = {}\n",
            self.data_path.display(),
            self.work_path.display(),
            self.page_size,
            self.user_name,
            self.password,
            self.tree_domain,
            self.cache_branch_size,
        )
    }

    pub fn from_toml(work_path: PathBuf, text: &str) -> Result<Self> {
        let mut settings = Settings::default_at(work_path);
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| DbError::Parse(format!("malformed config line: {}", line)))?;
            let key = key.trim();
            let value = value.trim().trim_matches('"');
            match key {
                "data_path" => settings.data_path = PathBuf::from(value),
                "work_path" => settings.work_path = PathBuf::from(value),
                "page_size" => {
                    settings.page_size =
                        value.parse().map_err(|_| DbError::Parse(format!("bad page_size: {}", value)))?
                }
                "user_name" => settings.user_name = value.to_string(),
                "password" => settings.password = value.to_string(),
                "tree_domain" => {
                    settings.tree_domain =
                        value.parse().map_err(|_| DbError::Parse(format!("bad tree_domain: {}", value)))?
                }
                "cache_branch_size" => {
                    settings.cache_branch_size =
                        value.parse().map_err(|_| DbError::Parse(format!("bad cache_branch_size: {}", value)))?
                }
                other => return Err(DbError::Parse(format!("unknown config key: {}", other))),
            }
        }
        Ok(settings)
    }

    pub fn load_or_create(work_path: PathBuf) -> Result<Self> {
        let config_path = Self::config_path(&work_path);
        if dbfs::exists(&config_path) {
            let bytes = dbfs::read(&config_path)?;
            let text = String::from_utf8(bytes)
                .map_err(|e| DbError::Parse(format!("config file is not valid utf-8: {}", e)))?;
            Settings::from_toml(work_path, &text)
        } else {
            let settings = Settings::default_at(work_path);
            settings.save()?;
            Ok(settings)
        }
    }

    pub fn save(&self) -> Result<()> {
        dbfs::ensure_dir(&self.work_path)?;
        dbfs::atomic_write(&Self::config_path(&self.work_path), self.to_toml().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::default_at(dir.path().to_path_buf());
        let text = settings.to_toml();
        let back = Settings::from_toml(dir.path().to_path_buf(), &text).unwrap();
        assert_eq!(back.page_size, settings.page_size);
        assert_eq!(back.password, settings.password);
    }

    #[test]
    fn load_or_create_generates_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let first = Settings::load_or_create(dir.path().to_path_buf()).unwrap();
        let second = Settings::load_or_create(dir.path().to_path_buf()).unwrap();
        assert_eq!(first.password, second.password);
    }

    #[test]
    fn rejects_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::from_toml(dir.path().to_path_buf(), "bogus = 1\n");
        assert!(err.is_err());
    }
}
