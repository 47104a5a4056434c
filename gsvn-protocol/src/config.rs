//! Server configuration (`gsvn.toml`).
//!
//! Every field has a default, so an empty file is a valid configuration that
//! serves nothing. Relative file paths are resolved against the directory of
//! the configuration file.

use crate::dispatch::StoreFailurePolicy;
use anyhow::{Context, Result, bail};
use gsvn_core::ExpiredLockPolicy;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Top-level server configuration.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the accept loop binds (default: `0.0.0.0:3690`).
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Realm announced in the authentication request.
    #[serde(default = "default_realm")]
    pub realm: String,

    /// Offer the `ANONYMOUS` mechanism.
    #[serde(default = "default_allow_anonymous")]
    pub allow_anonymous: bool,

    /// Subversion authz file. Absent means every user may read and write.
    #[serde(default)]
    pub authz_file: Option<PathBuf>,

    /// Apache htpasswd file consulted after the local user table.
    #[serde(default)]
    pub htpasswd_file: Option<PathBuf>,

    #[serde(default)]
    pub store_failure: StoreFailurePolicy,

    /// Largest string item accepted from a client, in bytes.
    #[serde(default = "default_max_string_len")]
    pub max_string_len: usize,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default, rename = "user")]
    pub users: Vec<UserConfig>,

    #[serde(default, rename = "repository")]
    pub repositories: Vec<RepositoryConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            realm: default_realm(),
            allow_anonymous: default_allow_anonymous(),
            authz_file: None,
            htpasswd_file: None,
            store_failure: StoreFailurePolicy::default(),
            max_string_len: default_max_string_len(),
            lock: LockConfig::default(),
            users: Vec::new(),
            repositories: Vec::new(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:3690".to_owned()
}

fn default_realm() -> String {
    "gsvn".to_owned()
}

const fn default_allow_anonymous() -> bool {
    true
}

/// Longest accepted lock lifetime: 100 years.
pub const MAX_LOCK_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

const fn default_max_string_len() -> usize {
    64 * 1024 * 1024
}

/// `[lock]` table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    /// Lifetime of new locks in seconds; 0 disables expiration.
    #[serde(default)]
    pub ttl_secs: u64,

    #[serde(default)]
    pub expired: ExpiredLockPolicy,
}

impl LockConfig {
    pub fn ttl(&self) -> Option<chrono::Duration> {
        if self.ttl_secs == 0 {
            return None;
        }
        i64::try_from(self.ttl_secs).ok().and_then(chrono::Duration::try_seconds)
    }
}

/// `[[user]]` entry of the local user table.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserConfig {
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// `[[repository]]` entry.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryConfig {
    /// First path segment of `svn://host/<name>/...` URLs.
    pub name: String,

    /// Branch served as the repository tree (default: `"master"`).
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "master".to_owned()
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::parse(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        if let Some(dir) = path.parent() {
            config.resolve_paths(dir);
        }
        Ok(config)
    }

    /// Parse and validate TOML text; paths are left as written.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .with_context(|| format!("Invalid listen address '{}'", self.listen))
    }

    fn resolve_paths(&mut self, base: &Path) {
        for file in [&mut self.authz_file, &mut self.htpasswd_file].into_iter().flatten() {
            if file.is_relative() {
                *file = base.join(&*file);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        if self.max_string_len == 0 {
            bail!("max_string_len must be positive");
        }
        if self.lock.ttl_secs > MAX_LOCK_TTL_SECS {
            bail!("lock.ttl_secs must be at most {}", MAX_LOCK_TTL_SECS);
        }

        let mut names = HashSet::new();
        for repo in &self.repositories {
            if repo.name.is_empty()
                || !repo
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            {
                bail!("Invalid repository name '{}'", repo.name);
            }
            if repo.branch.is_empty() {
                bail!("Repository '{}' has an empty branch", repo.name);
            }
            if !names.insert(repo.name.as_str()) {
                bail!("Repository '{}' is defined twice", repo.name);
            }
        }

        let mut users = HashSet::new();
        for user in &self.users {
            if user.name.is_empty() {
                bail!("User with empty name");
            }
            if !users.insert(user.name.as_str()) {
                bail!("User '{}' is defined twice", user.name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen, "0.0.0.0:3690");
        assert!(config.allow_anonymous);
        assert_eq!(config.store_failure, StoreFailurePolicy::ByCommand);
        assert_eq!(config.max_string_len, 67_108_864);
        assert_eq!(config.lock.ttl(), None);
        assert_eq!(config.lock.expired, ExpiredLockPolicy::TreatAsAbsent);
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            listen = "127.0.0.1:3691"
            realm = "example"
            allow_anonymous = false
            authz_file = "/etc/gsvn/authz"
            store_failure = "terminate"

            [lock]
            ttl_secs = 600
            expired = "require-removal"

            [[user]]
            name = "alice"
            password = "secret"
            groups = ["developers"]

            [[repository]]
            name = "repo"

            [[repository]]
            name = "docs"
            branch = "main"
            "#,
        )
        .unwrap();

        assert_eq!(config.realm, "example");
        assert!(!config.allow_anonymous);
        assert_eq!(config.store_failure, StoreFailurePolicy::Terminate);
        assert_eq!(config.lock.ttl(), Some(chrono::Duration::seconds(600)));
        assert_eq!(config.lock.expired, ExpiredLockPolicy::RequireRemoval);
        assert_eq!(config.users[0].groups, vec!["developers".to_string()]);
        assert_eq!(config.repositories[0].branch, "master");
        assert_eq!(config.repositories[1].branch, "main");
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(Config::parse("colour = \"blue\"").is_err());
        assert!(Config::parse("listen = \"nowhere\"").is_err());
        assert!(Config::parse("[[repository]]\nname = \"a/b\"").is_err());
        assert!(Config::parse("[[repository]]\nname = \"\"").is_err());
        assert!(Config::parse("[[repository]]\nname = \"r\"\n[[repository]]\nname = \"r\"").is_err());
        assert!(Config::parse("[[user]]\nname = \"a\"\npassword = \"x\"\n[[user]]\nname = \"a\"\npassword = \"y\"").is_err());
        assert!(Config::parse("store_failure = \"sometimes\"").is_err());
        assert!(Config::parse("[lock]\nttl_secs = 10000000000000\n").is_err());
        assert!(Config::parse(&format!("[lock]\nttl_secs = {}\n", MAX_LOCK_TTL_SECS)).is_ok());
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gsvn.toml");
        std::fs::write(
            &path,
            "authz_file = \"authz.conf\"\nhtpasswd_file = \"/srv/htpasswd\"\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.authz_file, Some(dir.path().join("authz.conf")));
        assert_eq!(config.htpasswd_file, Some(PathBuf::from("/srv/htpasswd")));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
