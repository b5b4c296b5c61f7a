//! Deployment configuration.
//!
//! Assembled once at process start from, in precedence order: CLI flags,
//! `STAGEHAND_*` environment variables, the JSON config file, and the
//! hardcoded fallback defaults. The resulting struct is passed explicitly to
//! every stage; nothing reads ambient environment deeper in the call stack.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use serde::{Deserialize, Serialize};

/// Default config file looked up when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "stagehand.json";

/// Exclusions that apply even when no config file is present. Losing the
/// config must never expose preserved data, env files, or VCS state to a
/// deleting sync.
pub fn fallback_exclude_patterns() -> Vec<String> {
    [
        "uploads/",
        "data/",
        ".env",
        ".env.*",
        "*.log",
        "node_modules/",
        ".git/",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Paths never captured by file backups: caches, thumbnails, OS metadata.
pub fn backup_denylist() -> Vec<String> {
    [
        "cache/",
        "thumbnails/",
        ".DS_Store",
        "Thumbs.db",
        ".git/",
        "node_modules/",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Glob patterns excluded from every sync.
    pub exclude_patterns: Vec<String>,
    /// When present, sync runs in include-only mode.
    pub include_patterns: Option<Vec<String>>,
    /// Subtrees of the target that sync and rollback must never touch.
    pub preserve_directories: Vec<String>,
    /// Extra flag strings passed through to rsync.
    pub rsync_options: Vec<String>,
    pub permissions: PermissionsConfig,
    pub extension_sync: ExtensionSyncConfig,
    pub atomic_deployment: AtomicDeploymentConfig,
    /// Where backups are created and looked up.
    pub backup_directory: PathBuf,
    /// Minimum free space required on the target and backup filesystems.
    pub min_free_space_mib: u64,
    /// Files that must exist in the target after a deploy.
    pub essential_files: Vec<String>,
    /// Timeout for database and HTTP reachability probes.
    pub probe_timeout_secs: u64,
    /// Backups older than this get a warning during verification.
    pub backup_stale_days: i64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: fallback_exclude_patterns(),
            include_patterns: None,
            preserve_directories: vec!["uploads".into(), "data".into()],
            rsync_options: Vec::new(),
            permissions: PermissionsConfig::default(),
            extension_sync: ExtensionSyncConfig::default(),
            atomic_deployment: AtomicDeploymentConfig::default(),
            backup_directory: PathBuf::from("backups"),
            min_free_space_mib: 1024,
            essential_files: vec!["package.json".into()],
            probe_timeout_secs: 10,
            backup_stale_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Octal mode string applied to regular files after sync.
    pub file_mode: String,
    /// Octal mode string applied to directories after sync.
    pub directory_mode: String,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            file_mode: "644".into(),
            directory_mode: "755".into(),
        }
    }
}

impl PermissionsConfig {
    pub fn file_mode_bits(&self) -> Result<u32> {
        parse_octal_mode(&self.file_mode)
    }

    pub fn directory_mode_bits(&self) -> Result<u32> {
        parse_octal_mode(&self.directory_mode)
    }
}

fn parse_octal_mode(s: &str) -> Result<u32> {
    u32::from_str_radix(s, 8).with_context(|| format!("invalid octal mode '{s}'"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionSyncConfig {
    pub enabled: bool,
    /// Deploy plugin `src/` trees (normally only built output ships).
    pub include_source: bool,
    pub include_dist: bool,
    pub exclude_patterns: Vec<String>,
}

impl Default for ExtensionSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            include_source: false,
            include_dist: true,
            exclude_patterns: vec!["node_modules/".into(), "*.log".into()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AtomicDeploymentConfig {
    /// Override for the staging directory. Must be on the same filesystem
    /// as the target so the final rename stays atomic. Defaults to a
    /// sibling of the target.
    pub staging_directory: Option<PathBuf>,
}

impl DeployConfig {
    /// Load config: defaults <- JSON file <- `STAGEHAND_*` env.
    ///
    /// An explicitly passed `--config` that is missing or unparseable is a
    /// hard error; a missing default config file just means defaults.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(DeployConfig::default()));

        match explicit_path {
            Some(path) => {
                if !path.is_file() {
                    bail!("config file not found: {}", path.display());
                }
                figment = figment.merge(Json::file(path));
            }
            None => {
                if Path::new(DEFAULT_CONFIG_FILE).is_file() {
                    figment = figment.merge(Json::file(DEFAULT_CONFIG_FILE));
                }
            }
        }

        let config: DeployConfig = figment
            .merge(Env::prefixed("STAGEHAND_").split("__"))
            .extract()
            .context("failed to load configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.permissions.file_mode_bits()?;
        self.permissions.directory_mode_bits()?;
        if self.preserve_directories.iter().any(|d| d.contains("..")) {
            bail!("preserve_directories must be relative paths without '..'");
        }
        if let Some(includes) = &self.include_patterns
            && includes.is_empty()
        {
            bail!("include_patterns, when present, must not be empty");
        }
        Ok(())
    }

    /// Effective exclusion policy for a sync against a target. Preserved
    /// directories are always part of the exclusions regardless of what the
    /// config file lists.
    pub fn exclusion_policy(&self) -> ExclusionPolicy {
        let mut exclude = self.exclude_patterns.clone();
        for dir in &self.preserve_directories {
            let pattern = format!("{}/", dir.trim_end_matches('/'));
            if !exclude.contains(&pattern) {
                exclude.push(pattern);
            }
        }
        ExclusionPolicy {
            exclude_patterns: exclude,
            include_patterns: self.include_patterns.clone(),
            preserve_directories: self.preserve_directories.clone(),
            rsync_options: self.rsync_options.clone(),
        }
    }
}

/// Declarative sync policy, immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct ExclusionPolicy {
    pub exclude_patterns: Vec<String>,
    pub include_patterns: Option<Vec<String>>,
    pub preserve_directories: Vec<String>,
    pub rsync_options: Vec<String>,
}

impl ExclusionPolicy {
    /// Whether a path relative to the sync root matches an exclusion.
    ///
    /// Used by the native copy fallback; rsync evaluates the same patterns
    /// itself. Directory patterns (trailing `/`) match the component
    /// anywhere in the path, file patterns match the file name or the whole
    /// relative path with `*`/`?` wildcards.
    pub fn is_excluded(&self, relative: &Path) -> bool {
        patterns_match(&self.exclude_patterns, relative)
    }
}

pub fn patterns_match(patterns: &[String], relative: &Path) -> bool {
    let components: Vec<&str> = relative
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();
    let rel_str = components.join("/");

    for pattern in patterns {
        if let Some(dir) = pattern.strip_suffix('/') {
            if components.iter().any(|c| wildcard_match(dir, c)) {
                return true;
            }
        } else if components
            .last()
            .is_some_and(|name| wildcard_match(pattern, name))
            || wildcard_match(pattern, &rel_str)
        {
            return true;
        }
    }
    false
}

/// Minimal `*`/`?` wildcard match, enough for rsync-style exclude lists.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    let (mut star, mut star_ti) = (None::<usize>, 0usize);

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            star_ti = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Database connection parameters sourced from the environment, captured
/// once at startup. Absence of credentials disables database features; it
/// is never an error by itself.
#[derive(Debug, Clone, Default)]
pub struct DatabaseEnv {
    pub host: Option<String>,
    pub port: u16,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl DatabaseEnv {
    pub fn from_env() -> Self {
        let var = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());
        Self {
            host: var("DB_HOST"),
            port: var("DB_PORT").and_then(|p| p.parse().ok()).unwrap_or(5432),
            database: var("DB_DATABASE"),
            user: var("DB_USER"),
            password: var("DB_PASSWORD"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.host.is_some() && self.database.is_some() && self.user.is_some()
    }
}

/// Non-database environment inputs. CLI flags override all of these.
#[derive(Debug, Clone, Default)]
pub struct RuntimeEnv {
    pub database: DatabaseEnv,
    /// Base URL for post-deploy liveness probing.
    pub public_url: Option<String>,
    /// Default target path when `--target` is not given.
    pub default_target: Option<PathBuf>,
    pub dry_run: bool,
    pub force: bool,
}

impl RuntimeEnv {
    pub fn from_env() -> Self {
        let var = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());
        let flag = |k: &str| var(k).is_some_and(|v| matches!(v.as_str(), "1" | "true" | "yes"));
        Self {
            database: DatabaseEnv::from_env(),
            public_url: var("PUBLIC_URL").map(|u| u.trim_end_matches('/').to_string()),
            default_target: var("STAGEHAND_TARGET").map(PathBuf::from),
            dry_run: flag("STAGEHAND_DRY_RUN"),
            force: flag("STAGEHAND_FORCE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_match_basics() {
        assert!(wildcard_match("*.log", "app.log"));
        assert!(!wildcard_match("*.log", "app.log.bak"));
        assert!(wildcard_match(".env*", ".env.production"));
        assert!(wildcard_match("?.txt", "a.txt"));
        assert!(!wildcard_match("?.txt", "ab.txt"));
        assert!(wildcard_match("exact", "exact"));
    }

    #[test]
    fn directory_patterns_match_any_component() {
        let policy = ExclusionPolicy {
            exclude_patterns: vec!["node_modules/".into(), "*.log".into()],
            include_patterns: None,
            preserve_directories: vec![],
            rsync_options: vec![],
        };
        assert!(policy.is_excluded(Path::new("node_modules/pkg/index.js")));
        assert!(policy.is_excluded(Path::new("ext/a/node_modules/x")));
        assert!(policy.is_excluded(Path::new("logs/app.log")));
        assert!(!policy.is_excluded(Path::new("src/main.js")));
    }

    #[test]
    fn exclusion_policy_always_contains_preserved_dirs() {
        let config = DeployConfig {
            exclude_patterns: vec!["*.tmp".into()],
            preserve_directories: vec!["uploads".into()],
            ..Default::default()
        };
        let policy = config.exclusion_policy();
        assert!(policy.exclude_patterns.contains(&"uploads/".into()));
        assert!(policy.is_excluded(Path::new("uploads/img.png")));
    }

    #[test]
    fn default_config_is_valid() {
        DeployConfig::default().validate().unwrap();
    }

    #[test]
    fn invalid_mode_rejected() {
        let config = DeployConfig {
            permissions: PermissionsConfig {
                file_mode: "9z9".into(),
                directory_mode: "755".into(),
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let err = DeployConfig::load(Some(Path::new("/nonexistent/stagehand.json")));
        assert!(err.is_err());
    }
}
