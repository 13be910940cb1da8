//! Configuration for gitbridge.
//!
//! Settings come from an optional TOML file, then environment variables are
//! overlaid on top. The access token is never stored in the file; the file
//! only names the environment variable that holds it (`git.token_env`), and
//! the value is resolved at runtime via [`BridgeConfig::resolve_token`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level gitbridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Where projects are read from and clones are kept.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Remote access and commit identity.
    #[serde(default)]
    pub git: GitConfig,

    /// Polling and timeout settings.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Which files of a project are mirrored.
    #[serde(default)]
    pub content: ContentConfig,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root directory whose immediate children are compiled projects.
    #[serde(default = "default_compiles_dir")]
    pub compiles_dir: PathBuf,

    /// Directory holding one persistent local clone per linked project.
    #[serde(default = "default_clones_dir")]
    pub clones_dir: PathBuf,

    /// Name of the per-project link descriptor file.
    #[serde(default = "default_descriptor_file")]
    pub descriptor_file: String,

    /// Optional file replacing the built-in ignore template.
    #[serde(default)]
    pub gitignore_template: Option<PathBuf>,
}

fn default_compiles_dir() -> PathBuf {
    PathBuf::from("/data/compiles")
}

fn default_clones_dir() -> PathBuf {
    PathBuf::from("/var/lib/gitbridge/clones")
}

fn default_descriptor_file() -> String {
    ".gitinfo".into()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            compiles_dir: default_compiles_dir(),
            clones_dir: default_clones_dir(),
            descriptor_file: default_descriptor_file(),
            gitignore_template: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Environment variable holding the access token.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Author/committer name for mirror commits.
    #[serde(default = "default_user_name")]
    pub user_name: String,

    /// Author/committer email for mirror commits.
    #[serde(default = "default_user_email")]
    pub user_email: String,

    /// Commit message template.
    /// Placeholders: `{folder_name}`, `{timestamp}`, `{project_path}`
    #[serde(default = "default_commit_template")]
    pub commit_message_template: String,

    /// Deadline for a single clone, fetch or push.
    #[serde(default = "default_git_timeout")]
    pub timeout_secs: u64,

    /// Resolved token (populated by `resolve_token`).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".into()
}

fn default_user_name() -> String {
    "GitBridge".into()
}

fn default_user_email() -> String {
    "gitbridge@example.com".into()
}

fn default_commit_template() -> String {
    "Update from Overleaf ({folder_name})".into()
}

fn default_git_timeout() -> u64 {
    120
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            user_name: default_user_name(),
            user_email: default_user_email(),
            commit_message_template: default_commit_template(),
            timeout_secs: default_git_timeout(),
            token: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds between the end of one cycle and the start of the next.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Projects compiled longer ago than this are left out of a cycle.
    /// Unset means "same as the poll interval"; 0 disables the filter.
    #[serde(default)]
    pub recent_window_secs: Option<u64>,

    /// Upper bound for one project's whole sync attempt.
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,

    /// How long shutdown waits for detached attempts to release their clones.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_poll_interval() -> u64 {
    300
}

fn default_attempt_timeout() -> u64 {
    600
}

fn default_shutdown_grace() -> u64 {
    30
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            recent_window_secs: None,
            attempt_timeout_secs: default_attempt_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentConfig {
    /// Glob patterns (relative, forward-slash paths) never copied into a clone.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Skip files larger than this (in bytes). 0 = no limit.
    #[serde(default)]
    pub max_file_size: u64,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// When set, logs are also written to daily-rotated files here.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl BridgeConfig {
    /// Load a [`BridgeConfig`] from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: BridgeConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Load from an optional file, then overlay the process environment and
    /// resolve the token.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::load_from_file(p)?,
            None => Self::default(),
        };
        let lookup = |name: &str| std::env::var(name).ok();
        config.apply_env(lookup)?;
        config.resolve_token(lookup);
        Ok(config)
    }

    /// Overlay settings from environment variables.
    ///
    /// `lookup` returns the value of a variable, if set.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("COMPILES_DIR") {
            self.paths.compiles_dir = PathBuf::from(v);
        }
        if let Some(v) = get("CLONES_DIR").or_else(|| get("TEMP_DIR_BASE")) {
            self.paths.clones_dir = PathBuf::from(v);
        }
        if let Some(v) = get("GITINFO_FILENAME") {
            self.paths.descriptor_file = v;
        }
        if let Some(v) = get("GITIGNORE_TEMPLATE") {
            self.paths.gitignore_template = Some(PathBuf::from(v));
        }
        if let Some(v) = get("GIT_USER_NAME") {
            self.git.user_name = v;
        }
        if let Some(v) = get("GIT_USER_EMAIL") {
            self.git.user_email = v;
        }
        if let Some(v) = get("COMMIT_MESSAGE_TEMPLATE") {
            self.git.commit_message_template = v;
        }
        if let Some(v) = get("GIT_TIMEOUT") {
            self.git.timeout_secs = parse_secs(&v, "GIT_TIMEOUT")?;
        }
        if let Some(v) = get("CHECK_INTERVAL") {
            self.schedule.poll_interval_secs = parse_secs(&v, "CHECK_INTERVAL")?;
        }
        if let Some(v) = get("RECENT_WINDOW") {
            self.schedule.recent_window_secs = Some(parse_secs(&v, "RECENT_WINDOW")?);
        }
        if let Some(v) = get("ATTEMPT_TIMEOUT") {
            self.schedule.attempt_timeout_secs = parse_secs(&v, "ATTEMPT_TIMEOUT")?;
        }
        if let Some(v) = get("SHUTDOWN_GRACE") {
            self.schedule.shutdown_grace_secs = parse_secs(&v, "SHUTDOWN_GRACE")?;
        }
        if let Some(v) = get("EXCLUDE_PATTERNS") {
            self.content.exclude_patterns = v
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = get("MAX_FILE_SIZE") {
            self.content.max_file_size = v.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: "MAX_FILE_SIZE".into(),
                detail: format!("'{v}' is not a byte count"),
            })?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.logging.log_level = v;
        }
        if let Some(v) = get("LOG_DIR") {
            self.logging.log_dir = Some(PathBuf::from(v));
        }

        debug!("environment overrides applied");
        Ok(())
    }

    /// Resolve the access token from the variable named by `git.token_env`.
    pub fn resolve_token<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_name = self.git.token_env.clone();
        self.git.token = match lookup(&env_name) {
            Some(val) if !val.trim().is_empty() => {
                debug!(env_name, "resolved access token");
                Some(val.trim().to_string())
            }
            Some(_) => {
                warn!(env_name, "token env var is set but empty");
                None
            }
            None => {
                warn!(env_name, "token env var not set");
                None
            }
        };
    }

    /// Validate that all required fields are present and sane.
    ///
    /// `require_token` is false for read-only commands such as `scan`.
    pub fn validate(&self, require_token: bool) -> Result<(), ConfigError> {
        if require_token && self.git.token.is_none() {
            return Err(ConfigError::EnvVarMissing {
                var: self.git.token_env.clone(),
                field: "git.token_env".into(),
            });
        }
        if self.paths.descriptor_file.trim().is_empty() {
            return Err(invalid("paths.descriptor_file", "descriptor file name must not be empty"));
        }
        if self.paths.descriptor_file.contains('/') {
            return Err(invalid("paths.descriptor_file", "descriptor file name must not contain '/'"));
        }
        if self.git.user_name.trim().is_empty() {
            return Err(invalid("git.user_name", "commit author name must not be empty"));
        }
        if self.git.user_email.trim().is_empty() {
            return Err(invalid("git.user_email", "commit author email must not be empty"));
        }
        if self.git.commit_message_template.trim().is_empty() {
            return Err(invalid(
                "git.commit_message_template",
                "commit message template must not be empty",
            ));
        }
        if self.git.timeout_secs == 0 {
            return Err(invalid("git.timeout_secs", "timeout must be > 0"));
        }
        if self.schedule.poll_interval_secs == 0 {
            return Err(invalid("schedule.poll_interval_secs", "poll interval must be > 0"));
        }
        if self.schedule.attempt_timeout_secs == 0 {
            return Err(invalid("schedule.attempt_timeout_secs", "attempt timeout must be > 0"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.poll_interval_secs)
    }

    /// Recency window for the scanner; `None` disables the filter.
    pub fn recent_window(&self) -> Option<Duration> {
        match self
            .schedule
            .recent_window_secs
            .unwrap_or(self.schedule.poll_interval_secs)
        {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git.timeout_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.schedule.attempt_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.schedule.shutdown_grace_secs)
    }

    /// Human-readable key/value view with the token redacted.
    pub fn summary(&self) -> Vec<(&'static str, String)> {
        let window = match self.recent_window() {
            Some(w) => format!("{}s", w.as_secs()),
            None => "disabled".into(),
        };
        vec![
            ("Compiles dir", self.paths.compiles_dir.display().to_string()),
            ("Clones dir", self.paths.clones_dir.display().to_string()),
            ("Descriptor", self.paths.descriptor_file.clone()),
            (
                "Ignore template",
                self.paths
                    .gitignore_template
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "built-in".into()),
            ),
            (
                "Token",
                match self.git.token {
                    Some(_) => format!("set (${})", self.git.token_env),
                    None => format!("missing (${})", self.git.token_env),
                },
            ),
            (
                "Author",
                format!("{} <{}>", self.git.user_name, self.git.user_email),
            ),
            ("Commit template", self.git.commit_message_template.clone()),
            ("Poll interval", format!("{}s", self.schedule.poll_interval_secs)),
            ("Recent window", window),
            ("Git timeout", format!("{}s", self.git.timeout_secs)),
            ("Attempt timeout", format!("{}s", self.schedule.attempt_timeout_secs)),
            ("Log level", self.logging.log_level.clone()),
        ]
    }

    /// Generate a default TOML config template string.
    pub fn default_template() -> &'static str {
        r#"# gitbridge configuration
# Environment variables (COMPILES_DIR, CHECK_INTERVAL, ...) override these values.

[paths]
compiles_dir = "/data/compiles"
clones_dir = "/var/lib/gitbridge/clones"
descriptor_file = ".gitinfo"
# gitignore_template = "/etc/gitbridge/gitignore"

[git]
token_env = "GITHUB_TOKEN"
user_name = "GitBridge"
user_email = "gitbridge@example.com"
commit_message_template = "Update from Overleaf ({folder_name})"
timeout_secs = 120

[schedule]
poll_interval_secs = 300
# recent_window_secs = 300   # defaults to the poll interval; 0 disables
attempt_timeout_secs = 600
shutdown_grace_secs = 30

[content]
# exclude_patterns = ["*.pdfsync"]
# max_file_size = 0          # 0 = no limit

[logging]
log_level = "info"
# log_dir = "/var/log/gitbridge"
"#
    }
}

fn invalid(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail: detail.into(),
    }
}

fn parse_secs(value: &str, field: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: field.into(),
        detail: format!("'{value}' is not a number of seconds"),
    })
}
