use std::path::PathBuf;

pub const DB_ENV: &str = "JOBTRAIL_DB";
pub const USER_ENV: &str = "JOBTRAIL_USER";
pub const LOG_ENV: &str = "JOBTRAIL_LOG";

const DEFAULT_LOG_FILTER: &str = "warn";
const DEFAULT_OWNER: &str = "local";

/// Runtime settings resolved from flags, environment and platform defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub db_path: PathBuf,
    /// Identity every read and write is scoped to.
    pub owner: String,
    pub log_filter: String,
}

impl Config {
    /// Fill whatever was not given explicitly from the process environment.
    pub fn resolve(db: Option<PathBuf>, user: Option<String>, log: Option<String>) -> Self {
        Self::resolve_with(db, user, log, |key| std::env::var(key).ok())
    }

    fn resolve_with(
        db: Option<PathBuf>,
        user: Option<String>,
        log: Option<String>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let owner = user
            .or_else(|| env("USER"))
            .or_else(|| env("USERNAME"))
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_OWNER.to_string());
        Self {
            db_path: db.unwrap_or_else(Self::default_db_path),
            owner,
            log_filter: log
                .filter(|l| !l.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        }
    }

    pub fn default_db_path() -> PathBuf {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "jobtrail") {
            proj_dirs.data_dir().join("jobtrail.db")
        } else {
            PathBuf::from("jobtrail.db")
        }
    }
}
