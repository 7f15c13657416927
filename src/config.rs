use std::{collections::HashMap, env, fs, net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use crate::models::Caller;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub work_dir: PathBuf,
    pub db_path: PathBuf,
    pub program: String,
    pub program_args: Vec<String>,
    pub timeout_ms: u64,
    pub timeout_sync_ms: u64,
    pub kill_grace_ms: u64,
    pub geometry_limit: usize,
    pub geometry_limit_sync: usize,
    pub max_body_bytes: usize,
    pub job_cache_ttl_seconds: u64,
    pub result_retention_seconds: u64,
    pub recent_jobs: usize,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max_requests: u32,
    pub shutdown_grace_ms: u64,
    pub api_keys: HashMap<String, Caller>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            work_dir: PathBuf::from("temp"),
            db_path: PathBuf::from("analysis_jobs.sqlite3"),
            program: "python".to_string(),
            program_args: vec!["src/python/analysis.py".to_string()],
            timeout_ms: 90_000,
            timeout_sync_ms: 30_000,
            kill_grace_ms: 500,
            geometry_limit: 1000,
            geometry_limit_sync: 300,
            max_body_bytes: 50 * 1024 * 1024,
            job_cache_ttl_seconds: 24 * 60 * 60,
            result_retention_seconds: 7 * 24 * 60 * 60,
            recent_jobs: 20,
            rate_limit_window_ms: 60_000,
            rate_limit_max_requests: 30,
            shutdown_grace_ms: 5_000,
            api_keys: HashMap::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let bind_raw =
            env::var("ANALYSIS_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or(defaults.bind_addr);

        let work_dir = env::var("ANALYSIS_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.work_dir);

        let db_path = env::var("ANALYSIS_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let program = env::var("ANALYSIS_PROGRAM")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.program);

        let program_args = env::var("ANALYSIS_PROGRAM_ARGS")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or(defaults.program_args);

        let mut api_keys = match env::var("ANALYSIS_API_KEYS") {
            Ok(raw) => parse_api_keys(raw.split(','))?,
            Err(_) => HashMap::new(),
        };
        if let Ok(key_file) = env::var("ANALYSIS_API_KEYS_FILE") {
            let raw = fs::read_to_string(&key_file)
                .with_context(|| format!("Failed reading ANALYSIS_API_KEYS_FILE at {key_file}"))?;
            api_keys.extend(parse_api_keys(raw.lines())?);
        }
        if api_keys.is_empty() {
            warn!("No API keys configured; every submission runs anonymously");
        }

        Ok(Self {
            bind_addr,
            work_dir,
            db_path,
            program,
            program_args,
            timeout_ms: env_parse("ANALYSIS_TIMEOUT_MS").unwrap_or(defaults.timeout_ms),
            timeout_sync_ms: env_parse("ANALYSIS_TIMEOUT_SYNC_MS")
                .unwrap_or(defaults.timeout_sync_ms),
            kill_grace_ms: env_parse("ANALYSIS_KILL_GRACE_MS").unwrap_or(defaults.kill_grace_ms),
            geometry_limit: env_parse("ANALYSIS_GEOMETRY_LIMIT")
                .unwrap_or(defaults.geometry_limit),
            geometry_limit_sync: env_parse("ANALYSIS_GEOMETRY_LIMIT_SYNC")
                .unwrap_or(defaults.geometry_limit_sync),
            max_body_bytes: env_parse("ANALYSIS_MAX_BODY_BYTES")
                .unwrap_or(defaults.max_body_bytes),
            job_cache_ttl_seconds: env_parse("ANALYSIS_JOB_CACHE_TTL_SECONDS")
                .unwrap_or(defaults.job_cache_ttl_seconds),
            result_retention_seconds: env_parse("ANALYSIS_RESULT_RETENTION_SECONDS")
                .unwrap_or(defaults.result_retention_seconds),
            recent_jobs: env_parse("ANALYSIS_RECENT_JOBS").unwrap_or(defaults.recent_jobs),
            rate_limit_window_ms: env_parse("RATE_LIMIT_WINDOW_MS")
                .unwrap_or(defaults.rate_limit_window_ms),
            rate_limit_max_requests: env_parse("RATE_LIMIT_MAX_REQUESTS")
                .unwrap_or(defaults.rate_limit_max_requests),
            shutdown_grace_ms: env_parse("ANALYSIS_SHUTDOWN_GRACE_MS")
                .unwrap_or(defaults.shutdown_grace_ms),
            api_keys,
        })
    }

    pub fn timeout_for(&self, is_async: bool) -> u64 {
        if is_async {
            self.timeout_ms
        } else {
            self.timeout_sync_ms
        }
    }

    pub fn geometry_limit_for(&self, is_async: bool) -> usize {
        if is_async {
            self.geometry_limit
        } else {
            self.geometry_limit_sync
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// Parses `key=owner[:maxConcurrent]` entries; blank entries and `#` comments
/// are skipped.
pub fn parse_api_keys<'a, I>(entries: I) -> Result<HashMap<String, Caller>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut keys = HashMap::new();
    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() || entry.starts_with('#') {
            continue;
        }
        let (key, identity) = entry
            .split_once('=')
            .with_context(|| format!("API key entry `{entry}` must look like key=owner"))?;
        let (owner, max_concurrent) = match identity.split_once(':') {
            Some((owner, max)) => {
                let max = max
                    .trim()
                    .parse::<u32>()
                    .with_context(|| format!("Invalid max concurrent value in `{entry}`"))?;
                (owner, Some(max))
            }
            None => (identity, None),
        };
        keys.insert(
            key.trim().to_string(),
            Caller {
                owner: owner.trim().to_string(),
                max_concurrent_analyses: max_concurrent,
            },
        );
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_entries_parse_with_optional_limit() {
        let keys = parse_api_keys(["k1=alice:2", " k2 = bob ", "", "# comment"]).expect("parse");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys["k1"].owner, "alice");
        assert_eq!(keys["k1"].max_concurrent_analyses, Some(2));
        assert_eq!(keys["k2"].owner, "bob");
        assert_eq!(keys["k2"].max_concurrent_analyses, None);
    }

    #[test]
    fn malformed_api_key_entry_is_rejected() {
        assert!(parse_api_keys(["no-separator"]).is_err());
        assert!(parse_api_keys(["k=alice:many"]).is_err());
    }

    #[test]
    fn sync_mode_uses_the_stricter_limits() {
        let config = Config::default();
        assert!(config.geometry_limit_for(false) < config.geometry_limit_for(true));
        assert!(config.timeout_for(false) < config.timeout_for(true));
    }
}
