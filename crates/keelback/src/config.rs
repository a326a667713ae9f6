//! The immutable configuration of the core, derived from the process
//! environment exactly once at startup and passed explicitly everywhere.

use std::{path::PathBuf, time::Duration};

use keelback_types::Platform;
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};

/// Configuration consumed by the index engine and the transaction engine.
///
/// Every field maps to a `CONDA_*` environment variable; see
/// [`CoreConfig::from_env`]. There is deliberately no global instance: tests
/// and embedders construct their own values.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// The platform to solve and install for.
    pub platform: Platform,

    /// Directories holding downloaded archives and extracted packages. The
    /// first writable directory is used for new downloads; all of them are
    /// searched for existing packages.
    pub pkgs_dirs: Vec<PathBuf>,

    /// Directories in which named environments are created.
    pub envs_dirs: Vec<PathBuf>,

    /// The repodata freshness window: `<= 0` never trusts the cache, `1`
    /// defers to the server's `Cache-Control`, any other value is the window
    /// in seconds.
    pub local_repodata_ttl: i64,

    /// Whether every `python` record grows a `pip` dependency.
    pub add_pip_as_python_dependency: bool,

    /// Whether missing subdirs are tolerated as empty repodata.
    pub allow_non_channel_urls: bool,

    /// Whether TLS certificates are verified.
    pub ssl_verify: bool,
}

impl CoreConfig {
    /// Builds the configuration from the `CONDA_*` environment variables,
    /// with conda's defaults for everything unset.
    pub fn from_env() -> CoreConfig {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));

        let path_list = |variable: &str, default: PathBuf| -> Vec<PathBuf> {
            match std::env::var(variable) {
                Ok(value) if !value.trim().is_empty() => value
                    .split(if cfg!(windows) { ';' } else { ':' })
                    .map(PathBuf::from)
                    .collect(),
                _ => vec![default],
            }
        };

        let flag = |variable: &str, default: bool| -> bool {
            match std::env::var(variable) {
                Ok(value) => matches!(
                    value.trim().to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                ),
                Err(_) => default,
            }
        };

        CoreConfig {
            platform: Platform::current(),
            pkgs_dirs: path_list("CONDA_PKGS_DIRS", home.join(".conda").join("pkgs")),
            envs_dirs: path_list("CONDA_ENVS_DIRS", home.join(".conda").join("envs")),
            local_repodata_ttl: std::env::var("CONDA_LOCAL_REPODATA_TTL")
                .ok()
                .and_then(|value| value.trim().parse().ok())
                .unwrap_or(1),
            add_pip_as_python_dependency: flag("CONDA_ADD_PIP_AS_PYTHON_DEPENDENCY", true),
            allow_non_channel_urls: flag("CONDA_ALLOW_NON_CHANNEL_URLS", false),
            ssl_verify: flag("CONDA_SSL_VERIFY", true),
        }
    }

    /// The directory new packages are downloaded into.
    pub fn writable_pkgs_dir(&self) -> &PathBuf {
        self.pkgs_dirs
            .first()
            .expect("the configuration always has at least one pkgs dir")
    }

    /// The repodata cache directory inside the packages directory.
    pub fn repodata_cache_dir(&self) -> PathBuf {
        self.writable_pkgs_dir().join("cache")
    }

    /// Builds the HTTP client used for repodata and package downloads:
    /// separate connect and read timeouts, transparent retries with
    /// exponential backoff for transient failures, and TLS verification
    /// controlled by `CONDA_SSL_VERIFY`. Proxies are picked up from the
    /// standard `HTTP(S)_PROXY` variables by reqwest itself.
    pub fn http_client(&self) -> ClientWithMiddleware {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(60))
            .danger_accept_invalid_certs(!self.ssl_verify)
            .build()
            .expect("the static client configuration is valid");

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        reqwest_middleware::ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build()
    }
}

#[cfg(test)]
mod test {
    use super::CoreConfig;

    #[test]
    fn env_overrides_are_honored() {
        temp_env::with_vars(
            [
                ("CONDA_PKGS_DIRS", Some("/tmp/pkgs-a:/tmp/pkgs-b")),
                ("CONDA_LOCAL_REPODATA_TTL", Some("600")),
                ("CONDA_ADD_PIP_AS_PYTHON_DEPENDENCY", Some("false")),
                ("CONDA_ALLOW_NON_CHANNEL_URLS", Some("1")),
            ],
            || {
                let config = CoreConfig::from_env();
                assert_eq!(config.pkgs_dirs.len(), 2);
                assert_eq!(config.writable_pkgs_dir().to_str(), Some("/tmp/pkgs-a"));
                assert_eq!(config.local_repodata_ttl, 600);
                assert!(!config.add_pip_as_python_dependency);
                assert!(config.allow_non_channel_urls);
                assert!(config.ssl_verify);
            },
        );
    }

    #[test]
    fn defaults_without_env() {
        temp_env::with_vars(
            [
                ("CONDA_PKGS_DIRS", None::<&str>),
                ("CONDA_LOCAL_REPODATA_TTL", None),
                ("CONDA_ADD_PIP_AS_PYTHON_DEPENDENCY", None),
            ],
            || {
                let config = CoreConfig::from_env();
                assert_eq!(config.local_repodata_ttl, 1);
                assert!(config.add_pip_as_python_dependency);
                assert!(config.repodata_cache_dir().ends_with("cache"));
            },
        );
    }
}
