use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use fjall::Keyspace;

/// Runtime settings derived from environment variables.
#[derive(Clone, Debug)]
pub(crate) struct Config {
    /// Listen port for the HTTP API.
    pub(crate) port: u16,
    /// Hostname used to mint IRIs, e.g. `social.example`.
    pub(crate) host: String,
    /// TLS material for the fronting listener; termination itself is a
    /// collaborator, the paths are only carried here.
    pub(crate) tls_cert: Option<PathBuf>,
    pub(crate) tls_key: Option<PathBuf>,
    /// Items per OrderedCollectionPage.
    pub(crate) page_size: usize,
    /// Number of concurrent delivery workers.
    pub(crate) delivery_workers: usize,
    /// Delivery attempts before a job is retired.
    pub(crate) delivery_max_attempts: u32,
    /// Root directory for the keyspace.
    pub(crate) data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 8420,
            host: "localhost".to_string(),
            tls_cert: None,
            tls_key: None,
            page_size: 20,
            delivery_workers: 4,
            delivery_max_attempts: 8,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Config {
    pub(crate) fn from_env() -> Result<Config> {
        let mut config = Config::default();
        if let Some(port) = opt_var("PORT") {
            config.port = port.parse().context("PORT must be a port number")?;
        }
        if let Some(host) = opt_var("HOST") {
            config.host = host;
        }
        config.tls_cert = opt_var("TLS_CERT").map(PathBuf::from);
        config.tls_key = opt_var("TLS_KEY").map(PathBuf::from);
        if let Some(size) = opt_var("PAGE_SIZE") {
            config.page_size = size.parse().context("PAGE_SIZE must be an integer")?;
            if config.page_size == 0 {
                bail!("PAGE_SIZE must be at least 1");
            }
        }
        if let Some(workers) = opt_var("DELIVERY_WORKERS") {
            config.delivery_workers = workers
                .parse()
                .context("DELIVERY_WORKERS must be an integer")?;
        }
        if let Some(attempts) = opt_var("DELIVERY_MAX_ATTEMPTS") {
            config.delivery_max_attempts = attempts
                .parse()
                .context("DELIVERY_MAX_ATTEMPTS must be an integer")?;
        }
        if let Some(dir) = opt_var("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    /// Base IRI of this instance. All minted ids hang off of it.
    pub(crate) fn base_url(&self) -> String {
        format!("https://{}", self.host)
    }
}

fn opt_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

#[derive(Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) init: Config,
    pub(crate) keyspace: Keyspace,
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.page_size, 20);
        assert_eq!(config.delivery_max_attempts, 8);
        assert_eq!(config.base_url(), "https://localhost");
    }
}
