//! Node configuration.

use std::path::{Path, PathBuf};

use config::{ConfigError, Map, Source, Value};
use multiaddr::Multiaddr;
use serde::{Deserialize, Serialize};

/// Name of the optional config file inside the repo directory.
pub const CONFIG_FILE_NAME: &str = "braid.config.toml";

/// Environment prefix for config overrides, e.g. `BRAID_DEBUG=true`.
pub const ENV_PREFIX: &str = "BRAID";

/// Configuration of one braid node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Repository directory holding the datastore.
    pub repo_path: PathBuf,
    /// Multiaddress the host listens on.
    pub host_addr: Multiaddr,
    /// Multiaddress the local API binds to.
    pub api_addr: Multiaddr,
    /// Verbose logging.
    pub debug: bool,
    /// Trade memory for disk where possible.
    pub low_mem: bool,
    /// Peers dialed at startup.
    pub bootstrap_peers: Vec<Multiaddr>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            repo_path: PathBuf::from(".braid"),
            host_addr: "/ip4/0.0.0.0/tcp/4006".parse().expect("static multiaddr"),
            api_addr: "/ip4/127.0.0.1/tcp/6006".parse().expect("static multiaddr"),
            debug: false,
            low_mem: false,
            bootstrap_peers: Vec::new(),
        }
    }
}

impl Source for Config {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
        let mut map: Map<String, Value> = Map::new();
        map.insert(
            "repo_path".into(),
            Value::from(self.repo_path.to_string_lossy().to_string()),
        );
        map.insert("host_addr".into(), Value::from(self.host_addr.to_string()));
        map.insert("api_addr".into(), Value::from(self.api_addr.to_string()));
        map.insert("debug".into(), Value::from(self.debug));
        map.insert("low_mem".into(), Value::from(self.low_mem));
        let peers: Vec<String> = self
            .bootstrap_peers
            .iter()
            .map(|peer| peer.to_string())
            .collect();
        map.insert("bootstrap_peers".into(), Value::from(peers));
        Ok(map)
    }
}

/// Layer defaults, an optional config file, and `BRAID_*` environment
/// overrides into a [`Config`].
pub fn load_config(file: Option<&Path>) -> anyhow::Result<Config> {
    let mut builder = config::Config::builder().add_source(Config::default());
    if let Some(file) = file {
        builder = builder.add_source(config::File::from(file.to_path_buf()).required(false));
    }
    let built = builder
        .add_source(config::Environment::with_prefix(ENV_PREFIX))
        .build()?;
    Ok(built.try_deserialize()?)
}
