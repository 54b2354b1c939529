pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod parser;

use std::fs;
use std::path::Path;
use tds_common::Config;

pub use engine::client::{ClientResult, DbClientConfig, DbClientExecutor, TdsClientExecutor};
pub use engine::credentials::{clone_credentials, credential_map, CredentialMap};
pub use engine::listener::open_loopback_listener;
pub use engine::mock::{AcceptHandle, MockTarget, MockTargetCapture};
pub use engine::proxy::{
    InProcessProxyFactory, InProcessProxyService, ProxyService, ProxyServiceFactory,
    ACTIVE_CONNECTIONS,
};
pub use engine::request::{ClientRequest, MockResponse, ProxyResponse};
pub use error::{HarnessError, Result};

/// Reads a YAML configuration file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)
        .map_err(|e| HarnessError::Config(format!("reading {}: {}", path.display(), e)))?;
    Ok(Config::from_yaml_str(&data)?)
}
