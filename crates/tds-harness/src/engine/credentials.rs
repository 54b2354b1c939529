//! Credential maps handed to the proxy service.
//!
//! Values are opaque bytes that a consumer may zeroize once it is done with
//! them, so callers that need to keep their copy pass a clone inward.

use std::collections::HashMap;
use tracing::debug;
use zeroize::Zeroize;

pub type CredentialMap = HashMap<String, Vec<u8>>;

/// Upstream address keys understood by the proxy service.
pub const HOST_KEY: &str = "host";
pub const PORT_KEY: &str = "port";
/// Injected into LOGIN7. `user` is accepted as an alias for `username`.
pub const USERNAME_KEY: &str = "username";
pub const USER_KEY: &str = "user";
pub const PASSWORD_KEY: &str = "password";

/// Builds a map from string pairs.
pub fn credential_map<I, K, V>(pairs: I) -> CredentialMap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: AsRef<[u8]>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.as_ref().to_vec()))
        .collect()
}

/// Deep copy: every value lands in a fresh buffer of equal length.
pub fn clone_credentials(original: &CredentialMap) -> CredentialMap {
    let mut clone = CredentialMap::with_capacity(original.len());
    for (key, value) in original {
        let mut value_clone = Vec::with_capacity(value.len());
        value_clone.extend_from_slice(value);
        clone.insert(key.clone(), value_clone);
    }
    clone
}

/// Points a credential map at `host:port`. The given address always wins over
/// any `host`/`port` entries the caller supplied.
pub fn target_credentials(host: &str, port: &str, credentials: CredentialMap) -> CredentialMap {
    let mut merged = CredentialMap::with_capacity(credentials.len() + 2);
    merged.insert(HOST_KEY.to_string(), host.as_bytes().to_vec());
    merged.insert(PORT_KEY.to_string(), port.as_bytes().to_vec());

    for (key, mut value) in credentials {
        if merged.contains_key(&key) {
            debug!(key = %key, "Discarding caller-supplied upstream address entry");
            value.zeroize();
            continue;
        }
        merged.insert(key, value);
    }
    merged
}

/// Zeroes every value in place, keeping its length.
pub fn zeroize_credentials(credentials: &mut CredentialMap) {
    for value in credentials.values_mut() {
        value.as_mut_slice().zeroize();
    }
}
