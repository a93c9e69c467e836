//! `cilantro auth`: the node's authorized-keys store.

use super::fail;
use crate::config::require_node_keys;
use cilantro_types::NodeConfig;
use cilantro_wire::AuthStore;

fn open_store(config: &NodeConfig) -> AuthStore {
    let keys = require_node_keys(config).unwrap_or_else(|e| fail(e));
    AuthStore::open(&config.certs_dir, &keys, false)
        .unwrap_or_else(|e| fail(format!("Failed to open authorized keys: {e}")))
}

pub fn cmd_auth_add(config: &NodeConfig, vk: &str, domain: &str) {
    let store = open_store(config);
    match store.authorize_vk(vk, domain) {
        Ok(()) => println!("Authorized {vk} in domain '{domain}'"),
        Err(e) => fail(e),
    }
}

pub fn cmd_auth_remove(config: &NodeConfig, vk: &str, domain: &str) {
    let store = open_store(config);
    match store.revoke_vk(vk, domain) {
        Ok(()) => println!("Revoked {vk} from domain '{domain}'"),
        Err(e) => fail(e),
    }
}

pub fn cmd_auth_list(config: &NodeConfig, domain: &str) {
    let store = open_store(config);
    let keys = store.list(domain).unwrap_or_else(|e| fail(e));
    if keys.is_empty() {
        println!("No keys authorized in domain '{domain}'");
        return;
    }
    println!("Authorized keys in domain '{domain}':");
    for key in keys {
        println!("  {key}");
    }
}
