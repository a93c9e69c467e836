//! `cilantro keys`: node identity.

use super::fail;
use crate::config::{require_node_keys, SIGNING_KEY_ENV};
use cilantro_types::NodeConfig;
use cilantro_wire::NodeKeys;

fn print_keys(keys: &NodeKeys, include_seed: bool, json: bool) {
    let encryption_key = hex::encode(keys.encryption_public().as_bytes());
    if json {
        let mut out = serde_json::json!({
            "verifying_key": keys.verifying_key_hex(),
            "encryption_key": encryption_key,
            "fingerprint": keys.fingerprint(),
        });
        if include_seed {
            out["signing_key"] = serde_json::Value::String(keys.seed_hex().to_string());
        }
        println!(
            "{}",
            serde_json::to_string_pretty(&out).unwrap_or_else(|e| fail(e))
        );
        return;
    }
    if include_seed {
        println!("Signing key:    {}", keys.seed_hex().as_str());
    }
    println!("Verifying key:  {}", keys.verifying_key_hex());
    println!("Encryption key: {encryption_key}");
    println!("Fingerprint:    {}", keys.fingerprint());
}

pub fn cmd_keys_generate(json: bool) {
    let keys = NodeKeys::generate();
    print_keys(&keys, true, json);
    if !json {
        println!();
        println!("Store the signing key as `signing_key` in the config file or in {SIGNING_KEY_ENV}.");
    }
}

pub fn cmd_keys_show(config: &NodeConfig, json: bool) {
    let keys = require_node_keys(config).unwrap_or_else(|e| fail(e));
    print_keys(&keys, false, json);
}
