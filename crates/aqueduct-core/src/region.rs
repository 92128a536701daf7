//! Endpoint-name region classification.
//!
//! Voice-server endpoints encode their region in the hostname
//! (`us-west42.example.com`, `vip-amsterdam33.example.com`). The table maps a
//! region key to the hostname prefixes known to belong to it.

use std::collections::HashMap;

/// The built-in region table. Operators override it through
/// [`PoolConfig::regions`](crate::PoolConfig).
pub fn default_regions() -> HashMap<String, Vec<String>> {
    let mut regions = HashMap::new();
    regions.insert(
        "asia".to_string(),
        ["hongkong", "singapore", "sydney", "japan", "southafrica"]
            .map(String::from)
            .to_vec(),
    );
    regions.insert(
        "eu".to_string(),
        ["eu", "amsterdam", "frankfurt", "russia", "london", "rotterdam"]
            .map(String::from)
            .to_vec(),
    );
    regions.insert("us".to_string(), ["us", "brazil"].map(String::from).to_vec());
    regions
}

/// Classify a raw endpoint into a region key. Only regions for which
/// `has_available_node` holds participate; when nothing matches, the
/// configured default (else `"us"`) is returned.
pub(crate) fn classify(
    endpoint: &str,
    regions: &HashMap<String, Vec<String>>,
    default_region: Option<&str>,
    has_available_node: impl Fn(&str) -> bool,
) -> String {
    let endpoint = endpoint.strip_prefix("vip-").unwrap_or(endpoint);

    // Deterministic scan order; the prefix sets are disjoint in practice.
    let mut keys: Vec<&String> = regions.keys().collect();
    keys.sort();
    for key in keys {
        if !has_available_node(key) {
            continue;
        }
        let Some(prefixes) = regions.get(key) else {
            continue;
        };
        if prefixes.iter().any(|prefix| endpoint.starts_with(prefix)) {
            return key.clone();
        }
    }

    default_region.unwrap_or("us").to_string()
}
