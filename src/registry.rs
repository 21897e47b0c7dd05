use std::collections::BTreeMap;

/// Default authority profile for a known vendor
#[derive(Debug, Clone)]
pub struct SourceProfile {
    pub vendor: String,
    pub default_authority: u8,
}

/// Explicit registry of known sources, passed into the engine by the host.
///
/// Replaces ambient/global source registries: construct one, register the
/// vendors you ingest, and hand it to whatever needs authority defaults.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    entries: BTreeMap<String, SourceProfile>,
    derived_authority: u8,
}

impl SourceRegistry {
    pub fn new(derived_authority: u8) -> Self {
        Self {
            entries: BTreeMap::new(),
            derived_authority,
        }
    }

    /// Registry seeded with the usual suspects. Authority values are
    /// caller-supplied rankings, not engine semantics.
    pub fn with_defaults(derived_authority: u8) -> Self {
        let mut registry = Self::new(derived_authority);
        registry.register("sec", 100);
        registry.register("press_release", 80);
        registry.register("factset", 70);
        registry.register("bloomberg", 70);
        registry.register("refinitiv", 65);
        registry.register("scraped", 50);
        registry
    }

    pub fn register(&mut self, vendor: impl Into<String>, default_authority: u8) {
        let vendor = vendor.into();
        self.entries.insert(
            vendor.clone(),
            SourceProfile {
                vendor,
                default_authority,
            },
        );
    }

    pub fn authority_for(&self, vendor: &str) -> Option<u8> {
        self.entries.get(vendor).map(|p| p.default_authority)
    }

    pub fn vendors(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    /// Authority for observations this engine derives itself
    pub fn derived_authority(&self) -> u8 {
        self.derived_authority
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_rank_filings_highest() {
        let registry = SourceRegistry::with_defaults(10);
        assert_eq!(registry.authority_for("sec"), Some(100));
        assert!(registry.authority_for("sec") > registry.authority_for("scraped"));
        assert!(registry.derived_authority() < registry.authority_for("scraped").unwrap());
    }

    #[test]
    fn vendors_iterate_lexically() {
        let registry = SourceRegistry::with_defaults(10);
        let vendors: Vec<&str> = registry.vendors().collect();
        let mut sorted = vendors.clone();
        sorted.sort_unstable();
        assert_eq!(vendors, sorted);
    }
}
