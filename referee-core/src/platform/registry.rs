use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::RefereeConfig;

use super::{Extractor, PlatformSpec, ScriptExtractor};

#[derive(Clone)]
pub struct RegisteredPlatform {
    pub spec: Arc<PlatformSpec>,
    pub extractor: Arc<dyn Extractor>,
}

impl std::fmt::Debug for RegisteredPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredPlatform")
            .field("id", &self.spec.id)
            .field("kind", &self.spec.kind)
            .finish()
    }
}

/// Platform id to spec and extractor. Built once at startup.
#[derive(Debug, Clone, Default)]
pub struct PlatformRegistry {
    platforms: BTreeMap<String, RegisteredPlatform>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every configured platform, each with the script extractor.
    pub fn from_config(config: &RefereeConfig) -> Self {
        let extractor: Arc<dyn Extractor> = Arc::new(ScriptExtractor::new());
        let mut registry = Self::new();
        for section in &config.platforms {
            registry.insert(
                PlatformSpec::from_section(section, config.session.ttl_seconds),
                Arc::clone(&extractor),
            );
        }
        registry
    }

    pub fn insert(&mut self, spec: PlatformSpec, extractor: Arc<dyn Extractor>) {
        self.platforms.insert(
            spec.id.clone(),
            RegisteredPlatform {
                spec: Arc::new(spec),
                extractor,
            },
        );
    }

    /// Swaps the extractor of an already configured platform.
    pub fn register_extractor(&mut self, platform_id: &str, extractor: Arc<dyn Extractor>) -> bool {
        match self.platforms.get_mut(platform_id) {
            Some(platform) => {
                platform.extractor = extractor;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, platform_id: &str) -> Option<&RegisteredPlatform> {
        self.platforms.get(platform_id)
    }

    pub fn contains(&self, platform_id: &str) -> bool {
        self.platforms.contains_key(platform_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.platforms.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredPlatform> {
        self.platforms.values()
    }

    pub fn len(&self) -> usize {
        self.platforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }
}
