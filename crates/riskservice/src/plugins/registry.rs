use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use super::{Cha2ds2VascPlugin, MethodKey, RiskPlugin, SimplePlugin};
use crate::fhir::ResourceKind;

/// Static set of scorers, fixed at startup.
#[derive(Clone)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn RiskPlugin>>,
}

/// Registry construction failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("plugin '{name}' has no method coding")]
    MissingMethodCoding { name: String },
    #[error("plugin '{name}' reuses method {method}")]
    DuplicateMethod { name: String, method: MethodKey },
}

impl PluginRegistry {
    pub fn new(plugins: Vec<Arc<dyn RiskPlugin>>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for plugin in &plugins {
            let config = plugin.config();
            let method = config
                .method_key()
                .ok_or_else(|| RegistryError::MissingMethodCoding {
                    name: config.name.clone(),
                })?;
            if !seen.insert(method.clone()) {
                return Err(RegistryError::DuplicateMethod {
                    name: config.name.clone(),
                    method,
                });
            }
        }

        Ok(Self { plugins })
    }

    /// CHA2DS2-VASc followed by the simple condition and medication count.
    pub fn standard() -> Result<Self, RegistryError> {
        Self::new(vec![
            Arc::new(Cha2ds2VascPlugin::default()),
            Arc::new(SimplePlugin::new()),
        ])
    }

    pub fn plugins(&self) -> &[Arc<dyn RiskPlugin>] {
        &self.plugins
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Union of the record kinds any registered scorer needs, patient excluded.
    pub fn required_kinds(&self) -> Vec<ResourceKind> {
        self.plugins
            .iter()
            .flat_map(|plugin| plugin.config().required_kinds.iter().copied())
            .filter(|kind| *kind != ResourceKind::Patient)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
