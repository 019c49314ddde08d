use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

use crate::detect::result::DetectionBatch;
use crate::frame::Frame;

use super::backend::{DetectionCapability, DetectorBackend};

/// Registry of detector backends, keyed by backend name.
///
/// Frames are processed on a single thread, so backends are owned directly
/// and borrowed mutably per call.
pub struct BackendRegistry {
    backends: BTreeMap<String, Box<dyn DetectorBackend>>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: BTreeMap::new(),
            default_name: None,
        }
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Box::new(backend));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// Name of the backend that serves a capability.
    ///
    /// Prefers the default backend when it supports the capability.
    pub fn backend_for_capability(&self, capability: DetectionCapability) -> Option<String> {
        if let Some(name) = &self.default_name {
            if let Some(backend) = self.backends.get(name) {
                if backend.supports(capability) {
                    return Some(name.clone());
                }
            }
        }
        self.backends
            .iter()
            .find(|(_, backend)| backend.supports(capability))
            .map(|(name, _)| name.clone())
    }

    /// Run detection using a backend that supports the requested capability.
    pub fn detect_with_capability(
        &mut self,
        capability: DetectionCapability,
        frame: &Frame,
    ) -> Result<(String, DetectionBatch)> {
        let name = self.backend_for_capability(capability).ok_or_else(|| {
            anyhow!(
                "no registered backend supports capability {:?}",
                capability
            )
        })?;
        let backend = self
            .backends
            .get_mut(&name)
            .ok_or_else(|| anyhow!("backend '{}' vanished from registry", name))?;
        let batch = backend.detect(frame)?;
        Ok((name, batch))
    }

    pub fn warm_up_all(&mut self) -> Result<()> {
        for (name, backend) in self.backends.iter_mut() {
            backend
                .warm_up()
                .map_err(|e| anyhow!("backend '{}' warm-up failed: {}", name, e))?;
        }
        Ok(())
    }

    /// True when the default backend is a finite source with nothing left.
    pub fn default_exhausted(&self) -> bool {
        self.default_name
            .as_ref()
            .and_then(|name| self.backends.get(name))
            .is_some_and(|backend| backend.is_exhausted())
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
