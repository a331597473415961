use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

use crate::config::DetectorSettings;

use super::backend::Detector;
use super::backends::StubBackend;

type Factory = Box<dyn Fn(&DetectorSettings) -> Result<Box<dyn Detector>> + Send + Sync>;

/// Named detector constructors.
///
/// The daemon picks a backend by the `detector.backend` config key; tests and
/// embedders can register their own constructors under new names.
pub struct BackendRegistry {
    factories: BTreeMap<String, Factory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with every backend compiled into this build.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("stub", |_| Ok(Box::new(StubBackend::new()) as Box<dyn Detector>));
        #[cfg(feature = "backend-tract")]
        registry.register("tract", |settings| {
            let model = settings
                .model_path
                .as_ref()
                .ok_or_else(|| anyhow!("detector.model_path is required for the tract backend"))?;
            let backend = super::backends::TractBackend::new(
                model,
                settings.input_width,
                settings.input_height,
                settings.class_count(),
            )?
            .with_thresholds(settings.score_threshold, settings.nms_threshold);
            Ok(Box::new(backend) as Box<dyn Detector>)
        });
        registry
    }

    /// Register a constructor. A later registration under the same name wins.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&DetectorSettings) -> Result<Box<dyn Detector>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Build the backend named in `settings`.
    pub fn build(&self, settings: &DetectorSettings) -> Result<Box<dyn Detector>> {
        let factory = self.factories.get(&settings.backend).ok_or_else(|| {
            anyhow!(
                "detector backend '{}' not available (built with: {})",
                settings.backend,
                self.list().join(", ")
            )
        })?;
        factory(settings)
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::ScriptedBackend;

    #[test]
    fn builtin_has_stub() {
        let registry = BackendRegistry::builtin();
        assert!(registry.list().contains(&"stub".to_string()));
        let settings = DetectorSettings {
            backend: "stub".to_string(),
            ..DetectorSettings::default()
        };
        let backend = registry.build(&settings).unwrap();
        assert_eq!(backend.name(), "stub");
    }

    #[test]
    fn unknown_backend_names_alternatives() {
        let registry = BackendRegistry::builtin();
        let settings = DetectorSettings {
            backend: "hailo".to_string(),
            ..DetectorSettings::default()
        };
        let err = registry.build(&settings).err().unwrap().to_string();
        assert!(err.contains("hailo"));
        assert!(err.contains("stub"));
    }

    #[test]
    fn custom_registration() {
        let mut registry = BackendRegistry::new();
        registry.register("scripted", |_| {
            Ok(Box::new(ScriptedBackend::new(Vec::new())) as Box<dyn Detector>)
        });
        let settings = DetectorSettings {
            backend: "scripted".to_string(),
            ..DetectorSettings::default()
        };
        assert_eq!(registry.build(&settings).unwrap().name(), "scripted");
    }
}
