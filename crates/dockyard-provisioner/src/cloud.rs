//! Runtime clouds.
//!
//! A [`Cloud`] pairs a cloud's configuration with its host resolver and
//! engine client. Its template list can change while provisioning runs,
//! so it sits behind a lock and readers take snapshots.

use std::sync::{Arc, RwLock, RwLockReadGuard};

use tracing::info;

use dockyard_core::{CloudConfig, ConfigError, ConfigResult, Template};
use dockyard_discovery::HostResolver;
use dockyard_engine::EngineClient;

pub struct Cloud {
    config: RwLock<CloudConfig>,
    resolver: Arc<dyn HostResolver>,
    engine: Arc<dyn EngineClient>,
}

impl Cloud {
    pub fn new(config: CloudConfig, resolver: Arc<dyn HostResolver>, engine: Arc<dyn EngineClient>) -> Self {
        Self {
            config: RwLock::new(config),
            resolver,
            engine,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CloudConfig> {
        self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> String {
        self.read().name.clone()
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> CloudConfig {
        self.read().clone()
    }

    pub fn resolver(&self) -> &Arc<dyn HostResolver> {
        &self.resolver
    }

    pub fn engine(&self) -> &Arc<dyn EngineClient> {
        &self.engine
    }

    pub fn add_template(&self, template: Template) -> ConfigResult<()> {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        if config.template_by_image(&template.image).is_some() {
            return Err(ConfigError::DuplicateTemplate {
                cloud: config.name.clone(),
                image: template.image,
            });
        }
        info!(cloud = %config.name, image = %template.image, "template added");
        config.templates.push(template);
        Ok(())
    }

    pub fn remove_template(&self, image: &str) -> Option<Template> {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        let pos = config.templates.iter().position(|t| t.image == image)?;
        info!(cloud = %config.name, %image, "template removed");
        Some(config.templates.remove(pos))
    }

    pub fn template_by_image(&self, image: &str) -> Option<Template> {
        self.read().template_by_image(image).cloned()
    }

    pub fn templates_for_label(&self, label: Option<&str>) -> Vec<Template> {
        self.read()
            .templates_for_label(label)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn template_for_label(&self, label: Option<&str>) -> Option<Template> {
        self.read().template_for_label(label).cloned()
    }

    pub fn can_provision(&self, label: Option<&str>) -> bool {
        self.read().can_provision(label)
    }
}

/// All configured clouds, in declaration order.
#[derive(Default, Clone)]
pub struct CloudRegistry {
    clouds: Vec<Arc<Cloud>>,
}

impl CloudRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cloud(mut self, cloud: Arc<Cloud>) -> Self {
        self.clouds.push(cloud);
        self
    }

    pub fn push(&mut self, cloud: Arc<Cloud>) {
        self.clouds.push(cloud);
    }

    pub fn get(&self, name: &str) -> Option<Arc<Cloud>> {
        self.clouds.iter().find(|c| c.name() == name).cloned()
    }

    pub fn all(&self) -> &[Arc<Cloud>] {
        &self.clouds
    }

    /// First cloud with a template for `label`.
    pub fn for_label(&self, label: Option<&str>) -> Option<Arc<Cloud>> {
        self.clouds.iter().find(|c| c.can_provision(label)).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.clouds.is_empty()
    }
}
