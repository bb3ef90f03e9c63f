//! Plugin construction from configuration.

use crate::config::{PluginConfig, PluginKind};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tenvis_gateway_plugin::{MemoryOrigin, MemoryTarget, Plugin};
use tracing::debug;

/// A configured plugin, keeping its concrete handle.
pub enum BuiltPlugin {
    Target(Arc<MemoryTarget>),
    Origin(Arc<MemoryOrigin>),
}

impl BuiltPlugin {
    /// The plugin as the manager sees it.
    pub fn plugin(&self) -> Arc<dyn Plugin> {
        match self {
            Self::Target(target) => target.clone(),
            Self::Origin(origin) => origin.clone(),
        }
    }

    /// The origin handle, for submitting requests.
    pub fn origin(&self) -> Option<&Arc<MemoryOrigin>> {
        match self {
            Self::Target(_) => None,
            Self::Origin(origin) => Some(origin),
        }
    }
}

/// Build the plugin described by the `[plugins.<name>]` table.
///
/// # Errors
///
/// Returns an error for invalid settings or malformed resource keys.
pub fn build(name: &str, config: &PluginConfig) -> Result<BuiltPlugin> {
    let protocol = config.protocol_name(name);
    let built = match config.kind {
        PluginKind::MemoryTarget => {
            let target = MemoryTarget::new(protocol);
            for (key, value) in &config.resources {
                let (authority, path) = split_resource(key)?;
                target.insert(authority, &path, value.clone());
            }
            BuiltPlugin::Target(Arc::new(target))
        }
        PluginKind::MemoryOrigin => {
            if !config.resources.is_empty() {
                bail!("Plugin {name}: resources are only supported by memory targets");
            }
            BuiltPlugin::Origin(Arc::new(MemoryOrigin::new(protocol)))
        }
    };
    let plugin = built.plugin();

    plugin
        .settings()
        .apply(config.settings.iter().map(|(k, v)| (k, v.clone())))
        .with_context(|| format!("Plugin {name}: invalid settings"))?;
    plugin
        .settings()
        .validate()
        .with_context(|| format!("Plugin {name}: incomplete settings"))?;

    debug!(
        plugin = %name,
        protocol = %plugin.protocol(),
        kind = ?config.kind,
        resources = config.resources.len(),
        "Plugin built"
    );
    Ok(built)
}

/// Split `authority/path` into the authority and an absolute path.
fn split_resource(key: &str) -> Result<(&str, String)> {
    match key.split_once('/') {
        Some((authority, path)) if !authority.is_empty() && !path.is_empty() => {
            Ok((authority, format!("/{path}")))
        }
        _ => bail!("Invalid resource key {key:?}, expected authority/path"),
    }
}
