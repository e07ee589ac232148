//! Domain registrars populating a [`CommandRegistry`].
//!
//! Each submodule owns the action names of one domain and registers a
//! validator and a builder per action. Builders are pure functions of the
//! parameters and the [`Settings`] captured at registration, so preparing the
//! same action twice yields the same command list.

pub mod cluster;
pub mod docker;
pub mod proxy;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::bootstrap::ScriptRenderer;
use crate::config::Settings;
use crate::params::Params;
use crate::registry::CommandRegistry;

/// Register every built-in action.
///
/// # Errors
///
/// Fails if `settings` do not validate or the embedded install scripts do
/// not compile.
pub fn register_all(registry: &mut CommandRegistry, settings: &Settings) -> Result<()> {
    settings.validate()?;
    let renderer = Arc::new(ScriptRenderer::new().context("failed to compile install scripts")?);

    cluster::register(registry, settings, &renderer);
    docker::register(registry);
    proxy::register(registry, settings);

    info!(actions = registry.len(), "registered actions");
    Ok(())
}

/// Optional sudo password shared by most actions.
pub(crate) fn password(params: &Params) -> Option<&str> {
    params.optional_str("password")
}

/// Validate and build like the orchestrator does, without its error mapping.
#[cfg(test)]
pub(crate) fn prepare(registry: &CommandRegistry, action: &str, params: &Params) -> Result<Vec<String>> {
    let template = registry
        .lookup(action)
        .ok_or_else(|| anyhow::anyhow!("{action} not registered"))?;
    if let Some(validate) = &template.validate {
        validate(params)?;
    }
    match &template.build {
        Some(build) => build(params),
        None => Ok(template.commands.clone().unwrap_or_default()),
    }
}
