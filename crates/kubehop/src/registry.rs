//! Action name to command template mapping.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::params::Params;

/// Parameter validator.
pub type ValidateFn = Arc<dyn Fn(&Params) -> Result<()> + Send + Sync>;

/// Command list builder.
pub type BuildFn = Arc<dyn Fn(&Params) -> Result<Vec<String>> + Send + Sync>;

/// How to turn parameters into a command list for one action.
///
/// Without a builder the static `commands` are used verbatim; without a
/// validator parameters are not checked.
#[derive(Clone, Default)]
pub struct CommandTemplate {
    pub commands: Option<Vec<String>>,
    pub validate: Option<ValidateFn>,
    pub build: Option<BuildFn>,
}

impl CommandTemplate {
    /// Template with a fixed command list.
    #[must_use]
    pub fn fixed<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: Some(commands.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Template whose command list is built from the parameters.
    #[must_use]
    pub fn built(build: impl Fn(&Params) -> Result<Vec<String>> + Send + Sync + 'static) -> Self {
        Self {
            build: Some(Arc::new(build)),
            ..Self::default()
        }
    }

    /// Attach a validator.
    #[must_use]
    pub fn validated(mut self, validate: impl Fn(&Params) -> Result<()> + Send + Sync + 'static) -> Self {
        self.validate = Some(Arc::new(validate));
        self
    }
}

impl fmt::Debug for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTemplate")
            .field("commands", &self.commands)
            .field("validate", &self.validate.is_some())
            .field("build", &self.build.is_some())
            .finish()
    }
}

/// Registry of command templates keyed by action name.
#[derive(Debug, Default, Clone)]
pub struct CommandRegistry {
    templates: HashMap<String, CommandTemplate>,
}

impl CommandRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `template` under `action`, replacing any previous template.
    pub fn register(&mut self, action: impl Into<String>, template: CommandTemplate) {
        let action = action.into();
        if self.templates.insert(action.clone(), template).is_some() {
            debug!(action = %action, "replaced command template");
        }
    }

    #[must_use]
    pub fn lookup(&self, action: &str) -> Option<&CommandTemplate> {
        self.templates.get(action)
    }

    /// Registered action names, sorted.
    #[must_use]
    pub fn actions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
