use std::collections::HashSet;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use tracing::info;

use super::router::Captures;
use super::{HandlerCatalog, Plugin, PluginSummary};
use crate::error::ConfigError;
use crate::event::Scope;

/// How a descriptor's patterns are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    /// Case-insensitive substring containment
    #[default]
    Literal,
    /// Case-insensitive regex search
    Regex,
}

/// One `[[plugins]]` entry from the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub pattern_type: PatternType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub description: String,
    /// Handler implementation to bind; defaults to `name`
    #[serde(default)]
    pub handler: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl PluginDescriptor {
    pub fn handler_name(&self) -> &str {
        self.handler.as_deref().unwrap_or(&self.name)
    }
}

/// A compiled pattern.
#[derive(Debug, Clone)]
pub enum Matcher {
    Literal { pattern: String, lowered: String },
    Regex(Regex),
}

impl Matcher {
    fn compile(plugin: &str, pattern: &str, kind: PatternType) -> Result<Self, ConfigError> {
        match kind {
            PatternType::Literal => Ok(Matcher::Literal {
                pattern: pattern.to_string(),
                lowered: pattern.to_lowercase(),
            }),
            PatternType::Regex => RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map(Matcher::Regex)
                .map_err(|source| ConfigError::InvalidPattern {
                    plugin: plugin.to_string(),
                    pattern: pattern.to_string(),
                    source,
                }),
        }
    }

    /// Try this pattern against `text`; returns the matched text and captures.
    pub fn find(&self, text: &str) -> Option<(String, Captures)> {
        match self {
            Matcher::Literal { pattern, lowered } => text
                .to_lowercase()
                .contains(lowered.as_str())
                .then(|| (pattern.clone(), Captures::default())),
            Matcher::Regex(re) => re
                .captures(text)
                .map(|caps| (caps[0].to_string(), Captures::from_regex(re, &caps))),
        }
    }
}

/// A descriptor bound to its handler with compiled patterns.
pub struct RegisteredPlugin {
    pub descriptor: PluginDescriptor,
    pub matchers: Vec<Matcher>,
    pub handler: Arc<dyn Plugin>,
}

impl RegisteredPlugin {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            name: self.descriptor.name.clone(),
            description: self.descriptor.description.clone(),
            scope: self.descriptor.scope,
            usage: self.handler.usage().map(str::to_string),
        }
    }
}

impl std::fmt::Debug for RegisteredPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredPlugin")
            .field("descriptor", &self.descriptor)
            .field("matchers", &self.matchers.len())
            .finish()
    }
}

/// The enabled plugins, in configured order. Never mutated after `load`.
#[derive(Debug)]
pub struct PluginRegistry {
    plugins: Vec<Arc<RegisteredPlugin>>,
}

impl PluginRegistry {
    /// Validate and compile descriptors, binding each to its handler.
    ///
    /// Disabled descriptors are skipped without validation. Fails on a duplicate
    /// enabled name, an empty pattern list, an uncompilable regex, or a handler
    /// name the catalog does not know.
    pub fn load(
        descriptors: &[PluginDescriptor],
        catalog: &HandlerCatalog,
    ) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut plugins = Vec::new();

        for descriptor in descriptors {
            if !descriptor.enabled {
                info!("Skipping disabled plugin: {}", descriptor.name);
                continue;
            }
            if !seen.insert(descriptor.name.as_str()) {
                return Err(ConfigError::DuplicateName(descriptor.name.clone()));
            }
            if descriptor.patterns.is_empty() {
                return Err(ConfigError::NoPatterns {
                    plugin: descriptor.name.clone(),
                });
            }

            let matchers = descriptor
                .patterns
                .iter()
                .map(|p| Matcher::compile(&descriptor.name, p, descriptor.pattern_type))
                .collect::<Result<Vec<_>, _>>()?;

            let handler = catalog.get(descriptor.handler_name()).ok_or_else(|| {
                ConfigError::UnknownHandler {
                    plugin: descriptor.name.clone(),
                    handler: descriptor.handler_name().to_string(),
                }
            })?;

            info!(
                "Registered plugin: {} ({} patterns, scope {})",
                descriptor.name,
                matchers.len(),
                descriptor.scope
            );
            plugins.push(Arc::new(RegisteredPlugin {
                descriptor: descriptor.clone(),
                matchers,
                handler,
            }));
        }

        info!("Loaded {} plugins", plugins.len());
        Ok(Self { plugins })
    }

    /// Enabled plugins eligible for events in `scope`, in configured order.
    pub fn list_enabled(&self, scope: Scope) -> impl Iterator<Item = &Arc<RegisteredPlugin>> {
        self.plugins
            .iter()
            .filter(move |p| p.descriptor.scope.admits(scope))
    }

    pub fn summaries(&self) -> Arc<[PluginSummary]> {
        self.plugins.iter().map(|p| p.summary()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
