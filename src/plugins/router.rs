use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::registry::{PluginRegistry, RegisteredPlugin};
use crate::event::Scope;

/// Groups captured by a regex pattern. Literal patterns capture nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Captures {
    /// Positional groups 1.., `None` where a group did not participate
    pub groups: Vec<Option<String>>,
    pub named: BTreeMap<String, String>,
}

impl Captures {
    pub(crate) fn from_regex(re: &regex::Regex, caps: &regex::Captures<'_>) -> Self {
        let groups = caps
            .iter()
            .skip(1)
            .map(|m| m.map(|m| m.as_str().to_string()))
            .collect();
        let named = re
            .capture_names()
            .flatten()
            .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
            .collect();
        Self { groups, named }
    }

    /// Positional group, 1-based like regex numbering.
    pub fn get(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.groups.get(i))
            .and_then(|g| g.as_deref())
    }

    pub fn name(&self, name: &str) -> Option<&str> {
        self.named.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.named.is_empty()
    }
}

/// The winning plugin for a piece of text.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub plugin: Arc<RegisteredPlugin>,
    pub matched: String,
    pub captures: Captures,
}

/// First-match-wins router over a [`PluginRegistry`].
#[derive(Debug, Clone)]
pub struct PluginRouter {
    registry: Arc<PluginRegistry>,
}

impl PluginRouter {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Walk in-scope plugins in configured order and return the first whose
    /// patterns match. Configuration order is the only tie-break.
    pub fn route(&self, text: &str, scope: Scope) -> Option<MatchResult> {
        for plugin in self.registry.list_enabled(scope) {
            for matcher in &plugin.matchers {
                if let Some((matched, captures)) = matcher.find(text) {
                    debug!(plugin = plugin.name(), matched = %matched, "plugin matched");
                    return Some(MatchResult {
                        plugin: Arc::clone(plugin),
                        matched,
                        captures,
                    });
                }
            }
        }
        debug!(text, %scope, "no plugin matched");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{HandlerCatalog, PatternType, PluginDescriptor};

    fn descriptor(name: &str, patterns: &[&str], kind: PatternType, scope: Scope) -> PluginDescriptor {
        PluginDescriptor {
            name: name.to_string(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            pattern_type: kind,
            enabled: true,
            scope,
            description: String::new(),
            handler: Some("ping".to_string()),
        }
    }

    fn router(descriptors: &[PluginDescriptor]) -> PluginRouter {
        let registry = PluginRegistry::load(descriptors, &HandlerCatalog::builtin()).unwrap();
        PluginRouter::new(Arc::new(registry))
    }

    #[test]
    fn test_earlier_plugin_wins_on_overlap() {
        let r = router(&[
            descriptor("first", &["deploy"], PatternType::Literal, Scope::Any),
            descriptor("second", &["deploy prod"], PatternType::Literal, Scope::Any),
        ]);
        let m = r.route("please deploy prod now", Scope::Channel).unwrap();
        assert_eq!(m.plugin.name(), "first");

        let reversed = router(&[
            descriptor("second", &["deploy prod"], PatternType::Literal, Scope::Any),
            descriptor("first", &["deploy"], PatternType::Literal, Scope::Any),
        ]);
        let m = reversed.route("please deploy prod now", Scope::Channel).unwrap();
        assert_eq!(m.plugin.name(), "second");
    }

    #[test]
    fn test_route_is_deterministic() {
        let r = router(&[
            descriptor("incident", &[r"incident\s+(\d+)"], PatternType::Regex, Scope::Any),
            descriptor("ping", &["ping"], PatternType::Literal, Scope::Any),
        ]);
        for text in ["incident 12 ping", "ping", "nothing here"] {
            let a = r.route(text, Scope::Channel).map(|m| (m.plugin.name().to_string(), m.captures));
            let b = r.route(text, Scope::Channel).map(|m| (m.plugin.name().to_string(), m.captures));
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_literal_is_case_insensitive() {
        let r = router(&[descriptor("ping", &["Ping"], PatternType::Literal, Scope::Any)]);
        let m = r.route("PING?", Scope::Channel).unwrap();
        assert_eq!(m.matched, "Ping");
        assert!(m.captures.is_empty());
    }

    #[test]
    fn test_regex_captures_groups() {
        let r = router(&[descriptor(
            "incident",
            &[r"incident\s+(?P<id>\d+)"],
            PatternType::Regex,
            Scope::Any,
        )]);
        let m = r.route("Incident 456 is burning", Scope::Channel).unwrap();
        assert_eq!(m.matched, "Incident 456");
        assert_eq!(m.captures.get(1), Some("456"));
        assert_eq!(m.captures.name("id"), Some("456"));
        assert_eq!(m.captures.get(0), None);
    }

    #[test]
    fn test_scope_excludes_plugins() {
        let r = router(&[
            descriptor("secret", &["token"], PatternType::Literal, Scope::Dm),
            descriptor("fallback", &["token"], PatternType::Literal, Scope::Channel),
        ]);
        assert_eq!(r.route("my token", Scope::Dm).unwrap().plugin.name(), "secret");
        assert_eq!(r.route("my token", Scope::Channel).unwrap().plugin.name(), "fallback");
    }

    #[test]
    fn test_no_match() {
        let r = router(&[descriptor("ping", &["ping"], PatternType::Literal, Scope::Any)]);
        assert!(r.route("hello there", Scope::Channel).is_none());
    }
}
