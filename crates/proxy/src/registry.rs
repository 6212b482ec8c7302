//! The merged tool catalog.
//!
//! Every tool the proxy can dispatch lives here under its fully-qualified
//! name `<owner>__<tool>`. Upstream discovery inserts entries, disconnects
//! purge them in bulk, core tools and plug-in command tools are mounted once
//! at startup, and the exposure filter decides what `tools/list` shows.

use indexmap::IndexMap;
use manifold_types::ToolMetadata;
use regex::Regex;
use std::collections::HashMap;
use tracing::debug;

/// Separator between the owner prefix and the original tool name.
pub const NAME_SEPARATOR: &str = "__";

/// Build a fully-qualified tool name.
pub fn qualified_name(owner: &str, tool: &str) -> String {
    format!("{owner}{NAME_SEPARATOR}{tool}")
}

/// Who serves a registered tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOrigin {
    /// Routed to an upstream server by logical name.
    Upstream(String),
    /// Served by the proxy itself.
    Core,
    /// Served by a mounted plug-in command, by command name.
    Command(String),
}

impl ToolOrigin {
    /// The name used as the FQ prefix for this origin.
    pub fn prefix(&self) -> &str {
        match self {
            ToolOrigin::Upstream(name) => name,
            ToolOrigin::Core => "core",
            ToolOrigin::Command(name) => name,
        }
    }
}

/// Visibility flags for one entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToolVisibility {
    /// Came from upstream discovery (as opposed to being built in).
    pub discovered: bool,
    /// Passes the static exposure filter.
    pub exposed: bool,
    /// Activated at runtime (toolset load or discovery); immune to static
    /// filters.
    pub dynamic: bool,
    /// Built-in core tool; always exposed, immune to filters.
    pub core: bool,
}

impl ToolVisibility {
    /// Whether this entry appears in listings and accepts calls.
    pub fn is_visible(&self) -> bool {
        self.core || self.dynamic || self.exposed
    }
}

/// One registered tool.
#[derive(Debug, Clone)]
pub struct ToolEntry {
    pub fq_name: String,
    pub original_name: String,
    pub origin: ToolOrigin,
    pub metadata: ToolMetadata,
    pub visibility: ToolVisibility,
}

/// Outcome of resolving a call-time tool name.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Core(String),
    Upstream { upstream: String, tool: String },
    Command { command: String, tool: String },
    NotFound,
    Ambiguous(Vec<String>),
}

/// Ordered allow/deny evaluation of glob patterns over FQ names.
///
/// A discovered tool is exposed when it matches `expose` (or `expose` is
/// empty) or matches `always_visible`, and does not match `hide`. Core and
/// dynamically-enabled tools bypass the filter entirely.
#[derive(Debug, Default)]
pub struct ExposureFilter {
    expose: Vec<Regex>,
    hide: Vec<Regex>,
    always_visible: Vec<Regex>,
}

impl ExposureFilter {
    pub fn new(
        expose: &[String],
        hide: &[String],
        always_visible: &[String],
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            expose: compile_globs(expose)?,
            hide: compile_globs(hide)?,
            always_visible: compile_globs(always_visible)?,
        })
    }

    pub fn allows(&self, fq_name: &str) -> bool {
        let allowed = self.expose.is_empty()
            || self.expose.iter().any(|p| p.is_match(fq_name))
            || self.always_visible.iter().any(|p| p.is_match(fq_name));
        allowed && !self.hide.iter().any(|p| p.is_match(fq_name))
    }
}

/// Compile `*` glob patterns into anchored regexes.
fn compile_globs(patterns: &[String]) -> Result<Vec<Regex>, regex::Error> {
    patterns
        .iter()
        .map(|pattern| {
            let escaped = regex::escape(pattern).replace(r"\*", ".*");
            Regex::new(&format!("^{escaped}$"))
        })
        .collect()
}

/// The registry proper. Not internally synchronized; the proxy wraps it in
/// a readers-writer lock.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    entries: IndexMap<String, ToolEntry>,
    /// FQ names per owning prefix, for bulk removal on disconnect.
    by_owner: HashMap<String, Vec<String>>,
    /// FQ names per original name, for short-name resolution.
    by_original: HashMap<String, Vec<String>>,
    filter: ExposureFilter,
}

impl ToolRegistry {
    pub fn new(filter: ExposureFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    /// Mount a core tool. Core entries live for the proxy's lifetime and
    /// are always exposed.
    pub fn register_core(&mut self, metadata: ToolMetadata) {
        let name = metadata.name.clone();
        self.insert(ToolEntry {
            fq_name: name.clone(),
            original_name: name,
            origin: ToolOrigin::Core,
            metadata,
            visibility: ToolVisibility {
                core: true,
                exposed: true,
                ..Default::default()
            },
        });
    }

    /// Mount a plug-in command's tools under `<command>__<tool>`.
    pub fn register_command_tools(&mut self, command: &str, tools: Vec<ToolMetadata>) {
        for metadata in tools {
            let fq_name = qualified_name(command, &metadata.name);
            let exposed = self.filter.allows(&fq_name);
            self.insert(ToolEntry {
                fq_name: fq_name.clone(),
                original_name: metadata.name.clone(),
                origin: ToolOrigin::Command(command.to_string()),
                metadata: metadata.renamed(&fq_name),
                visibility: ToolVisibility {
                    exposed,
                    ..Default::default()
                },
            });
        }
    }

    /// Replace the discovered tools of one upstream. Existing entries for
    /// that upstream are removed first, so rediscovery is idempotent.
    pub fn register_upstream_tools(&mut self, upstream: &str, tools: Vec<ToolMetadata>) {
        self.remove_owner(upstream);
        for metadata in tools {
            let fq_name = qualified_name(upstream, &metadata.name);
            let exposed = self.filter.allows(&fq_name);
            self.insert(ToolEntry {
                fq_name: fq_name.clone(),
                original_name: metadata.name.clone(),
                origin: ToolOrigin::Upstream(upstream.to_string()),
                metadata: metadata.renamed(&fq_name),
                visibility: ToolVisibility {
                    discovered: true,
                    exposed,
                    ..Default::default()
                },
            });
        }
        debug!(upstream, count = self.by_owner.get(upstream).map_or(0, Vec::len), "registered upstream tools");
    }

    /// Drop every tool owned by the given prefix. Returns how many entries
    /// were removed.
    pub fn remove_owner(&mut self, owner: &str) -> usize {
        let Some(names) = self.by_owner.remove(owner) else {
            return 0;
        };
        let mut removed = 0;
        for fq_name in names {
            if let Some(entry) = self.entries.shift_remove(&fq_name) {
                removed += 1;
                if let Some(list) = self.by_original.get_mut(&entry.original_name) {
                    list.retain(|n| n != &fq_name);
                    if list.is_empty() {
                        self.by_original.remove(&entry.original_name);
                    }
                }
            }
        }
        removed
    }

    /// Mark a fully-qualified name as dynamically enabled. Returns whether
    /// the entry's visibility actually changed.
    pub fn enable_dynamic(&mut self, fq_name: &str) -> bool {
        match self.entries.get_mut(fq_name) {
            Some(entry) => {
                let was_visible = entry.visibility.is_visible();
                entry.visibility.dynamic = true;
                !was_visible
            }
            None => false,
        }
    }

    pub fn get(&self, fq_name: &str) -> Option<&ToolEntry> {
        self.entries.get(fq_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every currently visible tool, in registration order.
    pub fn exposed_tools(&self) -> Vec<ToolMetadata> {
        self.entries
            .values()
            .filter(|entry| entry.visibility.is_visible())
            .map(|entry| entry.metadata.clone())
            .collect()
    }

    /// Every entry regardless of visibility; used by discovery tooling.
    pub fn all_entries(&self) -> impl Iterator<Item = &ToolEntry> {
        self.entries.values()
    }

    /// Resolve a call-time name: core tools first, then exact FQ match,
    /// then (optionally) a unique visible short name.
    pub fn resolve(&self, name: &str, allow_short_names: bool) -> Resolution {
        if let Some(entry) = self.entries.get(name) {
            if !entry.visibility.is_visible() {
                return Resolution::NotFound;
            }
            return Self::resolution_for(entry);
        }

        if allow_short_names {
            let candidates: Vec<&ToolEntry> = self
                .by_original
                .get(name)
                .map(|names| {
                    names
                        .iter()
                        .filter_map(|fq| self.entries.get(fq))
                        .filter(|entry| entry.visibility.is_visible())
                        .collect()
                })
                .unwrap_or_default();

            return match candidates.as_slice() {
                [] => Resolution::NotFound,
                [single] => Self::resolution_for(single),
                many => Resolution::Ambiguous(
                    many.iter().map(|entry| entry.fq_name.clone()).collect(),
                ),
            };
        }

        Resolution::NotFound
    }

    fn resolution_for(entry: &ToolEntry) -> Resolution {
        match &entry.origin {
            ToolOrigin::Core => Resolution::Core(entry.fq_name.clone()),
            ToolOrigin::Upstream(upstream) => Resolution::Upstream {
                upstream: upstream.clone(),
                tool: entry.original_name.clone(),
            },
            ToolOrigin::Command(command) => Resolution::Command {
                command: command.clone(),
                tool: entry.original_name.clone(),
            },
        }
    }

    fn insert(&mut self, entry: ToolEntry) {
        let owner = entry.origin.prefix().to_string();
        self.by_owner
            .entry(owner)
            .or_default()
            .push(entry.fq_name.clone());
        self.by_original
            .entry(entry.original_name.clone())
            .or_default()
            .push(entry.fq_name.clone());
        self.entries.insert(entry.fq_name.clone(), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter(expose: &[&str], hide: &[&str], always: &[&str]) -> ExposureFilter {
        let to_vec = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        ExposureFilter::new(&to_vec(expose), &to_vec(hide), &to_vec(always)).unwrap()
    }

    fn tool(name: &str) -> ToolMetadata {
        ToolMetadata::new(name, format!("{name} description"))
    }

    fn names(tools: &[ToolMetadata]) -> Vec<&str> {
        tools.iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn aggregates_two_upstreams_under_prefixes() {
        let mut registry = ToolRegistry::default();
        registry.register_upstream_tools("a", vec![tool("x"), tool("y")]);
        registry.register_upstream_tools("b", vec![tool("y"), tool("z")]);

        let exposed = registry.exposed_tools();
        assert_eq!(names(&exposed), vec!["a__x", "a__y", "b__y", "b__z"]);
    }

    #[test]
    fn disconnect_removes_only_that_upstream() {
        let mut registry = ToolRegistry::default();
        registry.register_upstream_tools("a", vec![tool("x"), tool("y")]);
        registry.register_upstream_tools("b", vec![tool("z")]);

        assert_eq!(registry.remove_owner("a"), 2);
        let exposed = registry.exposed_tools();
        assert_eq!(names(&exposed), vec!["b__z"]);
        assert!(registry.get("a__x").is_none());
    }

    #[test]
    fn rediscovery_replaces_previous_set() {
        let mut registry = ToolRegistry::default();
        registry.register_upstream_tools("a", vec![tool("x"), tool("y")]);
        registry.register_upstream_tools("a", vec![tool("x")]);

        assert_eq!(names(&registry.exposed_tools()), vec!["a__x"]);
    }

    #[test]
    fn exposure_filter_scenario() {
        // exposeTools=["a__*"], hideTools=["a__y"], alwaysVisibleTools=["b__z"]
        let mut registry =
            ToolRegistry::new(filter(&["a__*"], &["a__y"], &["b__z"]));
        registry.register_upstream_tools("a", vec![tool("x"), tool("y")]);
        registry.register_upstream_tools("b", vec![tool("y"), tool("z")]);

        assert_eq!(names(&registry.exposed_tools()), vec!["a__x", "b__z"]);
    }

    #[test]
    fn empty_expose_allows_everything_not_hidden() {
        let mut registry = ToolRegistry::new(filter(&[], &["a__secret"], &[]));
        registry.register_upstream_tools("a", vec![tool("open"), tool("secret")]);

        assert_eq!(names(&registry.exposed_tools()), vec!["a__open"]);
    }

    #[test]
    fn core_tools_bypass_filters() {
        let mut registry = ToolRegistry::new(filter(&["nothing"], &["*"], &[]));
        registry.register_core(tool("discover_tools_by_words"));

        assert_eq!(
            names(&registry.exposed_tools()),
            vec!["discover_tools_by_words"]
        );
    }

    #[test]
    fn hidden_tools_are_not_callable() {
        let mut registry = ToolRegistry::new(filter(&[], &["a__secret"], &[]));
        registry.register_upstream_tools("a", vec![tool("secret")]);

        assert_eq!(registry.resolve("a__secret", false), Resolution::NotFound);
    }

    #[test]
    fn dynamic_enable_overrides_static_filter() {
        let mut registry = ToolRegistry::new(filter(&["none"], &[], &[]));
        registry.register_upstream_tools("a", vec![tool("x")]);
        assert!(registry.exposed_tools().is_empty());

        assert!(registry.enable_dynamic("a__x"));
        assert_eq!(names(&registry.exposed_tools()), vec!["a__x"]);
        // Enabling again reports no change.
        assert!(!registry.enable_dynamic("a__x"));

        assert_eq!(
            registry.resolve("a__x", false),
            Resolution::Upstream { upstream: "a".into(), tool: "x".into() }
        );
    }

    #[test]
    fn resolves_exact_fq_name() {
        let mut registry = ToolRegistry::default();
        registry.register_upstream_tools("b", vec![tool("y")]);

        assert_eq!(
            registry.resolve("b__y", false),
            Resolution::Upstream { upstream: "b".into(), tool: "y".into() }
        );
    }

    #[test]
    fn short_name_unique_match_resolves() {
        let mut registry = ToolRegistry::default();
        registry.register_upstream_tools("a", vec![tool("x")]);
        registry.register_upstream_tools("b", vec![tool("z")]);

        assert_eq!(
            registry.resolve("z", true),
            Resolution::Upstream { upstream: "b".into(), tool: "z".into() }
        );
        assert_eq!(registry.resolve("z", false), Resolution::NotFound);
    }

    #[test]
    fn short_name_with_two_owners_is_ambiguous() {
        let mut registry = ToolRegistry::default();
        registry.register_upstream_tools("a", vec![tool("y")]);
        registry.register_upstream_tools("b", vec![tool("y")]);

        match registry.resolve("y", true) {
            Resolution::Ambiguous(candidates) => {
                assert_eq!(candidates, vec!["a__y".to_string(), "b__y".to_string()]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn command_tools_are_prefixed_by_command_name() {
        let mut registry = ToolRegistry::default();
        registry.register_command_tools("debugger", vec![tool("create_session")]);

        assert_eq!(
            registry.resolve("debugger__create_session", false),
            Resolution::Command { command: "debugger".into(), tool: "create_session".into() }
        );
    }

    #[test]
    fn glob_compilation_escapes_regex_metacharacters() {
        let filter = filter(&["a.b__*"], &[], &[]);
        assert!(filter.allows("a.b__tool"));
        assert!(!filter.allows("aXb__tool"));
    }

    #[test]
    fn stable_listing_under_stable_topology() {
        let mut registry = ToolRegistry::default();
        registry.register_upstream_tools("a", vec![tool("x"), tool("y")]);

        let first = names(&registry.exposed_tools())
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        for _ in 0..5 {
            let again = names(&registry.exposed_tools())
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>();
            assert_eq!(again, first);
        }
    }
}
