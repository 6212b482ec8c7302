//! Per-session breakpoint registry.
//!
//! Keyed by the breakpoint id the target issues. Lines are 1-based here;
//! the session layer translates to the wire's 0-based numbering when it
//! talks CDP.

use crate::cdp::WireLocation;
use serde::Serialize;
use std::collections::HashMap;

/// A location a breakpoint resolved to, 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedLocation {
    pub line: u32,
    pub column: u32,
}

impl ResolvedLocation {
    pub fn from_wire(location: &WireLocation) -> Self {
        Self {
            line: location.line_number + 1,
            column: location.column_number,
        }
    }
}

/// One registered breakpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Breakpoint {
    pub id: String,
    pub file: String,
    /// 1-based line as the caller requested it.
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Whether the target bound it to at least one location.
    pub verified: bool,
    pub resolved_locations: Vec<ResolvedLocation>,
}

/// Registry of one session's breakpoints.
#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    breakpoints: HashMap<String, Breakpoint>,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, breakpoint: Breakpoint) {
        self.breakpoints.insert(breakpoint.id.clone(), breakpoint);
    }

    pub fn remove(&mut self, id: &str) -> Option<Breakpoint> {
        self.breakpoints.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Breakpoint> {
        self.breakpoints.get(id)
    }

    /// All breakpoints, ordered by file then line for stable listings.
    pub fn list(&self) -> Vec<Breakpoint> {
        let mut list: Vec<Breakpoint> = self.breakpoints.values().cloned().collect();
        list.sort_by(|a, b| a.file.cmp(&b.file).then(a.line.cmp(&b.line)));
        list
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    /// Record a late resolution pushed by the target.
    pub fn mark_resolved(&mut self, id: &str, location: &WireLocation) {
        if let Some(breakpoint) = self.breakpoints.get_mut(id) {
            breakpoint.verified = true;
            let resolved = ResolvedLocation::from_wire(location);
            if !breakpoint.resolved_locations.contains(&resolved) {
                breakpoint.resolved_locations.push(resolved);
            }
        }
    }
}
