//! Marker comments embedded in script source.
//!
//! Scripts declare their interface with inline comments:
//!
//! ```text
//! # ORCHESTRATOR.REQUIRES: df_initial
//! # ORCHESTRATOR.PRODUCE: df_grouped, summary
//! ```
//!
//! The same grammar is used by the extractor (to build descriptors) and by
//! the executor (to find partial-stop anchors), so it lives here.

use std::sync::OnceLock;

use regex::Regex;

/// Prefix of the stdout line printed when a run halts at a produce marker.
pub const PARTIAL_STOP_SENTINEL: &str = "ORCHESTRATOR_PARTIAL_STOP:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Produce,
    Requires,
}

/// One marker found on a single source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub kind: MarkerKind,
    pub names: Vec<String>,
}

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"#\s*ORCHESTRATOR\.(PRODUCE|REQUIRES):\s*([A-Za-z0-9_, \t]*)")
            .expect("marker regex is valid")
    })
}

fn ident_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("ident regex is valid"))
}

/// Parse a marker from a single line, if present.
pub fn parse_marker_line(line: &str) -> Option<Marker> {
    let caps = marker_regex().captures(line)?;
    let kind = match &caps[1] {
        "PRODUCE" => MarkerKind::Produce,
        _ => MarkerKind::Requires,
    };
    let mut names = Vec::new();
    push_unique(&mut names, split_names(&caps[2]));
    Some(Marker { kind, names })
}

/// Split a comma-separated list, trimming and dropping non-identifiers.
pub fn split_names(list: &str) -> impl Iterator<Item = String> + '_ {
    list.split(',')
        .map(str::trim)
        .filter(|s| ident_regex().is_match(s))
        .map(str::to_string)
}

/// Append names not already present, keeping first-seen order.
pub fn push_unique(into: &mut Vec<String>, names: impl IntoIterator<Item = String>) {
    for name in names {
        if !into.contains(&name) {
            into.push(name);
        }
    }
}

/// All produce/require declarations of a source, accumulated and deduplicated.
pub fn collect_declarations(source: &str) -> (Vec<String>, Vec<String>) {
    let mut produces = Vec::new();
    let mut requires = Vec::new();
    for marker in source.lines().filter_map(parse_marker_line) {
        match marker.kind {
            MarkerKind::Produce => push_unique(&mut produces, marker.names),
            MarkerKind::Requires => push_unique(&mut requires, marker.names),
        }
    }
    (produces, requires)
}

/// Format the sentinel line for the given names.
pub fn sentinel_line(names: &[String]) -> String {
    format!("{} {}", PARTIAL_STOP_SENTINEL, names.join(", "))
}

/// Names from the first sentinel line in `stdout`, if any.
pub fn parse_partial_stop(stdout: &str) -> Option<Vec<String>> {
    stdout.lines().find_map(|line| {
        let rest = line.trim_end().strip_prefix(PARTIAL_STOP_SENTINEL)?;
        Some(split_names(rest).collect())
    })
}
