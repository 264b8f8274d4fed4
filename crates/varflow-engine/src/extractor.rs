//! Metadata extraction from script source.

use std::sync::OnceLock;

use regex::Regex;

use varflow_core::error::{Result, VarflowError};
use varflow_core::markers::collect_declarations;
use varflow_core::types::ScriptDescriptor;

fn docstring_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)"""(.*?)"""|'''(.*?)'''"#).expect("docstring regex is valid")
    })
}

/// Build a descriptor from source text.
///
/// Missing or malformed markers yield empty `produces`/`requires`; this
/// never fails.
pub fn extract(source: &str, path: &str) -> ScriptDescriptor {
    let (produces, requires) = collect_declarations(source);
    ScriptDescriptor {
        produces,
        requires,
        docstring: first_docstring(source),
        source: source.to_string(),
        ..ScriptDescriptor::new(path)
    }
}

/// Like [`extract`], but from raw bytes. Fails only on invalid UTF-8.
pub fn extract_bytes(bytes: &[u8], path: &str) -> Result<ScriptDescriptor> {
    let source = std::str::from_utf8(bytes).map_err(|e| VarflowError::Parse {
        path: path.to_string(),
        message: format!("invalid UTF-8: {}", e),
    })?;
    // A leading BOM is not part of the script.
    let source = source.strip_prefix('\u{feff}').unwrap_or(source);
    Ok(extract(source, path))
}

/// Text of the first triple-quoted string literal, trimmed. Display only.
fn first_docstring(source: &str) -> String {
    docstring_regex()
        .captures(source)
        .and_then(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRODUCER: &str = r#"# scripts/script_a.py
"""
Builds the initial frame and a filtered final frame.
"""
import json

df_initial = [1, 2, 3]
# ORCHESTRATOR.PRODUCE: df_initial

df_final = [x for x in df_initial if x > 1]
# ORCHESTRATOR.PRODUCE: df_final
"#;

    #[test]
    fn test_extract_markers_and_docstring() {
        let d = extract(PRODUCER, "/s/script_a.py");
        assert_eq!(d.path, "/s/script_a.py");
        assert_eq!(d.name, "script_a.py");
        assert_eq!(d.produces, vec!["df_initial", "df_final"]);
        assert!(d.requires.is_empty());
        assert_eq!(d.docstring, "Builds the initial frame and a filtered final frame.");
        assert_eq!(d.source, PRODUCER);
    }

    #[test]
    fn test_single_quoted_docstring() {
        let d = extract("'''  Loader  '''\nx = 1\n", "l.py");
        assert_eq!(d.docstring, "Loader");
    }

    #[test]
    fn test_no_declarations_degrades_gracefully() {
        let d = extract("print('hi')\n# ORCHESTRATOR.PRODUCE:\n", "p.py");
        assert!(d.produces.is_empty());
        assert!(d.requires.is_empty());
        assert_eq!(d.docstring, "");
    }

    #[test]
    fn test_invalid_utf8_is_parse_error() {
        let err = extract_bytes(&[0x66, 0x6f, 0xff, 0xfe], "bad.py").unwrap_err();
        assert!(matches!(err, VarflowError::Parse { ref path, .. } if path == "bad.py"));
    }

    #[test]
    fn test_bom_is_stripped() {
        let mut bytes = vec![0xef, 0xbb, 0xbf];
        bytes.extend_from_slice(b"# ORCHESTRATOR.REQUIRES: a\n");
        let d = extract_bytes(&bytes, "bom.py").unwrap();
        assert_eq!(d.requires, vec!["a"]);
        assert!(d.source.starts_with('#'));
    }
}
