//! Converter for the legacy list-assignment metadata style.
//!
//! Older scripts declared their interface with top-level assignments:
//!
//! ```text
//! PRODUCES = ["df_initial", "df_final"]
//! REQUIRES = ("raw",)
//! ```
//!
//! The extractor only understands marker comments, so such scripts must be
//! converted explicitly. Each assignment (single or multi-line) is replaced
//! by the equivalent marker comment; every other line is left as is.

use std::sync::OnceLock;

use regex::Regex;

use varflow_core::markers::push_unique;

fn assignment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(PRODUCES|REQUIRES)\s*=\s*([\[\(])").expect("assignment regex is valid")
    })
}

fn item_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"["']([A-Za-z0-9_]+)["']"#).expect("item regex is valid")
    })
}

/// Rewrite legacy `PRODUCES`/`REQUIRES` assignments into marker comments.
pub fn convert_legacy(source: &str) -> String {
    let mut out = Vec::new();
    let mut lines = source.lines();

    while let Some(line) = lines.next() {
        let Some(caps) = assignment_regex().captures(line) else {
            out.push(line.to_string());
            continue;
        };
        let marker = if &caps[1] == "PRODUCES" {
            "PRODUCE"
        } else {
            "REQUIRES"
        };
        let closer = if &caps[2] == "[" { ']' } else { ')' };

        let mut literal = line.to_string();
        while !literal.contains(closer) {
            match lines.next() {
                Some(next) => {
                    literal.push('\n');
                    literal.push_str(next);
                }
                None => break,
            }
        }

        let mut names = Vec::new();
        push_unique(
            &mut names,
            item_regex()
                .captures_iter(&literal)
                .map(|c| c[1].to_string()),
        );
        out.push(format!("# ORCHESTRATOR.{}: {}", marker, names.join(", ")));
    }

    let mut converted = out.join("\n");
    if source.ends_with('\n') {
        converted.push('\n');
    }
    converted
}

#[cfg(test)]
mod tests {
    use super::*;
    use varflow_core::markers::collect_declarations;

    #[test]
    fn test_single_line_assignments() {
        let src = "PRODUCES = [\"a\", 'b']\nREQUIRES = (\"x\",)\nprint(1)\n";
        let out = convert_legacy(src);
        assert_eq!(
            out,
            "# ORCHESTRATOR.PRODUCE: a, b\n# ORCHESTRATOR.REQUIRES: x\nprint(1)\n"
        );
    }

    #[test]
    fn test_multi_line_assignment() {
        let src = "PRODUCES = [\n    \"df_initial\",\n    \"df_final\",\n]\ndf_initial = 1\n";
        let out = convert_legacy(src);
        let (produces, _) = collect_declarations(&out);
        assert_eq!(produces, vec!["df_initial", "df_final"]);
        assert!(out.ends_with("df_initial = 1\n"));
    }

    #[test]
    fn test_indented_assignment_left_alone() {
        let src = "def f():\n    PRODUCES = ['inner']\n";
        assert_eq!(convert_legacy(src), src);
    }

    #[test]
    fn test_source_without_legacy_is_unchanged() {
        let src = "# ORCHESTRATOR.PRODUCE: a\na = 1";
        assert_eq!(convert_legacy(src), src);
    }
}
