//! Hardening helpers for user-facing exports.
//!
//! Spreadsheet applications execute cells starting with formula
//! characters, so exported CSV cells are defanged with a leading
//! apostrophe before normal CSV quoting. Export paths are resolved
//! lexically against a configured base directory and rejected if they
//! escape it.

use std::path::{Component, Path, PathBuf};

use crate::error::Error;

const FORMULA_PREFIXES: [char; 7] = ['=', '+', '-', '@', '\t', '\r', '|'];

/// Escape one CSV cell. Formula-leading cells get an apostrophe prefix;
/// anything containing a delimiter, quote, newline or the prefix itself
/// is wrapped in quotes with embedded quotes doubled.
pub fn escape_csv_value(value: &str) -> String {
    let defanged = value.starts_with(FORMULA_PREFIXES);
    let body = if defanged {
        format!("'{value}")
    } else {
        value.to_owned()
    };

    let needs_quotes = defanged || body.contains([',', '"', '\n', '\r', '\t']);
    if needs_quotes {
        format!("\"{}\"", body.replace('"', "\"\""))
    } else {
        body
    }
}

/// Render rows into a CSV buffer with every cell escaped.
pub fn to_csv(header: &[&str], rows: &[Vec<String>]) -> String {
    let mut out = String::new();
    out.push_str(
        &header
            .iter()
            .map(|cell| escape_csv_value(cell))
            .collect::<Vec<_>>()
            .join(","),
    );
    out.push('\n');
    for row in rows {
        out.push_str(
            &row.iter()
                .map(|cell| escape_csv_value(cell))
                .collect::<Vec<_>>()
                .join(","),
        );
        out.push('\n');
    }
    out
}

/// Resolve `candidate` against `base` and require the result to stay
/// inside `base`. Purely lexical: `..` components are folded before the
/// check, absolute candidates are rejected outright.
pub fn resolve_export_path(base: &Path, candidate: &str) -> Result<PathBuf, Error> {
    let candidate_path = Path::new(candidate);
    if candidate_path.is_absolute() {
        return Err(Error::Validation(format!(
            "export path {candidate} must be relative to the export directory"
        )));
    }

    let base = normalize(base)?;
    let resolved = normalize(&base.join(candidate_path))?;
    if !resolved.starts_with(&base) {
        return Err(Error::Validation(format!(
            "export path {candidate} escapes the export directory"
        )));
    }
    Ok(resolved)
}

fn normalize(path: &Path) -> Result<PathBuf, Error> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(Error::Validation(format!(
                        "path {} escapes its root",
                        path.display()
                    )));
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formula_cells_are_defanged_and_quoted() {
        assert_eq!(
            escape_csv_value("=cmd|'/c calc'!A0"),
            "\"'=cmd|'/c calc'!A0\""
        );
        assert_eq!(escape_csv_value("+SUM(A1:A9)"), "\"'+SUM(A1:A9)\"");
        assert_eq!(escape_csv_value("@import"), "\"'@import\"");
        assert_eq!(escape_csv_value("-2"), "\"'-2\"");
    }

    #[test]
    fn plain_cells_pass_through() {
        assert_eq!(escape_csv_value("hello"), "hello");
        assert_eq!(escape_csv_value("42"), "42");
    }

    #[test]
    fn delimiters_force_quoting_and_quotes_double() {
        assert_eq!(escape_csv_value("a,b"), "\"a,b\"");
        assert_eq!(escape_csv_value("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_csv_value("line\nbreak"), "\"line\nbreak\"");
    }

    #[test]
    fn csv_rendering_escapes_every_cell() {
        let csv = to_csv(
            &["title", "owner"],
            &[vec!["=HYPERLINK(\"x\")".into(), "alice".into()]],
        );
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("title,owner"));
        assert_eq!(
            lines.next(),
            Some("\"'=HYPERLINK(\"\"x\"\")\",alice")
        );
    }

    #[test]
    fn export_paths_stay_inside_the_base() {
        let base = Path::new("/var/exports");
        assert_eq!(
            resolve_export_path(base, "org-1/report.csv").unwrap(),
            PathBuf::from("/var/exports/org-1/report.csv")
        );
        assert!(resolve_export_path(base, "../etc/passwd").is_err());
        assert!(resolve_export_path(base, "org-1/../../etc/passwd").is_err());
        assert!(resolve_export_path(base, "/etc/passwd").is_err());
        // Parent references that stay inside the base are fine.
        assert_eq!(
            resolve_export_path(base, "org-1/../org-2/report.csv").unwrap(),
            PathBuf::from("/var/exports/org-2/report.csv")
        );
    }
}
