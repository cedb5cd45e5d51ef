//! Mug list files: one group url-name per line, `#` starts a comment.

use std::path::Path;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tracing::info;

const URLNAME_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9_-]*$";

/// Parse mug list content. Blank lines and comments are skipped; anything else must be a
/// single url-name.
pub fn parse_mug_list(content: &str) -> Result<Vec<String>> {
    let urlname = Regex::new(URLNAME_PATTERN)?;
    let mut mugs: Vec<String> = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let entry = line.split('#').next().unwrap_or_default().trim();
        if entry.is_empty() {
            continue;
        }
        if !urlname.is_match(entry) {
            bail!("line {}: {entry:?} is not a group url-name", lineno + 1);
        }
        if !mugs.iter().any(|m| m == entry) {
            mugs.push(entry.to_string());
        }
    }
    Ok(mugs)
}

pub fn read_mug_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read mug file {}", path.display()))?;
    let mugs = parse_mug_list(&content)
        .with_context(|| format!("Invalid mug file {}", path.display()))?;
    info!(path = %path.display(), mugs = mugs.len(), "Loaded mug file");
    Ok(mugs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let content = "# MongoDB user groups\nDublinMUG\n\n  London-MongoDB-User-Group  # uk\nDublinMUG\n";
        assert_eq!(
            parse_mug_list(content).unwrap(),
            vec!["DublinMUG", "London-MongoDB-User-Group"]
        );
    }

    #[test]
    fn rejects_lines_with_spaces() {
        let err = parse_mug_list("DublinMUG\nnot a mug\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
