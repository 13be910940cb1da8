//! Managed `.gitignore` section for mirrored repositories.
//!
//! The bridge owns one delimited block inside each target repository's
//! `.gitignore`. Every sync rewrites that block with the current template;
//! lines outside it belong to the repository's users and are left alone.

use std::io::ErrorKind;
use std::path::Path;

use crate::errors::{io_err, WorkspaceError};

/// Bumped whenever [`TEMPLATE`] changes.
pub const TEMPLATE_VERSION: u32 = 1;

/// First line of the managed block (the version is appended).
pub const BEGIN_MARKER: &str = "# >>> gitbridge managed section";

/// Last line of the managed block.
pub const END_MARKER: &str = "# <<< gitbridge managed section <<<";

/// Built-in patterns for LaTeX compile intermediates. Sources and final
/// PDFs are kept.
pub const TEMPLATE: &str = "\
## Core LaTeX/pdfLaTeX auxiliary files
*.aux
*.lof
*.log
*.lot
*.fls
*.out
*.toc
*.fmt
*.fot
*.cb
*.cb2
.*.lb

## Intermediate documents
*.dvi
*.xdv
*-converted-to.*

## Bibliography auxiliary files
*.bbl
*.bcf
*.blg
*-blx.aux
*-blx.bib
*.run.xml

## Build tool auxiliary files
*.fdb_latexmk
*.synctex
*.synctex(busy)
*.synctex.gz
*.synctex.gz(busy)
*.pdfsync

## Auxiliary and intermediate files from other packages
*.acn
*.acr
*.alg
*.glg
*.glo
*.gls
*.idx
*.ilg
*.ind
*.ist
*.nav
*.snm
*.vrb
*.xwm
*.loa
*.lol
*.nlo
*.nls
*.thm
*.figlist
*.makefile
*.auxlock
_minted*/
*.pyg

## Temporary directories and editor leftovers
tmp/
temp/
output/
*~
*.swp
*.bak
.DS_Store
";

/// Render the complete managed block for `template`.
pub fn managed_block(template: &str) -> String {
    let mut block = format!("{} (v{}) >>>\n", BEGIN_MARKER, TEMPLATE_VERSION);
    block.push_str("# Maintained automatically; edits inside this block are overwritten.\n");
    block.push_str(template.trim_end_matches('\n'));
    block.push('\n');
    block.push_str(END_MARKER);
    block.push('\n');
    block
}

/// Replace (or append) the managed block inside `existing`.
///
/// Text before and after the block is preserved byte-for-byte. If a begin
/// marker has no matching end marker, everything from the begin marker on is
/// treated as the block.
pub fn merge_managed_section(existing: &str, template: &str) -> String {
    let block = managed_block(template);

    let Some(begin) = find_line_start(existing, BEGIN_MARKER) else {
        let mut out = existing.to_string();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&block);
        return out;
    };

    let after_begin = &existing[begin..];
    let tail = match find_line_start(after_begin, END_MARKER) {
        Some(end_rel) => {
            let end_line = &after_begin[end_rel..];
            let line_len = end_line.find('\n').map_or(end_line.len(), |i| i + 1);
            &after_begin[end_rel + line_len..]
        }
        None => "",
    };

    let mut out = String::with_capacity(existing.len() + block.len());
    out.push_str(&existing[..begin]);
    out.push_str(&block);
    out.push_str(tail);
    out
}

/// Extract the template text currently inside the managed block, if any.
pub fn managed_content(text: &str) -> Option<&str> {
    let begin = find_line_start(text, BEGIN_MARKER)?;
    let after_begin = &text[begin..];
    let body_start = after_begin.find('\n')? + 1;
    let body = &after_begin[body_start..];
    // Skip the notice line written by `managed_block`.
    let body = match body.strip_prefix('#') {
        Some(_) => &body[body.find('\n')? + 1..],
        None => body,
    };
    let end = find_line_start(body, END_MARKER)?;
    Some(&body[..end])
}

/// Rewrite the managed block of the ignore file at `path`, creating it if
/// needed.
pub fn write_managed_section(path: &Path, template: &str) -> Result<(), WorkspaceError> {
    let existing = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => return Err(io_err(path, e)),
    };
    let merged = merge_managed_section(&existing, template);
    if merged != existing {
        std::fs::write(path, merged).map_err(|e| io_err(path, e))?;
    }
    Ok(())
}

/// Byte offset of the first line starting with `marker`.
fn find_line_start(text: &str, marker: &str) -> Option<usize> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.starts_with(marker) {
            return Some(offset);
        }
        offset += line.len();
    }
    None
}
