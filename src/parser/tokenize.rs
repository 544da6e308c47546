//! Line-level helpers: banner/version detection, header matching, cell splitting.

use super::registry::{ColumnLayout, Delimiter};
use super::ToolVersion;

const BANNER: &str = "Volatility 3 Framework";

/// Banner and progress noise the tool prints ahead of the table.
pub(crate) fn is_banner(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("Volatility") || t.starts_with("Progress")
}

/// Row separators some renderers print under the header.
pub(crate) fn is_separator(line: &str) -> bool {
    let t = line.trim();
    !t.is_empty() && t.chars().all(|c| matches!(c, '-' | '=' | '*' | ' ' | '\t'))
}

/// `Volatility 3 Framework 2.5.2` → 2.5.2, searched in the first lines of `text`.
pub(crate) fn detect_version(text: &str) -> Option<ToolVersion> {
    text.lines().take(16).find_map(|line| {
        let rest = line.trim().strip_prefix(BANNER)?;
        ToolVersion::parse(rest.trim())
    })
}

/// Header match result: the layout plus cell offsets for fixed-width layouts.
pub(crate) struct HeaderMatch<'a> {
    pub layout: &'a ColumnLayout,
    pub offsets: Vec<usize>,
    /// Leading layout columns the header names, in order.
    pub fit: usize,
    /// The header names the layout's columns and nothing else.
    pub exact: bool,
}

impl HeaderMatch<'_> {
    /// Ordering between layouts that matched the same header line.
    pub fn rank(&self) -> (bool, usize) {
        (self.exact, self.fit)
    }
}

pub(crate) fn match_header<'a>(line: &str, layout: &'a ColumnLayout) -> Option<HeaderMatch<'a>> {
    let sig = layout.signature_columns();
    match layout.delimiter {
        Delimiter::Tab => {
            let mut cells: Vec<&str> = line.split('\t').map(str::trim).collect();
            while cells.len() > 1 && cells.last().map_or(false, |c| c.is_empty()) {
                cells.pop();
            }
            if cells.len() < sig.len() || !cells.iter().zip(sig).all(|(c, s)| c == s) {
                return None;
            }
            let fit = cells.iter().zip(layout.columns).take_while(|(c, col)| c == col).count();
            Some(HeaderMatch {
                layout,
                offsets: Vec::new(),
                fit,
                exact: fit == layout.columns.len() && cells.len() == fit,
            })
        }
        Delimiter::Whitespace => {
            if !starts_with_words(line, sig) {
                return None;
            }
            let (fit, exact) = leading_columns(line, layout.columns);
            Some(HeaderMatch {
                layout,
                offsets: Vec::new(),
                fit,
                exact,
            })
        }
        Delimiter::FixedWidth => {
            if line.contains('\t') || !starts_with_words(line, sig) {
                return None;
            }
            let offsets = column_offsets(line, layout.columns)?;
            let (fit, exact) = leading_columns(line, layout.columns);
            Some(HeaderMatch {
                layout,
                offsets,
                fit,
                exact,
            })
        }
    }
}

fn starts_with_words(line: &str, words: &[&str]) -> bool {
    let mut tokens = line.split_whitespace();
    words.iter().all(|w| {
        // Multi-word column names ("Start VPN") span several tokens.
        w.split_whitespace().all(|part| tokens.next() == Some(part))
    })
}

/// How many leading `columns` the line names, and whether nothing follows them.
fn leading_columns(line: &str, columns: &[&str]) -> (usize, bool) {
    let mut tokens = line.split_whitespace();
    let mut fit = 0;
    for col in columns {
        if !col.split_whitespace().all(|part| tokens.next() == Some(part)) {
            return (fit, false);
        }
        fit += 1;
    }
    (fit, tokens.next().is_none())
}

/// Char offsets where each column name starts in the header line.
fn column_offsets(line: &str, columns: &[&str]) -> Option<Vec<usize>> {
    let chars: Vec<char> = line.chars().collect();
    let mut offsets = Vec::with_capacity(columns.len());
    let mut from = 0;
    for col in columns {
        let needle: Vec<char> = col.chars().collect();
        let pos = (from..=chars.len().saturating_sub(needle.len())).find(|&i| {
            chars[i..i + needle.len()] == needle[..]
                && (i == 0 || chars[i - 1].is_whitespace())
                && chars.get(i + needle.len()).map_or(true, |c| c.is_whitespace())
        })?;
        offsets.push(pos);
        from = pos + needle.len();
    }
    Some(offsets)
}

/// Split a data line into cells. Fewer cells than columns means a short row.
pub(crate) fn split_cells(line: &str, delimiter: Delimiter, columns: usize, offsets: &[usize]) -> Vec<String> {
    match delimiter {
        Delimiter::Tab => {
            let mut cells: Vec<String> = line.split('\t').map(|c| c.trim().to_string()).collect();
            while cells.len() > columns && cells.last().map_or(false, |c| c.is_empty()) {
                cells.pop();
            }
            fold_extra(cells, columns, "\t")
        }
        Delimiter::Whitespace => {
            let mut cells = Vec::new();
            let mut rest = line.trim();
            while !rest.is_empty() {
                if cells.len() + 1 == columns {
                    cells.push(rest.to_string());
                    break;
                }
                match rest.find(char::is_whitespace) {
                    Some(end) => {
                        cells.push(rest[..end].to_string());
                        rest = rest[end..].trim_start();
                    }
                    None => {
                        cells.push(rest.to_string());
                        break;
                    }
                }
            }
            cells
        }
        Delimiter::FixedWidth => {
            let chars: Vec<char> = line.trim_end().chars().collect();
            let mut cells = Vec::new();
            for (i, &start) in offsets.iter().enumerate() {
                if start >= chars.len() {
                    break;
                }
                let end = offsets.get(i + 1).copied().unwrap_or(chars.len()).min(chars.len());
                cells.push(chars[start..end].iter().collect::<String>().trim().to_string());
            }
            cells
        }
    }
}

fn fold_extra(mut cells: Vec<String>, columns: usize, sep: &str) -> Vec<String> {
    if columns == 0 || cells.len() <= columns {
        return cells;
    }
    let extra = cells.split_off(columns);
    if let Some(last) = cells.last_mut() {
        for e in extra {
            last.push_str(sep);
            last.push_str(&e);
        }
    }
    cells
}
