//! Record parser: one plugin's raw text → ordered typed rows plus warnings.
//!
//! Forgiving by construction: short rows are kept with [`Field::Absent`] cells,
//! untokenizable lines are skipped with a warning, and output without a
//! recognizable header is rejected as a whole so garbage is never parsed as data.

pub mod registry;
mod tokenize;

pub use registry::{ArtifactKind, ColumnLayout, Delimiter, PluginRegistry, PluginSchema};

use crate::runner::PluginResult;
use crate::warning::Warning;
use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokenize::{detect_version, is_banner, is_separator, match_header, split_cells, HeaderMatch};

/// Non-blank lines scanned for a header before the output is rejected.
pub const HEADER_LOOKAHEAD: usize = 64;

/// Extraction tool version, from its banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ToolVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ToolVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self { major, minor, patch }
    }

    /// `"2.5.2"`, `"2.5"` or `"2.5.2 (build)"`.
    pub fn parse(s: &str) -> Option<Self> {
        let token = s.split_whitespace().next()?;
        let mut parts = token.split('.').map(|p| p.parse::<u16>());
        let major = parts.next()?.ok()?;
        let minor = parts.next()?.ok()?;
        let patch = match parts.next() {
            Some(p) => p.ok()?,
            None => 0,
        };
        Some(Self::new(major, minor, patch))
    }
}

impl fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// One cell. `Absent` (column missing from a short row) is not the same as `Value("")`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Absent,
    Value(String),
}

impl Field {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Field::Absent => None,
            Field::Value(v) => Some(v),
        }
    }
}

impl Serialize for Field {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Field::Absent => s.serialize_none(),
            Field::Value(v) => s.serialize_str(v),
        }
    }
}

/// Parsed row: column name → cell, in column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub source_plugin: Arc<str>,
    /// 1-based line in the raw output
    pub line_number: usize,
    columns: Arc<[String]>,
    fields: Vec<Field>,
}

impl Row {
    pub fn new(source_plugin: Arc<str>, line_number: usize, columns: Arc<[String]>, mut fields: Vec<Field>) -> Self {
        fields.resize(columns.len(), Field::Absent);
        Self {
            source_plugin,
            line_number,
            columns,
            fields,
        }
    }

    /// Row with every listed column present; for fixtures and replayed JSON.
    pub fn from_pairs(plugin: &str, line_number: usize, pairs: &[(&str, &str)]) -> Self {
        let columns: Arc<[String]> = pairs.iter().map(|(c, _)| c.to_string()).collect::<Vec<_>>().into();
        let fields = pairs.iter().map(|(_, v)| Field::Value(v.to_string())).collect();
        Self::new(Arc::from(plugin), line_number, columns, fields)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Cell for `column`; `None` when the layout has no such column.
    pub fn field(&self, column: &str) -> Option<&Field> {
        self.columns.iter().position(|c| c == column).map(|i| &self.fields[i])
    }

    /// Present cell text; `None` for absent cells and unknown columns.
    pub fn value(&self, column: &str) -> Option<&str> {
        self.field(column).and_then(Field::as_str)
    }

    fn extend_last(&mut self, text: &str) {
        if let Some(last) = self.fields.last_mut() {
            match last {
                Field::Absent => *last = Field::Value(text.to_string()),
                Field::Value(v) => {
                    if !v.is_empty() {
                        v.push('\n');
                    }
                    v.push_str(text);
                }
            }
        }
    }
}

struct FieldMap<'a>(&'a Row);

impl Serialize for FieldMap<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(self.0.columns.len()))?;
        for (c, f) in self.0.columns.iter().zip(&self.0.fields) {
            map.serialize_entry(c, f)?;
        }
        map.end()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut st = s.serialize_struct("Row", 2)?;
        st.serialize_field("line", &self.line_number)?;
        st.serialize_field("fields", &FieldMap(self))?;
        st.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Parsed,
    /// The runner reported a failure; nothing was parsed.
    ToolFailed,
    HeaderNotFound,
}

/// Parser output for one plugin; serialized as the cleaned per-plugin JSON.
#[derive(Debug, Clone, Serialize)]
pub struct ParsedOutput {
    pub plugin: String,
    pub status: TableStatus,
    pub tool_version: Option<ToolVersion>,
    pub layout: Option<String>,
    pub rows: Vec<Row>,
    pub warnings: Vec<Warning>,
}

/// The layout actually applied to a table, registry-backed or inferred.
struct ActiveLayout {
    id: String,
    delimiter: Delimiter,
    columns: Arc<[String]>,
    offsets: Vec<usize>,
    continuation: bool,
}

impl ActiveLayout {
    fn min_fields(&self) -> usize {
        self.columns.len().min(2)
    }
}

pub fn parse(result: &PluginResult) -> ParsedOutput {
    parse_with(PluginRegistry::global(), result)
}

pub fn parse_with(registry: &PluginRegistry, result: &PluginResult) -> ParsedOutput {
    let plugin = result.plugin.as_str();
    let mut out = ParsedOutput {
        plugin: plugin.to_string(),
        status: TableStatus::Parsed,
        tool_version: None,
        layout: None,
        rows: Vec::new(),
        warnings: Vec::new(),
    };
    if result.error.is_some() {
        out.status = TableStatus::ToolFailed;
        return out;
    }

    let version = detect_version(&result.raw_output).or_else(|| detect_version(&result.stderr));
    out.tool_version = version;

    let lines: Vec<&str> = result.raw_output.lines().collect();
    let found = match registry.get(plugin) {
        Some(schema) => find_header(&lines, &schema.candidates(version)),
        None => infer_header(&lines),
    };
    let (header_idx, layout) = match found {
        Ok(found) => found,
        Err(scanned_lines) => {
            tracing::warn!(plugin, scanned_lines, "no header found; output rejected");
            out.status = TableStatus::HeaderNotFound;
            out.warnings.push(Warning::HeaderNotFound {
                plugin: plugin.to_string(),
                scanned_lines,
            });
            return out;
        }
    };
    out.layout = Some(layout.id.clone());

    let source: Arc<str> = Arc::from(plugin);
    let expected = layout.columns.len();
    let last_data_idx = lines.iter().rposition(|l| !l.trim().is_empty());
    let unterminated = !result.raw_output.ends_with('\n');
    let mut after_header = true;

    for (idx, line) in lines.iter().enumerate().skip(header_idx + 1) {
        let line_number = idx + 1;
        if line.trim().is_empty() || is_banner(line) {
            continue;
        }
        if after_header && is_separator(line) {
            continue;
        }
        after_header = false;

        let cells = split_cells(line, layout.delimiter, expected, &layout.offsets);
        if cells.len() < layout.min_fields() {
            if layout.continuation {
                if let Some(prev) = out.rows.last_mut() {
                    prev.extend_last(line.trim());
                    continue;
                }
            }
            out.warnings.push(Warning::UnparseableLine {
                plugin: plugin.to_string(),
                line: line_number,
            });
            continue;
        }

        let found_columns = cells.len();
        if found_columns < expected {
            let truncated = unterminated && Some(idx) == last_data_idx;
            out.warnings.push(if truncated {
                Warning::TruncatedOutput {
                    plugin: plugin.to_string(),
                    line: line_number,
                    found_columns,
                }
            } else {
                Warning::MalformedRow {
                    plugin: plugin.to_string(),
                    line: line_number,
                    expected_columns: expected,
                    found_columns,
                }
            });
        }
        let fields = cells.into_iter().map(Field::Value).collect();
        out.rows.push(Row::new(source.clone(), line_number, layout.columns.clone(), fields));
    }

    tracing::debug!(
        plugin,
        layout = %layout.id,
        rows = out.rows.len(),
        warnings = out.warnings.len(),
        "parsed plugin output"
    );
    out
}

/// Index of the header line and the layout it matched; `Err(scanned)` when none matched.
fn find_header(lines: &[&str], candidates: &[&ColumnLayout]) -> Result<(usize, ActiveLayout), usize> {
    let mut scanned = 0;
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if scanned == HEADER_LOOKAHEAD {
            break;
        }
        scanned += 1;
        // Layouts sharing a signature differ in later columns; the closest fit wins and
        // ties go to the newest candidate.
        let best = candidates
            .iter()
            .filter_map(|layout| match_header(line, layout))
            .fold(None, |best: Option<HeaderMatch>, m| match best {
                Some(b) if b.rank() >= m.rank() => Some(b),
                _ => Some(m),
            });
        if let Some(m) = best {
            let columns: Arc<[String]> = m.layout.columns.iter().map(|c| c.to_string()).collect::<Vec<_>>().into();
            return Ok((
                idx,
                ActiveLayout {
                    id: m.layout.id.to_string(),
                    delimiter: m.layout.delimiter,
                    columns,
                    offsets: m.offsets,
                    continuation: m.layout.continuation,
                },
            ));
        }
    }
    Err(scanned)
}

/// Plugins outside the registry: the first non-banner line is taken as the header.
fn infer_header(lines: &[&str]) -> Result<(usize, ActiveLayout), usize> {
    let mut scanned = 0;
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if scanned == HEADER_LOOKAHEAD {
            break;
        }
        scanned += 1;
        if is_banner(line) {
            continue;
        }
        let (delimiter, columns): (Delimiter, Vec<String>) = if line.contains('\t') {
            (Delimiter::Tab, line.split('\t').map(|c| c.trim().to_string()).collect())
        } else {
            (Delimiter::Whitespace, line.split_whitespace().map(str::to_string).collect())
        };
        return Ok((
            idx,
            ActiveLayout {
                id: "inferred".to_string(),
                delimiter,
                columns: columns.into(),
                offsets: Vec::new(),
                continuation: false,
            },
        ));
    }
    Err(scanned)
}

/// Successful tables of one run plus every parse warning, in plugin order.
#[derive(Debug, Clone, Default)]
pub struct ParsedTables {
    pub tool_version: Option<ToolVersion>,
    pub tables: BTreeMap<String, Vec<Row>>,
    pub warnings: Vec<Warning>,
}

impl ParsedTables {
    pub fn collect<'a>(outputs: impl IntoIterator<Item = &'a ParsedOutput>) -> Self {
        let mut t = ParsedTables::default();
        for o in outputs {
            if t.tool_version.is_none() {
                t.tool_version = o.tool_version;
            }
            t.warnings.extend(o.warnings.iter().cloned());
            if o.status == TableStatus::Parsed {
                t.tables.insert(o.plugin.clone(), o.rows.clone());
            }
        }
        t
    }

    pub fn insert(&mut self, plugin: &str, rows: Vec<Row>) {
        self.tables.insert(plugin.to_string(), rows);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ToolError;

    const PSLIST_OUT: &str = "Volatility 3 Framework 2.5.0\n\
Progress:  100.00\t\tPDB scanning finished\n\
\n\
PID\tPPID\tImageFileName\tOffset(V)\tThreads\tHandles\tSessionId\tWow64\tCreateTime\tExitTime\tFile output\n\
\n\
4\t0\tSystem\t0xfa8000c9e040\t92\t545\tN/A\tFalse\t2019-12-14 10:36:23.000000 UTC\tN/A\tDisabled\n\
304\t4\tsmss.exe\t0xfa8001a3b040\t2\t29\tN/A\tFalse\t2019-12-14 10:36:23.000000 UTC\tN/A\tDisabled\n\
388\t380\tcsrss.exe\t0xfa8001c1e060\t9\n";

    fn result(plugin: &str, raw: &str) -> PluginResult {
        PluginResult::from_output(plugin, "dump", raw)
    }

    #[test]
    fn banner_skipped_and_rows_parsed() {
        let out = parse(&result(registry::PSLIST, PSLIST_OUT));
        assert_eq!(out.status, TableStatus::Parsed);
        assert_eq!(out.tool_version, Some(ToolVersion::new(2, 5, 0)));
        assert_eq!(out.layout.as_deref(), Some("pslist/2"));
        assert_eq!(out.rows.len(), 3);
        assert_eq!(out.rows[0].value("ImageFileName"), Some("System"));
        assert_eq!(out.rows[0].line_number, 6);
        assert_eq!(out.rows[1].value("CreateTime"), Some("2019-12-14 10:36:23.000000 UTC"));
    }

    #[test]
    fn short_row_kept_with_absent_cells() {
        let out = parse(&result(registry::PSLIST, PSLIST_OUT));
        let short = &out.rows[2];
        assert_eq!(short.value("PID"), Some("388"));
        assert_eq!(short.field("Handles"), Some(&Field::Absent));
        assert_eq!(short.value("Handles"), None);
        assert_eq!(
            out.warnings,
            vec![Warning::MalformedRow {
                plugin: registry::PSLIST.into(),
                line: 8,
                expected_columns: 11,
                found_columns: 5,
            }]
        );
    }

    #[test]
    fn empty_cell_is_not_absent() {
        let raw = "PID\tProcess\tOffset\tHandleValue\tType\tGrantedAccess\tName\n4\tSystem\t0x1\t0x4\tProcess\t0x1fffff\t\n";
        let out = parse(&result(registry::HANDLES, raw));
        assert_eq!(out.rows[0].field("Name"), Some(&Field::Value(String::new())));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn unterminated_last_row_is_truncation() {
        let raw = PSLIST_OUT.trim_end_matches('\n');
        let out = parse(&result(registry::PSLIST, raw));
        assert_eq!(out.rows.len(), 3);
        assert!(matches!(
            out.warnings.as_slice(),
            [Warning::TruncatedOutput { line: 8, found_columns: 5, .. }]
        ));
    }

    #[test]
    fn untokenizable_line_skipped_with_warning() {
        let raw = "PID\tProcess\tOffset\tHandleValue\tType\tGrantedAccess\tName\n\
4\tSystem\t0x1\t0x4\tKey\t0x1\tMACHINE\n\
garbage-without-cells\n\
4\tSystem\t0x2\t0x8\tFile\t0x1\t\\Device\\X\n";
        let out = parse(&result(registry::HANDLES, raw));
        assert_eq!(out.rows.len(), 2);
        assert_eq!(
            out.warnings,
            vec![Warning::UnparseableLine {
                plugin: registry::HANDLES.into(),
                line: 3
            }]
        );
    }

    #[test]
    fn missing_header_rejects_output() {
        let raw = "Volatility 3 Framework 2.5.0\nUnsatisfied requirement plugins.PsList.kernel\n";
        let out = parse(&result(registry::PSLIST, raw));
        assert_eq!(out.status, TableStatus::HeaderNotFound);
        assert!(out.rows.is_empty());
        assert_eq!(
            out.warnings,
            vec![Warning::HeaderNotFound {
                plugin: registry::PSLIST.into(),
                scanned_lines: 2
            }]
        );
    }

    #[test]
    fn header_beyond_lookahead_is_not_found() {
        let mut raw = String::new();
        for i in 0..HEADER_LOOKAHEAD {
            raw.push_str(&format!("log line {i}\n"));
        }
        raw.push_str("PID\tPPID\tImageFileName\n4\t0\tSystem\n");
        let out = parse(&result(registry::PSLIST, &raw));
        assert_eq!(out.status, TableStatus::HeaderNotFound);
    }

    #[test]
    fn failed_result_yields_nothing() {
        let mut r = result(registry::PSLIST, PSLIST_OUT);
        r.error = Some(ToolError::Timeout { secs: 1 });
        let out = parse(&r);
        assert_eq!(out.status, TableStatus::ToolFailed);
        assert!(out.rows.is_empty() && out.warnings.is_empty());
    }

    #[test]
    fn malfind_hexdump_lines_continue_previous_row() {
        let raw = "Volatility 3 Framework 2.4.1\n\
PID\tProcess\tStart VPN\tEnd VPN\tTag\tProtection\tCommitCharge\tPrivateMemory\tFile output\tHexdump\tDisasm\n\
\n\
1234\tevil.exe\t0x400000\t0x401fff\tVadS\tPAGE_EXECUTE_READWRITE\t2\t1\tDisabled\t4d 5a 90 00\t\n\
03 00 00 00\n\
0x400000:  dec ebp\n";
        let out = parse(&result(registry::MALFIND, raw));
        assert_eq!(out.layout.as_deref(), Some("malfind/2"));
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].value("Protection"), Some("PAGE_EXECUTE_READWRITE"));
        assert!(out.rows[0].value("Disasm").unwrap().ends_with("dec ebp"));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn legacy_fixed_width_layout_selected_by_header() {
        let raw = "PID  PPID ImageFileName  Offset(V)  Threads Handles SessionId Wow64 CreateTime              ExitTime\n\
---- ---- -------------- ---------- ------- ------- --------- ----- ----------------------- --------\n\
4    0    System         0xfa80     92      545     N/A       False 2019-12-14 10:36:23 UTC N/A\n";
        let out = parse(&result(registry::PSLIST, raw));
        assert_eq!(out.layout.as_deref(), Some("pslist/1"));
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].value("CreateTime"), Some("2019-12-14 10:36:23 UTC"));
        assert_eq!(out.rows[0].value("ExitTime"), Some("N/A"));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn older_svcscan_columns_without_banner_select_older_layout() {
        let raw = "Offset\tOrder\tPID\tStart\tState\tType\tName\tDisplay\tBinary\n\
0xa1\t12\t640\tSERVICE_AUTO_START\tSERVICE_RUNNING\tSERVICE_WIN32_OWN_PROCESS\tSpooler\tPrint Spooler\tC:\\spoolsv.exe\n";
        let out = parse(&result(registry::SVCSCAN, raw));
        assert_eq!(out.tool_version, None);
        assert_eq!(out.layout.as_deref(), Some("svcscan/1"));
        assert_eq!(out.rows[0].value("Binary"), Some("C:\\spoolsv.exe"));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn older_malfind_columns_without_banner_keep_hexdump_and_disasm() {
        let raw = "PID\tProcess\tStart VPN\tEnd VPN\tTag\tProtection\tCommitCharge\tPrivateMemory\tFile output\tHexdump\tDisasm\n\
1234\tevil.exe\t0x400000\t0x401fff\tVadS\tPAGE_EXECUTE_READWRITE\t2\t1\tDisabled\t4d 5a 90 00\tdec ebp\n";
        let out = parse(&result(registry::MALFIND, raw));
        assert_eq!(out.layout.as_deref(), Some("malfind/2"));
        assert_eq!(out.rows[0].value("Hexdump"), Some("4d 5a 90 00"));
        assert_eq!(out.rows[0].value("Disasm"), Some("dec ebp"));
        assert_eq!(out.rows[0].value("Notes"), None);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn newer_banner_with_older_columns_selects_matching_layout() {
        let raw = "Volatility 3 Framework 2.7.0\n\
PID\tProcess\tStart VPN\tEnd VPN\tTag\tProtection\tCommitCharge\tPrivateMemory\tFile output\tHexdump\tDisasm\n\
1234\tevil.exe\t0x400000\t0x401fff\tVadS\tPAGE_EXECUTE_READWRITE\t2\t1\tDisabled\t4d 5a\tdec ebp\n";
        let out = parse(&result(registry::MALFIND, raw));
        assert_eq!(out.layout.as_deref(), Some("malfind/2"));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn current_malfind_columns_still_select_newest_layout() {
        let raw = "PID\tProcess\tStart VPN\tEnd VPN\tTag\tProtection\tCommitCharge\tPrivateMemory\tFile output\tNotes\tHexdump\tDisasm\n\
1234\tevil.exe\t0x400000\t0x401fff\tVadS\tPAGE_EXECUTE_READWRITE\t2\t1\tDisabled\tMZ header\t4d 5a\tdec ebp\n";
        let out = parse(&result(registry::MALFIND, raw));
        assert_eq!(out.layout.as_deref(), Some("malfind/3"));
        assert_eq!(out.rows[0].value("Notes"), Some("MZ header"));
    }

    #[test]
    fn unknown_plugin_infers_layout() {
        let raw = "Volatility 3 Framework 2.5.0\nPID\tPort\tState\n4\t445\tLISTENING\n";
        let out = parse(&result("windows.netstat", raw));
        assert_eq!(out.layout.as_deref(), Some("inferred"));
        assert_eq!(out.rows[0].value("Port"), Some("445"));
    }

    #[test]
    fn row_serializes_in_column_order() {
        let out = parse(&result(registry::PSLIST, PSLIST_OUT));
        let json = serde_json::to_string(&out.rows[2]).unwrap();
        assert!(json.starts_with(r#"{"line":8,"fields":{"PID":"388","PPID":"380""#));
        assert!(json.contains(r#""Handles":null"#));
    }

    #[test]
    fn collect_keeps_only_parsed_tables() {
        let ok = parse(&result(registry::PSLIST, PSLIST_OUT));
        let bad = parse(&result(registry::HANDLES, "no table here\n"));
        let tables = ParsedTables::collect([&ok, &bad]);
        assert!(tables.tables.contains_key(registry::PSLIST));
        assert!(!tables.tables.contains_key(registry::HANDLES));
        assert_eq!(tables.warnings.len(), 2);
        assert_eq!(tables.tool_version, Some(ToolVersion::new(2, 5, 0)));
    }

    #[test]
    fn tool_version_parsing() {
        assert_eq!(ToolVersion::parse("2.5"), Some(ToolVersion::new(2, 5, 0)));
        assert_eq!(ToolVersion::parse("2.7.1 (dev)"), Some(ToolVersion::new(2, 7, 1)));
        assert_eq!(ToolVersion::parse("x.y"), None);
        assert!(ToolVersion::new(2, 4, 0) < ToolVersion::new(2, 10, 0));
    }
}
