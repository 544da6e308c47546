//! Typed access to row cells. Unconvertible present values become `invalid_value` warnings.

use crate::parser::Row;
use crate::warning::Warning;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Placeholders the tool prints for "no data".
fn is_placeholder(s: &str) -> bool {
    matches!(s, "" | "N/A" | "-" | "--" | "n/a")
}

pub fn parse_int(s: &str) -> Option<u64> {
    let t = s.trim();
    match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => t.parse().ok(),
    }
}

pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim() {
        "True" | "true" | "1" => Some(true),
        "False" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Volatility timestamps: `2019-12-14 10:36:23.000000 UTC`, `... UTC+0000`, or RFC 3339.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let t = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.with_timezone(&Utc));
    }
    let t = t
        .strip_suffix("UTC+0000")
        .or_else(|| t.strip_suffix("UTC"))
        .unwrap_or(t)
        .trim_end();
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(t, fmt).ok())
        .map(|n| Utc.from_utc_datetime(&n))
}

/// Row view that records conversion failures into `warnings`.
pub struct Cells<'a, 'w> {
    row: &'a Row,
    warnings: &'w mut Vec<Warning>,
}

impl<'a, 'w> Cells<'a, 'w> {
    pub fn new(row: &'a Row, warnings: &'w mut Vec<Warning>) -> Self {
        Self { row, warnings }
    }

    /// Present, non-placeholder text of the first existing column among `columns`.
    fn raw(&self, columns: &[&str]) -> Option<(&'a str, &'a str)> {
        let row = self.row;
        let col = columns
            .iter()
            .find_map(|c| row.columns().iter().find(|rc| rc.as_str() == *c))?;
        let v = row.value(col)?.trim();
        (!is_placeholder(v)).then_some((col.as_str(), v))
    }

    fn convert<T>(&mut self, columns: &[&str], f: impl Fn(&str) -> Option<T>) -> Option<T> {
        let (col, v) = self.raw(columns)?;
        let parsed = f(v);
        if parsed.is_none() {
            self.warnings.push(Warning::InvalidValue {
                plugin: self.row.source_plugin.to_string(),
                line: self.row.line_number,
                column: col.to_string(),
                value: v.to_string(),
            });
        }
        parsed
    }

    pub fn text(&self, columns: &[&str]) -> Option<String> {
        self.raw(columns).map(|(_, v)| v.to_string())
    }

    pub fn int(&mut self, columns: &[&str]) -> Option<u64> {
        self.convert(columns, parse_int)
    }

    pub fn pid(&mut self, columns: &[&str]) -> Option<u32> {
        self.convert(columns, |v| parse_int(v).and_then(|n| u32::try_from(n).ok()))
    }

    pub fn boolean(&mut self, columns: &[&str]) -> Option<bool> {
        self.convert(columns, parse_bool)
    }

    pub fn time(&mut self, columns: &[&str]) -> Option<DateTime<Utc>> {
        self.convert(columns, parse_timestamp)
    }
}
