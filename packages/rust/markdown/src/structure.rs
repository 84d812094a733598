//! Detection of chartable structured data in raw markdown.
//!
//! Looks for markdown tables and numeric series (list items or short lines
//! carrying numbers). Only counts are produced; values are never extracted.

use std::sync::LazyLock;

use regex::Regex;

/// Structured-data profile of one markdown text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StructuredData {
    /// Markdown tables with a header separator row.
    pub tables: usize,
    /// Table body rows with at least one numeric cell.
    pub numeric_rows: usize,
    /// Numeric table cells.
    pub numeric_cells: usize,
    /// List items or lines outside tables that carry a number.
    pub series_points: usize,
}

impl StructuredData {
    /// Data points a chart could plot.
    pub fn numeric_points(&self) -> usize {
        self.numeric_rows + self.series_points
    }

    pub fn has_data(&self) -> bool {
        self.numeric_points() > 0
    }

    /// Combine the profiles of several documents.
    pub fn merge(self, other: Self) -> Self {
        Self {
            tables: self.tables + other.tables,
            numeric_rows: self.numeric_rows + other.numeric_rows,
            numeric_cells: self.numeric_cells + other.numeric_cells,
            series_points: self.series_points + other.series_points,
        }
    }
}

static SEPARATOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\|?\s*:?-{3,}:?\s*(\|\s*:?-{3,}:?\s*)*\|?\s*$").expect("valid regex")
});

static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-+]?[$€£¥]?\d[\d,]*(\.\d+)?\s*(%|[kKmMbB]n?|x)?$").expect("valid regex")
});

static SERIES_RE: LazyLock<Regex> = LazyLock::new(|| {
    // List item or "label: value" line containing a standalone number.
    Regex::new(r"^\s*(?:[-*+]|\d+\.)?\s*[^|]{0,80}?[:：]?\s*[-+]?[$€£¥]?\d[\d,]*(\.\d+)?\s*(%|[kKmMbB]n?)?\b")
        .expect("valid regex")
});

/// Profile `markdown` for tables and numeric series.
pub fn detect_structured_data(markdown: &str) -> StructuredData {
    let mut data = StructuredData::default();
    let lines: Vec<&str> = markdown.lines().collect();
    let mut in_fence = false;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i].trim();

        if line.starts_with("```") || line.starts_with("~~~") {
            in_fence = !in_fence;
            i += 1;
            continue;
        }
        if in_fence {
            i += 1;
            continue;
        }

        // Header row followed by a separator row starts a table.
        if line.contains('|') && i + 1 < lines.len() && SEPARATOR_RE.is_match(lines[i + 1].trim())
        {
            data.tables += 1;
            i += 2;
            while i < lines.len() && lines[i].contains('|') && !lines[i].trim().is_empty() {
                let numeric = table_cells(lines[i])
                    .filter(|cell| NUMBER_RE.is_match(cell))
                    .count();
                if numeric > 0 {
                    data.numeric_rows += 1;
                    data.numeric_cells += numeric;
                }
                i += 1;
            }
            continue;
        }

        if is_series_line(line) {
            data.series_points += 1;
        }
        i += 1;
    }

    data
}

fn table_cells(row: &str) -> impl Iterator<Item = &str> {
    row.trim()
        .trim_start_matches('|')
        .trim_end_matches('|')
        .split('|')
        .map(str::trim)
}

fn is_series_line(line: &str) -> bool {
    if line.is_empty() || line.starts_with('#') || line.len() > 160 {
        return false;
    }
    let listish = line.starts_with(['-', '*', '+']) || line.contains(':') || line.contains('：');
    listish && SERIES_RE.is_match(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_numeric_table() {
        let md = "# Capacity\n\n| Year | GWh |\n|---|---|\n| 2021 | 540 |\n| 2022 | 780 |\n| 2023 | 1,100 |\n";
        let data = detect_structured_data(md);
        assert_eq!(data.tables, 1);
        assert_eq!(data.numeric_rows, 3);
        assert_eq!(data.numeric_cells, 6);
        assert!(data.has_data());
    }

    #[test]
    fn table_without_numbers_has_no_points() {
        let md = "| Name | Role |\n| :--- | ---: |\n| Ann | CEO |\n| Bo | CTO |\n";
        let data = detect_structured_data(md);
        assert_eq!(data.tables, 1);
        assert_eq!(data.numeric_points(), 0);
    }

    #[test]
    fn detects_list_series() {
        let md = "Shares:\n- Producer A: 37%\n- Producer B: 14.2%\n- Producer C: 6%\n";
        let data = detect_structured_data(md);
        assert_eq!(data.tables, 0);
        assert_eq!(data.series_points, 3);
    }

    #[test]
    fn ignores_prose_and_code() {
        let md = "The market is large and growing.\n\n```\nvalue: 42\n| a | b |\n|---|---|\n| 1 | 2 |\n```\n";
        let data = detect_structured_data(md);
        assert_eq!(data, StructuredData::default());
    }

    #[test]
    fn merge_sums_profiles() {
        let a = StructuredData {
            tables: 1,
            numeric_rows: 2,
            numeric_cells: 4,
            series_points: 0,
        };
        let b = StructuredData {
            series_points: 3,
            ..Default::default()
        };
        assert_eq!(a.merge(b).numeric_points(), 5);
    }
}
