//! File exports invoked by the `tab` runtime module.

use std::collections::HashMap;
use std::path::Path;

use rust_xlsxwriter::{Color, Format, Workbook};
use tablog_engine::{CellValue, HeaderFormat, Table};

/// Write one table as CSV: header row, then rows in column order. Missing
/// cells become empty fields.
pub fn write_csv(table: &Table, path: &Path) -> Result<(), String> {
    let mut writer = csv::WriterBuilder::new()
        .from_path(path)
        .map_err(|e| e.to_string())?;
    writer.write_record(table.headers()).map_err(|e| e.to_string())?;
    for row in 0..table.row_count() {
        let record: Vec<String> = table
            .columns
            .iter()
            .map(|col| col.values[row].to_text().unwrap_or_default())
            .collect();
        writer.write_record(&record).map_err(|e| e.to_string())?;
    }
    writer.flush().map_err(|e| e.to_string())
}

/// A workbook export accumulated across `to_sheet`/`style_headers` calls
/// and written once on save.
pub struct WorkbookBuild {
    path: String,
    sheets: Vec<(String, Table)>,
    styles: HashMap<String, HeaderFormat>,
}

impl WorkbookBuild {
    pub fn new(path: String) -> Self {
        Self { path, sheets: Vec::new(), styles: HashMap::new() }
    }

    pub fn add_sheet(&mut self, name: String, table: Table) {
        self.sheets.push((name, table));
    }

    pub fn style_sheet(&mut self, name: String, color: Option<String>, background: Option<String>) {
        self.styles.insert(name, HeaderFormat { color, background_color: background });
    }
}

fn parse_color(hex: &str) -> Option<Color> {
    let hex = hex.strip_prefix('#')?;
    if hex.len() != 6 {
        return None;
    }
    u32::from_str_radix(hex, 16).ok().map(Color::RGB)
}

fn header_excel_format(style: &HeaderFormat) -> Format {
    let mut format = Format::new();
    if let Some(color) = style.color.as_deref().and_then(parse_color) {
        format = format.set_font_color(color);
    }
    if let Some(color) = style.background_color.as_deref().and_then(parse_color) {
        format = format.set_background_color(color);
    }
    format
}

/// Write every accumulated sheet. Header styling applies only to sheets
/// that declared a style; others keep the Excel defaults.
pub fn write_workbook(build: &WorkbookBuild) -> Result<(), String> {
    let mut workbook = Workbook::new();
    for (name, table) in &build.sheets {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(name).map_err(|e| e.to_string())?;
        let header_format = build.styles.get(name).map(header_excel_format);

        for (col_index, col) in table.columns.iter().enumerate() {
            let col16 = col_index as u16;
            match &header_format {
                Some(format) => worksheet
                    .write_string_with_format(0, col16, &col.header, format)
                    .map(|_| ())
                    .map_err(|e| e.to_string())?,
                None => worksheet
                    .write_string(0, col16, &col.header)
                    .map(|_| ())
                    .map_err(|e| e.to_string())?,
            }
            for (row_index, value) in col.values.iter().enumerate() {
                let row32 = (row_index + 1) as u32;
                let result = match value {
                    CellValue::Missing => continue,
                    CellValue::Int(n) => worksheet.write_number(row32, col16, *n as f64),
                    CellValue::Float(n) => worksheet.write_number(row32, col16, *n),
                    CellValue::Bool(b) => worksheet.write_boolean(row32, col16, *b),
                    other => worksheet.write_string(
                        row32,
                        col16,
                        other.to_text().unwrap_or_default(),
                    ),
                };
                result.map(|_| ()).map_err(|e| e.to_string())?;
            }
        }
    }
    workbook.save(&build.path).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablog_engine::{Column, Dtype};

    fn sample_table() -> Table {
        Table::new(
            "orders",
            vec![
                Column::new(
                    "id",
                    "id",
                    Dtype::Int64,
                    vec![CellValue::Int(1), CellValue::Int(2)],
                ),
                Column::new(
                    "note",
                    "note",
                    Dtype::Str,
                    vec![CellValue::Str("first, with comma".into()), CellValue::Missing],
                ),
            ],
        )
    }

    #[test]
    fn test_csv_layout_and_missing_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.csv");
        write_csv(&sample_table(), &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("id,note"));
        assert_eq!(lines.next(), Some("1,\"first, with comma\""));
        assert_eq!(lines.next(), Some("2,"), "missing cell becomes an empty field");
    }

    #[test]
    fn test_workbook_save_with_styled_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.xlsx");
        let mut build = WorkbookBuild::new(path.to_string_lossy().into_owned());
        build.add_sheet("orders".into(), sample_table());
        build.style_sheet("orders".into(), Some("#FFFFFF".into()), Some("#549D3A".into()));
        write_workbook(&build).unwrap();
        assert!(path.exists());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn test_color_parsing() {
        assert_eq!(parse_color("#FFFFFF"), Some(Color::RGB(0xFFFFFF)));
        assert_eq!(parse_color("#549D3A"), Some(Color::RGB(0x549D3A)));
        assert_eq!(parse_color("549D3A"), None, "leading # is required");
        assert_eq!(parse_color("#54"), None);
        assert_eq!(parse_color("#GGGGGG"), None);
    }
}
