use crate::extract::FieldMapping;

/// Column values in configured column order.
pub type Row = Vec<String>;

/// Project a field mapping onto the column list. Missing fields become the
/// empty string.
pub fn project(fields: &FieldMapping, columns: &[String]) -> Row {
    columns
        .iter()
        .map(|column| fields.get(column).cloned().unwrap_or_default())
        .collect()
}
