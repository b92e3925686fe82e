//! Row normalization: coerce raw spreadsheet values into typed canonical
//! cells.
//!
//! | Kind | Accepted input | Output |
//! |------|----------------|--------|
//! | date | spreadsheet serial (number or digit string), `YYYY-MM-DD`, `YYYY/MM/DD`, `YYYY.MM.DD`, `YYYYMMDD`, ISO datetime | `NaiveDate` or absent |
//! | decimal | number, numeric string with `,` / `_` / space grouping, scientific notation | fixed-scale `Decimal`; zero when blank or non-numeric |
//! | unit | any scalar | trimmed text, default unit when blank |
//! | text | any scalar | trimmed text or absent |
//!
//! Spreadsheet serials count days from 1900-01-01 with a 1-based origin,
//! so serial `1` is `1900-01-01`. No correction is applied for the
//! fictitious 1900-02-29 some spreadsheet tools count.
//!
//! A row with no `material_text` cannot be classified and is marked
//! [`RowStatus::Skipped`]; it stays in position in the batch.
//!
//! Normalization is idempotent: feeding [`CanonicalRow::to_raw`] back
//! through [`RowNormalizer::normalize`] yields the same cells.

use std::str::FromStr;

use chrono::{Days, NaiveDate};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;

use crate::header::HeaderMap;
use crate::models::{
    CanonicalColumn, CanonicalRow, CellValue, ColumnKind, RawRow, RowStatus, DEFAULT_UNIT,
};

/// Largest serial accepted as a date.
pub const MAX_SERIAL: i64 = 2_958_465;

/// Day zero of the spreadsheet-serial calendar; serial `n` is this date
/// plus `n - 1` days.
pub fn serial_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1900, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// Parameters for [`RowNormalizer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeParams {
    /// Unit substituted when the `unit` cell is blank.
    pub default_unit: String,
}

impl Default for NormalizeParams {
    fn default() -> Self {
        Self {
            default_unit: DEFAULT_UNIT.to_string(),
        }
    }
}

/// Converts raw rows into [`CanonicalRow`]s using a batch's [`HeaderMap`].
#[derive(Debug, Clone, Default)]
pub struct RowNormalizer {
    params: NormalizeParams,
}

impl RowNormalizer {
    pub fn new(params: NormalizeParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &NormalizeParams {
        &self.params
    }

    /// Normalize one row. Never fails; problems are recorded on the row.
    pub fn normalize(&self, index: usize, raw: &RawRow, header_map: &HeaderMap) -> CanonicalRow {
        let mut row = CanonicalRow::empty(index);

        for column in CanonicalColumn::INPUT {
            let value = header_map
                .raw_for(column)
                .and_then(|key| raw.get(key))
                .unwrap_or(&Value::Null);
            row.set(column, self.coerce(column, value));
        }

        for (key, value) in raw {
            if header_map.canonical_for(key).is_some() {
                continue;
            }
            if key == CanonicalColumn::AiSuggestion.as_str() {
                row.set(CanonicalColumn::AiSuggestion, coerce_text(value));
            } else {
                row.passthrough.insert(key.clone(), value.clone());
            }
        }

        if row.material_text().is_none() {
            row.status = RowStatus::Skipped {
                reason: "material_text is empty".to_string(),
            };
        }

        row
    }

    /// Normalize every row of a batch, preserving order.
    pub fn normalize_all(&self, rows: &[RawRow], header_map: &HeaderMap) -> Vec<CanonicalRow> {
        rows.iter()
            .enumerate()
            .map(|(i, raw)| self.normalize(i, raw, header_map))
            .collect()
    }

    fn coerce(&self, column: CanonicalColumn, value: &Value) -> CellValue {
        match column.kind() {
            ColumnKind::Text | ColumnKind::Synthetic => coerce_text(value),
            ColumnKind::Date => coerce_date(value)
                .map(CellValue::Date)
                .unwrap_or(CellValue::Absent),
            ColumnKind::Decimal {
                scale,
                zero_when_blank,
            } => match coerce_decimal(value, scale) {
                Some(d) => CellValue::Decimal(d),
                None if zero_when_blank => CellValue::Decimal(zero(scale)),
                None => CellValue::Absent,
            },
            ColumnKind::Unit => coerce_unit(value, &self.params.default_unit),
        }
    }
}

// ============ Coercions ============

/// Trim a scalar into text; empty or null becomes absent.
pub fn coerce_text(value: &Value) -> CellValue {
    let s = match value {
        Value::Null => return CellValue::Absent,
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    };
    if s.is_empty() {
        CellValue::Absent
    } else {
        CellValue::Text(s)
    }
}

/// Trimmed unit token, or `default_unit` when blank.
pub fn coerce_unit(value: &Value, default_unit: &str) -> CellValue {
    match coerce_text(value) {
        CellValue::Absent => CellValue::Text(default_unit.to_string()),
        other => other,
    }
}

/// Convert a spreadsheet serial day-count into a calendar date.
///
/// Returns `None` outside `1..=MAX_SERIAL`.
pub fn serial_to_date(serial: i64) -> Option<NaiveDate> {
    if !(1..=MAX_SERIAL).contains(&serial) {
        return None;
    }
    serial_epoch().checked_add_days(Days::new((serial - 1) as u64))
}

/// Interpret a value as a calendar date.
pub fn coerce_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().and_then(serial_from_f64))
            .and_then(serial_to_date),
        Value::String(s) => parse_date_str(s.trim()),
        _ => None,
    }
}

/// Whole-day part of a fractional serial (date plus time of day).
fn serial_from_f64(f: f64) -> Option<i64> {
    if f.is_finite() && f >= 1.0 && f <= MAX_SERIAL as f64 + 1.0 {
        Some(f.floor() as i64)
    } else {
        None
    }
}

fn parse_date_str(s: &str) -> Option<NaiveDate> {
    if s.is_empty() {
        return None;
    }

    if s.bytes().all(|b| b.is_ascii_digit()) {
        if s.len() == 8 {
            if let Ok(d) = NaiveDate::parse_from_str(s, "%Y%m%d") {
                return Some(d);
            }
        }
        return s.parse::<i64>().ok().and_then(serial_to_date);
    }

    for fmt in ["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }

    // Datetime: keep the date part.
    if s.len() > 10 && s.is_char_boundary(10) {
        let (date, rest) = s.split_at(10);
        if rest.starts_with('T') || rest.starts_with(' ') {
            if let Ok(d) = NaiveDate::parse_from_str(date, "%Y-%m-%d") {
                return Some(d);
            }
        }
    }

    // Serial stored as a float string, e.g. "45351.0".
    s.parse::<f64>()
        .ok()
        .and_then(serial_from_f64)
        .and_then(serial_to_date)
}

/// Parse a value into a decimal at `scale` fractional digits.
///
/// Returns `None` for blanks and non-numeric input.
pub fn coerce_decimal(value: &Value, scale: u32) -> Option<Decimal> {
    let parsed = match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(Decimal::from(i)),
            None => n.as_f64().and_then(Decimal::from_f64),
        },
        Value::String(s) => parse_decimal_str(s),
        _ => None,
    }?;
    Some(fix_scale(parsed, scale))
}

fn parse_decimal_str(s: &str) -> Option<Decimal> {
    let cleaned: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',' && *c != '_')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .ok()
}

fn fix_scale(d: Decimal, scale: u32) -> Decimal {
    let mut d = d.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);
    d.rescale(scale);
    d
}

fn zero(scale: u32) -> Decimal {
    Decimal::new(0, scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::unify;
    use serde_json::json;

    fn raw(v: Value) -> RawRow {
        v.as_object().cloned().unwrap()
    }

    fn normalize_one(v: Value) -> CanonicalRow {
        let row = raw(v);
        let header: Vec<String> = row.keys().cloned().collect();
        let map = unify(&header);
        RowNormalizer::default().normalize(0, &row, &map)
    }

    #[test]
    fn test_serial_one_is_epoch() {
        assert_eq!(
            serial_to_date(1),
            NaiveDate::from_ymd_opt(1900, 1, 1)
        );
        assert_eq!(serial_to_date(0), None);
        assert_eq!(serial_to_date(MAX_SERIAL + 1), None);
    }

    #[test]
    fn test_serial_dates() {
        assert_eq!(
            coerce_date(&json!(45352)),
            NaiveDate::from_ymd_opt(2024, 3, 2)
        );
        assert_eq!(
            coerce_date(&json!("45352")),
            NaiveDate::from_ymd_opt(2024, 3, 2)
        );
        assert_eq!(
            coerce_date(&json!(45352.75)),
            NaiveDate::from_ymd_opt(2024, 3, 2)
        );
        assert_eq!(
            serial_to_date(2_958_464),
            NaiveDate::from_ymd_opt(9999, 12, 31)
        );
        assert!(serial_to_date(MAX_SERIAL).is_some());
    }

    #[test]
    fn test_string_dates() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1);
        assert_eq!(coerce_date(&json!("2024-03-01")), expected);
        assert_eq!(coerce_date(&json!(" 2024/03/01 ")), expected);
        assert_eq!(coerce_date(&json!("2024.03.01")), expected);
        assert_eq!(coerce_date(&json!("20240301")), expected);
        assert_eq!(coerce_date(&json!("2024-03-01T08:30:00")), expected);
        assert_eq!(coerce_date(&json!("2024-03-01 08:30")), expected);
    }

    #[test]
    fn test_invalid_dates_absent() {
        assert_eq!(coerce_date(&json!("next tuesday")), None);
        assert_eq!(coerce_date(&json!("2024-13-01")), None);
        assert_eq!(coerce_date(&json!(-5)), None);
        assert_eq!(coerce_date(&json!("")), None);
        assert_eq!(coerce_date(&json!(true)), None);
    }

    #[test]
    fn test_decimal_scales() {
        assert_eq!(
            coerce_decimal(&json!("1,234.5"), 2).map(|d| d.to_string()),
            Some("1234.50".to_string())
        );
        assert_eq!(
            coerce_decimal(&json!(0.1234567), 6).map(|d| d.to_string()),
            Some("0.123457".to_string())
        );
        assert_eq!(
            coerce_decimal(&json!(12), 6).map(|d| d.to_string()),
            Some("12.000000".to_string())
        );
        assert_eq!(
            coerce_decimal(&json!("1.5e3"), 2).map(|d| d.to_string()),
            Some("1500.00".to_string())
        );
        assert_eq!(coerce_decimal(&json!("n/a"), 2), None);
        assert_eq!(coerce_decimal(&json!("  "), 2), None);
    }

    #[test]
    fn test_quantity_blank_becomes_zero() {
        let row = normalize_one(json!({"material_text": "coke", "quantity": "", "production_qty": "abc"}));
        assert_eq!(
            row.get(CanonicalColumn::Quantity),
            &CellValue::Decimal(Decimal::new(0, 6))
        );
        assert_eq!(
            row.get(CanonicalColumn::ProductionQty),
            &CellValue::Decimal(Decimal::new(0, 2))
        );
    }

    #[test]
    fn test_unit_default() {
        let row = normalize_one(json!({"material_text": "coke", "unit": "   "}));
        assert_eq!(row.text(CanonicalColumn::Unit), Some("t"));

        let normalizer = RowNormalizer::new(NormalizeParams {
            default_unit: "kg".into(),
        });
        let r = raw(json!({"material_text": "coke"}));
        let row = normalizer.normalize(0, &r, &unify(&["material_text"]));
        assert_eq!(row.text(CanonicalColumn::Unit), Some("kg"));
    }

    #[test]
    fn test_text_trimmed_and_absent() {
        let row = normalize_one(json!({"material_text": "  pig iron ", "process": "   ", "lot_no": 1234}));
        assert_eq!(row.material_text(), Some("pig iron"));
        assert!(row.get(CanonicalColumn::Process).is_absent());
        assert_eq!(row.text(CanonicalColumn::LotNo), Some("1234"));
    }

    #[test]
    fn test_missing_material_text_skips_row() {
        let row = normalize_one(json!({"material_text": " ", "process": "coking"}));
        assert!(row.is_skipped());
        assert_eq!(row.text(CanonicalColumn::Process), Some("coking"));
    }

    #[test]
    fn test_passthrough_and_suggestion_carried() {
        let row = normalize_one(json!({
            "material_text": "coke",
            "Remarks": "urgent",
            "ai_suggestion": "coke"
        }));
        assert_eq!(row.passthrough.get("Remarks"), Some(&json!("urgent")));
        assert_eq!(row.text(CanonicalColumn::AiSuggestion), Some("coke"));
        assert!(!row.passthrough.contains_key("ai_suggestion"));
    }

    #[test]
    fn test_normalize_idempotent() {
        let first = normalize_one(json!({
            "Lot No": "L-01",
            "Material Text": " 휘발유 ",
            "Input Date": 45352,
            "End Date": "2024/03/05",
            "Quantity": "1,000.1234567",
            "Production Qty": 12.345,
            "Unit": "",
            "Remarks": "x"
        }));
        let again_raw = first.to_raw();
        let header: Vec<String> = again_raw.keys().cloned().collect();
        let map = unify(&header);
        let second = RowNormalizer::default().normalize(0, &again_raw, &map);
        assert_eq!(first.cells, second.cells);
        assert_eq!(first.passthrough, second.passthrough);
        assert_eq!(first.status, second.status);
    }

    #[test]
    fn test_only_declared_types_survive() {
        let row = normalize_one(json!({
            "material_text": "coke",
            "input_date": 45000,
            "end_date": "garbage",
            "quantity": "3",
        }));
        for column in CanonicalColumn::ALL {
            let cell = row.get(column);
            let ok = match column.kind() {
                ColumnKind::Date => matches!(cell, CellValue::Date(_) | CellValue::Absent),
                ColumnKind::Decimal { .. } => matches!(cell, CellValue::Decimal(_)),
                ColumnKind::Unit => matches!(cell, CellValue::Text(_)),
                ColumnKind::Text | ColumnKind::Synthetic => {
                    matches!(cell, CellValue::Text(_) | CellValue::Absent)
                }
            };
            assert!(ok, "{column} has unexpected value {cell:?}");
        }
    }
}
