//! Header unification: map arbitrary spreadsheet column names onto the
//! canonical schema.
//!
//! # Algorithm
//!
//! Canonical columns are probed in declaration order (the synthetic
//! `ai_suggestion` is skipped). For each one:
//!
//! 1. **Exact pass**: the first raw header whose trimmed value equals the
//!    canonical name.
//! 2. **Relaxed pass**: both sides are lowercased with all whitespace and
//!    underscores removed; the first raw header where either string contains
//!    the other wins.
//! 3. Otherwise the canonical column is recorded as missing.
//!
//! A bound raw header is removed from further consideration, so every
//! canonical column is bound at most once and every raw header binds at
//! most one column. Unbound raw headers are passed through verbatim.
//!
//! ```text
//!  raw: ["Lot No", "Material Text", "QTY", "remarks"]
//!           │             │           │        │
//!           ▼             ▼           ▼        ▼
//!        lot_no     material_text  (none)  unmapped
//! ```
//!
//! Unification never fails; an empty header set yields an empty map.

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;

use crate::models::{CanonicalColumn, RawRow};

/// Result of unifying one header set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeaderMap {
    /// Raw header → canonical column, in binding order.
    pub bindings: IndexMap<String, CanonicalColumn>,
    /// Raw headers that were not bound, in input order.
    pub unmapped: IndexSet<String>,
    /// Canonical input columns no raw header was bound to.
    pub missing: Vec<CanonicalColumn>,
}

impl HeaderMap {
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// The canonical column a raw header is bound to, if any.
    pub fn canonical_for(&self, raw: &str) -> Option<CanonicalColumn> {
        self.bindings.get(raw).copied()
    }

    /// The raw header bound to a canonical column, if any.
    pub fn raw_for(&self, column: CanonicalColumn) -> Option<&str> {
        self.bindings
            .iter()
            .find(|(_, c)| **c == column)
            .map(|(raw, _)| raw.as_str())
    }
}

/// Lowercase and drop whitespace and underscores.
fn relax(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Unify a raw header sequence against the canonical schema.
pub fn unify<S: AsRef<str>>(raw_header: &[S]) -> HeaderMap {
    let mut available: Vec<&str> = Vec::with_capacity(raw_header.len());
    for h in raw_header {
        let h = h.as_ref();
        if !available.contains(&h) {
            available.push(h);
        }
    }

    let mut map = HeaderMap::default();

    for column in CanonicalColumn::INPUT {
        let name = column.as_str();

        let exact = available.iter().position(|raw| raw.trim() == name);
        let position = exact.or_else(|| {
            let target = relax(name);
            available.iter().position(|raw| {
                let candidate = relax(raw);
                !candidate.is_empty()
                    && (candidate.contains(&target) || target.contains(&candidate))
            })
        });

        match position {
            Some(i) => {
                let raw = available.remove(i);
                map.bindings.insert(raw.to_string(), column);
            }
            None => map.missing.push(column),
        }
    }

    for raw in available {
        map.unmapped.insert(raw.to_string());
    }

    if !map.missing.is_empty() {
        tracing::warn!(
            missing = ?map.missing.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
            "canonical columns not found in header; treating as absent"
        );
    }

    map
}

/// Collect the header of a batch: the union of row keys, ordered by first
/// appearance.
pub fn collect_header(rows: &[RawRow]) -> Vec<String> {
    let mut seen: IndexSet<&str> = IndexSet::new();
    for row in rows {
        for key in row.keys() {
            seen.insert(key.as_str());
        }
    }
    seen.into_iter().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_header() {
        let map = unify::<&str>(&[]);
        assert!(map.is_empty());
        assert!(map.unmapped.is_empty());
        assert_eq!(map.missing.len(), 9);
    }

    #[test]
    fn test_canonical_names_are_identity() {
        let names: Vec<&str> = CanonicalColumn::INPUT.iter().map(|c| c.as_str()).collect();
        let map = unify(&names);
        for column in CanonicalColumn::INPUT {
            assert_eq!(map.canonical_for(column.as_str()), Some(column));
        }
        assert!(map.unmapped.is_empty());
        assert!(map.missing.is_empty());
    }

    #[test]
    fn test_exact_pass_trims() {
        let map = unify(&["  unit  ", "material_text"]);
        assert_eq!(map.canonical_for("  unit  "), Some(CanonicalColumn::Unit));
        assert_eq!(
            map.canonical_for("material_text"),
            Some(CanonicalColumn::MaterialText)
        );
    }

    #[test]
    fn test_relaxed_pass() {
        let map = unify(&["Lot No", "Material Text", "Input_Date", "PROCESS"]);
        assert_eq!(map.canonical_for("Lot No"), Some(CanonicalColumn::LotNo));
        assert_eq!(
            map.canonical_for("Material Text"),
            Some(CanonicalColumn::MaterialText)
        );
        assert_eq!(
            map.canonical_for("Input_Date"),
            Some(CanonicalColumn::InputDate)
        );
        assert_eq!(map.canonical_for("PROCESS"), Some(CanonicalColumn::Process));
    }

    #[test]
    fn test_containment_both_directions() {
        // raw contains canonical
        let map = unify(&["Unit (kg/t)"]);
        assert_eq!(map.canonical_for("Unit (kg/t)"), Some(CanonicalColumn::Unit));

        // canonical contains raw
        let map = unify(&["Lot"]);
        assert_eq!(map.canonical_for("Lot"), Some(CanonicalColumn::LotNo));
    }

    #[test]
    fn test_each_canonical_bound_at_most_once() {
        let map = unify(&["unit", "Unit", "UNIT "]);
        let bound: Vec<_> = map
            .bindings
            .values()
            .filter(|c| **c == CanonicalColumn::Unit)
            .collect();
        assert_eq!(bound.len(), 1);
        assert_eq!(map.raw_for(CanonicalColumn::Unit), Some("unit"));
    }

    #[test]
    fn test_bound_header_removed_from_consideration() {
        // `input_date` is probed first and takes "Date"; `end_date` gets nothing.
        let map = unify(&["Date"]);
        assert_eq!(map.canonical_for("Date"), Some(CanonicalColumn::InputDate));
        assert!(map.missing.contains(&CanonicalColumn::EndDate));
    }

    #[test]
    fn test_exact_pass_beats_earlier_relaxed_candidate() {
        let map = unify(&["Lot", "lot_no"]);
        assert_eq!(map.canonical_for("lot_no"), Some(CanonicalColumn::LotNo));
        assert!(map.unmapped.contains("Lot"));
    }

    #[test]
    fn test_unmapped_passthrough() {
        let map = unify(&["material_text", "Remarks", "비고"]);
        assert!(map.unmapped.contains("Remarks"));
        assert!(map.unmapped.contains("비고"));
        assert_eq!(map.bindings.len(), 1);
    }

    #[test]
    fn test_blank_header_never_binds() {
        let map = unify(&["   ", "___"]);
        assert!(map.bindings.is_empty());
        assert_eq!(map.unmapped.len(), 2);
    }

    #[test]
    fn test_collect_header_first_appearance() {
        let rows: Vec<RawRow> = vec![
            serde_json::from_str(r#"{"b":1,"a":2}"#).unwrap(),
            serde_json::from_str(r#"{"a":3,"c":4}"#).unwrap(),
        ];
        assert_eq!(collect_header(&rows), vec!["b", "a", "c"]);
    }
}
