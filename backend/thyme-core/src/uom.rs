// src/uom.rs
//
// Resource unit-of-measure conversion. Business Central stores some resources
// with a "day" base unit and others with "hour", and the HOUR factor on a
// day-based resource can arrive as hours-per-day (> 1) or days-per-hour (< 1).
// Both encodings occur in real resource masters, so both are honoured here.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const HOUR_CODE: &str = "HOUR";
pub const DEFAULT_HOURS_PER_DAY: f64 = 8.0;

/// One conversion factor row as returned by the `resourceUnitsOfMeasure` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUnitOfMeasure {
    pub resource_no: String,
    pub code: String,
    pub qty_per_unit_of_measure: f64,
}

impl ResourceUnitOfMeasure {
    pub fn new(resource_no: &str, code: &str, qty_per_unit_of_measure: f64) -> Self {
        Self {
            resource_no: resource_no.to_string(),
            code: code.to_string(),
            qty_per_unit_of_measure,
        }
    }
}

/// Lookup of `"{resource_no}:{code}"` -> qty per unit of measure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UomConversionMap(HashMap<String, f64>);

fn uom_key(resource_no: &str, code: &str) -> String {
    format!("{}:{}", resource_no, code)
}

impl UomConversionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, resource_no: &str, code: &str, factor: f64) {
        self.0.insert(uom_key(resource_no, code), factor);
    }

    pub fn get(&self, resource_no: &str, code: &str) -> Option<f64> {
        self.0.get(&uom_key(resource_no, code)).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The HOUR factor of a day-based resource, or `None` when the resource
    /// is already measured in hours.
    fn day_factor(&self, resource_no: &str) -> Option<f64> {
        self.get(resource_no, HOUR_CODE)
            .filter(|factor| is_day_factor(*factor))
    }
}

impl FromIterator<ResourceUnitOfMeasure> for UomConversionMap {
    fn from_iter<I: IntoIterator<Item = ResourceUnitOfMeasure>>(iter: I) -> Self {
        let mut map = Self::new();
        for record in iter {
            map.insert(&record.resource_no, &record.code, record.qty_per_unit_of_measure);
        }
        map
    }
}

// A factor of exactly 1 (or a non-positive one) means the base unit is hours.
fn is_day_factor(factor: f64) -> bool {
    factor > 0.0 && factor != 1.0
}

fn normalize_hours_per_day(factor: f64) -> f64 {
    if factor > 1.0 {
        factor
    } else {
        1.0 / factor
    }
}

/// Builds the lookup from raw ERP rows. Later rows overwrite earlier ones with
/// the same resource and code.
pub fn build(records: &[ResourceUnitOfMeasure]) -> UomConversionMap {
    records.iter().cloned().collect()
}

pub fn is_resource_day_based(resource_no: &str, map: &UomConversionMap) -> bool {
    map.day_factor(resource_no).is_some()
}

/// Converts a quantity in the resource's native unit into hours.
pub fn convert_to_hours(resource_no: &str, quantity: f64, map: &UomConversionMap) -> f64 {
    match map.day_factor(resource_no) {
        Some(factor) => quantity * normalize_hours_per_day(factor),
        None => quantity,
    }
}

/// Converts hours into the resource's native unit. Inverse of [`convert_to_hours`].
pub fn convert_from_hours(resource_no: &str, hours: f64, map: &UomConversionMap) -> f64 {
    match map.day_factor(resource_no) {
        Some(factor) => hours / normalize_hours_per_day(factor),
        None => hours,
    }
}

/// Resolves the length of a working day in hours: the resource's own HOUR
/// factor first, then the first usable HOUR factor of any resource, then 8.
pub fn get_hours_per_day(records: &[ResourceUnitOfMeasure], resource_no: Option<&str>) -> f64 {
    let hour_factors = || {
        records
            .iter()
            .filter(|r| r.code == HOUR_CODE && is_day_factor(r.qty_per_unit_of_measure))
    };

    if let Some(resource_no) = resource_no {
        if let Some(own) = hour_factors().find(|r| r.resource_no == resource_no) {
            return normalize_hours_per_day(own.qty_per_unit_of_measure);
        }
    }

    hour_factors()
        .next()
        .map(|r| normalize_hours_per_day(r.qty_per_unit_of_measure))
        .unwrap_or(DEFAULT_HOURS_PER_DAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with_hour_factor(resource_no: &str, factor: f64) -> UomConversionMap {
        build(&[ResourceUnitOfMeasure::new(resource_no, HOUR_CODE, factor)])
    }

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn build_keys_rows_by_resource_and_code() {
        let map = build(&[
            ResourceUnitOfMeasure::new("R1", "HOUR", 8.0),
            ResourceUnitOfMeasure::new("R1", "DAY", 1.0),
            ResourceUnitOfMeasure::new("R2", "HOUR", 1.0),
        ]);
        assert_eq!(map.len(), 3);
        assert_eq!(map.get("R1", "HOUR"), Some(8.0));
        assert_eq!(map.get("R1", "DAY"), Some(1.0));
        assert_eq!(map.get("R3", "HOUR"), None);
    }

    #[test]
    fn build_last_duplicate_wins() {
        let map = build(&[
            ResourceUnitOfMeasure::new("R1", "HOUR", 8.0),
            ResourceUnitOfMeasure::new("R1", "HOUR", 7.5),
        ]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("R1", "HOUR"), Some(7.5));
    }

    #[test]
    fn build_empty_input_yields_empty_map() {
        assert!(build(&[]).is_empty());
    }

    #[test]
    fn hours_per_day_factor_multiplies_and_round_trips() {
        for factor in [1.5, 7.5, 8.0, 10.0] {
            let map = map_with_hour_factor("R", factor);
            for quantity in [0.0, 0.5, 1.0, 3.0] {
                let hours = convert_to_hours("R", quantity, &map);
                assert!(approx_eq(hours, quantity * factor));
                assert!(approx_eq(convert_from_hours("R", hours, &map), quantity));
            }
        }
    }

    #[test]
    fn days_per_hour_factor_uses_reciprocal() {
        let map = map_with_hour_factor("R", 0.125);
        assert!(approx_eq(convert_to_hours("R", 2.0, &map), 16.0));
        assert!(approx_eq(convert_from_hours("R", 16.0, &map), 2.0));

        let map = map_with_hour_factor("R", 0.25);
        assert!(approx_eq(convert_to_hours("R", 1.5, &map), 1.5 / 0.25));
    }

    #[test]
    fn missing_entry_is_identity() {
        let map = UomConversionMap::new();
        assert_eq!(convert_to_hours("R", 3.25, &map), 3.25);
        assert_eq!(convert_from_hours("R", 3.25, &map), 3.25);
    }

    #[test]
    fn factor_of_one_is_identity() {
        let map = map_with_hour_factor("R", 1.0);
        assert_eq!(convert_to_hours("R", 6.0, &map), 6.0);
        assert_eq!(convert_from_hours("R", 6.0, &map), 6.0);
    }

    #[test]
    fn non_positive_factor_is_treated_as_hours() {
        let map = map_with_hour_factor("R", 0.0);
        assert!(!is_resource_day_based("R", &map));
        assert_eq!(convert_to_hours("R", 2.0, &map), 2.0);

        let map = map_with_hour_factor("R", -8.0);
        assert_eq!(convert_to_hours("R", 2.0, &map), 2.0);
    }

    #[test]
    fn day_based_detection() {
        assert!(!is_resource_day_based("R", &UomConversionMap::new()));
        assert!(!is_resource_day_based("R", &map_with_hour_factor("R", 1.0)));
        assert!(is_resource_day_based("R", &map_with_hour_factor("R", 8.0)));
        assert!(is_resource_day_based("R", &map_with_hour_factor("R", 0.125)));
        // Only the HOUR code decides.
        let map = build(&[ResourceUnitOfMeasure::new("R", "DAY", 8.0)]);
        assert!(!is_resource_day_based("R", &map));
    }

    #[test]
    fn hours_per_day_defaults_to_eight() {
        assert_eq!(get_hours_per_day(&[], None), 8.0);
        assert_eq!(get_hours_per_day(&[], Some("R1")), 8.0);
    }

    #[test]
    fn hours_per_day_prefers_resource_factor() {
        let records = [ResourceUnitOfMeasure::new("R1", "HOUR", 7.5)];
        assert_eq!(get_hours_per_day(&records, Some("R1")), 7.5);
    }

    #[test]
    fn hours_per_day_normalizes_reciprocal() {
        let records = [ResourceUnitOfMeasure::new("R1", "HOUR", 0.125)];
        assert_eq!(get_hours_per_day(&records, Some("R1")), 8.0);
    }

    #[test]
    fn hours_per_day_falls_back_to_first_usable_factor() {
        let records = [
            ResourceUnitOfMeasure::new("R1", "HOUR", 1.0),
            ResourceUnitOfMeasure::new("R2", "DAY", 6.0),
            ResourceUnitOfMeasure::new("R3", "HOUR", 0.1),
            ResourceUnitOfMeasure::new("R4", "HOUR", 7.0),
        ];
        assert!(approx_eq(get_hours_per_day(&records, Some("R1")), 10.0));
        assert!(approx_eq(get_hours_per_day(&records, Some("missing")), 10.0));
        assert!(approx_eq(get_hours_per_day(&records, None), 10.0));
        assert_eq!(get_hours_per_day(&records, Some("R4")), 7.0);
    }
}
