use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};

use crate::config::{BlockingKeyConfig, KeyKind};
use crate::model::{BlockKey, NormalizedRecord, Record, Side};

// Slash dates with the year last are read month-first.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d", "%d.%m.%Y", "%m/%d/%Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Trim, then uppercase with full Unicode case mapping (locale-independent).
/// Absent values canonicalize to the empty string.
pub fn canonicalize(value: Option<&str>) -> String {
    value.map(|v| v.trim().to_uppercase()).unwrap_or_default()
}

/// Year component of a date-like value, `None` if it does not parse.
pub fn parse_year(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, fmt) {
            return Some(i64::from(date.year()));
        }
    }
    // Bare year, then year-month.
    if value.len() == 4 && value.bytes().all(|b| b.is_ascii_digit()) {
        return value.parse().ok();
    }
    if let Ok(date) = NaiveDate::parse_from_str(&format!("{value}-01"), "%Y-%m-%d") {
        return Some(i64::from(date.year()));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(i64::from(dt.year()));
        }
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| i64::from(dt.year()))
}

/// Derive one blocking key from a raw value. Never fails: anything that
/// cannot produce a key yields `None`.
pub fn derive_key(key: &BlockingKeyConfig, raw: Option<&str>) -> Option<BlockKey> {
    match key.kind {
        KeyKind::Year => raw.and_then(parse_year).map(BlockKey::Int),
        KeyKind::Exact => {
            let canonical = canonicalize(raw);
            (!canonical.is_empty()).then_some(BlockKey::Text(canonical))
        }
        KeyKind::Prefix => {
            let canonical = canonicalize(raw);
            let length = key.length.unwrap_or(0);
            if canonical.is_empty() || length == 0 {
                return None;
            }
            Some(BlockKey::Text(canonical.chars().take(length).collect()))
        }
    }
}

/// Canonicalizes records of one dataset and derives its blocking keys.
#[derive(Debug, Clone)]
pub struct Normalizer {
    keys: Vec<BlockingKeyConfig>,
    side: Side,
}

impl Normalizer {
    pub fn new(keys: &[BlockingKeyConfig], side: Side) -> Self {
        Self {
            keys: keys.to_vec(),
            side,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn normalize(&self, record: &Record) -> NormalizedRecord {
        let fields = record
            .fields
            .iter()
            .map(|(name, value)| (name.clone(), canonicalize(value.as_deref())))
            .collect();

        let keys: BTreeMap<String, Option<BlockKey>> = self
            .keys
            .iter()
            .map(|key| {
                let raw = record.get(key.field_for(self.side));
                (key.name.clone(), derive_key(key, raw))
            })
            .collect();

        NormalizedRecord {
            id: record.id.clone(),
            fields,
            keys,
        }
    }

    pub fn normalize_all(&self, records: &[Record]) -> Vec<NormalizedRecord> {
        records.iter().map(|r| self.normalize(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str, field: &str, kind: KeyKind, length: Option<usize>) -> BlockingKeyConfig {
        BlockingKeyConfig {
            name: name.into(),
            field: field.into(),
            right_field: None,
            kind,
            length,
        }
    }

    #[test]
    fn canonicalize_trims_and_uppercases() {
        assert_eq!(canonicalize(Some("  Örebro ")), "ÖREBRO");
        assert_eq!(canonicalize(Some("straße")), "STRASSE");
        assert_eq!(canonicalize(Some("   ")), "");
        assert_eq!(canonicalize(None), "");
    }

    #[test]
    fn year_from_supported_formats() {
        assert_eq!(parse_year("1994-05-02"), Some(1994));
        assert_eq!(parse_year("1994/05/02"), Some(1994));
        assert_eq!(parse_year("02.05.1994"), Some(1994));
        assert_eq!(parse_year(" 1988-11-21 "), Some(1988));
        assert_eq!(parse_year("1990-01-01 08:30:00"), Some(1990));
        assert_eq!(parse_year("1990-01-01T08:30:00+02:00"), Some(1990));
        assert_eq!(parse_year("1994"), Some(1994));
        assert_eq!(parse_year("1994-05"), Some(1994));
        assert_eq!(parse_year("05/02/1994"), Some(1994));
        assert_eq!(parse_year("12/31/1994"), Some(1994));
    }

    #[test]
    fn unparsable_dates_have_no_year() {
        assert_eq!(parse_year(""), None);
        assert_eq!(parse_year("unknown"), None);
        assert_eq!(parse_year("1994-13-45"), None);
        assert_eq!(parse_year("1994-13"), None);
        assert_eq!(parse_year("199"), None);
    }

    #[test]
    fn prefix_and_exact_keys() {
        let zip3 = key("zip3", "zip", KeyKind::Prefix, Some(3));
        assert_eq!(
            derive_key(&zip3, Some(" 70210")),
            Some(BlockKey::Text("702".into()))
        );
        assert_eq!(derive_key(&zip3, Some("70")), Some(BlockKey::Text("70".into())));
        assert_eq!(derive_key(&zip3, Some("")), None);

        let city = key("city", "city", KeyKind::Exact, None);
        assert_eq!(
            derive_key(&city, Some("Uppsala")),
            Some(BlockKey::Text("UPPSALA".into()))
        );
        assert_eq!(derive_key(&city, None), None);
    }

    #[test]
    fn normalize_record() {
        let normalizer = Normalizer::new(&[key("yob", "dob", KeyKind::Year, None)], Side::Left);
        let record = Record::new("2")
            .with("first", Some(" Beatrice "))
            .with::<String>("dob", None);
        let n = normalizer.normalize(&record);
        assert_eq!(n.id, "2");
        assert_eq!(n.field("first"), "BEATRICE");
        assert_eq!(n.field("dob"), "");
        assert_eq!(n.field("city"), "");
        assert_eq!(n.key("yob"), None);
        assert!(n.keys.contains_key("yob"));
    }

    #[test]
    fn right_side_reads_right_field() {
        let mut k = key("yob", "dob", KeyKind::Year, None);
        k.right_field = Some("birth_date".into());
        let normalizer = Normalizer::new(&[k], Side::Right);
        let record = Record::new("10").with("birth_date", Some("1990-01-01"));
        assert_eq!(normalizer.normalize(&record).key("yob"), Some(&BlockKey::Int(1990)));
    }
}
