//! Core domain model for catalog snapshots, plus the raw-item normalizer.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "cpw-core";

pub const DEFAULT_NAME: &str = "Untitled";
pub const NO_PRICE: &str = "N/A";
pub const NO_LINK: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
    pub id: String,
    pub name: String,
    pub price: String,
    pub link: String,
    /// Set when `id` was made up from the record's position; such ids change
    /// between refreshes and are never used as diff keys.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthetic_id: bool,
}

impl GameRecord {
    pub fn key(&self) -> RecordKey {
        if self.synthetic_id {
            RecordKey::Name(normalize_name_key(&self.name))
        } else {
            RecordKey::Id(self.id.clone())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    Id(String),
    Name(String),
}

pub fn normalize_name_key(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawItem {
    pub id: Option<String>,
    pub title: Option<String>,
    pub price: Option<JsonValue>,
    pub currency: Option<String>,
    pub link: Option<String>,
}

impl RawItem {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceChange {
    pub id: String,
    pub name: String,
    pub link: String,
    pub old_price: String,
    pub new_price: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult {
    pub new_records: Vec<GameRecord>,
    pub price_changes: Vec<PriceChange>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.new_records.is_empty() && self.price_changes.is_empty()
    }
}

/// Map a raw upstream item onto a `GameRecord`. Never fails; anything missing
/// or unusable falls back to the documented default. `synthetic_id` is only
/// called when the item carries no id of its own.
pub fn normalize(raw: &RawItem, synthetic_id: impl FnOnce() -> String) -> GameRecord {
    let (id, synthetic) = match raw.id.as_deref().and_then(text_or_none) {
        Some(id) => (id, false),
        None => (synthetic_id(), true),
    };
    GameRecord {
        id,
        name: raw
            .title
            .as_deref()
            .and_then(text_or_none)
            .unwrap_or_else(|| DEFAULT_NAME.to_string()),
        price: normalize_price(raw.price.as_ref(), raw.currency.as_deref()),
        link: raw
            .link
            .as_deref()
            .and_then(text_or_none)
            .unwrap_or_else(|| NO_LINK.to_string()),
        synthetic_id: synthetic,
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn normalize_price(price: Option<&JsonValue>, currency: Option<&str>) -> String {
    match price {
        Some(JsonValue::Number(n)) => {
            let Some(amount) = format_amount(n) else {
                return NO_PRICE.to_string();
            };
            match currency.and_then(text_or_none) {
                Some(code) => format!("{code} {amount}"),
                None => amount,
            }
        }
        // Already formatted upstream; keep it verbatim.
        Some(JsonValue::String(s)) => text_or_none(s).unwrap_or_else(|| NO_PRICE.to_string()),
        _ => NO_PRICE.to_string(),
    }
}

fn format_amount(n: &serde_json::Number) -> Option<String> {
    if let Some(i) = n.as_i64() {
        return (i >= 0).then(|| i.to_string());
    }
    if let Some(u) = n.as_u64() {
        return Some(u.to_string());
    }
    let f = n.as_f64()?;
    if !f.is_finite() || f < 0.0 {
        return None;
    }
    if f.fract() == 0.0 && f < 1e15 {
        Some(format!("{f:.0}"))
    } else {
        Some(f.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unreachable_id() -> String {
        panic!("synthetic id requested for an item that has one")
    }

    #[test]
    fn fills_defaults_for_empty_item() {
        let record = normalize(&RawItem::default(), || "reco:7".to_string());
        assert_eq!(record.id, "reco:7");
        assert!(record.synthetic_id);
        assert_eq!(record.name, DEFAULT_NAME);
        assert_eq!(record.price, NO_PRICE);
        assert_eq!(record.link, NO_LINK);
    }

    #[test]
    fn keeps_upstream_fields_and_trims_them() {
        let raw = RawItem {
            id: Some(" 9NBLGGH4R315 ".into()),
            title: Some("  Forza Horizon 5 ".into()),
            price: Some(json!(1999.99)),
            currency: None,
            link: Some("https://www.xbox.com/es-AR/games/store/_/9NBLGGH4R315".into()),
        };
        let record = normalize(&raw, unreachable_id);
        assert_eq!(record.id, "9NBLGGH4R315");
        assert!(!record.synthetic_id);
        assert_eq!(record.name, "Forza Horizon 5");
        assert_eq!(record.price, "1999.99");
        assert_eq!(record.link, "https://www.xbox.com/es-AR/games/store/_/9NBLGGH4R315");
    }

    #[test]
    fn price_formatting_covers_upstream_shapes() {
        let price = |value: JsonValue, currency: Option<&str>| {
            let raw = RawItem {
                id: Some("x".into()),
                price: Some(value),
                currency: currency.map(ToString::to_string),
                ..Default::default()
            };
            normalize(&raw, unreachable_id).price
        };
        assert_eq!(price(json!(100), None), "100");
        assert_eq!(price(json!(100.0), None), "100");
        assert_eq!(price(json!(0), None), "0");
        assert_eq!(price(json!(49.5), Some("ARS")), "ARS 49.5");
        assert_eq!(price(json!("$ 12.499,00"), Some("ARS")), "$ 12.499,00");
        assert_eq!(price(json!("   "), None), NO_PRICE);
        assert_eq!(price(json!(-1), None), NO_PRICE);
        assert_eq!(price(json!({"ListPrice": 5}), None), NO_PRICE);
        assert_eq!(price(json!(true), None), NO_PRICE);
    }

    #[test]
    fn blank_id_is_treated_as_missing() {
        let raw = RawItem {
            id: Some("   ".into()),
            title: Some("Halo".into()),
            ..Default::default()
        };
        let record = normalize(&raw, || "storefront:0".to_string());
        assert!(record.synthetic_id);
        assert_eq!(record.key(), RecordKey::Name("halo".into()));
    }

    #[test]
    fn key_prefers_stable_id() {
        let record = normalize(&RawItem::with_id("ABC"), unreachable_id);
        assert_eq!(record.key(), RecordKey::Id("ABC".into()));
    }

    #[test]
    fn name_key_ignores_case_and_punctuation() {
        assert_eq!(
            normalize_name_key("Halo: The Master Chief Collection"),
            normalize_name_key("HALO  the master-chief collection")
        );
    }

    #[test]
    fn synthetic_flag_is_omitted_from_json_when_false() {
        let record = normalize(&RawItem::with_id("ABC"), unreachable_id);
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("syntheticId").is_none());
        assert_eq!(value["price"], json!(NO_PRICE));
    }
}
