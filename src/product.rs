use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde_json::Value;

use crate::attributes::normalize_attr_key;
use crate::models::{AttrKey, ProductRecord};

static JSON_LD_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).unwrap());

/// All JSON-LD objects whose `@type` mentions "product", in document order.
/// Blocks that fail to parse are skipped.
pub fn json_ld_products(document: &Html) -> Vec<Value> {
    let mut products = Vec::new();
    for script in document.select(&JSON_LD_SEL) {
        let text = script.text().collect::<String>();
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        let data = match serde_json::from_str::<Value>(text) {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed JSON-LD block");
                continue;
            }
        };
        for item in flatten_items(data) {
            if is_product(&item) {
                products.push(item);
            }
        }
    }
    products
}

pub fn first_product(document: &Html) -> Option<ProductRecord> {
    json_ld_products(document).first().map(product_record)
}

fn flatten_items(data: Value) -> Vec<Value> {
    let items = match data {
        Value::Array(items) => items,
        other => vec![other],
    };
    let mut out = Vec::with_capacity(items.len());
    for mut item in items {
        if let Some(Value::Array(graph)) = item.get_mut("@graph").map(Value::take) {
            out.extend(graph);
        }
        out.push(item);
    }
    out
}

fn is_product(item: &Value) -> bool {
    let matches = |t: &Value| {
        t.as_str()
            .map(|s| s.to_lowercase().contains("product"))
            .unwrap_or(false)
    };
    match item.get("@type") {
        Some(Value::Array(types)) => types.iter().any(matches),
        Some(t) => matches(t),
        None => false,
    }
}

pub fn product_record(item: &Value) -> ProductRecord {
    let offer = match item.get("offers") {
        Some(Value::Array(offers)) => offers.first(),
        other => other,
    };
    let price = offer.and_then(|o| {
        ["price", "lowPrice", "highPrice"]
            .iter()
            .find_map(|key| o.get(*key).and_then(price_text))
    });
    let currency = offer.and_then(|o| {
        ["priceCurrency", "priceCurrencyCode"]
            .iter()
            .find_map(|key| o.get(*key).and_then(value_text))
    });

    let mut record = ProductRecord {
        name: item.get("name").and_then(value_text),
        brand: item.get("brand").and_then(value_text),
        price,
        currency,
        material: item.get("material").and_then(value_text),
        color: item.get("color").and_then(value_text),
        size: item.get("size").and_then(value_text),
        composition: None,
    };
    fill_from_additional_properties(&mut record, item);
    record
}

/// schema.org `additionalProperty` entries fill fields the top level left
/// empty.
fn fill_from_additional_properties(record: &mut ProductRecord, item: &Value) {
    let props = match item.get("additionalProperty") {
        Some(Value::Array(props)) => props.iter().collect::<Vec<_>>(),
        Some(prop @ Value::Object(_)) => vec![prop],
        _ => return,
    };
    for prop in props {
        let (Some(name), Some(value)) = (
            prop.get("name").and_then(value_text),
            prop.get("value").and_then(value_text),
        ) else {
            continue;
        };
        let slot = match normalize_attr_key(&name) {
            Some(AttrKey::Material) => &mut record.material,
            Some(AttrKey::Color) => &mut record.color,
            Some(AttrKey::Size) => &mut record.size,
            Some(AttrKey::Composition) => &mut record.composition,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    }
}

/// Scalar-ish JSON value as display text. Objects contribute their `name`.
fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => number_text(n),
        Value::Array(items) => items
            .iter()
            .filter_map(value_text)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(map) => return map.get("name").and_then(value_text),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Whole floats print without a fraction: `1999.00` reads as `1999`.
fn number_text(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
            (f as i64).to_string()
        }
        _ => n.to_string(),
    }
}

/// A zero price is treated as absent.
fn price_text(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        Value::Array(_) | Value::Object(_) => None,
        other => value_text(other),
    }
}
