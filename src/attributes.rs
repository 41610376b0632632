use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::extract::{normalize_text, safe_text, TextScope};
use crate::models::{AttrKey, AttributePair};

static DL_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("dl").unwrap());
static DT_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("dt").unwrap());
static ROW_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("table tr").unwrap());
static CELL_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("td, th").unwrap());
static SPEC_ITEM_SEL: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(".specs li, .characteristics li, .params li, .product-params li").unwrap()
});
static ITEM_KEY_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse("b, strong, .key, .label").unwrap());

static KEY_VALUE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([^:]+):\s*(.+)$").unwrap());
static LEADING_SEPARATORS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[:\-\s]+").unwrap());

/// First matching rule wins, so "цвет материала" is a material.
static KEY_RULES: Lazy<Vec<(Regex, AttrKey)>> = Lazy::new(|| {
    [
        (r"материал|material", AttrKey::Material),
        (r"состав", AttrKey::Composition),
        (r"цвет|color", AttrKey::Color),
        (r"размер|size", AttrKey::Size),
        (r"страна|country", AttrKey::Country),
        (r"производител|brand|бренд", AttrKey::Brand),
        (r"модель|model", AttrKey::Model),
        (r"артикул|sku|код товара", AttrKey::Sku),
        (r"категор|category", AttrKey::Category),
    ]
    .into_iter()
    .map(|(pattern, key)| (Regex::new(&format!("(?i)(?:{})", pattern)).unwrap(), key))
    .collect()
});

/// Map a free-form attribute label onto a known key.
pub fn normalize_attr_key(label: &str) -> Option<AttrKey> {
    let label = label.to_lowercase();
    KEY_RULES
        .iter()
        .find(|(re, _)| re.is_match(&label))
        .map(|(_, key)| *key)
}

/// Recognized attribute pairs from definition lists, tables and characteristic lists,
/// deduplicated by `(key, value)`.
pub fn collect_attributes(document: &Html) -> Vec<AttributePair> {
    let mut seen = HashSet::new();
    raw_attribute_pairs(document)
        .into_iter()
        .filter_map(|(label, value)| {
            normalize_attr_key(&label).map(|key| AttributePair { key, value })
        })
        .filter(|pair| seen.insert((pair.key, pair.value.clone())))
        .collect()
}

pub fn raw_attribute_pairs(document: &Html) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    definition_list_pairs(document, &mut pairs);
    table_pairs(document, &mut pairs);
    spec_list_pairs(document, &mut pairs);
    pairs
}

fn definition_list_pairs(document: &Html, pairs: &mut Vec<(String, String)>) {
    for dl in document.select(&DL_SEL) {
        for dt in dl.select(&DT_SEL) {
            let Some(dd) = dt
                .next_siblings()
                .find_map(ElementRef::wrap)
                .filter(|el| el.value().name() == "dd")
            else {
                continue;
            };
            push_pair(pairs, text_of(dt), text_of(dd));
        }
    }
}

fn table_pairs(document: &Html, pairs: &mut Vec<(String, String)>) {
    for row in document.select(&ROW_SEL) {
        let mut cells = row.select(&CELL_SEL);
        if let (Some(key), Some(value)) = (cells.next(), cells.next()) {
            push_pair(pairs, text_of(key), text_of(value));
        }
    }
}

fn spec_list_pairs(document: &Html, pairs: &mut Vec<(String, String)>) {
    for item in document.select(&SPEC_ITEM_SEL) {
        let text = text_of(item);
        let (key, value) = match item.select(&ITEM_KEY_SEL).next() {
            Some(label) => {
                let key = text_of(label);
                let rest = text.replacen(&key, "", 1);
                let value = LEADING_SEPARATORS_RE.replace(rest.trim(), "").to_string();
                (key, value)
            }
            None => match KEY_VALUE_RE.captures(&text) {
                Some(caps) => (caps[1].trim().to_string(), caps[2].trim().to_string()),
                None => continue,
            },
        };
        push_pair(pairs, key, value);
    }
}

fn push_pair(pairs: &mut Vec<(String, String)>, key: String, value: String) {
    if !key.is_empty() && !value.is_empty() {
        pairs.push((key, value));
    }
}

fn text_of(el: ElementRef<'_>) -> String {
    normalize_text(&safe_text(el, TextScope::Full))
}
