//! Facility listings from schema.org JSON-LD blocks
//!
//! Listing and review sites describe the business on a page with a
//! `<script type="application/ld+json">` block. Every node typed as a local or
//! medical business becomes a listing: the facility, its details on this source
//! and, when present, its aggregate rating.

use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::debug;

use crate::models::{
    FacilityInfoRecord, FacilityRecord, GeoCoords, Location, Record, ReviewSummaryRecord,
};

/// schema.org types that describe a reviewable facility
const FACILITY_TYPES: &[&str] = &[
    "LocalBusiness",
    "MedicalBusiness",
    "MedicalClinic",
    "MedicalOrganization",
    "Dentist",
    "Physician",
    "Hospital",
    "Optician",
    "Pharmacy",
    "HealthAndBeautyBusiness",
    "DaySpa",
    "HealthClub",
];

/// A facility described by one page
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub facility: FacilityRecord,
    pub info: FacilityInfoRecord,
    pub rating: Option<ReviewSummaryRecord>,
}

impl Listing {
    pub fn into_records(self) -> Vec<Record> {
        let mut records = vec![Record::from(self.facility), Record::from(self.info)];
        records.extend(self.rating.map(Record::from));
        records
    }
}

/// Listings found in the JSON-LD blocks of `document`. Malformed blocks are skipped.
pub fn extract_listings(document: &Html, source: &str, fetched_at: DateTime<Utc>) -> Vec<Listing> {
    let Ok(selector) = Selector::parse(r#"script[type="application/ld+json"]"#) else {
        return Vec::new();
    };

    let mut listings = Vec::new();
    for script in document.select(&selector) {
        let text = script.text().collect::<String>();
        let text = text.trim();
        if text.is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                debug!(source, "Skipping malformed JSON-LD block: {}", e);
                continue;
            }
        };

        listings.extend(
            nodes(&value)
                .into_iter()
                .filter_map(|node| parse_listing(node, source, fetched_at)),
        );
    }
    listings
}

/// Top-level objects of a block, with arrays and `@graph` flattened
fn nodes(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().flat_map(nodes).collect(),
        Value::Object(map) => match map.get("@graph") {
            Some(graph) => nodes(graph),
            None => vec![value],
        },
        _ => Vec::new(),
    }
}

fn types(node: &Value) -> Vec<&str> {
    match node.get("@type") {
        Some(Value::String(name)) => vec![name.as_str()],
        Some(Value::Array(names)) => names.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn parse_listing(node: &Value, source: &str, fetched_at: DateTime<Utc>) -> Option<Listing> {
    let types = types(node);
    if !types.iter().any(|name| FACILITY_TYPES.contains(name)) {
        return None;
    }
    let name = text(node, "name")?;

    let address = node.get("address");
    let location = Location {
        country: address.and_then(country),
        region: address.and_then(|a| text(a, "addressRegion")),
        city: address
            .and_then(|a| text(a, "addressLocality"))
            .unwrap_or_default(),
    };
    let street = match address {
        Some(Value::String(line)) => non_empty(line),
        Some(address) => text(address, "streetAddress"),
        None => None,
    };

    let facility = FacilityRecord {
        name: name.clone(),
        location,
        categories: types
            .iter()
            .filter(|name| **name != "LocalBusiness")
            .map(|name| name.to_string())
            .collect(),
    };

    let info = FacilityInfoRecord {
        facility: name.clone(),
        source: source.to_string(),
        about: text(node, "description"),
        logo_url: image(node.get("logo")).or_else(|| image(node.get("image"))),
        phone: text(node, "telephone"),
        website_url: text(node, "url"),
        address: street,
        postal_code: address.and_then(|a| text(a, "postalCode")),
        geocoords: node.get("geo").and_then(|geo| {
            Some(GeoCoords {
                latitude: number(geo, "latitude")?,
                longitude: number(geo, "longitude")?,
            })
        }),
        fetched_at,
    };

    let rating = node.get("aggregateRating").and_then(|aggregate| {
        Some(ReviewSummaryRecord {
            facility: name.clone(),
            source: source.to_string(),
            rating: number(aggregate, "ratingValue")?,
            count: count(aggregate, "reviewCount").or_else(|| count(aggregate, "ratingCount"))?,
        })
    });

    Some(Listing {
        facility,
        info,
        rating,
    })
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn text(node: &Value, key: &str) -> Option<String> {
    node.get(key)?.as_str().and_then(non_empty)
}

/// `addressCountry` is either a code or a `Country` object
fn country(address: &Value) -> Option<String> {
    match address.get("addressCountry")? {
        Value::String(code) => non_empty(code),
        country => text(country, "name"),
    }
}

/// An image URL, an `ImageObject` or a list of either
fn image(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(url) => non_empty(url),
        Value::Array(items) => items.iter().find_map(|item| image(Some(item))),
        object => text(object, "url"),
    }
}

/// Numbers are often published as strings
fn number(node: &Value, key: &str) -> Option<f64> {
    let value = node.get(key)?;
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn count(node: &Value, key: &str) -> Option<u64> {
    let value = node.get(key)?;
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}
