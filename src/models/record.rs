use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Location of a facility as reported by a listing site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Location {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub city: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCoords {
    pub latitude: f64,
    pub longitude: f64,
}

/// A facility identified by name within a city
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilityRecord {
    pub name: String,
    pub location: Location,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

/// Per-source details scraped for a facility
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilityInfoRecord {
    pub facility: String,
    pub source: String,
    pub about: Option<String>,
    pub logo_url: Option<String>,
    pub phone: Option<String>,
    pub website_url: Option<String>,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub geocoords: Option<GeoCoords>,
    pub fetched_at: DateTime<Utc>,
}

/// Aggregated rating of a facility on one review source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSummaryRecord {
    pub facility: String,
    pub source: String,
    pub rating: f64,
    pub count: u64,
}

/// A fetched page, emitted by the generic page crawler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub url: String,
    pub status: u16,
    pub content_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub depth: u32,
    pub proxy: String,
    pub fetched_at: DateTime<Utc>,
}

/// Business payload handed to a record sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Facility(FacilityRecord),
    FacilityInfo(FacilityInfoRecord),
    ReviewSummary(ReviewSummaryRecord),
    Page(PageRecord),
}

impl Record {
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Facility(_) => "facility",
            Record::FacilityInfo(_) => "facility_info",
            Record::ReviewSummary(_) => "review_summary",
            Record::Page(_) => "page",
        }
    }
}

impl From<FacilityRecord> for Record {
    fn from(r: FacilityRecord) -> Self {
        Record::Facility(r)
    }
}

impl From<FacilityInfoRecord> for Record {
    fn from(r: FacilityInfoRecord) -> Self {
        Record::FacilityInfo(r)
    }
}

impl From<ReviewSummaryRecord> for Record {
    fn from(r: ReviewSummaryRecord) -> Self {
        Record::ReviewSummary(r)
    }
}

impl From<PageRecord> for Record {
    fn from(r: PageRecord) -> Self {
        Record::Page(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_is_tagged_by_kind() {
        let record = Record::from(ReviewSummaryRecord {
            facility: "Back in Balance Clinic".to_string(),
            source: "google".to_string(),
            rating: 4.8,
            count: 47,
        });

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "review_summary");
        assert_eq!(json["source"], "google");
        assert_eq!(json["count"], 47);
        assert_eq!(record.kind(), "review_summary");
    }

    #[test]
    fn test_location_skips_missing_fields() {
        let facility = FacilityRecord {
            name: "Absolute Health Centre".to_string(),
            location: Location {
                country: None,
                region: Some("ON".to_string()),
                city: "Toronto".to_string(),
            },
            categories: vec![],
        };

        let json = serde_json::to_value(Record::Facility(facility)).unwrap();
        assert!(json["location"].get("country").is_none());
        assert_eq!(json["location"]["region"], "ON");
        assert!(json.get("categories").is_none());
    }
}
