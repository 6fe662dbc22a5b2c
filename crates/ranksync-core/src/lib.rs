//! Core domain model for ranking delta sync: summaries, detail records,
//! persisted snapshots and the canonical content hash.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "ranksync-core";

/// One tracked ranking list, e.g. the men's marathon top 100.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub category_id: String,
    pub event: String,
    pub gender: String,
    pub ranking_source: String,
    pub limit: usize,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Category {
    /// Ranks at or above this value count as "currently ranked" for drop detection.
    pub fn tracked_window(&self) -> i32 {
        i32::try_from(self.limit).unwrap_or(i32::MAX)
    }
}

/// Ephemeral ranking entry produced fresh by each summary fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedSummary {
    pub external_id: String,
    pub rank: i32,
    pub category_id: String,
}

/// Persisted state the candidate selector compares against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SnapshotRow {
    pub content_hash: Option<String>,
    pub rank: Option<i32>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Full detail payload for one athlete as returned by the ranking source.
///
/// Unknown fields are kept in `extra` so the raw audit column sees the whole
/// payload, but only the named fields feed the canonical projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AthleteDetail {
    #[serde(alias = "worldAthleticsId", deserialize_with = "deserialize_external_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default, deserialize_with = "de_country")]
    pub country: Option<String>,
    #[serde(default, rename = "dob", alias = "dateOfBirth")]
    pub date_of_birth: Option<String>,
    #[serde(default, alias = "pb", deserialize_with = "de_mark")]
    pub personal_best: Option<String>,
    #[serde(default, deserialize_with = "de_mark")]
    pub season_best: Option<String>,
    #[serde(default, alias = "headshot")]
    pub headshot_url: Option<String>,
    #[serde(default)]
    pub sponsor: Option<String>,
    #[serde(default)]
    pub age: Option<i32>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl AthleteDetail {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            gender: None,
            country: None,
            date_of_birth: None,
            personal_best: None,
            season_best: None,
            headshot_url: None,
            sponsor: None,
            age: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn canonical(&self) -> CanonicalAthlete {
        CanonicalAthlete::from_detail(self)
    }

    pub fn content_hash(&self) -> String {
        self.canonical().content_hash()
    }

    pub fn raw_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Text(String),
    Number(u64),
}

/// Accept an external id encoded either as a JSON string or a non-negative integer.
pub fn deserialize_external_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match IdRepr::deserialize(deserializer)? {
        IdRepr::Text(text) => text.trim().to_string(),
        IdRepr::Number(n) => n.to_string(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CountryRepr {
    Code(String),
    Object { code: Option<String> },
}

fn de_country<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(
        Option::<CountryRepr>::deserialize(deserializer)?.and_then(|repr| match repr {
            CountryRepr::Code(code) => Some(code),
            CountryRepr::Object { code } => code,
        }),
    )
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MarkRepr {
    Text(String),
    Object {
        time: Option<String>,
        mark: Option<String>,
    },
}

fn de_mark<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(
        Option::<MarkRepr>::deserialize(deserializer)?.and_then(|repr| match repr {
            MarkRepr::Text(mark) => Some(mark),
            MarkRepr::Object { time, mark } => time.or(mark),
        }),
    )
}

/// Identity-relevant projection of an [`AthleteDetail`].
///
/// Only these fields feed the hash. Rank, points and fields the source adds
/// later never reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalAthlete {
    pub id: String,
    pub name: Option<String>,
    pub gender: Option<String>,
    pub country: Option<String>,
    pub dob: Option<String>,
    pub personal_best: Option<String>,
    pub season_best: Option<String>,
    pub headshot_url: Option<String>,
    pub sponsor: Option<String>,
    pub age: Option<i32>,
}

impl CanonicalAthlete {
    pub fn from_detail(detail: &AthleteDetail) -> Self {
        Self {
            id: detail.id.trim().to_string(),
            name: normalized(&detail.name),
            gender: normalized(&detail.gender),
            country: normalized(&detail.country),
            dob: normalized(&detail.date_of_birth),
            personal_best: normalized(&detail.personal_best),
            season_best: normalized(&detail.season_best),
            headshot_url: normalized(&detail.headshot_url),
            sponsor: normalized(&detail.sponsor),
            age: detail.age,
        }
    }

    /// Compact JSON with sorted keys, `,` and `:` separators.
    pub fn canonical_json(&self) -> String {
        let mut fields: BTreeMap<&'static str, JsonValue> = BTreeMap::new();
        fields.insert("id", json!(self.id));
        fields.insert("name", json!(self.name));
        fields.insert("gender", json!(self.gender));
        fields.insert("country", json!(self.country));
        fields.insert("dob", json!(self.dob));
        fields.insert("personalBest", json!(self.personal_best));
        fields.insert("seasonBest", json!(self.season_best));
        fields.insert("headshotUrl", json!(self.headshot_url));
        fields.insert("sponsor", json!(self.sponsor));
        fields.insert("age", json!(self.age));
        serde_json::to_string(&fields).expect("string-keyed map of JSON values always serializes")
    }

    pub fn content_hash(&self) -> String {
        sha256_hex(self.canonical_json().as_bytes())
    }
}

fn normalized(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Row handed to the conditional upserter: hash, rank and passthrough
/// display columns travel together in a single write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AthleteWrite {
    pub external_id: String,
    pub category_id: String,
    pub gender: String,
    pub ranking_source: String,
    pub rank: i32,
    pub content_hash: String,
    pub name: Option<String>,
    pub country: Option<String>,
    pub date_of_birth: Option<String>,
    pub personal_best: Option<String>,
    pub season_best: Option<String>,
    pub headshot_url: Option<String>,
    pub sponsor: Option<String>,
    pub age: Option<i32>,
    pub raw_json: JsonValue,
    pub fetched_at: DateTime<Utc>,
}

impl AthleteWrite {
    pub fn from_detail(
        detail: &AthleteDetail,
        category: &Category,
        rank: i32,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        let canonical = detail.canonical();
        Self {
            external_id: canonical.id.clone(),
            category_id: category.category_id.clone(),
            gender: category.gender.clone(),
            ranking_source: category.ranking_source.clone(),
            rank,
            content_hash: canonical.content_hash(),
            name: canonical.name,
            country: canonical.country,
            date_of_birth: canonical.dob,
            personal_best: canonical.personal_best,
            season_best: canonical.season_best,
            headshot_url: canonical.headshot_url,
            sponsor: canonical.sponsor,
            age: canonical.age,
            raw_json: detail.raw_json(),
            fetched_at,
        }
    }
}
