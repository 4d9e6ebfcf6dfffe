//! # Entity Sources
//!
//! Resolves which type ids a run processes: explicit ids, a type-list file, or
//! the eligible list in storage. Also loads fixture maps for offline runs.
//!
//! Type-list files come in several loosely-structured shapes. They are parsed
//! by an ordered chain of strategies; the first one that recognises the
//! content wins, even when the list it recognises holds no ids.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::EntityListError;
use crate::model::MarketHistoryBucket;
use crate::storage::HistoryStore;

/// Page size used when listing eligible types from storage.
pub const ELIGIBLE_PAGE_SIZE: usize = 1_000;

/// Candidate buckets per type id, loaded from a fixture file.
pub type FixtureMap = HashMap<i64, Vec<MarketHistoryBucket>>;

type Strategy = fn(&str) -> Option<Vec<i64>>;

/// Tried in order on the whole file content.
const STRATEGIES: [(&str, Strategy); 3] = [
    ("keyed-lines", parse_keyed_lines),
    ("json-document", parse_json_document),
    ("delimited-integers", parse_delimited_integers),
];

static KEYED_TYPE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)"type(?:id|_id)"\s*:\s*(-?\d+)"#).unwrap());

static BARE_INTEGER_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(-?\d+),?$").unwrap());

/// Line scan: `"typeId": N` / `"type_id": N` anywhere on a line, or a line
/// that is just an integer with an optional trailing comma.
fn parse_keyed_lines(text: &str) -> Option<Vec<i64>> {
    let mut ids = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let before = ids.len();
        ids.extend(
            KEYED_TYPE_ID
                .captures_iter(line)
                .filter_map(|caps| caps.get(1)?.as_str().parse::<i64>().ok()),
        );
        if ids.len() > before {
            continue;
        }
        if let Some(id) = BARE_INTEGER_LINE
            .captures(line)
            .and_then(|caps| caps.get(1)?.as_str().parse::<i64>().ok())
        {
            ids.push(id);
        }
    }
    non_empty(ids)
}

/// Whole-document JSON: an array of numbers, numeric strings or objects with
/// a type id key, or an object with such an array under `entries`.
///
/// A recognised document always yields `Some`, possibly empty.
fn parse_json_document(text: &str) -> Option<Vec<i64>> {
    let value: Value = serde_json::from_str(text).ok()?;
    let entries = match &value {
        Value::Array(items) => items,
        Value::Object(map) => map.get("entries")?.as_array()?,
        _ => return None,
    };
    Some(entries.iter().filter_map(json_type_id).collect())
}

fn json_type_id(entry: &Value) -> Option<i64> {
    match entry {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(map) => map
            .get("typeId")
            .or_else(|| map.get("type_id"))
            .and_then(Value::as_i64),
        _ => None,
    }
}

/// Newline- or comma-separated integers; anything else is ignored.
fn parse_delimited_integers(text: &str) -> Option<Vec<i64>> {
    non_empty(
        text.split(['\n', ','])
            .filter_map(|token| token.trim().parse::<i64>().ok())
            .collect(),
    )
}

fn non_empty(ids: Vec<i64>) -> Option<Vec<i64>> {
    (!ids.is_empty()).then_some(ids)
}

/// Runs the strategy chain over `text`. `None` when no strategy recognises it.
pub fn parse_type_list(text: &str) -> Option<Vec<i64>> {
    STRATEGIES.iter().find_map(|(name, strategy)| {
        let ids = strategy(text)?;
        debug!(strategy = name, count = ids.len(), "type list parsed");
        Some(ids)
    })
}

/// Reads and parses a type-list file. A blank file is an empty list.
pub async fn load_type_ids_from_file(path: &Path) -> Result<Vec<i64>, EntityListError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| EntityListError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;

    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    parse_type_list(&text)
        .map(|ids| dedupe_type_ids(&ids))
        .ok_or_else(|| EntityListError::Unrecognised {
            path: path.to_path_buf(),
        })
}

/// Keeps the first occurrence of each positive id, in order.
pub fn dedupe_type_ids(ids: &[i64]) -> Vec<i64> {
    let mut seen = HashSet::new();
    ids.iter()
        .copied()
        .filter(|id| *id > 0 && seen.insert(*id))
        .collect()
}

/// Loads a `{ "<typeId>": Bucket[] }` fixture map.
pub async fn load_fixture(path: &Path) -> Result<FixtureMap, EntityListError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| EntityListError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_str(&text).map_err(|source| EntityListError::InvalidFixture {
        path: path.to_path_buf(),
        source,
    })
}

/// Where the entity list of a run comes from.
#[derive(Debug, Clone, Default)]
pub struct EntityRequest<'a> {
    /// Ids given on the command line.
    pub explicit: &'a [i64],
    /// Optional type-list file.
    pub file: Option<&'a Path>,
    /// Maximum number of entities.
    pub type_limit: Option<usize>,
}

/// Resolves the ordered, deduplicated entity list of a run.
///
/// Explicit ids come first, then file ids. When nothing valid remains the
/// eligible list is read from storage in keyset pages.
pub async fn resolve_entities<S: HistoryStore>(
    request: &EntityRequest<'_>,
    store: &S,
) -> Result<Vec<i64>, EntityListError> {
    let mut requested = request.explicit.to_vec();
    if let Some(path) = request.file {
        requested.extend(load_type_ids_from_file(path).await?);
    }

    let limit = request.type_limit.filter(|l| *l > 0);
    let mut ids = dedupe_type_ids(&requested);
    if let Some(limit) = limit {
        ids.truncate(limit);
    }
    if !ids.is_empty() {
        info!(count = ids.len(), "type ids resolved from arguments");
        return Ok(ids);
    }

    if !requested.is_empty() || request.file.is_some() {
        warn!("type list resolved to zero valid ids; falling back to eligible types");
    }

    let mut after = 0;
    loop {
        let wanted = limit.map_or(ELIGIBLE_PAGE_SIZE, |l| (l - ids.len()).min(ELIGIBLE_PAGE_SIZE));
        if wanted == 0 {
            break;
        }
        let page = store.eligible_type_ids(after, wanted).await?;
        let Some(last) = page.last().copied() else {
            break;
        };
        let short = page.len() < wanted;
        ids.extend(page);
        after = last;
        if short {
            break;
        }
    }

    info!(count = ids.len(), "type ids resolved from eligible list");
    Ok(ids)
}
