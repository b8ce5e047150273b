use std::{collections::BTreeMap, path::Path, time::Duration};

use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{Client, ClientBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    backend::{BackendKind, IndexBackend},
    doc_id::record_id,
    error::{Error, Result},
    record::{FileRecord, ScoredRecord, sort_by_relevance},
    text_util::query_terms,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Characters escaped in index names placed in a URL path.
const PATH_SEGMENT: &AsciiSet =
    &NON_ALPHANUMERIC.remove(b'_').remove(b'-').remove(b'.');

/// Weighted fields for the multi-field queries.
const SEARCH_FIELDS: &[&str] =
    &["file_name^3", "keywords^2.5", "summary^2", "raw_text"];
const PHRASE_FIELDS: &[&str] =
    &["file_name^5", "keywords^4", "summary^3", "raw_text^2"];
/// Fields matched by substring, with their boosts.
const SUBSTRING_FIELDS: &[(&str, f32)] =
    &[("file_name", 1.5), ("keywords", 1.25), ("summary", 1.0)];
/// Query terms shorter than this are not substring matched.
const SUBSTRING_MIN_CHARS: usize = 3;

/// Elasticsearch-compatible cluster backend.
///
/// Documents are keyed by the blake3 digest of their path and written with
/// `refresh=true`, so a successful upsert is visible to the next search.
pub struct ClusterIndex {
    client: Client,
    base_url: String,
    index: String,
}

/// Wire shape of a stored document.
#[derive(Debug, Serialize, Deserialize)]
struct ClusterDoc {
    file_path: String,
    file_name: String,
    extension: String,
    size_bytes: u64,
    modified_time: u64,
    summary: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    raw_text: Option<String>,
}

impl From<&FileRecord> for ClusterDoc {
    fn from(r: &FileRecord) -> Self {
        Self {
            file_path: r.path.clone(),
            file_name: r.name.clone(),
            extension: r.extension.clone(),
            size_bytes: r.size_bytes,
            modified_time: r.modified_time,
            summary: r.summary.clone(),
            keywords: r.keywords.clone(),
            content_hash: r.content_hash.clone(),
            raw_text: Some(r.content.clone()),
        }
    }
}

impl From<ClusterDoc> for FileRecord {
    fn from(d: ClusterDoc) -> Self {
        Self {
            path: d.file_path,
            name: d.file_name,
            extension: d.extension,
            size_bytes: d.size_bytes,
            modified_time: d.modified_time,
            summary: d.summary,
            keywords: d.keywords,
            content_hash: d.content_hash,
            content: String::new(),
        }
    }
}

impl ClusterIndex {
    /// Probe the cluster within `probe_timeout` and make sure the index
    /// exists. Fails with `BackendUnavailable` if it cannot be reached.
    pub async fn connect(
        base_url: &str,
        index: &str,
        probe_timeout: Duration,
    ) -> Result<Self> {
        let client = ClientBuilder::new()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(probe_timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;
        let this = Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            index: index.to_string(),
        };

        let probe = this
            .client
            .get(format!("{}/", this.base_url))
            .timeout(probe_timeout)
            .send()
            .await?;
        check(probe).await?;
        this.ensure_index().await?;
        Ok(this)
    }

    fn index_url(&self) -> String {
        format!("{}/{}", self.base_url, encode(&self.index))
    }

    fn doc_url(&self, path: &str) -> String {
        format!(
            "{}/_doc/{}?refresh=true",
            self.index_url(),
            record_id(path)
        )
    }

    async fn ensure_index(&self) -> Result<()> {
        let response = self.client.head(self.index_url()).send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(unexpected_status(response).await);
        }

        tracing::info!(index = %self.index, "creating cluster index");
        let response = self
            .client
            .put(self.index_url())
            .json(&mapping_body())
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn delete_by_query(&self, query: Value) -> Result<usize> {
        let response = self
            .client
            .post(format!(
                "{}/_delete_by_query?refresh=true&conflicts=proceed",
                self.index_url()
            ))
            .json(&json!({ "query": query }))
            .send()
            .await?;
        let body = check(response).await?;
        Ok(body["deleted"].as_u64().unwrap_or(0) as usize)
    }
}

impl std::fmt::Debug for ClusterIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterIndex")
            .field("base_url", &self.base_url)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl IndexBackend for ClusterIndex {
    fn kind(&self) -> BackendKind {
        BackendKind::Cluster
    }

    async fn upsert(&self, record: &FileRecord) -> Result<()> {
        let response = self
            .client
            .put(self.doc_url(&record.path))
            .json(&ClusterDoc::from(record))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let response = self.client.delete(self.doc_url(path)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }

    async fn delete_prefix(&self, folder: &Path) -> Result<usize> {
        self.delete_by_query(prefix_query(folder)).await
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<ScoredRecord>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .post(format!("{}/_search", self.index_url()))
            .json(&search_body(query, top_k))
            .send()
            .await?;
        let body = check(response).await?;
        parse_hits(&body)
    }

    async fn clear(&self) -> Result<()> {
        self.delete_by_query(json!({ "match_all": {} })).await?;
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let response = self
            .client
            .get(format!("{}/_count", self.index_url()))
            .send()
            .await?;
        let body = check(response).await?;
        Ok(body["count"].as_u64().unwrap_or(0))
    }

    async fn count_by_extension(&self) -> Result<BTreeMap<String, u64>> {
        let response = self
            .client
            .post(format!("{}/_search", self.index_url()))
            .json(&json!({
                "size": 0,
                "aggs": { "by_type": { "terms": { "field": "extension", "size": 100 } } }
            }))
            .send()
            .await?;
        let body = check(response).await?;
        Ok(parse_extension_buckets(&body))
    }
}

fn encode(segment: &str) -> String {
    utf8_percent_encode(segment, PATH_SEGMENT).to_string()
}

/// Return the parsed JSON body of a successful response, or
/// `BackendUnavailable` carrying the status and body text.
async fn check(response: Response) -> Result<Value> {
    if !response.status().is_success() {
        return Err(unexpected_status(response).await);
    }
    let text = response.text().await?;
    if text.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

async fn unexpected_status(response: Response) -> Error {
    let status = response.status();
    let detail = response.text().await.unwrap_or_default();
    Error::BackendUnavailable(format!("cluster returned {status}: {detail}"))
}

fn mapping_body() -> Value {
    json!({
        "settings": {
            "number_of_shards": 1,
            "number_of_replicas": 0,
            "analysis": {
                "analyzer": {
                    "file_analyzer": {
                        "type": "custom",
                        "tokenizer": "standard",
                        "filter": ["lowercase", "asciifolding"]
                    }
                }
            }
        },
        "mappings": {
            "properties": {
                "file_name": { "type": "text", "analyzer": "file_analyzer" },
                "summary": { "type": "text", "analyzer": "file_analyzer" },
                "keywords": { "type": "text", "analyzer": "file_analyzer" },
                "raw_text": { "type": "text", "analyzer": "file_analyzer" },
                "file_path": { "type": "keyword" },
                "extension": { "type": "keyword" },
                "content_hash": { "type": "keyword" },
                "size_bytes": { "type": "long" },
                "modified_time": { "type": "long" }
            }
        }
    })
}

/// Query matching every path strictly below `folder`.
fn prefix_query(folder: &Path) -> Value {
    let mut prefix = folder.to_string_lossy().into_owned();
    if !prefix.ends_with(std::path::MAIN_SEPARATOR) {
        prefix.push(std::path::MAIN_SEPARATOR);
    }
    json!({ "prefix": { "file_path": prefix } })
}

/// Fuzzy best-fields match, a boosted exact phrase, an OR'ed cross-fields
/// match and per-term substring wildcards; ties sorted by modification time.
fn search_body(query: &str, top_k: usize) -> Value {
    let mut should = vec![
        json!({
            "multi_match": {
                "query": query,
                "fields": SEARCH_FIELDS,
                "type": "best_fields",
                "fuzziness": "AUTO",
                "prefix_length": 1
            }
        }),
        json!({
            "multi_match": {
                "query": query,
                "fields": PHRASE_FIELDS,
                "type": "phrase",
                "boost": 2.0
            }
        }),
        json!({
            "multi_match": {
                "query": query,
                "fields": SEARCH_FIELDS,
                "type": "cross_fields",
                "operator": "or"
            }
        }),
    ];
    for term in query_terms(query) {
        if term.chars().count() < SUBSTRING_MIN_CHARS {
            continue;
        }
        for (field, boost) in SUBSTRING_FIELDS {
            should.push(json!({
                "wildcard": {
                    *field: {
                        "value": format!("*{term}*"),
                        "case_insensitive": true,
                        "boost": boost
                    }
                }
            }));
        }
    }

    json!({
        "size": top_k,
        "_source": { "excludes": ["raw_text"] },
        "query": {
            "bool": {
                "should": should,
                "minimum_should_match": 1
            }
        },
        "sort": [
            { "_score": { "order": "desc" } },
            { "modified_time": { "order": "desc" } }
        ]
    })
}

fn parse_hits(body: &Value) -> Result<Vec<ScoredRecord>> {
    let hits = body["hits"]["hits"].as_array().cloned().unwrap_or_default();
    let mut results = Vec::with_capacity(hits.len());
    for hit in hits {
        let score = hit["_score"].as_f64().unwrap_or(0.0) as f32;
        let doc: ClusterDoc = serde_json::from_value(hit["_source"].clone())?;
        results.push(ScoredRecord {
            record: doc.into(),
            score,
        });
    }
    sort_by_relevance(&mut results);
    Ok(results)
}

fn parse_extension_buckets(body: &Value) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    let buckets = body["aggregations"]["by_type"]["buckets"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    for bucket in buckets {
        let key = bucket["key"].as_str().unwrap_or_default();
        let key = if key.is_empty() { "other" } else { key };
        let count = bucket["doc_count"].as_u64().unwrap_or(0);
        *counts.entry(key.to_string()).or_insert(0) += count;
    }
    counts
}
