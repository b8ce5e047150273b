use std::{path::Path, sync::Arc, time::Duration};

use serde::Serialize;

use crate::{
    backend::IndexBackend,
    error::{Error, Result},
    extract,
    ingestion::describe,
    llm::Summarizer,
    record::{FileRecord, ScoredRecord, SearchHit},
    text_util::{query_terms, stem_words},
};

/// Result count used when the caller does not ask for one.
pub const DEFAULT_LIMIT: usize = 20;

/// A file sent along with a query. Never written to the index.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub total_results: usize,
    /// The text actually sent to the index: the expanded query, followed by
    /// the attachment description for multimodal searches.
    pub expanded_query: String,
    pub original_query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_file_name: Option<String>,
}

/// Expands queries, folds attachments in, and runs the ranked search.
pub struct QueryEngine {
    backend: Arc<dyn IndexBackend>,
    summarizer: Arc<dyn Summarizer>,
    expand_timeout: Duration,
}

impl QueryEngine {
    pub fn new(
        backend: Arc<dyn IndexBackend>,
        summarizer: Arc<dyn Summarizer>,
        expand_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            summarizer,
            expand_timeout,
        }
    }

    /// Search for `raw_query`, optionally enriched by an attached file.
    ///
    /// An empty query is only accepted together with an attachment. Model
    /// failures never fail the search; backend failures do.
    pub async fn search(
        &self,
        raw_query: &str,
        attachment: Option<Attachment>,
        limit: usize,
    ) -> Result<SearchResponse> {
        let query = raw_query.trim();
        if query.is_empty() && attachment.is_none() {
            return Err(Error::InvalidQuery("query is empty".into()));
        }

        let mut parts = Vec::with_capacity(2);
        if !query.is_empty() {
            parts.push(self.expand(query).await);
        }
        let uploaded_file_name = match attachment {
            Some(attachment) => {
                let description = self.describe_attachment(&attachment).await;
                if !description.is_empty() {
                    parts.push(description);
                }
                Some(attachment.file_name)
            }
            None => None,
        };
        let merged = parts.join(" ");

        let scored = if merged.trim().is_empty() {
            Vec::new()
        } else {
            self.backend.search(&merged, limit).await?
        };
        tracing::debug!(
            query = %query,
            expanded = %merged,
            results = scored.len(),
            "search finished"
        );

        let terms = query_terms(&merged);
        let results: Vec<SearchHit> = scored
            .into_iter()
            .map(|ScoredRecord { record, score }| SearchHit {
                matched_terms: matched_terms(&record, &terms),
                record,
                score,
            })
            .collect();

        Ok(SearchResponse {
            total_results: results.len(),
            results,
            expanded_query: merged,
            original_query: raw_query.to_string(),
            uploaded_file_name,
        })
    }

    /// Expanded form of `query`, or `query` itself when the model fails or
    /// takes longer than the expansion timeout.
    async fn expand(&self, query: &str) -> String {
        match tokio::time::timeout(self.expand_timeout, self.summarizer.expand(query))
            .await
        {
            Ok(Ok(expanded)) => expanded,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "query expansion failed, using raw query");
                query.to_string()
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.expand_timeout.as_secs(),
                    "query expansion timed out, using raw query"
                );
                query.to_string()
            }
        }
    }

    /// Caption or summarize the attachment. Falls back to the words of its
    /// file name when it cannot be read or described.
    async fn describe_attachment(&self, attachment: &Attachment) -> String {
        let name = attachment.file_name.as_str();
        let extracted = match extract::extract_bytes(Path::new(name), &attachment.bytes) {
            Ok(extracted) => extracted,
            Err(e) => {
                tracing::debug!(file = %name, error = %e, "cannot extract attachment");
                return stem_words(name);
            }
        };
        match describe(self.summarizer.as_ref(), name, &extracted).await {
            Ok(summary) if !summary.as_query_text().is_empty() => {
                summary.as_query_text()
            }
            Ok(_) => stem_words(name),
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "cannot describe attachment");
                stem_words(name)
            }
        }
    }
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("backend", &self.backend.kind())
            .field("expand_timeout", &self.expand_timeout)
            .finish_non_exhaustive()
    }
}

/// Query terms that occur in the record's name, summary or keywords.
fn matched_terms(record: &FileRecord, terms: &[String]) -> Vec<String> {
    let haystack = format!(
        "{} {} {}",
        record.name,
        record.summary,
        record.keywords.join(" ")
    )
    .to_lowercase();
    terms
        .iter()
        .filter(|term| haystack.contains(term.as_str()))
        .cloned()
        .collect()
}
