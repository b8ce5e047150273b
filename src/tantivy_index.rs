use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use tantivy::{
    DocAddress,
    DocId,
    Index,
    IndexReader,
    IndexWriter,
    ReloadPolicy,
    Score,
    Searcher,
    SegmentReader,
    TantivyDocument,
    Term,
    collector::{DocSetCollector, TopDocs},
    query::{
        AllQuery,
        BooleanQuery,
        BoostQuery,
        FuzzyTermQuery,
        Occur,
        Query,
        QueryParser,
        RegexQuery,
    },
    schema::*,
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
    },
};

use crate::{
    backend::{BackendKind, IndexBackend},
    error::Result,
    record::{FileRecord, ScoredRecord, sort_by_relevance},
    text_util::query_terms,
};

/// Field names used in the schema.
pub mod fields {
    pub const PATH: &str = "path";
    pub const NAME: &str = "name";
    pub const KEYWORDS: &str = "keywords";
    pub const SUMMARY: &str = "summary";
    pub const CONTENT: &str = "content";
    pub const EXTENSION: &str = "extension";
    pub const SIZE: &str = "size_bytes";
    pub const MTIME: &str = "modified_time";
    pub const CONTENT_HASH: &str = "content_hash";
}

/// Relative field weights: name and keyword hits outrank summary hits,
/// which outrank body text.
pub const NAME_BOOST: f32 = 3.0;
pub const KEYWORDS_BOOST: f32 = 2.5;
pub const SUMMARY_BOOST: f32 = 2.0;

/// Query terms shorter than this are not fuzzy or substring matched.
const FUZZY_MIN_CHARS: usize = 3;

/// Weight of a substring hit relative to the field boost.
const SUBSTRING_WEIGHT: f32 = 0.5;

const WRITER_MEMORY_BUDGET: usize = 50_000_000;

/// Resolved field handles for the schema.
#[derive(Debug, Clone, Copy)]
pub struct SchemaFields {
    pub path: Field,
    pub name: Field,
    pub keywords: Field,
    pub summary: Field,
    pub content: Field,
    pub extension: Field,
    pub size: Field,
    pub mtime: Field,
    pub content_hash: Field,
}

impl SchemaFields {
    fn resolve(schema: &Schema) -> Result<Self> {
        Ok(Self {
            path: schema.get_field(fields::PATH)?,
            name: schema.get_field(fields::NAME)?,
            keywords: schema.get_field(fields::KEYWORDS)?,
            summary: schema.get_field(fields::SUMMARY)?,
            content: schema.get_field(fields::CONTENT)?,
            extension: schema.get_field(fields::EXTENSION)?,
            size: schema.get_field(fields::SIZE)?,
            mtime: schema.get_field(fields::MTIME)?,
            content_hash: schema.get_field(fields::CONTENT_HASH)?,
        })
    }
}

fn build_schema() -> Schema {
    let mut builder = Schema::builder();

    builder.add_text_field(fields::PATH, STRING | STORED);

    let stored_text = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("en_stem")
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();
    builder.add_text_field(fields::NAME, stored_text.clone());
    builder.add_text_field(fields::KEYWORDS, stored_text.clone());
    builder.add_text_field(fields::SUMMARY, stored_text);

    let content_opts = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer("en_stem")
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    );
    builder.add_text_field(fields::CONTENT, content_opts);

    builder.add_text_field(fields::EXTENSION, STRING | STORED);
    builder.add_u64_field(fields::SIZE, STORED);
    builder.add_u64_field(fields::MTIME, STORED | FAST);
    builder.add_text_field(fields::CONTENT_HASH, STRING | STORED);

    builder.build()
}

fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build();
    index.tokenizers().register("en_stem", en_stem);
}

/// Embedded Tantivy index of [`FileRecord`]s, keyed by path.
///
/// Every write commits and reloads the reader before returning, so a
/// successful upsert is immediately visible to searches. The writer is
/// opened lazily so read-only commands can share the directory with a
/// running server.
pub struct SearchIndex {
    index: Index,
    reader: IndexReader,
    fields: SchemaFields,
    writer: Mutex<Option<IndexWriter>>,
}

impl SearchIndex {
    /// Open or create a search index at the given directory.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mmap_dir = tantivy::directory::MmapDirectory::open(dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?;
        let index = if Index::exists(&mmap_dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?
        {
            Index::open(mmap_dir)?
        } else {
            Index::create(
                mmap_dir,
                build_schema(),
                tantivy::IndexSettings::default(),
            )?
        };

        Self::from_index(index)
    }

    /// Create an in-memory search index (for testing).
    pub fn open_in_ram() -> Result<Self> {
        Self::from_index(Index::create_in_ram(build_schema()))
    }

    fn from_index(index: Index) -> Result<Self> {
        register_tokenizers(&index);
        let fields = SchemaFields::resolve(&index.schema())?;
        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        Ok(Self {
            index,
            reader,
            fields,
            writer: Mutex::new(None),
        })
    }

    /// Run `f` against the writer, then commit and refresh the reader.
    /// A failed write is rolled back.
    fn write<T>(
        &self,
        f: impl FnOnce(&mut IndexWriter) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.lock_writer();
        let mut writer = match guard.take() {
            Some(writer) => writer,
            None => self
                .index
                .writer_with_num_threads(1, WRITER_MEMORY_BUDGET)?,
        };

        let outcome = f(&mut writer).and_then(|value| {
            writer.commit()?;
            Ok(value)
        });
        if outcome.is_err() {
            writer.rollback()?;
        }
        *guard = Some(writer);
        drop(guard);

        let value = outcome?;
        self.reader.reload()?;
        Ok(value)
    }

    fn lock_writer(&self) -> MutexGuard<'_, Option<IndexWriter>> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn searcher(&self) -> Result<Searcher> {
        self.reader.reload()?;
        Ok(self.reader.searcher())
    }

    /// Insert or replace the document for `record.path`.
    pub fn upsert(&self, record: &FileRecord) -> Result<()> {
        let f = self.fields;
        let mut doc = TantivyDocument::default();
        doc.add_text(f.path, &record.path);
        doc.add_text(f.name, &record.name);
        for keyword in &record.keywords {
            doc.add_text(f.keywords, keyword);
        }
        doc.add_text(f.summary, &record.summary);
        doc.add_text(f.content, &record.content);
        doc.add_text(f.extension, &record.extension);
        doc.add_u64(f.size, record.size_bytes);
        doc.add_u64(f.mtime, record.modified_time);
        doc.add_text(f.content_hash, &record.content_hash);

        self.write(|writer| {
            writer.delete_term(Term::from_field_text(f.path, &record.path));
            writer.add_document(doc)?;
            Ok(())
        })
    }

    /// Delete the document for a path. Missing paths are a no-op.
    pub fn delete(&self, path: &str) -> Result<()> {
        let field = self.fields.path;
        self.write(|writer| {
            writer.delete_term(Term::from_field_text(field, path));
            Ok(())
        })
    }

    /// Delete every document under `folder`, compared per path component.
    pub fn delete_prefix(&self, folder: &Path) -> Result<usize> {
        let paths: Vec<String> = self
            .all_records()?
            .into_iter()
            .map(|r| r.path)
            .filter(|p| Path::new(p).starts_with(folder))
            .collect();
        if paths.is_empty() {
            return Ok(0);
        }

        let field = self.fields.path;
        self.write(|writer| {
            for path in &paths {
                writer.delete_term(Term::from_field_text(field, path));
            }
            Ok(paths.len())
        })
    }

    pub fn clear(&self) -> Result<()> {
        self.write(|writer| {
            writer.delete_all_documents()?;
            Ok(())
        })
    }

    pub fn count(&self) -> Result<u64> {
        Ok(self.searcher()?.num_docs())
    }

    /// Every stored record (content excerpt is not stored, so it is empty).
    pub fn all_records(&self) -> Result<Vec<FileRecord>> {
        let searcher = self.searcher()?;
        let addresses = searcher.search(&AllQuery, &DocSetCollector)?;
        addresses
            .into_iter()
            .map(|addr| self.load(&searcher, addr))
            .collect()
    }

    /// BM25 search over name, keywords, summary and content, OR'ed with
    /// Levenshtein-distance-1 fuzzy matches and substring matches on the
    /// weighted fields.
    ///
    /// Equal scores rank the most recently modified file first.
    pub fn search(&self, query_str: &str, top_k: usize) -> Result<Vec<ScoredRecord>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let f = self.fields;
        let searcher = self.searcher()?;

        let mut parser = QueryParser::for_index(
            &self.index,
            vec![f.name, f.keywords, f.summary, f.content],
        );
        parser.set_field_boost(f.name, NAME_BOOST);
        parser.set_field_boost(f.keywords, KEYWORDS_BOOST);
        parser.set_field_boost(f.summary, SUMMARY_BOOST);
        let (bm25_query, _errors) = parser.parse_query_lenient(query_str);

        let mut clauses: Vec<(Occur, Box<dyn Query>)> =
            vec![(Occur::Should, bm25_query)];
        for term in query_terms(query_str) {
            if term.chars().count() < FUZZY_MIN_CHARS {
                continue;
            }
            for (field, boost) in [
                (f.name, NAME_BOOST),
                (f.keywords, KEYWORDS_BOOST),
                (f.summary, SUMMARY_BOOST),
            ] {
                let fuzzy =
                    FuzzyTermQuery::new(Term::from_field_text(field, &term), 1, true);
                clauses.push((
                    Occur::Should,
                    Box::new(BoostQuery::new(Box::new(fuzzy), boost)),
                ));
                // Terms are alphanumeric, so they carry no regex syntax.
                let substring = RegexQuery::from_pattern(&format!(".*{term}.*"), field)?;
                clauses.push((
                    Occur::Should,
                    Box::new(BoostQuery::new(
                        Box::new(substring),
                        boost * SUBSTRING_WEIGHT,
                    )),
                ));
            }
        }
        let query = BooleanQuery::new(clauses);

        let collector = TopDocs::with_limit(top_k).tweak_score(
            move |segment: &SegmentReader| {
                let mtimes = segment
                    .fast_fields()
                    .u64(fields::MTIME)
                    .ok()
                    .map(|column| column.first_or_default_col(0));
                move |doc: DocId, score: Score| {
                    let mtime = mtimes.as_ref().map_or(0, |m| m.get_val(doc));
                    (score, mtime)
                }
            },
        );
        let top_docs = searcher.search(&query, &collector)?;

        let mut results = Vec::with_capacity(top_docs.len());
        for ((score, _mtime), addr) in top_docs {
            results.push(ScoredRecord {
                record: self.load(&searcher, addr)?,
                score,
            });
        }
        sort_by_relevance(&mut results);
        Ok(results)
    }

    fn load(&self, searcher: &Searcher, addr: DocAddress) -> Result<FileRecord> {
        let f = self.fields;
        let doc: TantivyDocument = searcher.doc(addr)?;
        Ok(FileRecord {
            path: extract_text(&doc, f.path),
            name: extract_text(&doc, f.name),
            extension: extract_text(&doc, f.extension),
            size_bytes: extract_u64(&doc, f.size),
            modified_time: extract_u64(&doc, f.mtime),
            summary: extract_text(&doc, f.summary),
            keywords: doc
                .get_all(f.keywords)
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            content_hash: extract_text(&doc, f.content_hash),
            content: String::new(),
        })
    }
}

impl std::fmt::Debug for SearchIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchIndex").finish_non_exhaustive()
    }
}

fn extract_text(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn extract_u64(doc: &TantivyDocument, field: Field) -> u64 {
    doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or(0)
}

/// [`IndexBackend`] over a [`SearchIndex`]. Tantivy calls block, so each one
/// runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct EmbeddedIndex {
    inner: Arc<SearchIndex>,
}

impl EmbeddedIndex {
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self::new(SearchIndex::open(dir)?))
    }

    pub fn new(index: SearchIndex) -> Self {
        Self {
            inner: Arc::new(index),
        }
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SearchIndex) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner)).await?
    }
}

#[async_trait]
impl IndexBackend for EmbeddedIndex {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    async fn upsert(&self, record: &FileRecord) -> Result<()> {
        let record = record.clone();
        self.run(move |idx| idx.upsert(&record)).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.run(move |idx| idx.delete(&path)).await
    }

    async fn delete_prefix(&self, folder: &Path) -> Result<usize> {
        let folder = folder.to_path_buf();
        self.run(move |idx| idx.delete_prefix(&folder)).await
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<ScoredRecord>> {
        let query = query.to_string();
        self.run(move |idx| idx.search(&query, top_k)).await
    }

    async fn clear(&self) -> Result<()> {
        self.run(|idx| idx.clear()).await
    }

    async fn count(&self) -> Result<u64> {
        self.run(|idx| idx.count()).await
    }

    async fn count_by_extension(&self) -> Result<BTreeMap<String, u64>> {
        self.run(|idx| {
            let mut counts = BTreeMap::new();
            for record in idx.all_records()? {
                let key = if record.extension.is_empty() {
                    "other".to_string()
                } else {
                    record.extension
                };
                *counts.entry(key).or_insert(0) += 1;
            }
            Ok(counts)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, summary: &str, keywords: &[&str], mtime: u64) -> FileRecord {
        let mut r = FileRecord::from_path(Path::new(path), 10, mtime, "h".into());
        r.summary = summary.to_string();
        r.keywords = keywords.iter().map(|k| k.to_string()).collect();
        r
    }

    fn names(results: &[ScoredRecord]) -> Vec<&str> {
        results.iter().map(|r| r.record.name.as_str()).collect()
    }

    #[test]
    fn create_and_search() {
        let idx = SearchIndex::open_in_ram().unwrap();
        idx.upsert(&record(
            "/docs/budget_2024.pdf",
            "Quarterly budget figures",
            &["finance", "budget"],
            1000,
        ))
        .unwrap();
        idx.upsert(&record("/docs/cat.png", "A cat on a sofa", &["animal"], 2000))
            .unwrap();

        let results = idx.search("budget", 10).unwrap();
        assert_eq!(names(&results), vec!["budget_2024.pdf"]);
        assert_eq!(results[0].record.keywords, vec!["finance", "budget"]);
        assert_eq!(results[0].record.extension, "pdf");
        assert_eq!(results[0].record.modified_time, 1000);
    }

    #[test]
    fn upsert_replaces_by_path() {
        let idx = SearchIndex::open_in_ram().unwrap();
        idx.upsert(&record("/docs/a.txt", "old summary", &[], 1)).unwrap();
        idx.upsert(&record("/docs/a.txt", "new summary", &[], 2)).unwrap();

        assert_eq!(idx.count().unwrap(), 1);
        let results = idx.search("summary", 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.summary, "new summary");
        assert_eq!(results[0].record.modified_time, 2);
    }

    #[test]
    fn delete_is_idempotent() {
        let idx = SearchIndex::open_in_ram().unwrap();
        idx.upsert(&record("/docs/a.txt", "hello world", &[], 1)).unwrap();

        idx.delete("/docs/a.txt").unwrap();
        idx.delete("/docs/a.txt").unwrap();
        idx.delete("/never/existed.txt").unwrap();
        assert_eq!(idx.count().unwrap(), 0);
    }

    #[test]
    fn delete_prefix_is_component_wise() {
        let idx = SearchIndex::open_in_ram().unwrap();
        idx.upsert(&record("/docs/a.txt", "x", &[], 1)).unwrap();
        idx.upsert(&record("/docs/sub/b.txt", "x", &[], 1)).unwrap();
        idx.upsert(&record("/docs2/c.txt", "x", &[], 1)).unwrap();

        assert_eq!(idx.delete_prefix(Path::new("/docs")).unwrap(), 2);
        let left: Vec<String> =
            idx.all_records().unwrap().into_iter().map(|r| r.path).collect();
        assert_eq!(left, vec!["/docs2/c.txt"]);
        assert_eq!(idx.delete_prefix(Path::new("/docs")).unwrap(), 0);
    }

    #[test]
    fn name_and_keywords_outrank_summary() {
        let idx = SearchIndex::open_in_ram().unwrap();
        idx.upsert(&record(
            "/d/notes.txt",
            "mentions invoice once",
            &["misc"],
            1,
        ))
        .unwrap();
        idx.upsert(&record("/d/invoice.txt", "a document", &["paper"], 1))
            .unwrap();
        idx.upsert(&record("/d/misc.txt", "a document", &["invoice"], 1))
            .unwrap();

        let results = idx.search("invoice", 10).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[2].record.name, "notes.txt");
    }

    #[test]
    fn fuzzy_matches_typos() {
        let idx = SearchIndex::open_in_ram().unwrap();
        idx.upsert(&record("/d/a.txt", "vacation photos", &["beach"], 1))
            .unwrap();

        let results = idx.search("beech", 10).unwrap();
        assert_eq!(names(&results), vec!["a.txt"]);
    }

    #[test]
    fn partial_words_match_as_substrings() {
        let idx = SearchIndex::open_in_ram().unwrap();
        idx.upsert(&record(
            "/docs/budget_2024.pdf",
            "quarterly budget overview",
            &["finance"],
            1,
        ))
        .unwrap();
        idx.upsert(&record("/docs/cat.png", "a cat on a sofa", &["animal"], 1))
            .unwrap();

        for partial in ["budg", "overv", "udget", "financ"] {
            let results = idx.search(partial, 10).unwrap();
            assert_eq!(names(&results), vec!["budget_2024.pdf"], "{partial}");
        }
        assert!(idx.search("ca", 10).unwrap().is_empty());
    }

    #[test]
    fn stemming_works() {
        let idx = SearchIndex::open_in_ram().unwrap();
        idx.upsert(&record("/d/a.txt", "the runners were running", &[], 1))
            .unwrap();
        assert!(!idx.search("run", 10).unwrap().is_empty());
    }

    #[test]
    fn no_match_is_empty_not_error() {
        let idx = SearchIndex::open_in_ram().unwrap();
        idx.upsert(&record("/d/a.txt", "hello world", &[], 1)).unwrap();
        assert!(idx.search("zzqxjv", 10).unwrap().is_empty());
        assert!(idx.search("", 10).unwrap().is_empty());
    }

    #[test]
    fn ties_prefer_recent_files() {
        let idx = SearchIndex::open_in_ram().unwrap();
        idx.upsert(&record("/d/a.txt", "budget report", &[], 100)).unwrap();
        idx.upsert(&record("/d/b.txt", "budget report", &[], 200)).unwrap();

        let results = idx.search("budget", 10).unwrap();
        assert_eq!(names(&results), vec!["b.txt", "a.txt"]);
    }

    #[test]
    fn ties_beyond_the_cut_off_still_prefer_recent_files() {
        let idx = SearchIndex::open_in_ram().unwrap();
        for i in 0..7 {
            idx.upsert(&record(&format!("/d/{i}.txt"), "budget report", &[], i))
                .unwrap();
        }

        let results = idx.search("budget", 2).unwrap();
        assert_eq!(names(&results), vec!["6.txt", "5.txt"]);
    }

    #[test]
    fn content_is_searchable_but_not_returned() {
        let idx = SearchIndex::open_in_ram().unwrap();
        let r = record("/d/report.pdf", "annual report", &[], 1)
            .with_content("the quarterly budget grew");
        idx.upsert(&r).unwrap();

        let results = idx.search("quarterly", 10).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].record.content.is_empty());
    }

    #[test]
    fn top_k_limits_results() {
        let idx = SearchIndex::open_in_ram().unwrap();
        for i in 0..5 {
            idx.upsert(&record(&format!("/d/{i}.txt"), "shared term", &[], i))
                .unwrap();
        }
        assert_eq!(idx.search("shared", 3).unwrap().len(), 3);
        assert!(idx.search("shared", 0).unwrap().is_empty());
    }

    #[test]
    fn clear_empties_index() {
        let idx = SearchIndex::open_in_ram().unwrap();
        idx.upsert(&record("/d/a.txt", "x", &[], 1)).unwrap();
        idx.clear().unwrap();
        assert_eq!(idx.count().unwrap(), 0);
    }

    #[test]
    fn disk_persistence() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("tantivy");

        {
            let idx = SearchIndex::open(&dir).unwrap();
            idx.upsert(&record("/d/a.txt", "persistent data", &[], 1))
                .unwrap();
        }

        {
            let idx = SearchIndex::open(&dir).unwrap();
            let results = idx.search("persistent", 10).unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].record.path, "/d/a.txt");
        }
    }

    #[tokio::test]
    async fn backend_counts_by_extension() {
        let backend = EmbeddedIndex::new(SearchIndex::open_in_ram().unwrap());
        backend.upsert(&record("/d/a.txt", "x", &[], 1)).await.unwrap();
        backend.upsert(&record("/d/b.txt", "x", &[], 1)).await.unwrap();
        backend.upsert(&record("/d/c.png", "x", &[], 1)).await.unwrap();
        backend.upsert(&record("/d/Makefile", "x", &[], 1)).await.unwrap();

        let counts = backend.count_by_extension().await.unwrap();
        assert_eq!(counts.get("txt"), Some(&2));
        assert_eq!(counts.get("png"), Some(&1));
        assert_eq!(counts.get("other"), Some(&1));
        assert_eq!(backend.count().await.unwrap(), 4);
        assert_eq!(backend.kind(), BackendKind::Embedded);
    }
}
