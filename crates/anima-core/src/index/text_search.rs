use anyhow::{Context, Result};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{self, Schema, Value as TantivyValue, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};

/// One row to feed into the lexical index.
#[derive(Debug, Clone)]
pub struct LexicalRow {
    pub chunk_id: String,
    pub document_id: String,
    pub ordinal: u32,
    pub text: String,
    pub source_filename: String,
}

/// A BM25 match with its stored payload.
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub chunk_id: String,
    pub document_id: String,
    pub ordinal: u32,
    pub text: String,
    pub source_filename: String,
    pub score: f32,
}

struct CollectionTextIndex {
    index: Index,
    reader: IndexReader,
    writer: parking_lot::Mutex<IndexWriter>,
    chunk_id_field: schema::Field,
    document_id_field: schema::Field,
    ordinal_field: schema::Field,
    text_field: schema::Field,
    source_field: schema::Field,
}

/// Per-collection full-text indexes, one Tantivy directory per collection.
pub struct LexicalStore {
    base_dir: PathBuf,
    indexes: DashMap<String, Arc<CollectionTextIndex>>,
}

impl LexicalStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir).ok();
        Self {
            base_dir,
            indexes: DashMap::new(),
        }
    }

    /// `chunk_id` and `document_id` must be STRING (indexed, not tokenized)
    /// so that `delete_term` and `TermQuery` lookups work correctly.
    fn build_schema() -> (
        Schema,
        schema::Field,
        schema::Field,
        schema::Field,
        schema::Field,
        schema::Field,
    ) {
        let mut sb = Schema::builder();
        let chunk_id = sb.add_text_field("chunk_id", STRING | STORED);
        let document_id = sb.add_text_field("document_id", STRING | STORED);
        let ordinal = sb.add_u64_field("ordinal", STORED);
        let text = sb.add_text_field("text", TEXT | STORED);
        let source = sb.add_text_field("source_filename", STRING | STORED);
        (sb.build(), chunk_id, document_id, ordinal, text, source)
    }

    fn collection_dir(&self, collection_id: &str) -> PathBuf {
        self.base_dir.join(collection_id)
    }

    pub fn collection_exists(&self, collection_id: &str) -> bool {
        self.indexes.contains_key(collection_id) || self.collection_dir(collection_id).is_dir()
    }

    /// Idempotent partition creation.
    pub fn create_collection(&self, collection_id: &str) -> Result<()> {
        self.open_or_create(collection_id).map(|_| ())
    }

    fn open_or_create(&self, collection_id: &str) -> Result<Arc<CollectionTextIndex>> {
        if let Some(existing) = self.indexes.get(collection_id) {
            return Ok(existing.clone());
        }

        let dir = self.collection_dir(collection_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create index dir {}", dir.display()))?;

        let (schema, chunk_id_field, document_id_field, ordinal_field, text_field, source_field) =
            Self::build_schema();

        let mmap_dir = tantivy::directory::MmapDirectory::open(&dir)?;
        let index = if Index::exists(&mmap_dir)? {
            Index::open_in_dir(&dir)?
        } else {
            Index::create_in_dir(&dir, schema)?
        };

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("Failed to create Tantivy reader")?;

        let writer = index
            .writer(50_000_000)
            .context("Failed to create Tantivy writer")?;

        let entry = Arc::new(CollectionTextIndex {
            index,
            reader,
            writer: parking_lot::Mutex::new(writer),
            chunk_id_field,
            document_id_field,
            ordinal_field,
            text_field,
            source_field,
        });
        self.indexes
            .insert(collection_id.to_string(), entry.clone());
        Ok(entry)
    }

    fn get_existing(&self, collection_id: &str) -> Result<Option<Arc<CollectionTextIndex>>> {
        if !self.collection_exists(collection_id) {
            return Ok(None);
        }
        self.open_or_create(collection_id).map(Some)
    }

    /// Index a batch of rows, overwriting any existing rows with the same
    /// chunk_id, and commit.
    pub fn index_batch(&self, collection_id: &str, rows: &[LexicalRow]) -> Result<()> {
        let entry = self.open_or_create(collection_id)?;
        {
            let writer = entry.writer.lock();
            for row in rows {
                let term =
                    tantivy::Term::from_field_text(entry.chunk_id_field, &row.chunk_id);
                writer.delete_term(term);
                writer.add_document(doc!(
                    entry.chunk_id_field => row.chunk_id.as_str(),
                    entry.document_id_field => row.document_id.as_str(),
                    entry.ordinal_field => row.ordinal as u64,
                    entry.text_field => row.text.as_str(),
                    entry.source_field => row.source_filename.as_str(),
                ))?;
            }
        }
        self.commit(&entry)?;
        Ok(())
    }

    fn commit(&self, entry: &CollectionTextIndex) -> Result<()> {
        let mut writer = entry.writer.lock();
        writer.commit().context("Tantivy commit failed")?;
        entry.reader.reload()?;
        Ok(())
    }

    /// BM25 search, best first. Returns `None` when the partition is missing.
    pub fn search(
        &self,
        collection_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Option<Vec<LexicalHit>>> {
        let Some(entry) = self.get_existing(collection_id)? else {
            return Ok(None);
        };

        let searcher = entry.reader.searcher();
        let query_parser = QueryParser::for_index(&entry.index, vec![entry.text_field]);

        let parsed_query = match query_parser.parse_query(query) {
            Ok(q) => q,
            Err(_) => {
                let escaped_query = query.replace('"', "");
                query_parser.parse_query(&format!("\"{}\"", escaped_query))?
            }
        };

        let top_docs = searcher.search(&parsed_query, &TopDocs::with_limit(k))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            if let Ok(doc) = searcher.doc::<TantivyDocument>(doc_address) {
                if let Some(hit) = hit_from_doc(&entry, &doc, score) {
                    results.push(hit);
                }
            }
        }

        Ok(Some(results))
    }

    /// Retrieve one stored row by chunk id.
    pub fn get_by_id(&self, collection_id: &str, chunk_id: &str) -> Result<Option<LexicalHit>> {
        let Some(entry) = self.get_existing(collection_id)? else {
            return Ok(None);
        };

        let searcher = entry.reader.searcher();
        let term = tantivy::Term::from_field_text(entry.chunk_id_field, chunk_id);
        let term_query =
            tantivy::query::TermQuery::new(term, tantivy::schema::IndexRecordOption::Basic);
        let top_docs = searcher.search(&term_query, &TopDocs::with_limit(1))?;

        if let Some((_score, addr)) = top_docs.first() {
            if let Ok(doc) = searcher.doc::<TantivyDocument>(*addr) {
                return Ok(hit_from_doc(&entry, &doc, 0.0));
            }
        }
        Ok(None)
    }

    pub fn delete_document(&self, collection_id: &str, document_id: &str) -> Result<()> {
        let Some(entry) = self.get_existing(collection_id)? else {
            return Ok(());
        };
        {
            let writer = entry.writer.lock();
            let term = tantivy::Term::from_field_text(entry.document_id_field, document_id);
            writer.delete_term(term);
        }
        self.commit(&entry)
    }

    pub fn delete_collection(&self, collection_id: &str) -> Result<()> {
        self.indexes.remove(collection_id);
        let dir = self.collection_dir(collection_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove index dir {}", dir.display()))?;
            tracing::info!(collection_id = %collection_id, "Dropped lexical collection");
        }
        Ok(())
    }

    pub fn count(&self, collection_id: &str) -> Result<usize> {
        let Some(entry) = self.get_existing(collection_id)? else {
            return Ok(0);
        };
        let searcher = entry.reader.searcher();
        Ok(searcher.num_docs() as usize)
    }
}

fn hit_from_doc(
    entry: &CollectionTextIndex,
    doc: &TantivyDocument,
    score: f32,
) -> Option<LexicalHit> {
    let chunk_id = doc.get_first(entry.chunk_id_field)?.as_str()?.to_string();
    let text = doc.get_first(entry.text_field)?.as_str()?.to_string();
    Some(LexicalHit {
        chunk_id,
        document_id: doc
            .get_first(entry.document_id_field)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        ordinal: doc
            .get_first(entry.ordinal_field)
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        text,
        source_filename: doc
            .get_first(entry.source_field)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(chunk_id: &str, doc_id: &str, ordinal: u32, text: &str, source: &str) -> LexicalRow {
        LexicalRow {
            chunk_id: chunk_id.into(),
            document_id: doc_id.into(),
            ordinal,
            text: text.into(),
            source_filename: source.into(),
        }
    }

    #[test]
    fn index_search_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LexicalStore::new(tmp.path());

        store
            .index_batch(
                "col_a",
                &[
                    row("d1:0", "d1", 0, "the cat sat on the mat", "a.txt"),
                    row("d2:0", "d2", 0, "the dog ran in the park", "b.txt"),
                ],
            )
            .unwrap();

        let hits = store.search("col_a", "cat", 5).unwrap().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "d1:0");
        assert_eq!(hits[0].source_filename, "a.txt");
        assert!(hits[0].score > 0.0);

        store.delete_document("col_a", "d1").unwrap();
        let hits = store.search("col_a", "cat", 5).unwrap().unwrap();
        assert!(hits.is_empty());
        assert_eq!(store.count("col_a").unwrap(), 1);
    }

    #[test]
    fn reindexing_same_chunk_id_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LexicalStore::new(tmp.path());

        store
            .index_batch("col_a", &[row("d1:0", "d1", 0, "first version", "a.txt")])
            .unwrap();
        store
            .index_batch("col_a", &[row("d1:0", "d1", 0, "second version", "a.txt")])
            .unwrap();

        assert_eq!(store.count("col_a").unwrap(), 1);
        let hit = store.get_by_id("col_a", "d1:0").unwrap().unwrap();
        assert_eq!(hit.text, "second version");
    }

    #[test]
    fn missing_collection_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LexicalStore::new(tmp.path());
        assert!(store.search("ghost", "query", 5).unwrap().is_none());
        assert_eq!(store.count("ghost").unwrap(), 0);
    }

    #[test]
    fn collections_are_isolated() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LexicalStore::new(tmp.path());

        store
            .index_batch("col_a", &[row("a:0", "a", 0, "alpha corpus text", "a.txt")])
            .unwrap();
        store
            .index_batch("col_b", &[row("b:0", "b", 0, "beta corpus text", "b.txt")])
            .unwrap();

        let hits = store.search("col_a", "beta", 5).unwrap().unwrap();
        assert!(hits.is_empty());
        let hits = store.search("col_b", "beta", 5).unwrap().unwrap();
        assert_eq!(hits.len(), 1);

        store.delete_collection("col_a").unwrap();
        assert!(!store.collection_exists("col_a"));
        assert!(store.collection_exists("col_b"));
    }
}
