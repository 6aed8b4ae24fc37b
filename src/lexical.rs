//! BM25 lexical index over a fixed passage set
//!
//! Passages live in an in-RAM tantivy index; each carries its position in
//! the input slice as a stored id so scores can be read back per passage.

use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, Schema, Value, STORED, TEXT};
use tantivy::{doc, Index, IndexWriter, Searcher, TantivyDocument, Term};

/// Heap for the single indexing thread
const WRITER_HEAP_BYTES: usize = 20_000_000;

/// Lower-case and split on anything that is not a letter or digit.
///
/// Matches tantivy's default text analyzer, so query tokens line up with
/// indexed terms.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Read-only BM25 index. Built once, searched afterwards.
#[derive(Clone)]
pub struct Bm25Index {
    searcher: Searcher,
    text: Field,
    id: Field,
    len: usize,
}

impl Bm25Index {
    pub fn build<S: AsRef<str>>(passages: &[S]) -> tantivy::Result<Self> {
        let mut schema = Schema::builder();
        let text = schema.add_text_field("text", TEXT);
        let id = schema.add_u64_field("id", STORED);
        let index = Index::create_in_ram(schema.build());

        let mut writer: IndexWriter = index.writer_with_num_threads(1, WRITER_HEAP_BYTES)?;
        for (position, passage) in passages.iter().enumerate() {
            writer.add_document(doc!(id => position as u64, text => passage.as_ref()))?;
        }
        writer.commit()?;

        let reader = index.reader()?;
        Ok(Self {
            searcher: reader.searcher(),
            text,
            id,
            len: passages.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Scores for every passage, in input order. Passages sharing no term
    /// with the query score 0.
    pub fn scores(&self, query_tokens: &[String]) -> tantivy::Result<Vec<f64>> {
        let mut scores = vec![0.0; self.len];
        if self.len == 0 || query_tokens.is_empty() {
            return Ok(scores);
        }

        let clauses: Vec<(Occur, Box<dyn Query>)> = query_tokens
            .iter()
            .map(|token| {
                let term = Term::from_field_text(self.text, token);
                let query: Box<dyn Query> = Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs));
                (Occur::Should, query)
            })
            .collect();
        let query = BooleanQuery::new(clauses);

        let hits = self.searcher.search(&query, &TopDocs::with_limit(self.len))?;
        for (score, address) in hits {
            let doc: TantivyDocument = self.searcher.doc(address)?;
            let position = doc.get_first(self.id).and_then(|v| v.as_u64());
            if let Some(slot) = position.and_then(|p| scores.get_mut(p as usize)) {
                *slot = score as f64;
            }
        }
        Ok(scores)
    }
}
