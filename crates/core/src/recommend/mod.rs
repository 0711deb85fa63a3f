//! Content-based recommendations: TF-IDF vectors over weighted item text,
//! ranked by cosine similarity. Vectors are rebuilt for every request.

pub mod tfidf;
pub mod tokenize;

use std::cmp::Ordering;

use crate::domain::item::{CatalogItem, ItemId, RecommendationCandidate};

pub use tfidf::{cosine_similarity, SimilarityMatrix, SparseVector, TfIdfModel};
pub use tokenize::tokenize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecommenderSettings {
    pub top_k: usize,
    pub name_weight: usize,
    pub max_corpus: usize,
}

impl Default for RecommenderSettings {
    fn default() -> Self {
        Self { top_k: 5, name_weight: 3, max_corpus: 500 }
    }
}

impl From<&crate::config::RecommendConfig> for RecommenderSettings {
    fn from(config: &crate::config::RecommendConfig) -> Self {
        Self { top_k: config.top_k, name_weight: config.name_weight, max_corpus: config.max_corpus }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CandidateRecommender {
    settings: RecommenderSettings,
}

impl CandidateRecommender {
    pub fn new(settings: RecommenderSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RecommenderSettings {
        &self.settings
    }

    /// Items most similar to `seed`, excluding the seed itself.
    ///
    /// Zero-score items are still eligible so a small catalog can fill `limit`.
    /// Returns nothing when fewer than two items are available or the seed is not
    /// among them.
    pub fn similar_to(
        &self,
        items: &[CatalogItem],
        seed: ItemId,
        limit: Option<usize>,
    ) -> Vec<RecommendationCandidate> {
        let corpus = self.corpus(items);
        if corpus.len() < 2 {
            return Vec::new();
        }
        let Some(seed_idx) = corpus.iter().position(|item| item.id == seed) else {
            return Vec::new();
        };

        let vectors = self.vectorize(&corpus, None);
        let matrix = SimilarityMatrix::from_vectors(&vectors);

        let scored = matrix
            .row(seed_idx)
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != seed_idx)
            .map(|(idx, score)| (corpus[idx], *score))
            .collect();

        self.rank(scored, limit)
    }

    /// Items most similar to `reference`, which need not be on sale itself. A
    /// purchased item is the usual reference: it is sold, so it joins the fit as an
    /// extra document instead of being looked up in the corpus.
    pub fn similar_to_reference(
        &self,
        items: &[CatalogItem],
        reference: &CatalogItem,
        limit: Option<usize>,
    ) -> Vec<RecommendationCandidate> {
        let mut corpus = self.corpus(items);
        corpus.retain(|item| item.id != reference.id);
        if corpus.is_empty() {
            return Vec::new();
        }

        let reference_tokens = tokenize(&reference.feature_text(self.settings.name_weight));
        let vectors = self.vectorize(&corpus, Some(&reference_tokens));
        let Some((reference_vector, item_vectors)) = vectors.split_last() else {
            return Vec::new();
        };

        let scored = corpus
            .iter()
            .zip(item_vectors)
            .map(|(item, vector)| (*item, cosine_similarity(reference_vector, vector)))
            .collect();

        self.rank(scored, limit)
    }

    /// Items ranked against the keyword treated as one more document of the corpus.
    /// Items with no lexical overlap are dropped.
    pub fn matching_keyword(
        &self,
        items: &[CatalogItem],
        keyword: &str,
        limit: Option<usize>,
    ) -> Vec<RecommendationCandidate> {
        let query_tokens = tokenize(keyword);
        if query_tokens.is_empty() {
            return Vec::new();
        }

        let corpus = self.corpus(items);
        if corpus.len() < 2 {
            return Vec::new();
        }

        let vectors = self.vectorize(&corpus, Some(&query_tokens));
        let Some((query, item_vectors)) = vectors.split_last() else {
            return Vec::new();
        };

        let scored = corpus
            .iter()
            .zip(item_vectors)
            .map(|(item, vector)| (*item, cosine_similarity(query, vector)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        self.rank(scored, limit)
    }

    /// Available items, newest first, capped at `max_corpus`.
    fn corpus<'a>(&self, items: &'a [CatalogItem]) -> Vec<&'a CatalogItem> {
        let mut corpus: Vec<&CatalogItem> =
            items.iter().filter(|item| item.is_available()).collect();
        corpus.sort_by(|left, right| newest_first(left, right));
        corpus.dedup_by_key(|item| item.id);
        corpus.truncate(self.settings.max_corpus.max(2));
        corpus
    }

    fn vectorize(&self, corpus: &[&CatalogItem], query: Option<&[String]>) -> Vec<SparseVector> {
        let mut documents: Vec<Vec<String>> = corpus
            .iter()
            .map(|item| tokenize(&item.feature_text(self.settings.name_weight)))
            .collect();
        if let Some(query) = query {
            documents.push(query.to_vec());
        }

        let model = TfIdfModel::fit(&documents);
        documents.iter().map(|tokens| model.transform(tokens)).collect()
    }

    fn rank(
        &self,
        mut scored: Vec<(&CatalogItem, f64)>,
        limit: Option<usize>,
    ) -> Vec<RecommendationCandidate> {
        scored.sort_by(|(left, left_score), (right, right_score)| {
            right_score.total_cmp(left_score).then_with(|| newest_first(left, right))
        });

        let limit = limit.unwrap_or(self.settings.top_k);
        scored
            .into_iter()
            .take(limit)
            .map(|(item, score)| RecommendationCandidate::from_item(item, score))
            .collect()
    }
}

fn newest_first(left: &CatalogItem, right: &CatalogItem) -> Ordering {
    right.created_at.cmp(&left.created_at).then_with(|| right.id.cmp(&left.id))
}
