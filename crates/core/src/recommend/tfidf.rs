use std::collections::{HashMap, HashSet};

/// Sparse, L2-normalized term weights sorted by column index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SparseVector {
    entries: Vec<(usize, f64)>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dot(&self, other: &SparseVector) -> f64 {
        let (mut left, mut right) = (0, 0);
        let mut sum = 0.0;
        while left < self.entries.len() && right < other.entries.len() {
            let (left_idx, left_weight) = self.entries[left];
            let (right_idx, right_weight) = other.entries[right];
            match left_idx.cmp(&right_idx) {
                std::cmp::Ordering::Less => left += 1,
                std::cmp::Ordering::Greater => right += 1,
                std::cmp::Ordering::Equal => {
                    sum += left_weight * right_weight;
                    left += 1;
                    right += 1;
                }
            }
        }
        sum
    }
}

/// Cosine similarity of two normalized vectors, clamped to `[0, 1]`.
pub fn cosine_similarity(a: &SparseVector, b: &SparseVector) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    a.dot(b).clamp(0.0, 1.0)
}

/// Vocabulary and smoothed idf learned from one corpus.
#[derive(Clone, Debug)]
pub struct TfIdfModel {
    token_to_idx: HashMap<String, usize>,
    idf: Vec<f64>,
}

impl TfIdfModel {
    /// Fits on tokenized documents with idf = ln((1 + n) / (1 + df)) + 1.
    pub fn fit(documents: &[Vec<String>]) -> Self {
        let mut token_to_idx: HashMap<String, usize> = HashMap::new();
        let mut doc_freq: Vec<usize> = Vec::new();

        for tokens in documents {
            let mut seen: HashSet<usize> = HashSet::new();
            for token in tokens {
                let next_idx = token_to_idx.len();
                let idx = *token_to_idx.entry(token.clone()).or_insert(next_idx);
                if idx == doc_freq.len() {
                    doc_freq.push(0);
                }
                if seen.insert(idx) {
                    doc_freq[idx] += 1;
                }
            }
        }

        let n = documents.len() as f64;
        let idf = doc_freq.iter().map(|&df| ((1.0 + n) / (1.0 + df as f64)).ln() + 1.0).collect();

        Self { token_to_idx, idf }
    }

    pub fn vocabulary_size(&self) -> usize {
        self.idf.len()
    }

    /// Raw term counts times idf, L2-normalized. Unknown tokens are ignored.
    pub fn transform(&self, tokens: &[String]) -> SparseVector {
        let mut counts: HashMap<usize, f64> = HashMap::new();
        for token in tokens {
            if let Some(&idx) = self.token_to_idx.get(token) {
                *counts.entry(idx).or_insert(0.0) += 1.0;
            }
        }

        let mut entries: Vec<(usize, f64)> =
            counts.into_iter().map(|(idx, count)| (idx, count * self.idf[idx])).collect();
        entries.sort_by_key(|(idx, _)| *idx);

        let norm = entries.iter().map(|(_, weight)| weight * weight).sum::<f64>().sqrt();
        if norm == 0.0 {
            return SparseVector::default();
        }
        for (_, weight) in &mut entries {
            *weight /= norm;
        }

        SparseVector { entries }
    }
}

/// Dense pairwise cosine matrix over one request's documents.
#[derive(Clone, Debug, PartialEq)]
pub struct SimilarityMatrix {
    size: usize,
    values: Vec<f64>,
}

impl SimilarityMatrix {
    /// Each pair is computed once and mirrored; the diagonal is 1.0 for non-empty rows.
    pub fn from_vectors(vectors: &[SparseVector]) -> Self {
        let size = vectors.len();
        let mut values = vec![0.0; size * size];

        for i in 0..size {
            if !vectors[i].is_empty() {
                values[i * size + i] = 1.0;
            }
            for j in (i + 1)..size {
                let score = cosine_similarity(&vectors[i], &vectors[j]);
                values[i * size + j] = score;
                values[j * size + i] = score;
            }
        }

        Self { size, values }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        if row >= self.size || col >= self.size {
            return 0.0;
        }
        self.values[row * self.size + col]
    }

    pub fn row(&self, row: usize) -> &[f64] {
        if row >= self.size {
            return &[];
        }
        &self.values[row * self.size..(row + 1) * self.size]
    }
}
