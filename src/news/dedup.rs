//! Two-phase deduplication: exact-hash then TF-IDF cosine clustering (C2).
//!
//! No direct teacher counterpart — built from the spec's own description in
//! the teacher's plain-`f64`/`Vec` numerical style (cf. `risk.rs`'s
//! `VaRCalculator`, the teacher's closest "batch transform over a `Vec<f64>`"
//! precedent). Tokenization is manual (`char::is_alphanumeric` + whitespace
//! split) rather than via `regex`, matching the fact that the teacher's own
//! source never reaches for `regex` either.

use std::collections::{HashMap, HashSet};

use crate::models::Article;

const BODY_TOKEN_LIMIT: usize = 200;

/// Deduplicate a batch of articles in two phases:
///
/// 1. Drop articles whose normalized URL or normalized title exactly matches
///    a prior retained article in the batch.
/// 2. Cluster surviving articles by TF-IDF cosine similarity over
///    `title + first 200 body tokens`; within each cluster keep the article
///    with max relevance (ties: earliest `published_at`, then lexicographic
///    `id`).
///
/// Output is a subset of the input, in input order. Never panics on
/// degenerate input (empty / single article) — those are returned unchanged.
pub fn dedupe(batch: &[Article], similarity_threshold: f64) -> Vec<Article> {
    if batch.len() <= 1 {
        return batch.to_vec();
    }

    let phase1 = hash_dedupe(batch);
    if phase1.len() <= 1 {
        return phase1;
    }

    cluster_dedupe(&phase1, similarity_threshold)
}

fn hash_dedupe(batch: &[Article]) -> Vec<Article> {
    let mut seen_urls: HashSet<String> = HashSet::new();
    let mut seen_titles: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(batch.len());

    for article in batch {
        let url_key = article.normalized_url();
        let title_key = article.normalized_title();
        if seen_urls.contains(&url_key) || seen_titles.contains(&title_key) {
            continue;
        }
        seen_urls.insert(url_key);
        seen_titles.insert(title_key);
        out.push(article.clone());
    }
    out
}

fn tokenize(article: &Article) -> Vec<String> {
    let title_tokens = crate::models::normalize_text(&article.title)
        .split_whitespace()
        .map(|s| s.to_string())
        .collect::<Vec<_>>();
    let body_tokens = crate::models::normalize_text(&article.raw_text)
        .split_whitespace()
        .take(BODY_TOKEN_LIMIT)
        .map(|s| s.to_string())
        .collect::<Vec<_>>();
    let mut tokens = title_tokens;
    tokens.extend(body_tokens);
    tokens
}

/// Sparse TF-IDF vector as a token->weight map. IDF is computed over the
/// current batch only (spec §4.2: "not global, to avoid drift").
fn tfidf_vectors(docs: &[Vec<String>]) -> Vec<HashMap<String, f64>> {
    let n = docs.len() as f64;
    let mut doc_freq: HashMap<&str, usize> = HashMap::new();
    for doc in docs {
        let unique: HashSet<&str> = doc.iter().map(|s| s.as_str()).collect();
        for term in unique {
            *doc_freq.entry(term).or_insert(0) += 1;
        }
    }

    docs.iter()
        .map(|doc| {
            let mut tf: HashMap<String, f64> = HashMap::new();
            for term in doc {
                *tf.entry(term.clone()).or_insert(0.0) += 1.0;
            }
            let len = doc.len().max(1) as f64;
            let mut vec = HashMap::new();
            for (term, count) in tf {
                let tf_val = count / len;
                let df = *doc_freq.get(term.as_str()).unwrap_or(&1) as f64;
                // +1 smoothing avoids a zero IDF wiping out terms that occur
                // in every document of a tiny batch.
                let idf = (n / df).ln() + 1.0;
                vec.insert(term, tf_val * idf);
            }
            vec
        })
        .collect()
}

fn cosine_similarity(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let dot: f64 = shorter
        .iter()
        .filter_map(|(term, w)| longer.get(term).map(|w2| w * w2))
        .sum();
    let norm_a: f64 = a.values().map(|w| w * w).sum::<f64>().sqrt();
    let norm_b: f64 = b.values().map(|w| w * w).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Pick the representative of a cluster: max relevance, ties broken by
/// earliest `published_at`, then lexicographic `id`.
fn pick_representative<'a>(cluster: &[&'a Article]) -> &'a Article {
    cluster
        .iter()
        .copied()
        .max_by(|a, b| {
            a.relevance
                .partial_cmp(&b.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.published_at.cmp(&a.published_at))
                .then_with(|| b.id.cmp(&a.id))
        })
        .expect("cluster is non-empty")
}

fn cluster_dedupe(articles: &[Article], threshold: f64) -> Vec<Article> {
    let docs: Vec<Vec<String>> = articles.iter().map(tokenize).collect();
    let vectors = tfidf_vectors(&docs);

    // Union-find over indices, merging any pair whose cosine similarity
    // meets the threshold.
    let mut parent: Vec<usize> = (0..articles.len()).collect();
    fn find(parent: &mut [usize], x: usize) -> usize {
        if parent[x] != x {
            parent[x] = find(parent, parent[x]);
        }
        parent[x]
    }
    fn union(parent: &mut [usize], a: usize, b: usize) {
        let ra = find(parent, a);
        let rb = find(parent, b);
        if ra != rb {
            parent[ra] = rb;
        }
    }

    for i in 0..articles.len() {
        for j in (i + 1)..articles.len() {
            if cosine_similarity(&vectors[i], &vectors[j]) >= threshold {
                union(&mut parent, i, j);
            }
        }
    }

    let mut clusters: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..articles.len() {
        let root = find(&mut parent, i);
        clusters.entry(root).or_default().push(i);
    }

    let mut representatives: HashSet<String> = HashSet::new();
    for indices in clusters.values() {
        let refs: Vec<&Article> = indices.iter().map(|&i| &articles[i]).collect();
        representatives.insert(pick_representative(&refs).id.clone());
    }

    articles
        .iter()
        .filter(|a| representatives.contains(&a.id))
        .cloned()
        .collect()
}
