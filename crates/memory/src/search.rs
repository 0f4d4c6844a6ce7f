//! Hybrid search dispatcher (§4.7): tries server-side fusion first, falls
//! back through progressively cheaper tiers as deployment capability shrinks.
use std::collections::HashMap;

#[cfg(feature = "metrics")]
use metrics::{counter, histogram};

use moltis_config::CitationMode;
use tracing::debug;

use crate::{
    capability::Features,
    embeddings::EmbeddingProvider,
    store::{MemoryStore, Scope},
};

/// Reciprocal rank fusion, k=60 (§4.7 tier 3). Each input list is assumed
/// already sorted best-first; results absent from a list simply don't
/// contribute that list's term. Ties broken by insertion order across lists.
const RRF_K: f64 = 60.0;

/// Sigmoid normalization constant for BM25-like text scores (§4.7 "Score
/// normalisation": `x/(x+k)`). Mongo's `$text`/`$search` textScore is
/// unbounded but typically single-digit for a good match, so `k=10` maps a
/// strong hit near 0.5-0.9 without needing the caller to know the corpus's
/// score distribution.
const TEXT_SCORE_SIGMOID_K: f64 = 10.0;

/// How a raw score from a given search tier should be mapped into `[0,1]`
/// (§4.7 "Score normalisation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreKind {
    /// `$vectorSearch`'s cosine similarity — already roughly `[-1,1]`, clamp.
    Cosine,
    /// BM25-like keyword score (`$text`/`$search`) — unbounded, sigmoid.
    Bm25,
    /// A raw reciprocal-rank-fusion score (`Σ 1/(k+rank)`), whether produced
    /// client-side or by `$rankFusion` — multiply by `(k+1)`.
    Rrf,
    /// Already weighted-average-of-normalised-scores (`$scoreFusion`'s
    /// output) — just clamp defensively.
    PreNormalized,
}

/// Maps a raw score into `[0,1]` per §4.7: non-finite inputs become `0`
/// (negative infinity) or `1` (positive infinity; also covers NaN, which
/// should never occur but must not propagate past this boundary).
pub fn normalize_score(raw: f32, kind: ScoreKind) -> f32 {
    if raw.is_nan() {
        return 0.0;
    }
    if raw == f32::NEG_INFINITY {
        return 0.0;
    }
    if raw == f32::INFINITY {
        return 1.0;
    }
    match kind {
        ScoreKind::Cosine | ScoreKind::PreNormalized => raw.clamp(0.0, 1.0),
        ScoreKind::Bm25 => {
            let x = raw as f64;
            (x / (x + TEXT_SCORE_SIGMOID_K)) as f32
        },
        ScoreKind::Rrf => ((raw as f64) * (RRF_K + 1.0)).clamp(0.0, 1.0) as f32,
    }
}

/// Normalizes every result's score in place per `kind`.
pub fn normalize_results(results: &mut [SearchResult], kind: ScoreKind) {
    for r in results {
        r.score = normalize_score(r.score, kind);
    }
}

pub fn reciprocal_rank_fusion(result_lists: &[Vec<SearchResult>], limit: usize) -> Vec<SearchResult> {
    let mut scores: HashMap<String, (f64, SearchResult)> = HashMap::new();
    for list in result_lists {
        for (rank, result) in list.iter().enumerate() {
            let contribution = 1.0 / (RRF_K + (rank + 1) as f64);
            let entry = scores
                .entry(result.chunk_id.clone())
                .or_insert((0.0, result.clone()));
            entry.0 += contribution;
        }
    }
    let mut merged: Vec<SearchResult> = scores
        .into_values()
        .map(|(score, mut r)| {
            r.score = normalize_score(score as f32, ScoreKind::Rrf);
            r
        })
        .collect();
    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(limit);
    merged
}

/// A search result with metadata.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk_id: String,
    pub path: String,
    pub source: String,
    pub start_line: i64,
    pub end_line: i64,
    pub score: f32,
    pub text: String,
}

impl SearchResult {
    /// Format the result text with a citation appended.
    /// Format: `{text}\n\nSource: {path}#{start_line}`
    pub fn text_with_citation(&self) -> String {
        format!(
            "{}\n\nSource: {}#{}",
            self.text.trim(),
            self.path,
            self.start_line
        )
    }

    /// Determine whether to include citations based on mode and chat scope
    /// (§4.10: "`auto` shows citations in direct chats only").
    pub fn should_include_citations(mode: CitationMode, chat_scope: ChatScope) -> bool {
        match mode {
            CitationMode::On => true,
            CitationMode::Off => false,
            CitationMode::Auto => chat_scope == ChatScope::Direct,
        }
    }
}

/// Chat-scope classification parsed out of a `sessionKey` (§4.7, §4.10).
/// `Unknown` covers the sentinel keys (`__memory__`/`__sessions__`, which
/// scope the *source* filter rather than the chat kind) and any key in
/// which none of the `direct`/`group`/`channel` tokens appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatScope {
    Direct,
    Group,
    Channel,
    Unknown,
}

/// `__memory__` restricts to `source = "memory"`, `__sessions__` to
/// `source = "sessions"`; any other `sessionKey` is parsed for the tokens
/// `direct`/`group`/`channel` to classify the chat scope instead (§4.7).
pub fn parse_session_key(session_key: &str) -> (Option<&'static str>, ChatScope) {
    match session_key {
        "__memory__" => (Some("memory"), ChatScope::Unknown),
        "__sessions__" => (Some("sessions"), ChatScope::Unknown),
        other => {
            let lower = other.to_lowercase();
            let scope = if lower.contains("direct") {
                ChatScope::Direct
            } else if lower.contains("group") {
                ChatScope::Group
            } else if lower.contains("channel") {
                ChatScope::Channel
            } else {
                ChatScope::Unknown
            };
            (None, scope)
        },
    }
}

/// Dispatches a hybrid (vector + keyword) search through the capability
/// ladder described in §4.7:
///
/// 1. Server-side `$scoreFusion` (Mongo ≥8.2 with a search engine)
/// 2. Server-side `$rankFusion` (Mongo ≥8.0 with a search engine)
/// 3. Client-side reciprocal rank fusion over separate vector + text calls
/// 4. Vector-only or text-only, whichever the deployment actually supports
/// 5. Plain `$text` search as the last resort on a bare standalone
///
/// Each tier is attempted once; a tier that errors or reports itself
/// unsupported (`Ok(None)`) falls through to the next without failing the
/// whole call. Only a tier-5 failure propagates to the caller.
#[allow(clippy::too_many_arguments)]
pub async fn hybrid_search(
    store: &dyn MemoryStore,
    embedder: Option<&dyn EmbeddingProvider>,
    features: Features,
    scope: Scope,
    query: &str,
    limit: usize,
    vector_weight: f64,
    text_weight: f64,
    source_filter: Option<&str>,
) -> anyhow::Result<Vec<SearchResult>> {
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let fetch_limit = limit.saturating_mul(3).max(limit);
    let query_embedding = match embedder {
        Some(embedder) if features.vector_search => Some(embedder.embed(query).await?),
        _ => None,
    };

    let (tier, mut results) = if let Some(vector) = &query_embedding
        && features.score_fusion
        && let Some(mut r) = store
            .score_fusion_search(scope, vector, query, fetch_limit, vector_weight, text_weight, source_filter)
            .await?
    {
        normalize_results(&mut r, ScoreKind::PreNormalized);
        ("score_fusion", r)
    } else {
        fall_back(
            store,
            query_embedding.as_deref(),
            features,
            scope,
            query,
            fetch_limit,
            source_filter,
        )
        .await?
    };

    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(limit);
    backfill_text(store, scope, &mut results).await?;

    #[cfg(feature = "metrics")]
    {
        counter!("moltis_memory_searches_total", "search_type" => tier).increment(1);
        histogram!("moltis_memory_search_duration_seconds", "search_type" => tier)
            .record(start.elapsed().as_secs_f64());
    }
    #[cfg(not(feature = "metrics"))]
    let _ = tier;

    Ok(results)
}

/// Tiers 2-5 of §4.7, shared between the `score_fusion` miss path and the
/// no-embedder/no-vector-support path.
async fn fall_back(
    store: &dyn MemoryStore,
    vector: Option<&[f32]>,
    features: Features,
    scope: Scope,
    query: &str,
    fetch_limit: usize,
    source_filter: Option<&str>,
) -> anyhow::Result<(&'static str, Vec<SearchResult>)> {
    if let Some(vector) = vector {
        if features.rank_fusion {
            if let Some(mut results) = store
                .rank_fusion_search(scope, vector, query, fetch_limit, source_filter)
                .await?
            {
                normalize_results(&mut results, ScoreKind::Rrf);
                return Ok(("rank_fusion", results));
            }
            debug!("rankFusion reported unsupported, falling back to client-side RRF");
        }

        if features.text_search {
            let mut vector_results = store.vector_search(scope, vector, fetch_limit, source_filter).await?;
            normalize_results(&mut vector_results, ScoreKind::Cosine);
            let mut text_results = store.text_search(scope, query, fetch_limit, source_filter).await?;
            normalize_results(&mut text_results, ScoreKind::Bm25);
            return Ok((
                "client_rrf",
                reciprocal_rank_fusion(&[vector_results, text_results], fetch_limit),
            ));
        }

        let mut results = store.vector_search(scope, vector, fetch_limit, source_filter).await?;
        normalize_results(&mut results, ScoreKind::Cosine);
        return Ok(("vector_only", results));
    }

    let mut results = store.text_search(scope, query, fetch_limit, source_filter).await?;
    normalize_results(&mut results, ScoreKind::Bm25);
    Ok(("text_only", results))
}

/// Backfills `text` for any result whose `chunk_id` lookup path omitted it
/// (search pipelines that don't project the full document back).
async fn backfill_text(store: &dyn MemoryStore, scope: Scope, results: &mut [SearchResult]) -> anyhow::Result<()> {
    for result in results {
        if result.text.is_empty()
            && let Some(chunk) = store.get_chunk_by_id(scope, &result.chunk_id).await?
        {
            result.text = chunk.text;
        }
    }
    Ok(())
}

/// Keyword-only search when no embedding provider is configured at all
/// (§4.4's degraded mode).
pub async fn keyword_only_search(
    store: &dyn MemoryStore,
    scope: Scope,
    query: &str,
    limit: usize,
    source_filter: Option<&str>,
) -> anyhow::Result<Vec<SearchResult>> {
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    #[cfg(feature = "metrics")]
    counter!("moltis_memory_searches_total", "search_type" => "keyword").increment(1);

    let mut results = store.text_search(scope, query, limit, source_filter).await?;
    normalize_results(&mut results, ScoreKind::Bm25);
    backfill_text(store, scope, &mut results).await?;

    #[cfg(feature = "metrics")]
    histogram!("moltis_memory_search_duration_seconds", "search_type" => "keyword")
        .record(start.elapsed().as_secs_f64());

    Ok(results)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn make_result(id: &str, score: f32) -> SearchResult {
        SearchResult {
            chunk_id: id.into(),
            path: "test.md".into(),
            source: "daily".into(),
            start_line: 1,
            end_line: 5,
            score,
            text: String::new(),
        }
    }

    fn make_result_with_path(id: &str, path: &str, text: &str) -> SearchResult {
        SearchResult {
            chunk_id: id.into(),
            path: path.into(),
            source: "daily".into(),
            start_line: 10,
            end_line: 20,
            score: 0.9,
            text: text.into(),
        }
    }

    #[test]
    fn rrf_rewards_results_that_rank_well_in_both_lists() {
        let vector_results = vec![make_result("c1", 0.9), make_result("c2", 0.5)];
        let text_results = vec![make_result("c1", 0.8), make_result("c3", 0.7)];

        let merged = reciprocal_rank_fusion(&[vector_results, text_results], 10);

        // c1 ranks #1 in both lists: raw RRF score is 1/(60+1) + 1/(60+1),
        // normalized by x(60+1): (2/61) * 61 = 2.0, clamped to 1.0
        let c1 = merged.iter().find(|r| r.chunk_id == "c1").unwrap();
        assert!((c1.score - 1.0).abs() < 1e-6);

        // c2 and c3 rank #2 in exactly one list: 1/(60+2) raw, normalized to
        // (1/62) * 61
        let c2 = merged.iter().find(|r| r.chunk_id == "c2").unwrap();
        assert!((c2.score - ((1.0 / 62.0) * 61.0) as f32).abs() < 1e-5);

        // c1 appears in both lists so it should outrank anything in just one
        assert_eq!(merged[0].chunk_id, "c1");
    }

    #[test]
    fn normalize_score_clamps_cosine() {
        assert_eq!(normalize_score(-0.5, ScoreKind::Cosine), 0.0);
        assert_eq!(normalize_score(1.5, ScoreKind::Cosine), 1.0);
        assert_eq!(normalize_score(0.42, ScoreKind::Cosine), 0.42);
    }

    #[test]
    fn normalize_score_sigmoid_for_bm25() {
        let low = normalize_score(0.1, ScoreKind::Bm25);
        let high = normalize_score(50.0, ScoreKind::Bm25);
        assert!(low > 0.0 && low < 0.2);
        assert!(high > 0.8 && high < 1.0);
        assert!(high > low);
    }

    #[test]
    fn normalize_score_rrf_scales_by_k_plus_one() {
        let raw = 1.0 / 61.0;
        assert!((normalize_score(raw, ScoreKind::Rrf) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_score_maps_non_finite_to_bounds() {
        assert_eq!(normalize_score(f32::NEG_INFINITY, ScoreKind::Cosine), 0.0);
        assert_eq!(normalize_score(f32::INFINITY, ScoreKind::Bm25), 1.0);
        assert_eq!(normalize_score(f32::NAN, ScoreKind::Rrf), 0.0);
    }

    #[test]
    fn normalize_results_updates_every_score_in_place() {
        let mut results = vec![make_result("c1", -1.0), make_result("c2", 2.0)];
        normalize_results(&mut results, ScoreKind::Cosine);
        assert_eq!(results[0].score, 0.0);
        assert_eq!(results[1].score, 1.0);
    }

    #[test]
    fn rrf_of_empty_lists_is_empty() {
        let merged = reciprocal_rank_fusion(&[vec![], vec![]], 10);
        assert!(merged.is_empty());
    }

    #[test]
    fn rrf_truncates_to_limit() {
        let list: Vec<SearchResult> = (0..20).map(|i| make_result(&format!("c{i}"), 1.0)).collect();
        let merged = reciprocal_rank_fusion(&[list], 5);
        assert_eq!(merged.len(), 5);
    }

    #[test]
    fn test_text_with_citation() {
        let result = make_result_with_path("c1", "memory/notes.md", "Some important content");
        let cited = result.text_with_citation();
        assert_eq!(
            cited,
            "Some important content\n\nSource: memory/notes.md#10"
        );
    }

    #[test]
    fn test_text_with_citation_trims_whitespace() {
        let mut result = make_result_with_path("c1", "test.md", "  content with spaces  \n");
        result.start_line = 42;
        let cited = result.text_with_citation();
        assert_eq!(cited, "content with spaces\n\nSource: test.md#42");
    }

    #[test]
    fn test_should_include_citations_on() {
        assert!(SearchResult::should_include_citations(
            CitationMode::On,
            ChatScope::Unknown
        ));
    }

    #[test]
    fn test_should_include_citations_off() {
        assert!(!SearchResult::should_include_citations(
            CitationMode::Off,
            ChatScope::Direct
        ));
    }

    #[test]
    fn test_should_include_citations_auto_direct_chat() {
        assert!(SearchResult::should_include_citations(
            CitationMode::Auto,
            ChatScope::Direct
        ));
    }

    #[test]
    fn test_should_include_citations_auto_group_chat() {
        assert!(!SearchResult::should_include_citations(
            CitationMode::Auto,
            ChatScope::Group
        ));
    }

    #[test]
    fn test_should_include_citations_auto_channel_chat() {
        assert!(!SearchResult::should_include_citations(
            CitationMode::Auto,
            ChatScope::Channel
        ));
    }

    #[test]
    fn test_should_include_citations_auto_unknown_scope() {
        assert!(!SearchResult::should_include_citations(
            CitationMode::Auto,
            ChatScope::Unknown
        ));
    }

    #[test]
    fn test_parse_session_key_memory_sentinel() {
        assert_eq!(
            parse_session_key("__memory__"),
            (Some("memory"), ChatScope::Unknown)
        );
    }

    #[test]
    fn test_parse_session_key_sessions_sentinel() {
        assert_eq!(
            parse_session_key("__sessions__"),
            (Some("sessions"), ChatScope::Unknown)
        );
    }

    #[test]
    fn test_parse_session_key_direct_token() {
        assert_eq!(
            parse_session_key("direct:user-123"),
            (None, ChatScope::Direct)
        );
    }

    #[test]
    fn test_parse_session_key_group_token() {
        assert_eq!(
            parse_session_key("group-456"),
            (None, ChatScope::Group)
        );
    }

    #[test]
    fn test_parse_session_key_channel_token() {
        assert_eq!(
            parse_session_key("CHANNEL:general"),
            (None, ChatScope::Channel)
        );
    }

    #[test]
    fn test_parse_session_key_unrecognized() {
        assert_eq!(
            parse_session_key("some-opaque-id"),
            (None, ChatScope::Unknown)
        );
    }

    #[test]
    fn test_citation_mode_from_str() {
        assert_eq!("on".parse::<CitationMode>().unwrap(), CitationMode::On);
        assert_eq!("ON".parse::<CitationMode>().unwrap(), CitationMode::On);
        assert_eq!("true".parse::<CitationMode>().unwrap(), CitationMode::On);
        assert_eq!("always".parse::<CitationMode>().unwrap(), CitationMode::On);

        assert_eq!("off".parse::<CitationMode>().unwrap(), CitationMode::Off);
        assert_eq!("OFF".parse::<CitationMode>().unwrap(), CitationMode::Off);
        assert_eq!("false".parse::<CitationMode>().unwrap(), CitationMode::Off);
        assert_eq!("never".parse::<CitationMode>().unwrap(), CitationMode::Off);

        assert_eq!("auto".parse::<CitationMode>().unwrap(), CitationMode::Auto);
        assert_eq!(
            "anything".parse::<CitationMode>().unwrap(),
            CitationMode::Auto
        );
    }
}
