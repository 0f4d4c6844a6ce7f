//! Agent tool surface (§6): `memory_search`, `memory_get`, `kb_search`, and
//! `memory_write`, each a thin [`AgentTool`] wrapper over [`MemoryManager`].

use std::sync::Arc;

use moltis_agents::tool_registry::AgentTool;
use {async_trait::async_trait, serde_json::json};

use crate::{
    manager::{MemoryManager, SearchOptions},
    structured::StructuredMemoryWrite,
};

fn result_json(r: &crate::search::SearchResult) -> serde_json::Value {
    json!({
        "chunk_id": r.chunk_id,
        "path": r.path,
        "source": r.source,
        "start_line": r.start_line,
        "end_line": r.end_line,
        "score": r.score,
        "text": r.text,
    })
}

/// `memory_search(query, maxResults?, minScore?)` (§6).
pub struct MemorySearchTool {
    manager: Arc<MemoryManager>,
}

impl MemorySearchTool {
    pub fn new(manager: Arc<MemoryManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl AgentTool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search agent memory using hybrid vector + keyword search. Returns relevant chunks from workspace memory files and session transcripts."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                },
                "maxResults": {
                    "type": "integer",
                    "description": "Maximum number of results to return",
                    "default": 5
                },
                "minScore": {
                    "type": "number",
                    "description": "Minimum relevance score to include a result",
                    "default": 0.0
                },
                "sessionKey": {
                    "type": "string",
                    "description": "Scopes the search: the sentinels '__memory__'/'__sessions__' restrict to workspace memory or session transcripts; any other value is treated as a chat/session identifier and classified as direct/group/channel to gate citation formatting"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let query = params["query"].as_str().ok_or_else(|| anyhow::anyhow!("missing 'query' parameter"))?;
        let opts = SearchOptions {
            max_results: params["maxResults"].as_u64().unwrap_or(5) as usize,
            min_score: params["minScore"].as_f64().unwrap_or(0.0) as f32,
            source_filter: None,
            session_key: params["sessionKey"].as_str().map(str::to_string),
            include_kb: false,
            include_structured: true,
        };

        let outcome = self.manager.search(query, opts).await?;
        let items: Vec<serde_json::Value> = outcome.results.iter().map(result_json).collect();

        let mut response = json!({
            "results": items,
            "citationsApplied": outcome.citations_applied,
        });
        if let Some(hint) = outcome.hint {
            response["hint"] = json!(hint);
        }
        Ok(response)
    }
}

/// `memory_get(path, from?, lines?)` (§6): reads a window of a
/// workspace-relative memory file, rejecting paths that escape the workspace.
pub struct MemoryGetTool {
    manager: Arc<MemoryManager>,
}

impl MemoryGetTool {
    pub fn new(manager: Arc<MemoryManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl AgentTool for MemoryGetTool {
    fn name(&self) -> &str {
        "memory_get"
    }

    fn description(&self) -> &str {
        "Read a window of lines from a workspace-relative memory file. Use this to see more context around a memory_search hit."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Workspace-relative path to read"
                },
                "from": {
                    "type": "integer",
                    "description": "1-based line number to start reading from"
                },
                "lines": {
                    "type": "integer",
                    "description": "Number of lines to read"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let path = params["path"].as_str().ok_or_else(|| anyhow::anyhow!("missing 'path' parameter"))?;
        let from = params["from"].as_u64().map(|n| n as usize);
        let lines = params["lines"].as_u64().map(|n| n as usize);

        match self.manager.read_file(path, from, lines).await {
            Ok(text) => Ok(json!({ "path": path, "text": text })),
            Err(e) => Ok(json!({ "error": e.to_string(), "path": path })),
        }
    }
}

/// `kb_search(query, maxResults?)` (§6), gated to mongodb-backed managers by
/// registration, not by a predicate inside this tool.
pub struct KbSearchTool {
    manager: Arc<MemoryManager>,
}

impl KbSearchTool {
    pub fn new(manager: Arc<MemoryManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl AgentTool for KbSearchTool {
    fn name(&self) -> &str {
        "kb_search"
    }

    fn description(&self) -> &str {
        "Search the knowledge base of ingested reference documents, separate from workspace memory."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                },
                "maxResults": {
                    "type": "integer",
                    "description": "Maximum number of results to return",
                    "default": 5
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let query = params["query"].as_str().ok_or_else(|| anyhow::anyhow!("missing 'query' parameter"))?;
        let max_results = params["maxResults"].as_u64().unwrap_or(5) as usize;

        let results = self.manager.kb_search(query, max_results).await?;
        let items: Vec<serde_json::Value> = results.iter().map(result_json).collect();
        Ok(json!({ "results": items }))
    }
}

/// `memory_write({type,key,value,context?,confidence?,tags?})` (§6, §4.9).
pub struct MemoryWriteTool {
    manager: Arc<MemoryManager>,
    agent_id: String,
}

impl MemoryWriteTool {
    pub fn new(manager: Arc<MemoryManager>, agent_id: impl Into<String>) -> Self {
        Self {
            manager,
            agent_id: agent_id.into(),
        }
    }
}

#[async_trait]
impl AgentTool for MemoryWriteTool {
    fn name(&self) -> &str {
        "memory_write"
    }

    fn description(&self) -> &str {
        "Record a typed structured-memory observation (decision, preference, person, todo, fact, project, architecture, or custom) for later recall."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "type": {
                    "type": "string",
                    "description": "One of: decision, preference, person, todo, fact, project, architecture, custom"
                },
                "key": {
                    "type": "string",
                    "description": "Stable key this observation is filed under"
                },
                "value": {
                    "type": "string",
                    "description": "The observation's content"
                },
                "context": {
                    "type": "string",
                    "description": "Optional surrounding context"
                },
                "confidence": {
                    "type": "number",
                    "description": "Confidence in [0, 1], defaults to 0.8"
                },
                "tags": {
                    "type": "array",
                    "items": { "type": "string" }
                }
            },
            "required": ["type", "key", "value"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let kind = params["type"].as_str().ok_or_else(|| anyhow::anyhow!("missing 'type' parameter"))?;
        let key = params["key"].as_str().ok_or_else(|| anyhow::anyhow!("missing 'key' parameter"))?;
        let value = params["value"].as_str().ok_or_else(|| anyhow::anyhow!("missing 'value' parameter"))?;
        let tags = params["tags"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let write = StructuredMemoryWrite {
            kind: kind.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            context: params["context"].as_str().map(str::to_string),
            confidence: params["confidence"].as_f64(),
            tags,
            source: "agent".to_string(),
            agent_id: self.agent_id.clone(),
        };

        let result = self.manager.write_structured_memory(write).await?;
        Ok(json!({ "id": result.id, "upserted": result.upserted }))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use std::sync::Arc;

    use async_trait::async_trait;
    use moltis_config::MemoryConfig;
    use tempfile::TempDir;

    use super::*;
    use crate::{embeddings::EmbeddingProvider, store::MockStore, sync::SyncReason};

    const KEYWORDS: [&str; 8] = ["rust", "python", "database", "memory", "search", "network", "cooking", "music"];

    struct MockEmbedder;

    #[async_trait]
    impl EmbeddingProvider for MockEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            let lower = text.to_lowercase();
            Ok(KEYWORDS.iter().map(|kw| if lower.contains(kw) { 1.0 } else { 0.0 }).collect())
        }

        fn model_name(&self) -> &str {
            "mock-model"
        }

        fn dimensions(&self) -> usize {
            KEYWORDS.len()
        }

        fn provider_key(&self) -> &str {
            "mock"
        }
    }

    fn setup_manager(workspace_root: std::path::PathBuf) -> Arc<MemoryManager> {
        let config = MemoryConfig {
            vector_weight: 0.7,
            keyword_weight: 0.3,
            ..Default::default()
        };
        let store: Arc<dyn crate::store::MemoryStore> = Arc::new(MockStore::new());
        let embedder: Option<Arc<dyn EmbeddingProvider>> = Some(Arc::new(MockEmbedder));
        MemoryManager::for_testing(config, "agent-1", workspace_root, store, embedder)
    }

    #[test]
    fn memory_search_tool_schema_requires_query() {
        let tmp = TempDir::new().unwrap();
        let manager = setup_manager(tmp.path().to_path_buf());
        let tool = MemorySearchTool::new(manager);
        assert_eq!(tool.name(), "memory_search");
        let schema = tool.parameters_schema();
        assert!(schema["required"].as_array().unwrap().contains(&json!("query")));
        assert!(schema["properties"]["sessionKey"].is_object());
    }

    #[tokio::test]
    async fn memory_search_tool_honors_session_key_sentinel() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("MEMORY.md"),
            "Rust is a systems programming language with great memory safety.",
        )
        .unwrap();
        let session_dir = tmp.path().join("memory").join("sessions");
        std::fs::create_dir_all(&session_dir).unwrap();
        std::fs::write(
            session_dir.join("s1.md"),
            "Rust is a systems programming language with great memory safety.",
        )
        .unwrap();
        let manager = setup_manager(tmp.path().to_path_buf());
        manager.sync(SyncReason::Manual).await.unwrap();

        let tool = MemorySearchTool::new(manager);
        let result = tool
            .execute(json!({ "query": "rust memory", "maxResults": 5, "sessionKey": "__sessions__" }))
            .await
            .unwrap();

        let results = result["results"].as_array().unwrap();
        assert!(!results.is_empty());
        assert!(results.iter().all(|r| r["source"].as_str().unwrap() == "sessions"));
    }

    #[test]
    fn memory_get_tool_schema_requires_path() {
        let tmp = TempDir::new().unwrap();
        let manager = setup_manager(tmp.path().to_path_buf());
        let tool = MemoryGetTool::new(manager);
        assert_eq!(tool.name(), "memory_get");
        let schema = tool.parameters_schema();
        assert!(schema["required"].as_array().unwrap().contains(&json!("path")));
        assert!(!schema["required"].as_array().unwrap().contains(&json!("chunk_id")));
    }

    #[tokio::test]
    async fn memory_search_tool_execute_finds_synced_content() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("MEMORY.md"),
            "Rust is a systems programming language with great memory safety.",
        )
        .unwrap();
        let manager = setup_manager(tmp.path().to_path_buf());
        manager.sync(SyncReason::Manual).await.unwrap();

        let tool = MemorySearchTool::new(manager);
        let result = tool.execute(json!({ "query": "rust memory", "maxResults": 3 })).await.unwrap();

        let results = result["results"].as_array().unwrap();
        assert!(!results.is_empty());
        assert!(results[0]["text"].as_str().unwrap().contains("Rust"));
    }

    #[tokio::test]
    async fn memory_search_tool_missing_query_errors() {
        let tmp = TempDir::new().unwrap();
        let manager = setup_manager(tmp.path().to_path_buf());
        let tool = MemorySearchTool::new(manager);
        assert!(tool.execute(json!({})).await.is_err());
    }

    #[tokio::test]
    async fn memory_get_tool_reads_requested_window() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("notes.md"), "one\ntwo\nthree\n").unwrap();
        let manager = setup_manager(tmp.path().to_path_buf());

        let tool = MemoryGetTool::new(manager);
        let result = tool.execute(json!({ "path": "notes.md", "from": 2, "lines": 1 })).await.unwrap();
        assert_eq!(result["text"].as_str().unwrap(), "two");
    }

    #[tokio::test]
    async fn memory_get_tool_rejects_escaping_path() {
        let tmp = TempDir::new().unwrap();
        let manager = setup_manager(tmp.path().to_path_buf());

        let tool = MemoryGetTool::new(manager);
        let result = tool.execute(json!({ "path": "../../etc/passwd" })).await.unwrap();
        assert!(result["error"].is_string());
    }

    #[tokio::test]
    async fn memory_write_tool_round_trips() {
        let tmp = TempDir::new().unwrap();
        let manager = setup_manager(tmp.path().to_path_buf());

        let tool = MemoryWriteTool::new(manager, "agent-1");
        let result = tool
            .execute(json!({
                "type": "preference",
                "key": "editor.indent",
                "value": "prefers tabs over spaces",
            }))
            .await
            .unwrap();
        assert!(result["upserted"].as_bool().unwrap());
    }

    #[tokio::test]
    async fn memory_write_tool_missing_field_errors() {
        let tmp = TempDir::new().unwrap();
        let manager = setup_manager(tmp.path().to_path_buf());

        let tool = MemoryWriteTool::new(manager, "agent-1");
        assert!(tool.execute(json!({ "type": "preference" })).await.is_err());
    }

    #[tokio::test]
    async fn kb_search_tool_schema_requires_query() {
        let tmp = TempDir::new().unwrap();
        let manager = setup_manager(tmp.path().to_path_buf());
        let tool = KbSearchTool::new(manager);
        assert_eq!(tool.name(), "kb_search");
        let schema = tool.parameters_schema();
        assert!(schema["required"].as_array().unwrap().contains(&json!("query")));
    }
}
