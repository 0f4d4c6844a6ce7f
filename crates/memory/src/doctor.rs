//! Doctor / health probe (§4.12, Component L): a one-shot diagnostic that
//! connects, runs the capability probe, reports embedding coverage, and
//! surfaces remediation hints. Does not hold the connection open afterward —
//! unlike [`crate::manager::MemoryManager`], there is no lifecycle here.

use std::time::Duration;

use mongodb::options::ClientOptions;

use moltis_config::MemoryConfig;

use crate::{
    capability::{detect_topology, Tier, Topology},
    error::redact_uri,
    store::{EmbeddingCoverage, MongoStore},
};

/// Server-selection timeout used for doctor probes only — tighter than the
/// manager's connect path (§5: "tightened to 5s for wizard probes").
const DOCTOR_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DoctorReport {
    pub uri_redacted: String,
    pub connected: bool,
    pub connection_error: Option<String>,
    pub topology: Option<Topology>,
    pub embedding_coverage: Option<EmbeddingCoverage>,
    pub remediations: Vec<String>,
}

impl DoctorReport {
    pub fn is_healthy(&self) -> bool {
        self.connected && self.remediations.is_empty()
    }
}

/// Runs every doctor check against `config`. Never panics; connection and
/// coverage failures are folded into the report as remediation hints rather
/// than propagated, since the whole point of `doctor` is to run even when
/// the deployment is broken.
pub async fn run_doctor(config: &MemoryConfig) -> DoctorReport {
    let uri_redacted = redact_uri(&config.uri);
    let mut remediations = Vec::new();

    let client_result = connect(config).await;
    let (client, connected, connection_error) = match client_result {
        Ok(client) => (Some(client), true, None),
        Err(e) => {
            remediations.push(format!("check the configured `uri` ({uri_redacted}) and that the server is reachable"));
            (None, false, Some(e))
        },
    };

    let mut topology = None;
    let mut embedding_coverage = None;

    if let Some(client) = client {
        let db = client.database(&config.database);
        let probed = detect_topology(&db).await;

        if probed.tier == Tier::Standalone {
            remediations.push(
                "topology is standalone: no transactions, change streams, or hybrid search — \
                 upgrade to a replica set (or full Atlas/mongot stack) for full capability"
                    .to_string(),
            );
        } else if !probed.features.vector_search {
            remediations.push(
                "replica set detected but no search engine found: vector/text hybrid search \
                 will fall back to plain $text search"
                    .to_string(),
            );
        }

        let store = MongoStore::new(db, config);
        match store.embedding_coverage().await {
            Ok(coverage) => {
                if coverage.total > 0 && coverage.failed > 0 {
                    remediations.push(format!(
                        "{} of {} chunks have embeddingStatus=failed: set the embedding provider's \
                         API key, or switch backend, then re-run sync",
                        coverage.failed, coverage.total
                    ));
                }
                embedding_coverage = Some(coverage);
            },
            Err(e) => remediations.push(format!("embedding coverage aggregation failed: {e}")),
        }

        topology = Some(probed);
    }

    DoctorReport {
        uri_redacted,
        connected,
        connection_error,
        topology,
        embedding_coverage,
        remediations,
    }
}

async fn connect(config: &MemoryConfig) -> Result<mongodb::Client, String> {
    let mut opts = ClientOptions::parse(&config.uri)
        .await
        .map_err(|e| format!("malformed uri: {e}"))?;
    opts.server_selection_timeout = Some(DOCTOR_TIMEOUT);
    opts.connect_timeout = Some(DOCTOR_TIMEOUT);
    mongodb::Client::with_options(opts).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_host_reports_connection_remediation() {
        let config = MemoryConfig {
            uri: "mongodb://203.0.113.1:27017/?connectTimeoutMS=200&serverSelectionTimeoutMS=200".to_string(),
            ..MemoryConfig::default()
        };
        let report = run_doctor(&config).await;
        assert!(!report.connected);
        assert!(!report.remediations.is_empty());
        assert!(report.remediations[0].contains("uri"));
    }

    #[test]
    fn is_healthy_requires_connection_and_no_remediations() {
        let report = DoctorReport {
            uri_redacted: "mongodb://localhost:27017".to_string(),
            connected: true,
            connection_error: None,
            topology: None,
            embedding_coverage: None,
            remediations: Vec::new(),
        };
        assert!(report.is_healthy());

        let mut unhealthy = report.clone();
        unhealthy.remediations.push("x".to_string());
        assert!(!unhealthy.is_healthy());
    }
}
