//! Topology / capability probe (§4.1, Component A).

use bson::doc;
use mongodb::Database;
use tracing::{debug, warn};

/// Capability level of the underlying database deployment.
/// `standalone < replicaset < fullstack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Standalone,
    ReplicaSet,
    FullStack,
}

/// The capability set a tier maps to (§4.1).
#[derive(Debug, Clone, Copy, Default)]
pub struct Features {
    pub transactions: bool,
    pub change_streams: bool,
    pub text_search: bool,
    pub vector_search: bool,
    pub rank_fusion: bool,
    pub score_fusion: bool,
}

impl Tier {
    fn features(self, server_version: &str) -> Features {
        match self {
            Self::Standalone => Features::default(),
            Self::ReplicaSet => Features {
                transactions: true,
                change_streams: true,
                ..Default::default()
            },
            Self::FullStack => {
                let (major, minor) = parse_major_minor(server_version);
                Features {
                    transactions: true,
                    change_streams: true,
                    text_search: true,
                    vector_search: true,
                    rank_fusion: major > 8 || (major == 8 && minor >= 0),
                    score_fusion: major > 8 || (major == 8 && minor >= 2),
                }
            },
        }
    }
}

fn parse_major_minor(version: &str) -> (u32, u32) {
    let mut parts = version.split('.');
    let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor)
}

/// Result of `detectTopology` (§4.1): cached once per manager instance.
#[derive(Debug, Clone)]
pub struct Topology {
    pub tier: Tier,
    pub is_replica_set: bool,
    pub replica_set_name: Option<String>,
    pub server_version: String,
    pub has_search_engine: bool,
    pub has_transactions: bool,
    pub features: Features,
}

/// Probes `db`'s deployment and maps it to a [`Topology`]. Runs once at
/// startup; the manager caches the result for the lifetime of the
/// connection (§4.1).
pub async fn detect_topology(db: &Database) -> Topology {
    let (is_replica_set, replica_set_name) = probe_replica_set(db).await;
    let server_version = probe_server_version(db).await;
    let has_search_engine = probe_search_engine(db).await;
    let has_transactions = is_replica_set || probe_trivial_transaction(db).await;

    let tier = if is_replica_set && has_search_engine {
        Tier::FullStack
    } else if is_replica_set {
        Tier::ReplicaSet
    } else {
        Tier::Standalone
    };

    let features = tier.features(&server_version);

    debug!(?tier, %server_version, has_search_engine, "topology detected");

    Topology {
        tier,
        is_replica_set,
        replica_set_name,
        server_version,
        has_search_engine,
        has_transactions,
        features,
    }
}

async fn probe_replica_set(db: &Database) -> (bool, Option<String>) {
    match db
        .run_command(doc! { "replSetGetStatus": 1 })
        .await
    {
        Ok(status) => {
            let set_name = status.get_str("set").ok().map(str::to_string);
            (true, set_name)
        },
        Err(e) => {
            debug!(error = %e, "replSetGetStatus failed, assuming standalone");
            (false, None)
        },
    }
}

async fn probe_server_version(db: &Database) -> String {
    match db.run_command(doc! { "buildInfo": 1 }).await {
        Ok(info) => info
            .get_str("version")
            .map(str::to_string)
            .unwrap_or_else(|_| "unknown".to_string()),
        Err(e) => {
            warn!(error = %e, "buildInfo failed");
            "unknown".to_string()
        },
    }
}

async fn probe_search_engine(db: &Database) -> bool {
    // Listing search indexes on a placeholder collection succeeds (possibly
    // with zero results) when the search engine (mongot) is reachable, and
    // fails with an "unsupported"-shaped error otherwise.
    match db
        .run_command(doc! { "listSearchIndexes": "__clawmem_probe__" })
        .await
    {
        Ok(_) => true,
        Err(e) => {
            let msg = e.to_string().to_lowercase();
            !(msg.contains("unsupported") || msg.contains("not supported") || msg.contains("unknown command"))
        },
    }
}

async fn probe_trivial_transaction(db: &Database) -> bool {
    let client = db.client();
    let mut session = match client.start_session().await {
        Ok(s) => s,
        Err(_) => return false,
    };
    session.start_transaction().await.is_ok() && session.abort_transaction().await.is_ok()
}

/// `true` when the error from a write indicates the server lacks
/// transaction support (§4.5's degrade condition: codes 20/263 or the
/// "Transaction numbers are only allowed on a replica set" message).
pub fn is_transaction_unsupported_error(err: &mongodb::error::Error) -> bool {
    let msg = err.to_string();
    msg.contains("Transaction numbers are only allowed on a replica set")
        || matches!(err.kind.as_ref(), mongodb::error::ErrorKind::Command(cmd_err) if cmd_err.code == 20 || cmd_err.code == 263)
}
