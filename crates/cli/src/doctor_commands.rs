//! `moltis doctor` — one-shot connectivity + capability + embedding-coverage
//! diagnostic, with an offer to auto-provision when nothing is reachable
//! (§4.11, §4.12).

use anyhow::Result;
use serde_json::json;

use moltis_memory::{
    doctor::{run_doctor, DoctorReport},
    provisioner::{attempt_auto_setup, ProvisionOutcome, ProvisionSource, SilentPrompter},
};

pub async fn handle_doctor(json: bool) -> Result<()> {
    let config = moltis_config::discover_and_load();
    let mut report = run_doctor(&config).await;

    if !report.connected {
        let outcome = attempt_auto_setup(&SilentPrompter).await;
        if let ProvisionOutcome::Success { ref uri, .. } = outcome {
            let mut retried = config.clone();
            retried.uri = uri.clone();
            report = run_doctor(&retried).await;
        }
        print_provision_outcome(&outcome, json);
    }

    if json {
        print_json(&report)?;
    } else {
        print_human(&report);
    }

    if !report.is_healthy() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_provision_outcome(outcome: &ProvisionOutcome, json: bool) {
    if json {
        return;
    }
    match outcome {
        ProvisionOutcome::Success { tier, source, .. } => {
            let source = match source {
                ProvisionSource::ExistingInstance => "an existing instance",
                ProvisionSource::AlreadyRunningContainer => "an already-running container",
                ProvisionSource::AutoStarted => "a freshly started container",
            };
            println!("auto-provisioner: connected via {source} ({tier:?} tier)");
        },
        ProvisionOutcome::Failed { reason } => {
            println!("auto-provisioner: {reason}");
        },
    }
}

fn print_json(report: &DoctorReport) -> Result<()> {
    let value = json!({
        "uri": report.uri_redacted,
        "connected": report.connected,
        "connectionError": report.connection_error,
        "healthy": report.is_healthy(),
        "topology": report.topology.as_ref().map(|t| json!({
            "tier": format!("{:?}", t.tier),
            "isReplicaSet": t.is_replica_set,
            "replicaSetName": t.replica_set_name,
            "serverVersion": t.server_version,
            "hasSearchEngine": t.has_search_engine,
            "hasTransactions": t.has_transactions,
            "features": {
                "transactions": t.features.transactions,
                "changeStreams": t.features.change_streams,
                "textSearch": t.features.text_search,
                "vectorSearch": t.features.vector_search,
                "rankFusion": t.features.rank_fusion,
                "scoreFusion": t.features.score_fusion,
            },
        })),
        "embeddingCoverage": report.embedding_coverage.as_ref().map(|c| json!({
            "success": c.success,
            "failed": c.failed,
            "pending": c.pending,
            "total": c.total,
        })),
        "remediations": report.remediations,
    });
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_human(report: &DoctorReport) {
    println!("uri:       {}", report.uri_redacted);
    println!("connected: {}", report.connected);
    if let Some(ref err) = report.connection_error {
        println!("error:     {err}");
    }

    if let Some(ref topology) = report.topology {
        println!("tier:      {:?}", topology.tier);
        println!("server:    {}", topology.server_version);
        println!(
            "features:  transactions={} changeStreams={} textSearch={} vectorSearch={} rankFusion={} scoreFusion={}",
            topology.features.transactions,
            topology.features.change_streams,
            topology.features.text_search,
            topology.features.vector_search,
            topology.features.rank_fusion,
            topology.features.score_fusion,
        );
    }

    if let Some(ref coverage) = report.embedding_coverage {
        println!(
            "embeddings: {}/{} succeeded, {} failed, {} pending",
            coverage.success, coverage.total, coverage.failed, coverage.pending
        );
    }

    if report.remediations.is_empty() {
        println!("status:    healthy");
    } else {
        println!("status:    needs attention");
        for hint in &report.remediations {
            println!("  - {hint}");
        }
    }
}
