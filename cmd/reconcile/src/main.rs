//! Repairs derived counters for the identifiers given on the command line.
//!
//! Usage: `reconcile <id>...` where each id is an article (reply and like
//! counters of its whole thread) or a user (follower counter).
//! Exits non-zero when any repair failed.

use anyhow::Context;
use configs::Settings;
use domains::Identifier;
use services::RepairReport;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("loading settings")?;
    bootstrap::init_tracing(&settings.log)?;

    let ids = std::env::args()
        .skip(1)
        .map(|raw| Identifier::parse(&raw).with_context(|| format!("bad identifier {raw:?}")))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if ids.is_empty() {
        println!("Usage: reconcile <identifier>...");
        return Ok(());
    }

    let core = bootstrap::build_core(&settings).await?;
    let mut total = RepairReport::default();
    for id in &ids {
        match core.reconciler.repair(id).await {
            Ok(report) => {
                for fix in &report.fixed {
                    println!("{}\t{}\t{} -> {}", fix.id, fix.field, fix.was, fix.now);
                }
                total.merge(report);
            }
            Err(err) => {
                error!(%id, error = %err, "repair aborted");
                total.failed += 1;
            }
        }
    }

    info!(examined = total.examined, fixed = total.fixed.len(), failed = total.failed, "reconciliation done");
    if total.failed > 0 {
        anyhow::bail!("{} repairs failed", total.failed);
    }
    Ok(())
}
