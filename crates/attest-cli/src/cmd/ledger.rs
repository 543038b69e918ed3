use crate::output::{or_none, print_json, print_table};
use anyhow::Context;
use attest_core::ledger::{Ledger, LedgerAction, LedgerLock, UnlockOutcome};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum LedgerSubcommand {
    /// Recompute every hash link; fails on the first bad line
    Verify,

    /// List ledger entries
    Show {
        /// Only entries with this action (e.g. PACK_APPLIED, step_approved)
        #[arg(long)]
        action: Option<String>,

        /// Only entries targeting this artifact or run id
        #[arg(long)]
        target: Option<String>,

        /// Show only the last N matching entries
        #[arg(long)]
        last: Option<usize>,
    },

    /// Remove a writer lock left behind by a process that is gone
    Unlock {
        /// Remove the lock even if its holder may still be running
        #[arg(long)]
        force: bool,
    },
}

pub fn run(root: &Path, subcmd: LedgerSubcommand, json: bool) -> anyhow::Result<()> {
    let ledger = Ledger::for_root(root);
    match subcmd {
        LedgerSubcommand::Verify => verify(&ledger, json),
        LedgerSubcommand::Show {
            action,
            target,
            last,
        } => show(&ledger, action.as_deref(), target.as_deref(), last, json),
        LedgerSubcommand::Unlock { force } => unlock(&ledger, force, json),
    }
}

fn unlock(ledger: &Ledger, force: bool, json: bool) -> anyhow::Result<()> {
    let outcome = LedgerLock::unlock(ledger.path(), force)
        .context("ledger lock not removed; pass --force if its holder is gone")?;
    if json {
        return print_json(&outcome);
    }
    match outcome {
        UnlockOutcome::NotLocked => println!("Ledger is not locked."),
        UnlockOutcome::Removed { pid } => println!(
            "Removed ledger lock (holder pid {})",
            pid.map_or_else(|| "unknown".to_string(), |p| p.to_string())
        ),
    }
    Ok(())
}

fn verify(ledger: &Ledger, json: bool) -> anyhow::Result<()> {
    let report = ledger
        .verify()
        .with_context(|| format!("{} failed verification", ledger.path().display()))?;
    if json {
        print_json(&report)?;
    } else {
        println!(
            "Ledger OK: {} entries, last hash {}",
            report.entries, report.last_hash
        );
    }
    Ok(())
}

fn show(
    ledger: &Ledger,
    action: Option<&str>,
    target: Option<&str>,
    last: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let action = action.map(str::parse::<LedgerAction>).transpose()?;
    let mut entries: Vec<_> = ledger
        .entries()?
        .into_iter()
        .filter(|e| action.is_none_or(|a| e.action == a))
        .filter(|e| target.is_none_or(|t| e.target_artifact_id == t))
        .collect();
    if let Some(n) = last {
        let skip = entries.len().saturating_sub(n);
        entries.drain(..skip);
    }

    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No ledger entries.");
        return Ok(());
    }
    let rows = entries
        .iter()
        .map(|e| {
            vec![
                e.ledger_seq.to_string(),
                e.timestamp_utc.clone(),
                e.action.to_string(),
                e.actor.clone(),
                e.target_artifact_id.clone(),
                or_none(e.evidence_ref.as_deref()),
            ]
        })
        .collect();
    print_table(&["SEQ", "TIMESTAMP", "ACTION", "ACTOR", "TARGET", "EVIDENCE"], rows);
    Ok(())
}
