use crate::cmd::gate::PolicyArgs;
use crate::output::{or_none, print_fields, print_json, print_table};
use anyhow::Context;
use attest_core::{audit::summarize_run, config::Config, ledger::Ledger, types::ApprovalMode};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum RunSubcommand {
    /// Log run_started with the effective approval policy
    Start {
        run_id: String,

        #[command(flatten)]
        policy: PolicyArgs,
    },

    /// Log run_completed
    Complete {
        run_id: String,

        /// Number of pipeline steps that finished
        #[arg(long)]
        steps: u32,

        #[command(flatten)]
        policy: PolicyArgs,
    },

    /// Summarize a run from its ledger entries
    Summary { run_id: String },
}

pub fn run(root: &Path, subcmd: RunSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        RunSubcommand::Start { run_id, policy } => {
            let entry = policy.controller(root, &load_config(root)?, &run_id)?.start_run()?;
            if json {
                print_json(&entry)?;
            } else {
                println!("Started run {run_id} (ledger seq {})", entry.ledger_seq);
            }
        }
        RunSubcommand::Complete {
            run_id,
            steps,
            policy,
        } => {
            let entry = policy.controller(root, &load_config(root)?, &run_id)?.complete_run(steps)?;
            if json {
                print_json(&entry)?;
            } else {
                println!("Completed run {run_id} (ledger seq {})", entry.ledger_seq);
            }
        }
        RunSubcommand::Summary { run_id } => {
            let summary = summarize_run(&Ledger::for_root(root), &run_id)?;
            if json {
                return print_json(&summary);
            }
            let meta = &summary.run_metadata;
            print_fields(&[
                ("run", summary.run_id.clone()),
                ("end state", summary.end_state.as_str().to_string()),
                ("failure", or_none(summary.failure_reason.as_deref())),
                ("profile", or_none(meta.governance_profile.as_deref())),
                ("auto approve", meta.auto_approve.to_string()),
                (
                    "approvals",
                    format!(
                        "{} manual, {} auto",
                        summary.approvals.manual, summary.approvals.auto
                    ),
                ),
            ]);
            let mut rows: Vec<Vec<String>> = summary
                .phase_gates
                .iter()
                .map(|g| {
                    vec![
                        g.step_idx.to_string(),
                        g.agent_name.clone(),
                        "phase_gate".to_string(),
                        String::new(),
                        mode(g.approval_mode),
                    ]
                })
                .collect();
            rows.extend(summary.risk_gates.iter().map(|g| {
                let mut m = mode(g.approval_mode);
                if g.overridden {
                    m.push_str(" (override)");
                }
                vec![
                    g.step_idx.to_string(),
                    g.agent_name.clone(),
                    "risk_gate".to_string(),
                    g.gate_reason.clone(),
                    m,
                ]
            }));
            if !rows.is_empty() {
                println!();
                rows.sort_by_key(|r| r[0].parse::<u32>().unwrap_or(0));
                print_table(&["STEP", "AGENT", "GATE", "REASON", "RESOLUTION"], rows);
            }
        }
    }
    Ok(())
}

fn load_config(root: &Path) -> anyhow::Result<Config> {
    Config::load(root).context("failed to load config")
}

fn mode(mode: Option<ApprovalMode>) -> String {
    match mode {
        Some(ApprovalMode::Manual) => "manual".to_string(),
        Some(ApprovalMode::Auto) => "auto".to_string(),
        None => "rejected".to_string(),
    }
}
