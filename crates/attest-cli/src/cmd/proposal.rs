use crate::output::{or_none, print_fields, print_json};
use anyhow::Context;
use attest_core::{
    approval::{self, NewProposal},
    config::Config,
    types::{RiskLevel, ValidationOutcome},
};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum ProposalSubcommand {
    /// Create a proposal linked to one or more signals
    Create {
        /// Linked signal id (repeatable, at least one)
        #[arg(long = "signal", required = true)]
        signals: Vec<String>,

        #[arg(long)]
        author: String,

        /// Component path the change targets
        #[arg(long)]
        target_path: String,

        #[arg(long, default_value = "*")]
        version_constraint: String,

        #[arg(long)]
        rationale: String,

        #[arg(long)]
        modification: String,

        /// LOW, MEDIUM or HIGH
        #[arg(long, default_value = "LOW")]
        risk: String,

        /// Proposal this one supersedes
        #[arg(long)]
        parent: Option<String>,
    },

    /// Record a validation result for a proposal
    Validate {
        id: String,

        /// PASS, FAIL, REGRESSION or ERROR
        #[arg(long)]
        outcome: String,

        #[arg(long, env = "ATTEST_ACTOR")]
        actor: String,

        #[arg(long, default_value = "")]
        summary: String,
    },

    /// Approve a validated proposal
    Approve {
        id: String,

        #[arg(long, env = "ATTEST_ACTOR")]
        actor: String,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Show the derived approval state of a proposal
    Status { id: String },
}

pub fn run(root: &Path, subcmd: ProposalSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ProposalSubcommand::Create {
            signals,
            author,
            target_path,
            version_constraint,
            rationale,
            modification,
            risk,
            parent,
        } => {
            let input = NewProposal {
                signal_ids: signals,
                author_id: author,
                target_path,
                version_constraint,
                rationale,
                proposed_modification: modification,
                risk_level: risk.parse::<RiskLevel>()?,
                parent_proposal_id: parent,
            };
            let (proposal, entry) =
                approval::create_proposal(root, &input).context("failed to create proposal")?;
            if json {
                print_json(&proposal)?;
            } else {
                println!(
                    "Created proposal {} (ledger seq {})",
                    proposal.governance_id, entry.ledger_seq
                );
            }
        }
        ProposalSubcommand::Validate {
            id,
            outcome,
            actor,
            summary,
        } => {
            let outcome = outcome.parse::<ValidationOutcome>()?;
            let (validation, entry) =
                approval::record_validation(root, &id, outcome, &actor, &summary)
                    .with_context(|| format!("failed to validate proposal '{id}'"))?;
            if json {
                print_json(&validation)?;
            } else {
                println!(
                    "Recorded {} validation {} for {id} (ledger seq {})",
                    validation.validation_outcome, validation.governance_id, entry.ledger_seq
                );
            }
        }
        ProposalSubcommand::Approve { id, actor, notes } => {
            let config = Config::load(root).context("failed to load config")?;
            let outcome = approval::approve(root, &config.approvers, &id, &actor, notes.as_deref())
                .with_context(|| format!("failed to approve proposal '{id}'"))?;
            if json {
                print_json(&outcome)?;
            } else {
                let state = if outcome.fully_approved {
                    "fully approved"
                } else {
                    "partially approved"
                };
                println!(
                    "Approved {id} as {actor}: {}/{} approvals, {state} (ledger seq {})",
                    outcome.approval_count, outcome.required_approvals, outcome.ledger_seq
                );
            }
        }
        ProposalSubcommand::Status { id } => {
            let status = approval::status(root, &id)?;
            if json {
                print_json(&status)?;
            } else {
                print_fields(&[
                    ("proposal", status.proposal_id.clone()),
                    ("risk level", status.risk_level.clone()),
                    ("state", status.state.to_string()),
                    ("latest validation", or_none(status.latest_validation.as_deref())),
                    ("validations", status.validation_count.to_string()),
                    (
                        "approvals",
                        format!("{}/{}", status.approval_count, status.required_approvals),
                    ),
                    ("approvers", status.approvers.join(", ")),
                ]);
            }
        }
    }
    Ok(())
}
