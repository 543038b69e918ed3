use crate::output::print_json;
use anyhow::Context;
use attest_core::approval::{create_signal, NewSignal, Signal, SourceType, SignalType};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum SignalSubcommand {
    /// Record a new signal and log SIGNAL_CREATED
    Create {
        /// pilot_feedback, operator_observation, automated_scorer or system_error
        #[arg(long)]
        source_type: String,

        /// Who or what produced the signal; becomes the ledger actor
        #[arg(long)]
        origin_id: String,

        /// complaint, observation, feature_request or bug_report
        #[arg(long = "type", value_name = "TYPE")]
        signal_type: String,

        /// One-line summary (at most 200 characters)
        #[arg(long)]
        summary: String,

        /// Full description of what was observed
        #[arg(long)]
        details: String,

        /// Affected artifact path (repeatable)
        #[arg(long = "artifact")]
        artifacts: Vec<String>,

        #[arg(long)]
        tenant: String,

        #[arg(long)]
        course: Option<String>,
    },

    /// Show a stored signal
    Show { id: String },
}

pub fn run(root: &Path, subcmd: SignalSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        SignalSubcommand::Create {
            source_type,
            origin_id,
            signal_type,
            summary,
            details,
            artifacts,
            tenant,
            course,
        } => {
            let input = NewSignal {
                source_type: source_type.parse::<SourceType>()?,
                origin_id,
                signal_type: signal_type.parse::<SignalType>()?,
                summary,
                details,
                affected_artifacts: artifacts,
                tenant_id: tenant,
                course_id: course,
            };
            let (signal, entry) = create_signal(root, &input).context("failed to create signal")?;
            if json {
                print_json(&signal)?;
            } else {
                println!(
                    "Created signal {} (ledger seq {})",
                    signal.governance_id, entry.ledger_seq
                );
            }
            Ok(())
        }
        SignalSubcommand::Show { id } => {
            let signal = Signal::load(root, &id)?;
            if json {
                print_json(&signal)?;
            } else {
                println!("{}  [{}]", signal.governance_id, signal.signal_type.as_str());
                println!("  source:  {} ({})", signal.source.origin_id, signal.source.source_type.as_str());
                println!("  tenant:  {}", signal.tenant_context.tenant_id);
                println!("  summary: {}", signal.content.summary);
            }
            Ok(())
        }
    }
}
