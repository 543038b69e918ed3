use crate::output::print_json;
use anyhow::Context;
use attest_core::{
    config::{Config, GovernanceProfile},
    gate::{ApprovalPrompt, AutoApprove, GateController, GateOutcome, GatePolicy, PromptRequest, StepReport},
    ledger::Ledger,
    types::GateType,
};
use clap::Args;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

/// Run-level options shared by `gate` and `run start`.
#[derive(Args)]
pub struct PolicyArgs {
    /// Auto-approve phase gates (and risk gates when the policy allows it)
    #[arg(long)]
    pub auto_approve: bool,

    /// Governance profile: dev, staging, prod or ci
    #[arg(long, env = "GOVERNANCE_PROFILE")]
    pub profile: Option<String>,

    /// Identity recorded on ledger entries
    #[arg(long, env = "ATTEST_ACTOR", default_value = "pipeline")]
    pub actor: String,
}

#[derive(Args)]
pub struct GateArgs {
    #[arg(long)]
    pub run_id: String,

    /// 1-based pipeline step index
    #[arg(long)]
    pub step: u32,

    /// Role name of the agent that produced the step
    #[arg(long)]
    pub agent: String,

    /// Open question raised by the step (repeatable)
    #[arg(long)]
    pub question: Vec<String>,

    /// File holding the step's deliverable text
    #[arg(long)]
    pub deliverable_file: Option<PathBuf>,

    #[command(flatten)]
    pub policy: PolicyArgs,
}

impl PolicyArgs {
    /// Build the controller for `run_id` from the config and these flags.
    pub fn controller(
        &self,
        root: &Path,
        config: &Config,
        run_id: &str,
    ) -> anyhow::Result<GateController> {
        let profile = self
            .profile
            .as_deref()
            .map(str::parse::<GovernanceProfile>)
            .transpose()?;
        let policy = GatePolicy::from_config(config, profile);
        let auto = AutoApprove::resolve(self.auto_approve, profile);
        Ok(GateController::new(
            Ledger::for_root(root),
            run_id,
            &self.actor,
            policy,
            auto,
        )?)
    }
}

pub fn run(root: &Path, args: GateArgs, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let controller = args.policy.controller(root, &config, &args.run_id)?;
    let deliverable = match &args.deliverable_file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => String::new(),
    };
    let report = StepReport {
        step_idx: args.step,
        agent_gate: config.agent_gate(&args.agent),
        agent_name: args.agent,
        open_questions: args.question,
        deliverable,
    };

    let mut prompt = StdinPrompt;
    let outcome = controller
        .on_step_completed(&report, &mut prompt)
        .with_context(|| format!("gate failed for step {}", report.step_idx))?;

    if json {
        print_json(&serde_json::json!({
            "run_id": args.run_id,
            "step_idx": report.step_idx,
            "agent_name": report.agent_name,
            "outcome": outcome,
        }))?;
    } else {
        let text = match outcome {
            GateOutcome::NotGated => "no gate",
            GateOutcome::AutoApproved => "auto-approved",
            GateOutcome::ManuallyApproved => "approved",
        };
        println!("Step {} ({}): {text}", report.step_idx, report.agent_name);
    }
    Ok(())
}

/// Asks on stderr and reads one line from stdin. End of input counts as a
/// rejection.
struct StdinPrompt;

impl ApprovalPrompt for StdinPrompt {
    fn ask(&mut self, request: &PromptRequest) -> attest_core::Result<String> {
        let mut err = std::io::stderr().lock();
        let kind = match request.gate_type {
            GateType::RiskGate => "RISK GATE",
            GateType::PhaseGate => "PHASE GATE",
        };
        writeln!(
            err,
            "{kind} [{}] step {} ({}): {}",
            request.run_id, request.step_idx, request.agent_name, request.gate_reason
        )?;
        write!(err, "Type {} to continue: ", request.token)?;
        err.flush()?;

        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(line)
    }
}
