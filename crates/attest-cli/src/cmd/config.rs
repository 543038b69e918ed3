use crate::output::{print_fields, print_json};
use anyhow::Context;
use attest_core::config::{Config, GovernanceProfile, WarnLevel};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show the effective configuration
    Show {
        /// Show the risk escalation block as overridden by this profile
        #[arg(long, env = "GOVERNANCE_PROFILE")]
        profile: Option<String>,
    },

    /// Validate the config for common mistakes
    Validate,
}

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show { profile } => show(root, profile.as_deref(), json),
        ConfigSubcommand::Validate => validate(root, json),
    }
}

fn show(root: &Path, profile: Option<&str>, json: bool) -> anyhow::Result<()> {
    let mut config = Config::load(root).context("failed to load config")?;
    let profile = profile.map(str::parse::<GovernanceProfile>).transpose()?;
    if let Some(p) = profile {
        config.approval.risk_gate_escalation =
            p.risk_escalation(&config.approval.risk_gate_escalation);
    }

    if json {
        return print_json(&config);
    }
    let risk = &config.approval.risk_gate_escalation;
    print_fields(&[
        ("project", config.project.name.clone()),
        (
            "profile",
            profile.map_or("-".to_string(), |p| p.to_string()),
        ),
        (
            "auto approve",
            profile.is_some_and(GovernanceProfile::auto_approve).to_string(),
        ),
        ("gate strategy", config.approval.gate_strategy.to_string()),
        (
            "phase gates",
            config
                .approval
                .phase_gates
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        ),
        ("approval token", config.approval.require_approval_token.clone()),
        ("risk escalation", risk.enabled.to_string()),
        ("risk threshold", risk.open_questions_threshold.to_string()),
        ("weighted", risk.weighted_severities.join(", ")),
        ("risk auto override", risk.auto_override.to_string()),
        ("medium approvers", config.approvers.medium.join(", ")),
        ("high approvers", config.approvers.high.join(", ")),
    ]);
    Ok(())
}

fn validate(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let warnings = config.validate();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
