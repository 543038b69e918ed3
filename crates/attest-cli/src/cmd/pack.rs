use crate::output::{or_none, print_fields, print_json, print_table};
use anyhow::Context;
use attest_core::{pack, paths, AttestError};
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum PackSubcommand {
    /// Copy a directory into the pack store and write its manifest
    Build {
        /// Directory holding the pack content
        source: PathBuf,

        #[arg(id = "pack_version", long = "pack-version", value_name = "VERSION")]
        version: String,

        #[arg(long)]
        git_commit: Option<String>,

        /// Proposal that produced this pack
        #[arg(long)]
        proposal: Option<String>,
    },

    /// Check a stored pack against its manifest
    Verify {
        #[arg(id = "pack_version", value_name = "VERSION")]
        version: String,

        /// Verify the copy in the active store instead of the source store
        #[arg(long)]
        active: bool,
    },

    /// Make a pack version active
    Apply {
        #[arg(id = "pack_version", value_name = "VERSION")]
        version: String,

        #[arg(long, env = "ATTEST_ACTOR")]
        actor: String,

        /// Re-apply even when this version is already active
        #[arg(long)]
        force: bool,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Restore the active pack recorded in a snapshot
    Rollback {
        /// Snapshot id, with or without the .json suffix
        snapshot: String,

        #[arg(long, env = "ATTEST_ACTOR")]
        actor: String,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Show the active pack, available versions and snapshots
    Status,
}

pub fn run(root: &Path, subcmd: PackSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        PackSubcommand::Build {
            source,
            version,
            git_commit,
            proposal,
        } => {
            let manifest = pack::build_pack(
                root,
                &source,
                &version,
                git_commit.as_deref(),
                proposal.as_deref(),
            )
            .with_context(|| format!("failed to build pack '{version}'"))?;
            if json {
                print_json(&manifest)?;
            } else {
                println!(
                    "Built pack {} ({} files, manifest {})",
                    manifest.pack_version,
                    manifest.files.len(),
                    manifest.manifest_hash
                );
            }
        }
        PackSubcommand::Verify { version, active } => {
            paths::validate_id(&version)?;
            let dir = if active {
                paths::active_pack_dir(root, &version)
            } else {
                paths::source_pack_dir(root, &version)
            };
            let manifest = pack::verify_pack(&dir)
                .map_err(AttestError::from)
                .with_context(|| format!("pack '{version}' failed verification"))?;
            if json {
                print_json(&manifest)?;
            } else {
                println!(
                    "Pack {} OK: {} files verified",
                    manifest.pack_version,
                    manifest.files.len()
                );
            }
        }
        PackSubcommand::Apply {
            version,
            actor,
            force,
            notes,
        } => {
            let outcome = pack::apply(root, &version, &actor, force, notes.as_deref())
                .with_context(|| format!("failed to apply pack '{version}'"))?;
            if json {
                print_json(&outcome)?;
            } else {
                println!(
                    "Applied pack {} (previous: {}, snapshot: {}, ledger seq {})",
                    outcome.pack_version,
                    or_none(outcome.previous_pack_version.as_deref()),
                    or_none(outcome.snapshot_id.as_deref()),
                    outcome.ledger_seq
                );
            }
        }
        PackSubcommand::Rollback {
            snapshot,
            actor,
            notes,
        } => {
            let outcome = pack::rollback(root, &snapshot, &actor, notes.as_deref())
                .with_context(|| format!("failed to roll back to '{snapshot}'"))?;
            if json {
                print_json(&outcome)?;
            } else {
                println!(
                    "Rolled back to pack {} (was: {}, pre-rollback snapshot: {}, ledger seq {})",
                    outcome.restored_pack_version,
                    or_none(outcome.previous_pack_version.as_deref()),
                    outcome.pre_rollback_snapshot_id,
                    outcome.ledger_seq
                );
            }
        }
        PackSubcommand::Status => {
            let status = pack::status(root)?;
            if json {
                return print_json(&status);
            }
            match &status.active {
                Some(marker) => print_fields(&[
                    ("active", marker.pack_version.clone()),
                    ("applied at", marker.applied_at_utc.clone()),
                    ("git commit", or_none(marker.git_commit_hash.as_deref())),
                    ("promotion", or_none(marker.promotion_id.as_deref())),
                ]),
                None => println!("No active pack."),
            }
            println!("\nAvailable: {}", status.available.join(", "));
            if !status.snapshots.is_empty() {
                println!();
                print_table(
                    &["SNAPSHOT"],
                    status.snapshots.iter().map(|s| vec![s.clone()]).collect(),
                );
            }
        }
    }
    Ok(())
}
