use crate::output::print_json;
use anyhow::Context;
use attest_core::{config::Config, io, paths};
use std::path::Path;

pub fn run(root: &Path, name: Option<&str>, json: bool) -> anyhow::Result<()> {
    let project_name = name.map(str::to_string).unwrap_or_else(|| {
        root.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    });

    let dirs = [
        paths::GOVERNANCE_DIR,
        paths::SIGNALS_DIR,
        paths::PROPOSALS_DIR,
        paths::VALIDATIONS_DIR,
        paths::APPROVALS_DIR,
        paths::PROMOTIONS_DIR,
        paths::SOURCE_PACKS_DIR,
        paths::SNAPSHOTS_DIR,
        paths::ACTIVE_PACKS_DIR,
    ];
    for dir in dirs {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    let mut created = Vec::new();
    let config_path = paths::config_path(root);
    if !config_path.exists() {
        Config::new(&project_name)
            .save(root)
            .context("failed to write config.yaml")?;
        created.push(paths::CONFIG_FILE);
    }
    let ledger_path = paths::ledger_path(root);
    if !ledger_path.exists() {
        io::atomic_write(&ledger_path, b"").context("failed to create ledger.jsonl")?;
        created.push(paths::LEDGER_FILE);
    }

    if json {
        print_json(&serde_json::json!({
            "root": root.display().to_string(),
            "created": created,
        }))?;
        return Ok(());
    }
    println!("Initializing governance in: {}", root.display());
    for file in [paths::CONFIG_FILE, paths::LEDGER_FILE] {
        let verb = if created.contains(&file) { "created" } else { "exists " };
        println!("  {verb}: {file}");
    }
    println!("\nNext: attest signal create --help");
    Ok(())
}
