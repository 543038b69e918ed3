#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

fn attest(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("attest").unwrap();
    cmd.current_dir(dir.path())
        .env("ATTEST_ROOT", dir.path())
        .env_remove("ATTEST_ACTOR")
        .env_remove("GOVERNANCE_PROFILE")
        .env_remove("RUST_LOG");
    cmd
}

fn init_project(dir: &TempDir) {
    attest(dir).arg("init").assert().success();
}

fn json_of(cmd: &mut Command) -> Value {
    let out = cmd.arg("--json").assert().success().get_output().stdout.clone();
    serde_json::from_slice(&out).unwrap()
}

fn create_signal(dir: &TempDir, tenant: &str) -> String {
    let v = json_of(attest(dir).args([
        "signal",
        "create",
        "--source-type",
        "pilot_feedback",
        "--origin-id",
        "instructor-7",
        "--type",
        "complaint",
        "--summary",
        "Hints are too vague",
        "--details",
        "Students on unit 4 could not act on the hints",
        "--tenant",
        tenant,
    ]));
    v["governance_id"].as_str().unwrap().to_string()
}

fn create_proposal(dir: &TempDir, signal: &str, risk: &str) -> String {
    let v = json_of(attest(dir).args([
        "proposal",
        "create",
        "--signal",
        signal,
        "--author",
        "alice",
        "--target-path",
        "prompts/hints.md",
        "--rationale",
        "clearer hints",
        "--modification",
        "rewrite hint template",
        "--risk",
        risk,
    ]));
    v["governance_id"].as_str().unwrap().to_string()
}

fn validate(dir: &TempDir, proposal: &str, outcome: &str) {
    attest(dir)
        .args(["proposal", "validate", proposal, "--outcome", outcome, "--actor", "ci-bot"])
        .assert()
        .success();
}

fn write_pack_source(dir: &Path, body: &str) {
    std::fs::create_dir_all(dir.join("prompts")).unwrap();
    std::fs::write(dir.join("prompts/hints.md"), body).unwrap();
    std::fs::write(dir.join("rules.yaml"), "strict: true\n").unwrap();
}

fn build_pack(dir: &TempDir, version: &str) {
    let src = TempDir::new().unwrap();
    write_pack_source(src.path(), &format!("hints {version}"));
    attest(dir)
        .args(["pack", "build"])
        .arg(src.path())
        .args(["--pack-version", version, "--git-commit", "abc123"])
        .assert()
        .success();
}

// ---------------------------------------------------------------------------
// attest init / config
// ---------------------------------------------------------------------------

#[test]
fn init_creates_governance_tree() {
    let dir = TempDir::new().unwrap();
    attest(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("created: governance/config.yaml"));

    for p in [
        "governance/config.yaml",
        "governance/ledger.jsonl",
        "knowledge/signals",
        "knowledge/packs",
        "knowledge/active/_snapshots",
    ] {
        assert!(dir.path().join(p).exists(), "missing {p}");
    }
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    attest(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists : governance/config.yaml"));
}

#[test]
fn config_validate_clean_config() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    attest(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No warnings"));
}

#[test]
fn config_show_applies_profile() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let v = json_of(attest(&dir).args(["config", "show", "--profile", "staging"]));
    let risk = &v["approval"]["risk_gate_escalation"];
    assert_eq!(risk["enabled"], true);
    assert_eq!(risk["open_questions_threshold"], 5);
}

#[test]
fn commands_before_init_fail() {
    let dir = TempDir::new().unwrap();
    attest(&dir)
        .args(["proposal", "approve", "p-1", "--actor", "bob"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not initialized"));
}

// ---------------------------------------------------------------------------
// attest signal / proposal
// ---------------------------------------------------------------------------

#[test]
fn low_risk_proposal_end_to_end() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let signal = create_signal(&dir, "school-1");
    let proposal = create_proposal(&dir, signal.as_str(), "LOW");

    let status = json_of(attest(&dir).args(["proposal", "status", proposal.as_str()]));
    assert_eq!(status["state"], "DRAFT");

    validate(&dir, proposal.as_str(), "pass");
    let outcome = json_of(attest(&dir).args(["proposal", "approve", proposal.as_str(), "--actor", "bob"]));
    assert_eq!(outcome["fully_approved"], true);
    assert_eq!(outcome["required_approvals"], 1);

    let status = json_of(attest(&dir).args(["proposal", "status", proposal.as_str()]));
    assert_eq!(status["state"], "APPROVED_FULL");
    assert_eq!(status["approvers"][0], "bob");

    let report = json_of(attest(&dir).args(["ledger", "verify"]));
    assert_eq!(report["entries"], 4);

    let entries = json_of(attest(&dir).args(["ledger", "show", "--action", "PROPOSAL_APPROVED"]));
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["decision_metadata"]["latest_validation_status_internal"], "PASS");
}

#[test]
fn approve_without_validation_is_blocked() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let signal = create_signal(&dir, "school-1");
    let proposal = create_proposal(&dir, signal.as_str(), "LOW");
    attest(&dir)
        .args(["proposal", "approve", proposal.as_str(), "--actor", "bob"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no validation evidence"));
}

#[test]
fn approve_after_failed_validation_is_blocked() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let signal = create_signal(&dir, "school-1");
    let proposal = create_proposal(&dir, signal.as_str(), "LOW");
    validate(&dir, proposal.as_str(), "FAIL");
    attest(&dir)
        .args(["proposal", "approve", proposal.as_str(), "--actor", "bob"])
        .assert()
        .code(2);
    let status = json_of(attest(&dir).args(["proposal", "status", proposal.as_str()]));
    assert_eq!(status["state"], "VALIDATED_FAIL");
}

#[test]
fn unlisted_approver_is_blocked_for_medium_risk() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let signal = create_signal(&dir, "school-1");
    let proposal = create_proposal(&dir, signal.as_str(), "MEDIUM");
    validate(&dir, proposal.as_str(), "PASS");
    attest(&dir)
        .args(["proposal", "approve", proposal.as_str(), "--actor", "mallory"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not authorized"));
}

#[test]
fn mixed_tenant_signals_are_blocked() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let a = create_signal(&dir, "school-1");
    let b = create_signal(&dir, "school-2");
    attest(&dir)
        .args([
            "proposal", "create", "--signal", a.as_str(), "--signal", b.as_str(), "--author", "alice",
            "--target-path", "prompts/hints.md", "--rationale", "r", "--modification", "m",
        ])
        .assert()
        .code(2);
}

#[test]
fn invalid_source_type_is_rejected() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    attest(&dir)
        .args([
            "signal", "create", "--source-type", "rumour", "--origin-id", "x", "--type",
            "complaint", "--summary", "s", "--details", "d", "--tenant", "t",
        ])
        .assert()
        .failure();
    let report = json_of(attest(&dir).args(["ledger", "verify"]));
    assert_eq!(report["entries"], 0);
}

// ---------------------------------------------------------------------------
// attest ledger
// ---------------------------------------------------------------------------

#[test]
fn tampered_ledger_fails_verification_with_line_number() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create_signal(&dir, "school-1");
    create_signal(&dir, "school-1");

    let path = dir.path().join("governance/ledger.jsonl");
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, text.replacen("instructor-7", "instructor-8", 2)).unwrap();

    attest(&dir)
        .args(["ledger", "verify"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("line 1"));
}

#[test]
fn ledger_unlock_needs_force_while_holder_runs() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let lock = dir.path().join("governance/ledger.jsonl.lock");
    std::fs::write(&lock, format!("pid={}\n", std::process::id())).unwrap();

    attest(&dir)
        .args(["ledger", "unlock"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--force"));
    assert!(lock.exists());

    attest(&dir)
        .args(["ledger", "unlock", "--force"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed ledger lock"));
    create_signal(&dir, "school-1");
    attest(&dir)
        .args(["ledger", "unlock"])
        .assert()
        .success()
        .stdout(predicate::str::contains("not locked"));
}

#[cfg(target_os = "linux")]
#[test]
fn lock_of_dead_writer_does_not_block_commands() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    std::fs::write(dir.path().join("governance/ledger.jsonl.lock"), "pid=4000000000\n").unwrap();
    create_signal(&dir, "school-1");
    attest(&dir).args(["ledger", "verify"]).assert().success();
}

#[test]
fn ledger_show_filters_by_target() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let signal = create_signal(&dir, "school-1");
    create_signal(&dir, "school-1");
    let entries = json_of(attest(&dir).args(["ledger", "show", "--target", signal.as_str()]));
    assert_eq!(entries.as_array().unwrap().len(), 1);
    attest(&dir)
        .args(["ledger", "show", "--last", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("SIGNAL_CREATED"));
}

// ---------------------------------------------------------------------------
// attest pack
// ---------------------------------------------------------------------------

#[test]
fn pack_apply_apply_rollback() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    build_pack(&dir, "v1");
    build_pack(&dir, "v2");
    attest(&dir).args(["pack", "verify", "v1"]).assert().success();

    attest(&dir)
        .args(["pack", "apply", "v1", "--actor", "ops"])
        .assert()
        .success();
    let second = json_of(attest(&dir).args(["pack", "apply", "v2", "--actor", "ops"]));
    let snapshot = second["snapshot_id"].as_str().unwrap().to_string();

    attest(&dir)
        .args(["pack", "rollback", format!("{snapshot}.json").as_str(), "--actor", "ops"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Rolled back to pack v1"));

    let status = json_of(attest(&dir).args(["pack", "status"]));
    assert_eq!(status["active"]["pack_version"], "v1");
    assert_eq!(status["available"], serde_json::json!(["v1", "v2"]));

    let entries = json_of(attest(&dir).args(["ledger", "show"]));
    let actions: Vec<&str> = entries
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["action"].as_str().unwrap())
        .collect();
    assert_eq!(actions, vec!["PACK_APPLIED", "PACK_APPLIED", "PACK_ROLLED_BACK"]);
    attest(&dir).args(["ledger", "verify"]).assert().success();
}

#[test]
fn tampered_pack_is_refused() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    build_pack(&dir, "v1");
    std::fs::write(dir.path().join("knowledge/packs/v1/rules.yaml"), "strict: false\n").unwrap();

    attest(&dir)
        .args(["pack", "verify", "v1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("rules.yaml"));
    attest(&dir)
        .args(["pack", "apply", "v1", "--actor", "ops"])
        .assert()
        .code(2);
    assert!(!dir.path().join("knowledge/active/ACTIVE_PACK.json").exists());
}

#[test]
fn reapply_requires_force() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    build_pack(&dir, "v1");
    attest(&dir).args(["pack", "apply", "v1", "--actor", "ops"]).assert().success();
    attest(&dir)
        .args(["pack", "apply", "v1", "--actor", "ops"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("already active"));
    attest(&dir)
        .args(["pack", "apply", "v1", "--actor", "ops", "--force"])
        .assert()
        .success();
}

#[test]
fn rollback_unknown_snapshot_is_blocked() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    attest(&dir)
        .args(["pack", "rollback", "20260101T000000Z_v0", "--actor", "ops"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("snapshot not found"));
}

// ---------------------------------------------------------------------------
// attest gate / run
// ---------------------------------------------------------------------------

#[test]
fn step_outside_phase_gates_is_not_gated() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    attest(&dir)
        .args(["gate", "--run-id", "run-1", "--step", "1", "--agent", "writer"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no gate"));
}

#[test]
fn phase_gate_approved_on_stdin() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    attest(&dir)
        .args(["run", "start", "run-1"])
        .assert()
        .success();
    attest(&dir)
        .args(["gate", "--run-id", "run-1", "--step", "3", "--agent", "writer"])
        .write_stdin("approve\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("approved"))
        .stderr(predicate::str::contains("PHASE GATE"));
    attest(&dir)
        .args(["run", "complete", "run-1", "--steps", "3"])
        .assert()
        .success();

    let summary = json_of(attest(&dir).args(["run", "summary", "run-1"]));
    assert_eq!(summary["end_state"], "completed");
    assert_eq!(summary["approvals"]["manual"], 1);
    assert_eq!(summary["phase_gates"][0]["step_idx"], 3);
}

#[test]
fn phase_gate_rejection_ends_run() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    attest(&dir)
        .args(["gate", "--run-id", "run-2", "--step", "3", "--agent", "writer"])
        .write_stdin("not yet\n")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("approval rejected at step 3"));

    let summary = json_of(attest(&dir).args(["run", "summary", "run-2"]));
    assert_eq!(summary["end_state"], "rejected");
    assert_eq!(summary["failure_reason"], "approval_rejected");
}

#[test]
fn closed_stdin_is_a_rejection() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    attest(&dir)
        .args(["gate", "--run-id", "run-3", "--step", "6", "--agent", "writer"])
        .write_stdin("")
        .assert()
        .code(2);
}

#[test]
fn auto_approve_flag_skips_prompt() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let v = json_of(attest(&dir).args([
        "gate", "--run-id", "run-4", "--step", "3", "--agent", "writer", "--auto-approve",
    ]));
    assert_eq!(v["outcome"], "auto_approved");

    let entries = json_of(attest(&dir).args(["ledger", "show", "--action", "step_approved"]));
    let meta = &entries[0]["decision_metadata"];
    assert_eq!(meta["approval_source"], "cli_flag");
    assert_eq!(meta["approval_reason"], "Auto-approval enabled via CLI");
}

#[test]
fn dev_profile_overrides_risk_gate() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let v = json_of(attest(&dir).env("GOVERNANCE_PROFILE", "dev").args([
        "gate", "--run-id", "run-5", "--step", "2", "--agent", "writer",
        "--question", "MAJOR: scope?", "--question", "what audience?", "--question", "MAJOR: tone?",
    ]));
    assert_eq!(v["outcome"], "auto_approved");

    let entries = json_of(attest(&dir).args(["ledger", "show", "--target", "run-5"]));
    let actions: Vec<&str> = entries
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["action"].as_str().unwrap())
        .collect();
    assert_eq!(actions, vec!["risk_gate_forced", "step_approved"]);
    assert_eq!(entries[1]["decision_metadata"]["approval_source"], "profile");
}

#[test]
fn prod_profile_requires_manual_approval_for_qa_critical() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let deliverable = dir.path().join("qa.md");
    std::fs::write(&deliverable, "Findings\nSeverity: Critical - broken rubric\n").unwrap();
    attest(&dir)
        .args(["gate", "--run-id", "run-6", "--step", "4", "--agent", "qa_agent", "--profile", "prod"])
        .arg("--deliverable-file")
        .arg(&deliverable)
        .write_stdin("APPROVE\n")
        .assert()
        .success()
        .stderr(predicate::str::contains("RISK GATE"));

    let summary = json_of(attest(&dir).args(["run", "summary", "run-6"]));
    assert_eq!(summary["risk_gates"][0]["gate_reason"], "qa_critical");
    assert_eq!(summary["risk_gates"][0]["approval_mode"], "manual");
}

#[test]
fn unknown_profile_is_an_error() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    attest(&dir)
        .args(["run", "start", "run-7", "--profile", "chaos"])
        .assert()
        .code(1);
}

#[test]
fn summary_of_unknown_run_fails() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    attest(&dir)
        .args(["run", "summary", "nope"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no ledger entries"));
}
