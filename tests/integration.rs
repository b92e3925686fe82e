use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn intake_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("intake");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    fs::write(
        config_dir.join("labels.json"),
        r#"{"labels":[
            {"id":"coke","name":"Coke","exemplars":["met coke","metallurgical coke"]},
            {"id":"iron","name":"Pig iron","exemplars":["pig iron"]},
            {"id":"limestone","name":"Limestone","exemplars":["crushed limestone"]}
        ]}"#,
    )
    .unwrap();

    let sheets_dir = root.join("sheets");
    fs::create_dir_all(&sheets_dir).unwrap();
    fs::write(
        sheets_dir.join("march.json"),
        r#"[
            {"Lot No": "L-1", "Product Name": "slab", "Material Text": "coke", "Quantity": "12.5", "Unit": "", "Input Date": 45352},
            {"Lot No": "L-2", "Product Name": "slab", "Material Text": "pig  iron", "Quantity": 3, "Unit": "kg", "Input Date": "2024-03-04"},
            {"Lot No": "L-3", "Product Name": "slab", "Material Text": "", "Quantity": null}
        ]"#,
    )
    .unwrap();
    fs::write(
        sheets_dir.join("empty.json"),
        r#"{"filename": "empty.xlsx", "data": []}"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/intake.sqlite"

[server]
bind = "127.0.0.1:7341"

[corpus]
seed_path = "{root}/config/labels.json"
feedback_log = "{root}/data/feedback.jsonl"

[classifier]
similarity_threshold = 0.70
top_k = 3

[embedding]
provider = "ngram"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("intake.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_intake(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    run_intake_with_env(config_path, args, &[])
}

fn run_intake_with_env(
    config_path: &Path,
    args: &[&str],
    env: &[(&str, &str)],
) -> (String, String, bool) {
    let binary = intake_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .envs(env.iter().copied())
        .output()
        .unwrap_or_else(|e| panic!("Failed to run intake binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn sheet(config_path: &Path, name: &str) -> String {
    config_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("sheets")
        .join(name)
        .display()
        .to_string()
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_intake(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/intake.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_intake(&config_path, &["init"]);
    assert!(success, "first init failed: {}", stderr);
    let (_, stderr, success) = run_intake(&config_path, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_normalize_prints_completed_batch() {
    let (_tmp, config_path) = setup_test_env();
    let file = sheet(&config_path, "march.json");

    let (stdout, stderr, success) =
        run_intake(&config_path, &["normalize", &file, "--progress", "off"]);
    assert!(success, "normalize failed: {}", stderr);

    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(json["filename"], "march.json");
    assert_eq!(json["columns"].as_array().unwrap().len(), 10);

    let rows = json["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["lot_no"], "L-1");
    assert_eq!(rows[0]["unit"], "t");
    assert_eq!(rows[0]["input_date"], "2024-03-02");
    assert_eq!(rows[0]["ai_suggestion"], "coke");
    assert_eq!(rows[1]["ai_suggestion"], "iron");
    assert_eq!(rows[1]["unit"], "kg");
    assert_eq!(rows[2]["skipped"], true);
}

#[test]
fn test_normalize_json_progress() {
    let (_tmp, config_path) = setup_test_env();
    let file = sheet(&config_path, "march.json");

    let (_, stderr, success) =
        run_intake(&config_path, &["normalize", &file, "--progress", "json"]);
    assert!(success, "normalize failed: {}", stderr);

    let kinds: Vec<String> = stderr
        .lines()
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .filter_map(|v| v["type"].as_str().map(str::to_string))
        .collect();
    assert_eq!(
        kinds,
        vec!["processing", "ai_request", "ai_processed", "completed"]
    );
}

#[test]
fn test_normalize_empty_fails() {
    let (_tmp, config_path) = setup_test_env();
    let file = sheet(&config_path, "empty.json");

    let (_, stderr, success) = run_intake(&config_path, &["normalize", &file]);
    assert!(!success);
    assert!(stderr.contains("empty_request"));
}

#[test]
fn test_normalize_persist() {
    let (_tmp, config_path) = setup_test_env();
    let file = sheet(&config_path, "march.json");

    let (_, stderr, success) = run_intake(
        &config_path,
        &["normalize", &file, "--progress", "off", "--persist"],
    );
    assert!(success, "normalize --persist failed: {}", stderr);
    assert!(stderr.contains("Persisted 3 rows."));

    // A second run is a new batch, not a conflict.
    let (_, stderr, success) = run_intake(
        &config_path,
        &["normalize", &file, "--progress", "off", "--persist"],
    );
    assert!(success, "second persist failed: {}", stderr);
}

#[test]
fn test_classify_exact_and_echo() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_intake(&config_path, &["classify", "met coke"]);
    assert!(success, "classify failed: {}", stderr);
    let result: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(result["label"], "coke");
    assert_eq!(result["match_kind"], "exact_exemplar");
    assert_eq!(result["confidence"], 100.0);

    let (stdout, _, success) = run_intake(&config_path, &["classify", "zzqx-9000"]);
    assert!(success);
    let result: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(result["label"], "zzqx-9000");
    assert_eq!(result["match_kind"], "none");
}

#[test]
fn test_feedback_survives_restart() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_intake(
        &config_path,
        &["feedback", "--text", "휘발유", "--label", "gasoline"],
    );
    assert!(success, "feedback failed: {}", stderr);
    assert!(stdout.contains("corpus version 2"));

    let log = fs::read_to_string(tmp.path().join("data/feedback.jsonl")).unwrap();
    assert_eq!(log.lines().count(), 1);

    let (stdout, _, success) = run_intake(&config_path, &["classify", "휘발유"]);
    assert!(success);
    let result: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(result["label"], "gasoline");
    assert_eq!(result["match_kind"], "exact_exemplar");

    let (stdout, _, success) = run_intake(&config_path, &["labels"]);
    assert!(success);
    assert!(stdout.contains("gasoline"));
    assert!(stdout.contains("limestone"));
}

#[test]
fn test_repeated_confirmation_is_absorbed() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_intake(
        &config_path,
        &["feedback", "--text", "met coke", "--label", "coke", "--correct"],
    );
    assert!(success);
    assert!(stdout.contains("already known"));
    assert!(stdout.contains("corpus version 1"));
}

#[test]
fn test_invalid_env_override_rejected() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_intake_with_env(
        &config_path,
        &["labels"],
        &[("SIMILARITY_THRESHOLD", "1.5")],
    );
    assert!(!success);
    assert!(stderr.contains("similarity_threshold"));
}

#[test]
fn test_missing_config_uses_defaults() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");

    let (stdout, stderr, success) = run_intake(&missing, &["classify", "coke"]);
    assert!(success, "classify without config failed: {}", stderr);
    let result: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(result["note"], "no training data");
}
