use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

fn write_script(path: &Path, steps: &[Value]) {
    let mut contents = String::new();
    for step in steps {
        contents.push_str(&serde_json::to_string(step).expect("encode step"));
        contents.push('\n');
    }
    fs::write(path, contents).expect("write script");
}

fn run_replay(dir: &Path, script: &Path, out: &Path) -> Vec<Value> {
    let bin = env!("CARGO_BIN_EXE_mdstash");
    let status = Command::new(bin)
        .args([
            "--script",
            script.to_str().unwrap(),
            "--out",
            out.to_str().unwrap(),
            "--data-dir",
            dir.join("data").to_str().unwrap(),
        ])
        .env("RUST_LOG", "warn")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("spawn mdstash");
    assert!(status.success(), "replay exited with {status}");

    fs::read_to_string(out)
        .expect("read replay output")
        .lines()
        .map(|line| serde_json::from_str(line).expect("parse output line"))
        .collect()
}

fn inventory_fulls(lines: &[Value]) -> Vec<&Value> {
    lines
        .iter()
        .filter_map(|line| line["message"]["Sync"].get("full"))
        .filter(|full| full["location"] == "Inventory")
        .collect()
}

#[test]
fn replay_persists_inventory_between_runs() {
    let dir = tempfile::tempdir().expect("temp dir");
    let script = dir.path().join("first.jsonl");
    let out = dir.path().join("first.out.jsonl");
    write_script(
        &script,
        &[
            json!({"op": "connect", "session": 1}),
            json!({"op": "add_item", "session": 1, "item_id": 3, "count": 5, "action": {"Pickup": {"entity_id": 77}}}),
            json!({"op": "send", "session": 1, "message": "Disconnect"}),
        ],
    );

    let lines = run_replay(dir.path(), &script, &out);
    assert_eq!(inventory_fulls(&lines).len(), 1, "connect sends one full sync");
    assert!(lines
        .iter()
        .any(|line| line["kind"] == "leftover" && line["leftover"] == 0));

    let script = dir.path().join("second.jsonl");
    let out = dir.path().join("second.out.jsonl");
    write_script(&script, &[json!({"op": "connect", "session": 1})]);

    let lines = run_replay(dir.path(), &script, &out);
    let fulls = inventory_fulls(&lines);
    assert_eq!(fulls.len(), 1);
    assert_eq!(fulls[0]["slots"][0], json!({"item_id": 3, "count": 5}));
}

#[test]
fn replay_reports_rejections_without_failing() {
    let dir = tempfile::tempdir().expect("temp dir");
    let script = dir.path().join("script.jsonl");
    let out = dir.path().join("out.jsonl");
    write_script(
        &script,
        &[
            json!({"op": "connect", "session": 2}),
            json!({"op": "connect", "session": 2}),
            json!({"op": "send", "session": 2, "message": {"Close": {"key": {"x": 4, "y": 4, "z": 4}}}}),
        ],
    );

    let lines = run_replay(dir.path(), &script, &out);
    let rejected: Vec<u64> = lines
        .iter()
        .filter(|line| line["kind"] == "rejected")
        .filter_map(|line| line["line"].as_u64())
        .collect();
    assert_eq!(rejected, vec![2, 3]);
}
