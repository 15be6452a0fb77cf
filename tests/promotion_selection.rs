use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_promotiond");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn promotiond");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string())
    );
    value.get("result").cloned().unwrap_or(json!({}))
}

fn create_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
    form: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        id,
        "classes.create",
        json!({ "name": name, "form": form }),
    );
    res["classId"].as_str().expect("classId").to_string()
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    class_id: &str,
    number: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({
            "classId": class_id,
            "studentNumber": number,
            "firstName": "Test",
            "lastName": number,
        }),
    );
    res["studentId"].as_str().expect("studentId").to_string()
}

fn wait_settled(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    prefix: &str,
) -> serde_json::Value {
    let deadline = Instant::now() + Duration::from_secs(20);
    for n in 0.. {
        let status = request_ok(
            stdin,
            reader,
            &format!("{}-{}", prefix, n),
            "promotion.status",
            json!({}),
        );
        if status["running"] == false && status["reloadPending"] == false {
            return status;
        }
        assert!(Instant::now() < deadline, "promotion never settled: {}", status);
        std::thread::sleep(Duration::from_millis(25));
    }
    unreachable!()
}

fn open_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &Path,
) {
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        stdin,
        reader,
        "cfg",
        "setup.update",
        json!({ "section": "promotion", "patch": { "staggerMs": 0, "settleMs": 0 } }),
    );
}

#[test]
fn individual_mode_only_promotes_selected_eligible_students() {
    let workspace = temp_dir("promotiond-individual");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, &workspace);

    let g1 = create_class(&mut stdin, &mut reader, "1", "Grade 1", "");
    let g2 = create_class(&mut stdin, &mut reader, "2", "Grade 2", "");
    let a = create_student(&mut stdin, &mut reader, "3", &g1, "001");
    let b = create_student(&mut stdin, &mut reader, "4", &g1, "002");
    let c = create_student(&mut stdin, &mut reader, "5", &g2, "003");
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "rules.set",
        json!({ "classKey": "Grade 1", "nextClass": "Grade 2" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "rules.set",
        json!({ "classKey": "Grade 2", "nextClass": "Completed" }),
    );

    // Selection needs a plan.
    let early = request(
        &mut stdin,
        &mut reader,
        "8",
        "promotion.toggle",
        json!({ "studentId": a }),
    );
    assert_eq!(early["error"]["code"], "no_plan");

    request_ok(&mut stdin, &mut reader, "9", "promotion.load", json!({}));
    let mode = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "promotion.mode",
        json!({ "mode": "individual" }),
    );
    assert_eq!(mode["mode"], "individual");

    // Nothing selected yet: the batch never starts.
    let empty = request(&mut stdin, &mut reader, "11", "promotion.start", json!({}));
    assert_eq!(empty["error"]["code"], "no_eligible_students");
    let status = request_ok(&mut stdin, &mut reader, "12", "promotion.status", json!({}));
    assert_eq!(status["running"], false);
    assert_eq!(
        status["lastReport"]["message"],
        "No eligible students selected for promotion."
    );

    // Terminal-class students cannot be selected.
    let ineligible = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "promotion.toggle",
        json!({ "studentId": c }),
    );
    assert_eq!(ineligible["eligible"], false);
    assert_eq!(ineligible["selected"], false);
    let none = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "promotion.selectClass",
        json!({ "classId": g2, "selected": true }),
    );
    assert_eq!(none["changed"], 0);

    let all_g1 = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "promotion.selectClass",
        json!({ "classId": g1, "selected": true }),
    );
    assert_eq!(all_g1["changed"], 2);
    let off = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "promotion.toggle",
        json!({ "studentId": b }),
    );
    assert_eq!(off["selected"], false);
    assert_eq!(off["selectedCount"], 1);

    let preview = request_ok(&mut stdin, &mut reader, "17", "promotion.preview", json!({}));
    assert_eq!(preview["commandCount"], 1);
    assert_eq!(preview["commands"][0]["studentId"], a.as_str());
    assert_eq!(preview["commands"][0]["toClassId"], g2.as_str());

    request_ok(&mut stdin, &mut reader, "18", "promotion.start", json!({}));
    let status = wait_settled(&mut stdin, &mut reader, "poll");
    assert_eq!(status["lastResult"]["successCount"], 1);

    let still_g1 = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "students.list",
        json!({ "classId": g1 }),
    );
    let ids: Vec<&str> = still_g1["students"]
        .as_array()
        .expect("students")
        .iter()
        .filter_map(|s| s["id"].as_str())
        .collect();
    assert_eq!(ids, vec![b.as_str()]);

    let plan = request_ok(&mut stdin, &mut reader, "20", "promotion.plan", json!({}));
    assert_eq!(plan["selectedCount"], 0);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn id_linked_rules_take_precedence_over_names() {
    let workspace = temp_dir("promotiond-linked");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, &workspace);

    let g1 = create_class(&mut stdin, &mut reader, "1", "Grade 1", "");
    let g2 = create_class(&mut stdin, &mut reader, "2", "Grade 2", "");
    let g3 = create_class(&mut stdin, &mut reader, "3", "Grade 3", "");
    create_student(&mut stdin, &mut reader, "4", &g1, "001");
    create_student(&mut stdin, &mut reader, "5", &g2, "002");
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "rules.set",
        json!({ "classKey": "Grade 1", "nextClass": "Grade 2" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "rules.set",
        json!({ "classKey": "Grade 2", "nextClass": "Grade 3" }),
    );
    // Grade 1 skips a year; Grade 2 is the last class.
    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "rules.link",
        json!({ "fromClassId": g1, "toClassId": g3 }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "rules.link",
        json!({ "fromClassId": g2, "isFinalClass": true }),
    );

    let rules = request_ok(&mut stdin, &mut reader, "10", "rules.list", json!({}));
    assert_eq!(rules["rules"]["Grade 1"], "Grade 2");
    assert_eq!(rules["links"].as_array().map(Vec::len), Some(2));

    let plan = request_ok(&mut stdin, &mut reader, "11", "promotion.load", json!({}));
    let entries = plan["entries"].as_array().expect("entries");
    assert_eq!(entries[0]["class"]["id"], g1.as_str());
    assert_eq!(entries[0]["nextClass"]["id"], g3.as_str());
    assert_eq!(entries[1]["class"]["id"], g2.as_str());
    assert_eq!(entries[1]["eligible"], false);

    let bad_link = request(
        &mut stdin,
        &mut reader,
        "12",
        "rules.link",
        json!({ "fromClassId": g1 }),
    );
    assert_eq!(bad_link["error"]["code"], "bad_params");
    let missing = request(
        &mut stdin,
        &mut reader,
        "13",
        "rules.link",
        json!({ "fromClassId": g1, "toClassId": "nope" }),
    );
    assert_eq!(missing["error"]["code"], "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
