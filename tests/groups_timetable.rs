use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

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
    let exe = env!("CARGO_BIN_EXE_tuitiond");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn tuitiond");
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
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
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
    assert_eq!(value["ok"], json!(true), "{} failed: {}", method, value);
    value["result"].clone()
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
    class: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({
            "student": {
                "name": name,
                "class": class,
                "subjects": ["Maths", "Science"],
                "gender": "female",
                "parentPhone": "98765 43210"
            }
        }),
    );
    created["student"]["id"].as_str().expect("student id").to_string()
}

fn create_with_subjects(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
    subjects: &[&str],
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({
            "student": { "name": name, "class": "10", "subjects": subjects, "gender": "male" }
        }),
    );
    created["student"]["id"].as_str().expect("student id").to_string()
}

#[test]
fn groups_follow_class_and_subject_set() {
    let workspace = temp_dir("tuition-groups");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    create_student(&mut stdin, &mut reader, "2", "Zara", "10");
    create_with_subjects(&mut stdin, &mut reader, "3", "Arjun", &["Science", "Maths"]);
    create_student(&mut stdin, &mut reader, "4", "Meera", "9");

    let listed = request_ok(&mut stdin, &mut reader, "5", "groups.list", json!({}));
    let groups = listed["groups"].as_array().expect("groups");
    assert_eq!(groups.len(), 2);
    let ten = groups
        .iter()
        .find(|g| g["class"] == json!("10"))
        .expect("class 10 group");
    assert_eq!(ten["id"], json!("10-maths-science"));
    assert_eq!(ten["subjects"], json!(["Maths", "Science"]));
    let names: Vec<&str> = ten["students"]
        .as_array()
        .expect("students")
        .iter()
        .filter_map(|s| s["name"].as_str())
        .collect();
    assert_eq!(names, vec!["Arjun", "Zara"]);

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "groups.get",
        json!({ "groupId": "10-maths-science" }),
    );
    assert_eq!(fetched["group"]["students"].as_array().map(|a| a.len()), Some(2));

    let missing = request(
        &mut stdin,
        &mut reader,
        "7",
        "groups.get",
        json!({ "groupId": "nope" }),
    );
    assert_eq!(missing["error"]["code"], json!("not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn seeded_timetable_is_stable_within_a_week() {
    let workspace = temp_dir("tuition-timetable");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    create_with_subjects(
        &mut stdin,
        &mut reader,
        "2",
        "Arjun",
        &["Maths", "Science", "English", "Hindi", "Computer"],
    );

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "timetable.generate",
        json!({ "groupId": "10-computer-english-hindi-maths-science", "week": "2024-03-04" }),
    );
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "timetable.generate",
        json!({ "groupId": "10-computer-english-hindi-maths-science", "week": "2024-03-08" }),
    );
    assert_eq!(first["seeded"], json!(true));
    assert_eq!(first["timetable"], again["timetable"]);
    assert_eq!(first["timetable"]["week"], json!("2024-W10"));

    let days = first["timetable"]["days"].as_array().expect("days");
    assert_eq!(days.len(), 5);
    for day in days {
        assert_eq!(day["slots"].as_array().map(|a| a.len()), Some(7));
    }

    let by_class = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "timetable.generate",
        json!({ "class": "10", "policy": "roundRobin", "week": "2024-03-04" }),
    );
    assert_eq!(by_class["timetable"]["policy"], json!("roundRobin"));

    let bad_policy = request(
        &mut stdin,
        &mut reader,
        "6",
        "timetable.generate",
        json!({ "class": "10", "policy": "random" }),
    );
    assert_eq!(bad_policy["error"]["code"], json!("bad_params"));

    let no_target = request(&mut stdin, &mut reader, "7", "timetable.generate", json!({}));
    assert_eq!(no_target["error"]["code"], json!("bad_params"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn weekend_tests_start_on_the_next_saturday() {
    let workspace = temp_dir("tuition-tests-schedule");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    create_with_subjects(&mut stdin, &mut reader, "2", "Arjun", &["Maths", "Science", "English"]);

    let schedule = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "tests.schedule",
        json!({ "from": "2024-03-06" }),
    );
    assert_eq!(schedule["weekend"], json!("2024-03-09"));
    let tests = schedule["tests"].as_array().expect("tests");
    assert_eq!(tests.len(), 3);
    assert_eq!(tests[0]["date"], json!("2024-03-09"));
    assert_eq!(tests[0]["start"], json!("10:00"));
    assert_eq!(tests[2]["day"], json!("Sunday"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
