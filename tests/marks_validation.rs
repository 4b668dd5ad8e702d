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

fn mark(student_id: &str, obtained: f64, total: f64) -> serde_json::Value {
    json!({
        "mark": {
            "studentId": student_id,
            "subject": "Maths",
            "weekNumber": 10,
            "year": 2024,
            "marksObtained": obtained,
            "totalMarks": total,
            "testDate": "2024-03-09"
        }
    })
}

#[test]
fn marks_bounds_and_grades() {
    let workspace = temp_dir("tuition-marks");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = create_student(&mut stdin, &mut reader, "2", "Asha", "10");

    let over = request(&mut stdin, &mut reader, "3", "marks.create", mark(&student, 101.0, 100.0));
    assert_eq!(over["error"]["code"], json!("validation_failed"));
    assert_eq!(over["error"]["details"]["field"], json!("marksObtained"));

    let zero_total = request(&mut stdin, &mut reader, "4", "marks.create", mark(&student, 0.0, 0.0));
    assert_eq!(zero_total["error"]["code"], json!("validation_failed"));

    let zero = request_ok(&mut stdin, &mut reader, "5", "marks.create", mark(&student, 0.0, 100.0));
    assert_eq!(zero["mark"]["percentage"], json!(0.0));
    assert_eq!(zero["mark"]["grade"], json!("F"));

    let full = request_ok(&mut stdin, &mut reader, "6", "marks.create", mark(&student, 45.0, 50.0));
    assert_eq!(full["mark"]["percentage"], json!(90.0));
    assert_eq!(full["mark"]["grade"], json!("A+"));
    let mark_id = full["mark"]["id"].as_str().expect("mark id").to_string();

    let mut patch = mark(&student, 30.0, 50.0);
    patch["markId"] = json!(mark_id);
    let updated = request_ok(&mut stdin, &mut reader, "7", "marks.update", patch);
    assert_eq!(updated["mark"]["percentage"], json!(60.0));

    let unknown = request(&mut stdin, &mut reader, "8", "marks.create", mark("nobody", 1.0, 10.0));
    assert_eq!(unknown["error"]["code"], json!("not_found"));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "marks.list",
        json!({ "studentId": student, "weekNumber": 10, "year": 2024 }),
    );
    assert_eq!(listed["marks"].as_array().map(|a| a.len()), Some(2));

    request_ok(&mut stdin, &mut reader, "10", "marks.delete", json!({ "markId": mark_id }));
    let gone = request(&mut stdin, &mut reader, "11", "marks.delete", json!({ "markId": mark_id }));
    assert_eq!(gone["error"]["code"], json!("not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn current_week_uses_iso_numbering() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    // 2021-01-01 falls in ISO week 53 of 2020, which is past the last
    // recordable week.
    let week = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "marks.currentWeek",
        json!({ "date": "2021-01-01" }),
    );
    assert_eq!(week["weekNumber"], json!(52));
    assert_eq!(week["isoWeek"], json!(53));
    assert_eq!(week["year"], json!(2020));

    let week = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "marks.currentWeek",
        json!({ "date": "2024-03-09" }),
    );
    assert_eq!(week["weekNumber"], json!(10));
    assert_eq!(week["year"], json!(2024));

    drop(stdin);
    let _ = child.wait();
}
