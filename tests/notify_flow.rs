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
        .env_remove("WHATSAPP_ACCESS_TOKEN")
        .env_remove("WHATSAPP_PHONE_NUMBER_ID")
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

#[test]
fn preview_and_link_handoff() {
    let workspace = temp_dir("tuition-notify");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let asha = create_student(&mut stdin, &mut reader, "2", "Asha", "10");
    let no_phone = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({
            "student": { "name": "Ravi", "class": "10", "subjects": ["Maths"], "gender": "male" }
        }),
    )["student"]["id"]
        .as_str()
        .expect("student id")
        .to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.mark",
        json!({ "studentId": asha, "date": "2024-03-01", "status": "present" }),
    );

    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "notify.preview",
        json!({ "studentId": asha }),
    );
    let message = preview["message"].as_str().expect("message");
    assert!(message.contains("*Student:* Asha"));
    assert!(message.contains("Attendance Percentage: 100.0%"));
    assert!(message.contains("No recent test marks available"));
    assert_eq!(preview["phone"], json!("919876543210"));
    assert!(preview["link"]
        .as_str()
        .expect("link")
        .starts_with("https://wa.me/919876543210?text="));

    let recipients = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "notify.recipients",
        json!({ "band": "high" }),
    );
    let list = recipients["recipients"].as_array().expect("recipients");
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["studentId"], json!(asha));

    let sent = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "notify.send",
        json!({ "studentIds": [asha, no_phone], "channel": "link" }),
    );
    assert_eq!(sent["succeeded"], json!(1));
    assert_eq!(sent["failed"], json!(1));
    assert!(sent["outcomes"][0]["link"].as_str().is_some());
    assert_eq!(sent["outcomes"][1]["error"]["code"], json!("validation_failed"));

    let business = request(
        &mut stdin,
        &mut reader,
        "8",
        "notify.send",
        json!({ "studentIds": [asha], "channel": "business" }),
    );
    assert_eq!(business["error"]["code"], json!("notify_not_configured"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
