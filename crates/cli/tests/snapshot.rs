use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

#[test]
fn test_cli_writes_snapshot() {
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let snapshot_path = std::env::temp_dir().join(format!("uartlite-snapshot-{}.json", nonce));
    let _ = std::fs::remove_file(&snapshot_path);

    let output = Command::new(env!("CARGO_BIN_EXE_uartlite-demo"))
        .args(["--snapshot", snapshot_path.to_str().unwrap()])
        .output()
        .expect("Failed to execute uartlite-demo");

    assert!(output.status.success());
    assert!(snapshot_path.exists());

    let snapshot_content = std::fs::read_to_string(&snapshot_path).unwrap();
    let snapshot: serde_json::Value = serde_json::from_str(&snapshot_content).unwrap();
    assert_eq!(snapshot["steps"], 50);
    assert_eq!(snapshot["exceptions_enabled"], true);
    assert_eq!(snapshot["intc"]["mode"], "real");
    assert_eq!(snapshot["intc"]["irq_asserted"], false);

    let uart = &snapshot["peripherals"]["uartlite0"];
    assert_eq!(uart["transmitted"].as_array().unwrap().len(), 5);
    assert_eq!(uart["loopback"], true);
    assert!(snapshot["peripherals"]["intc0"].is_object());

    let _ = std::fs::remove_file(&snapshot_path);
}
