use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;

#[test]
fn emulated_json_report() {
    let output = cargo_bin_cmd!("vc4-info")
        .args(["--emulated", "--json", "--allocate", "4096"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let report: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["emulated"], true);
    assert_eq!(report["memory_backend"], "emulator");
    assert_eq!(report["execution_backend"], "emulator");
    assert_eq!(report["num_qpus"], 12);
    assert_eq!(report["total_vpm_memory"], 12 * 1024);
    assert_eq!(report["queries"]["current_qpu_clock_rate_hz"], 250_000_000);
    assert!(report["board"].is_null());
    assert_eq!(report["allocation"]["size"], 4096);
    assert_eq!(report["allocation"]["handle"], 1);
    assert_eq!(report["allocation"]["released"], true);
}

#[test]
fn emulated_text_report() {
    let output = cargo_bin_cmd!("vc4-info").arg("--emulated").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("memory=emulator execution=emulator (emulated)"), "{stdout}");
    assert!(stdout.contains("QPUs:         12"), "{stdout}");
    assert!(!stdout.contains("board:"), "{stdout}");
}

#[test]
fn oversized_allocation_fails() {
    cargo_bin_cmd!("vc4-info")
        .args(["--emulated", "--allocate", "16777216"])
        .assert()
        .failure();
}
