use std::fs;
use std::process::Command;

use tempfile::tempdir;

#[test]
fn process_command_writes_output_next_to_template() {
    let Some(exe) = option_env!("CARGO_BIN_EXE_texttransform") else {
        eprintln!("skipping: CARGO_BIN_EXE_texttransform not set");
        return;
    };
    let dir = tempdir().expect("tempdir");
    let template = dir.path().join("greeting.tt");
    fs::write(&template, "<#@ parameter name=\"who\" #>\nHi <#= who #>").expect("write template");

    let output = Command::new(exe)
        .arg("process")
        .arg(&template)
        .arg("-p")
        .arg("who=there")
        .output()
        .expect("run texttransform process");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        output.status.success(),
        "texttransform process failed\nstdout:\n{stdout}\nstderr:\n{stderr}"
    );
    assert!(stdout.contains("greeting.txt"), "unexpected stdout: {stdout}");
    assert_eq!(
        fs::read_to_string(dir.path().join("greeting.txt")).expect("read output"),
        "Hi there"
    );
}

#[test]
fn process_command_reports_diagnostics_and_fails() {
    let Some(exe) = option_env!("CARGO_BIN_EXE_texttransform") else {
        eprintln!("skipping: CARGO_BIN_EXE_texttransform not set");
        return;
    };
    let dir = tempdir().expect("tempdir");
    let template = dir.path().join("custom.tt");
    fs::write(&template, "<#@ custom #>\ntext").expect("write template");

    let output = Command::new(exe)
        .arg("process")
        .arg(&template)
        .output()
        .expect("run texttransform process");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error[TT2001]"), "unexpected stderr: {stderr}");
    assert!(!dir.path().join("custom.txt").exists());
}

#[test]
fn unknown_flags_are_rejected() {
    let Some(exe) = option_env!("CARGO_BIN_EXE_texttransform") else {
        eprintln!("skipping: CARGO_BIN_EXE_texttransform not set");
        return;
    };
    let output = Command::new(exe)
        .args(["process", "a.tt", "--frobnicate"])
        .output()
        .expect("run texttransform");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown flag --frobnicate"), "unexpected stderr: {stderr}");
}
