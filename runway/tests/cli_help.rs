use std::io::Write;

use assert_cmd::cargo::cargo_bin_cmd;

#[test]
fn provision_help_lists_trigger_options() {
    let mut cmd = cargo_bin_cmd!("runway");
    let output = cmd
        .arg("provision")
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    for flag in [
        "--repository",
        "--workflow",
        "--ref",
        "--runner-count",
        "--compute-type",
        "--skip-consumer",
        "--config",
        "--env-file",
    ] {
        assert!(text.contains(flag), "provision help missing {flag}");
    }
}

#[test]
fn check_response_accepts_confirmation() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"statusCode":200,"body":"runner registered"}}"#).unwrap();

    let mut cmd = cargo_bin_cmd!("runway");
    let output = cmd
        .arg("check-response")
        .arg(file.path())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert!(String::from_utf8_lossy(&output).contains("runner confirmed"));
}

#[test]
fn check_response_reports_raw_payload_on_failure() {
    let mut cmd = cargo_bin_cmd!("runway");
    let output = cmd
        .arg("check-response")
        .arg("-")
        .write_stdin(r#"{"statusCode":500,"body":"capacity exceeded"}"#)
        .assert()
        .code(6)
        .get_output()
        .stderr
        .clone();
    let text = String::from_utf8_lossy(&output);
    assert!(text.contains(r#""statusCode":500"#), "stderr: {text}");
    assert!(text.contains("capacity exceeded"), "stderr: {text}");
}

#[test]
fn config_check_rejects_incomplete_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[cloud]\nregion = \"eu-west-1\"").unwrap();

    let mut cmd = cargo_bin_cmd!("runway");
    cmd.arg("config")
        .arg("check")
        .arg("--config")
        .arg(file.path())
        .env_remove("RUNWAY_ROLE_ARN")
        .env_remove("RUNWAY_DISPATCH_FUNCTION")
        .assert()
        .code(2);
}

#[test]
fn config_check_accepts_complete_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[github]
token_env = "RUNNER_TOKEN"

[cloud]
region = "eu-west-1"
role_arn = "arn:aws:iam::123456789012:role/runway"

[dispatch]
function_name = "provision-runner"
"#
    )
    .unwrap();

    let mut cmd = cargo_bin_cmd!("runway");
    let output = cmd
        .arg("config")
        .arg("check")
        .arg("--config")
        .arg(file.path())
        .env_remove("RUNWAY_RUNNER_COUNT")
        .env_remove("RUNWAY_COMPUTE_TYPE")
        .env_remove("RUNWAY_DISPATCH_TIMEOUT_SECS")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    assert!(text.contains("configuration ok"), "stdout: {text}");
    assert!(text.contains("function=provision-runner"), "stdout: {text}");
}
