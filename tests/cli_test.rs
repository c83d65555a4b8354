use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;
use tempfile::NamedTempFile;

fn scenario_file(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

#[test]
fn test_cli_sbp_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let scenario = scenario_file(
        r#"{
            "method": "sbp",
            "config": {"order": {"order_id": "order-42", "amount": "100.00"}},
            "responses": {
                "init": [{"Ok": {"payment_id": 42}}],
                "statuses": [{"Ok": "AUTHORIZING"}, {"Ok": "CONFIRMED"}]
            }
        }"#,
    );

    let mut cmd = Command::new(cargo_bin!());
    cmd.arg(scenario.path()).args(["--delay-ms", "1"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::starts_with("step,state,payment_id,detail"))
        .stdout(predicate::str::contains("need_choose_on_ui,42,banks="))
        .stdout(predicate::str::contains("success,42"));

    Ok(())
}

#[test]
fn test_cli_recurrent_decline_without_cvc_stops_at_prompt() -> Result<(), Box<dyn std::error::Error>> {
    let scenario = scenario_file(
        r#"{
            "method": "recurrent",
            "config": {"order": {"order_id": "order-7", "amount": 15}},
            "source": {"type": "attached", "card_id": "card-1", "rebill_id": "rebill-1"},
            "responses": {
                "init": [{"Ok": {"payment_id": 123}}],
                "charge": [{"Err": {"kind": "api", "code": "104", "payment_id": 123}}]
            }
        }"#,
    );

    let mut cmd = Command::new(cargo_bin!());
    cmd.arg(scenario.path());

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("cvc_ui_needed,123,rejected=123"))
        .stdout(predicate::str::contains("success").not());

    Ok(())
}

#[test]
fn test_cli_missing_scenario_fails() {
    let mut cmd = Command::new(cargo_bin!());
    cmd.arg("does-not-exist.json");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load scenario"));
}

#[test]
fn test_cli_malformed_scenario_fails() {
    let scenario = scenario_file(r#"{"method": "cash"}"#);

    let mut cmd = Command::new(cargo_bin!());
    cmd.arg(scenario.path());

    cmd.assert().failure();
}
