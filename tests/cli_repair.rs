use predicates::prelude::*;

const MALFORMED: &str = "```json\n[{title:\"1. 总览\",targetWords:800},{title:\"1.1 背景\"}\n```";

#[test]
fn repair_reads_stdin_and_prints_recovered_json() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("draftsync");
    cmd.args(["repair", "--stats"])
        .write_stdin(MALFORMED)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"title\": \"1.1 背景\""))
        .stderr(predicate::str::contains("missing_quotes"));
}

#[test]
fn repair_without_structure_fails() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("draftsync");
    cmd.args(["repair"])
        .write_stdin("nothing to see here")
        .assert()
        .failure()
        .stderr(predicate::str::contains("recover json"));
}

#[test]
fn outline_nests_numbered_titles() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("outline.json");
    std::fs::write(&input, MALFORMED)?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("draftsync");
    cmd.args(["outline", "--nested", "--input"])
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"children\""))
        .stdout(predicate::str::contains("\"targetWords\": 800"));
    Ok(())
}

#[test]
fn paginate_estimates_pages_for_an_outline() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("outline.json");
    std::fs::write(
        &input,
        r#"[{"id":"1","title":"1. 总览","content":"内容"},{"id":"2","title":"2. 方案"}]"#,
    )?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("draftsync");
    cmd.args(["paginate", "--outline"])
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"pageCount\": 1"));
    Ok(())
}

#[test]
fn invalid_env_override_names_the_variable() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("draftsync");
    cmd.env("DRAFTSYNC_PAGE_HEIGHT", "tall")
        .args(["repair"])
        .write_stdin("{}")
        .assert()
        .failure()
        .stderr(predicate::str::contains("DRAFTSYNC_PAGE_HEIGHT"));
}

#[test]
fn rust_log_debug_emits_debug_line_to_stderr() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("draftsync");
    cmd.env_remove("DRAFTSYNC_LOG")
        .env("RUST_LOG", "debug")
        .args(["repair"])
        .write_stdin("{}")
        .assert()
        .success()
        .stderr(predicate::str::contains("parsed cli"));
}
