mod stub_server;

use predicates::prelude::*;
use stub_server::{StubResponse, StubServer};

#[test]
fn export_saves_artifact_under_the_advertised_name() -> anyhow::Result<()> {
    let server = StubServer::spawn(|req| {
        if req.method != "GET" || req.url != "/api/documents/doc-7/export" {
            return StubResponse::text(404, "not found");
        }
        StubResponse::text(200, "DOCX-BYTES")
            .with_header(
                "Content-Disposition",
                "attachment; filename=\"export.docx\"; filename*=UTF-8''%E5%AE%9E%E6%96%BD%E6%96%B9%E6%A1%88.docx",
            )
            .with_header("Content-Type", "application/octet-stream")
    });
    let dir = tempfile::tempdir()?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("draftsync");
    cmd.args(["export", "--document", "doc-7"])
        .arg("--base-url")
        .arg(format!("{}/api", server.base_url))
        .arg("--out")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("实施方案.docx"));

    let saved = std::fs::read_to_string(dir.path().join("实施方案.docx"))?;
    assert_eq!(saved, "DOCX-BYTES");
    Ok(())
}

#[test]
fn export_failure_surfaces_the_service_message() -> anyhow::Result<()> {
    let server = StubServer::spawn(|_| StubResponse::text(500, "renderer crashed"));
    let dir = tempfile::tempdir()?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("draftsync");
    cmd.args(["export", "--document", "doc-7"])
        .arg("--base-url")
        .arg(&server.base_url)
        .arg("--out")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("renderer crashed"));
    Ok(())
}

#[test]
fn workspace_export_restores_body_from_sections() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let sections = dir.path().join("sections.json");
    std::fs::write(
        &sections,
        r#"[{"id":"1","title":"总览","content":"正文内容\n\n📊 字数统计：120字"}]"#,
    )?;
    let out = dir.path().join("out");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("draftsync");
    cmd.args(["export", "--document", "plan"])
        .arg("--workspace")
        .arg(dir.path())
        .arg("--sections")
        .arg(&sections)
        .arg("--out")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("plan.md"));

    let exported = std::fs::read_to_string(out.join("plan.md"))?;
    assert!(exported.contains("## 总览"));
    assert!(exported.contains("正文内容"));
    assert!(!exported.contains("字数统计"));
    Ok(())
}

#[test]
fn workspace_export_of_an_unknown_document_fails() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("draftsync");
    cmd.args(["export", "--document", "missing"])
        .arg("--workspace")
        .arg(dir.path())
        .arg("--out")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("nothing to export"));
    Ok(())
}
