//! `odq` command line behaviour.

#![allow(missing_docs)]

mod common;

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::{json, Value};
use tempfile::TempDir;

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write fixture");
    path
}

fn price_filter_command() -> String {
    json!({
        "collection": "Products",
        "filter": {
            "kind": "binary",
            "op": "GreaterThan",
            "left": {"kind": "reference", "path": "Price"},
            "right": {"kind": "value", "value": {"t": "Int32", "v": 10}}
        },
        "order_by": ["Price desc"],
        "top": 5
    })
    .to_string()
}

#[test]
fn compile_prints_method_and_uri() {
    let dir = TempDir::new().expect("tempdir");
    let model = write(dir.path(), "model.json", &common::northwind_json("4.0"));
    let command = write(dir.path(), "command.json", &price_filter_command());

    let output = cargo_bin_cmd!("odq")
        .arg("compile")
        .arg(&command)
        .arg("--model")
        .arg(&model)
        .output()
        .expect("run odq");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        "GET Products?$filter=Price gt 10&$orderby=Price desc&$top=5"
    );
}

#[test]
fn compile_json_output_honours_protocol_override() {
    let dir = TempDir::new().expect("tempdir");
    let model = write(dir.path(), "model.json", &common::northwind_json("4.0"));
    let command = write(
        dir.path(),
        "command.json",
        &json!({
            "collection": "Orders",
            "filter": {
                "kind": "binary",
                "op": "GreaterThan",
                "left": {"kind": "reference", "path": "OrderDetails/Quantity"},
                "right": {"kind": "value", "value": {"t": "Int32", "v": 50}}
            },
            "include_count": true
        })
        .to_string(),
    );

    let output = cargo_bin_cmd!("odq")
        .args(["--format", "json", "compile"])
        .arg(&command)
        .arg("--model")
        .arg(&model)
        .args(["--protocol", "3.0"])
        .output()
        .expect("run odq");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let report: Value = serde_json::from_slice(&output.stdout).expect("json output");
    assert_eq!(report["version"], "3.0");
    assert_eq!(report["request"]["method"], "GET");
    assert_eq!(
        report["uri"],
        "Orders?$filter=OrderDetails/any(x:x/Quantity gt 50)&$inlinecount=allpages"
    );
}

#[test]
fn config_file_supplies_model_and_update_method() {
    let dir = TempDir::new().expect("tempdir");
    write(dir.path(), "model.json", &common::northwind_json("4.0"));
    let config = write(
        dir.path(),
        "odq.toml",
        "base_uri = \"http://svc/\"\nmetadata_file = \"model.json\"\nupdate_method = \"put\"\n",
    );
    let command = write(
        dir.path(),
        "command.json",
        &json!({
            "collection": "Products",
            "key": [{"t": "Int32", "v": 1}],
            "operation": "update",
            "entry": {"ProductName": {"t": "String", "v": "Chai"}}
        })
        .to_string(),
    );

    let output = cargo_bin_cmd!("odq")
        .arg("compile")
        .arg(&command)
        .arg("--config")
        .arg(&config)
        .output()
        .expect("run odq");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut lines = stdout.lines();
    assert_eq!(lines.next(), Some("PUT Products(1)"));
    assert!(lines.next().is_some_and(|payload| payload.contains("Chai")));
}

#[test]
fn detect_reads_headers_and_documents() {
    let output = cargo_bin_cmd!("odq")
        .args(["detect", "--header", "DataServiceVersion: 2.0;NetFx"])
        .output()
        .expect("run odq");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "2.0");

    let dir = TempDir::new().expect("tempdir");
    let metadata = write(
        dir.path(),
        "metadata.xml",
        r#"<edmx:Edmx Version="4.0" xmlns:edmx="http://docs.oasis-open.org/odata/ns/edmx"/>"#,
    );
    let output = cargo_bin_cmd!("odq")
        .arg("detect")
        .arg("--metadata")
        .arg(&metadata)
        .output()
        .expect("run odq");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "4.0");
}

#[test]
fn failures_exit_non_zero_with_error_code() {
    let dir = TempDir::new().expect("tempdir");
    let command = write(dir.path(), "command.json", &price_filter_command());
    let output = cargo_bin_cmd!("odq")
        .arg("compile")
        .arg(&command)
        .env_remove("ODQ_CONFIG")
        .output()
        .expect("run odq");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("[Config]"));

    let output = cargo_bin_cmd!("odq")
        .args(["detect", "--header", "OData-Version: 9.0"])
        .output()
        .expect("run odq");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("[UnsupportedVersion]"));
}
