// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
use assert_cmd::Command;
use predicates::prelude::predicate;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[test]
// Test volguard -V produces version string.
fn test_volguard_version() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("volguard")?;
    cmd.arg("-V");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains(VERSION));
    Ok(())
}

#[test]
// Test volguard when no subcommand is given.
fn test_volguard_no_subcommand() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("volguard")?;
    cmd.assert().failure().code(2);
    Ok(())
}

#[test]
// Test that expand lists every address of the block, one per line.
fn test_volguard_expand() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("volguard")?;
    cmd.env_remove("RUST_LOG").arg("expand").arg("10.0.0.0/30");
    cmd.assert()
        .success()
        .stdout("10.0.0.0\n10.0.0.1\n10.0.0.2\n10.0.0.3\n");
    Ok(())
}

#[test]
// Test that expand rejects a malformed block.
fn test_volguard_expand_bad_range() {
    let mut cmd = Command::cargo_bin("volguard").unwrap();
    cmd.arg("expand").arg("10.0.0.0/33");
    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Invalid address range"));
}

#[test]
// Test that fence requires at least one range.
fn test_volguard_fence_no_ranges() {
    let mut cmd = Command::cargo_bin("volguard").unwrap();
    cmd.arg("fence").arg("add");
    cmd.assert().failure().code(2);
}

#[test]
// Test that fence validates the ranges before contacting the cluster.
fn test_volguard_fence_bad_range() {
    let mut cmd = Command::cargo_bin("volguard").unwrap();
    cmd.arg("fence").arg("add").arg("not-a-range");
    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Invalid address range"));
}

#[test]
// Test that a missing configuration file is reported.
fn test_volguard_missing_config() {
    let mut cmd = Command::cargo_bin("volguard").unwrap();
    cmd.arg("--config")
        .arg("/nonexistent/volguard.json")
        .arg("evict")
        .arg("remove")
        .arg("10.0.0.0/30");
    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Failed to open configuration file"));
}

#[test]
// Test that rotate requires the image of the volume.
fn test_volguard_rotate_no_image() {
    let mut cmd = Command::cargo_bin("volguard").unwrap();
    cmd.arg("rotate").arg("vol-1");
    cmd.assert().failure().code(2);
}

#[test]
// Test that expand refuses a block larger than the expansion limit.
fn test_volguard_expand_too_large() {
    let mut cmd = Command::cargo_bin("volguard").unwrap();
    cmd.arg("expand").arg("10.0.0.0/4");
    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("at most 24 can be expanded"));
}
