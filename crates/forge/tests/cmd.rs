// forge: A general-purpose, change-driven build system.
// Copyright (C) 2024 International Digital Economy Academy
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// For inquiries, you can contact us via e-mail at jichuruanjian@idea.edu.cn.

//! Smoke tests driving the installed binary.

mod util;

use std::process::Command;

use util::TestProject;

fn forge_bin() -> std::path::PathBuf {
    snapbox::cmd::cargo_bin("forge")
}

#[test]
fn version() {
    let out = Command::new(forge_bin()).arg("version").output().unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.starts_with("forge "), "stdout was: {}", stdout);
}

#[test]
fn missing_manifest_is_an_error() {
    let p = TestProject::new();
    let out = Command::new(forge_bin())
        .args(["build", "-C"])
        .arg(&p.root)
        .output()
        .unwrap();
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("forge.json"), "stderr was: {}", stderr);
}

#[cfg(unix)]
#[test]
fn build_and_rebuild() {
    let p = TestProject::new();
    p.file(
        "forge.json",
        r#"{
            "name": "proj",
            "targets": [
                { "name": "file{greeting}",
                  "recipe": ["sh", "-c", "echo hello > $out"] }
            ]
        }"#,
    );

    let out = Command::new(forge_bin())
        .args(["build", "-C"])
        .arg(&p.root)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(p.out().join("greeting").is_file());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("ran"), "stdout was: {}", stdout);

    // The rebuild is a no-op.
    let out = Command::new(forge_bin())
        .args(["build", "-C"])
        .arg(&p.root)
        .output()
        .unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("no work to do"), "stdout was: {}", stdout);

    // And clean removes the output.
    let out = Command::new(forge_bin())
        .args(["clean", "-C"])
        .arg(&p.root)
        .output()
        .unwrap();
    assert!(out.status.success());
    assert!(!p.out().join("greeting").exists());
}

#[cfg(unix)]
#[test]
fn dry_run_prints_commands_only() {
    let p = TestProject::new();
    p.file(
        "forge.json",
        r#"{
            "name": "proj",
            "targets": [
                { "name": "file{greeting}",
                  "recipe": ["sh", "-c", "echo hello > $out"] }
            ]
        }"#,
    );

    let out = Command::new(forge_bin())
        .args(["build", "--dry-run", "-C"])
        .arg(&p.root)
        .output()
        .unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("echo hello"), "stdout was: {}", stdout);
    assert!(!p.out().join("greeting").exists());
}
