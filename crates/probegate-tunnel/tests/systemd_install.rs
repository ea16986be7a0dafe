//! Tunnel service installation against a stand-in systemctl
#![cfg(unix)]

use probegate_tunnel::{SystemdInstaller, SystemdUnit};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Write a fake systemctl that logs its arguments and always succeeds
fn fake_systemctl(dir: &Path) -> (PathBuf, PathBuf) {
    let log = dir.join("systemctl.log");
    let script = dir.join("systemctl");
    std::fs::write(
        &script,
        format!("#!/bin/sh\necho \"$@\" >> {}\nexit 0\n", log.display()),
    )
    .unwrap();
    let mut perms = std::fs::metadata(&script).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).unwrap();
    (script, log)
}

#[tokio::test]
async fn test_install_writes_unit_and_enables() {
    let temp = TempDir::new().unwrap();
    let (systemctl, log) = fake_systemctl(temp.path());
    let unit_dir = temp.path().join("units");

    let installer = SystemdInstaller::with_paths(&unit_dir, &systemctl);
    let unit = SystemdUnit::for_tunnel(10001, "/usr/bin/probe-bootstrap supervise");

    assert!(installer.install(&unit).await.unwrap());

    let written = std::fs::read_to_string(unit_dir.join("probegate-tunnel-10001.service")).unwrap();
    assert_eq!(written, unit.render());

    let calls = std::fs::read_to_string(&log).unwrap();
    assert!(calls.contains("daemon-reload"));
    assert!(calls.contains("enable --now probegate-tunnel-10001.service"));
}

#[tokio::test]
async fn test_reinstall_of_active_unit_is_noop() {
    let temp = TempDir::new().unwrap();
    let (systemctl, log) = fake_systemctl(temp.path());
    let installer = SystemdInstaller::with_paths(temp.path().join("units"), &systemctl);
    let unit = SystemdUnit::for_tunnel(10002, "/usr/bin/probe-bootstrap supervise");

    assert!(installer.install(&unit).await.unwrap());
    std::fs::remove_file(&log).unwrap();

    assert!(!installer.install(&unit).await.unwrap());

    let calls = std::fs::read_to_string(&log).unwrap();
    assert!(calls.contains("is-active"));
    assert!(!calls.contains("enable"));
}
