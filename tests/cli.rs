use assert_cmd::prelude::*; // Add methods on commands
use predicates::prelude::*; // Used for writing assertions
use std::process::Command; // Run programs

#[test]
fn test_cli_help() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("check_icmp")?;

    cmd.arg("--help");

    cmd.assert()
        .code(predicate::eq(3))
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("Options:"));

    Ok(())
}

#[test]
fn test_cli_version() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("check_icmp")?;

    cmd.arg("--version");

    cmd.assert()
        .code(predicate::eq(3))
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));

    Ok(())
}

#[test]
fn test_cli_no_hosts() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("check_icmp")?;

    cmd.assert()
        .code(predicate::eq(3))
        .stdout(predicate::str::starts_with("UNKNOWN - no hosts to check"));

    Ok(())
}

#[test]
fn test_cli_invalid_host() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("check_icmp")?;

    cmd.arg("not a host");

    cmd.assert()
        .code(predicate::eq(3))
        .stdout(predicate::str::starts_with(
            "UNKNOWN - invalid address or hostname",
        ));

    Ok(())
}

#[test]
fn test_cli_invalid_warning_pair() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("check_icmp")?;

    cmd.arg("192.0.2.1").arg("-w").arg("fast");

    cmd.assert()
        .code(predicate::eq(3))
        .stdout(predicate::str::contains("is not an rta,pl% pair"));

    Ok(())
}

#[test]
fn test_cli_conflicting_families() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("check_icmp")?;

    cmd.arg("192.0.2.1").arg("-4").arg("-6");

    cmd.assert()
        .code(predicate::eq(3))
        .stdout(predicate::str::contains("mutually exclusive"));

    Ok(())
}

#[test]
fn test_cli_unresolvable_host_is_critical() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("check_icmp")?;

    // The .invalid TLD is reserved and never resolves.
    cmd.arg("no-such-host.invalid");

    cmd.assert()
        .code(predicate::eq(2))
        .stdout(predicate::str::contains("name resolution failed"));

    Ok(())
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    #[ignore] // Needs ping_group_range or privileges, depending on the host.
    #[test]
    fn test_cli_loopback_is_ok() -> Result<(), Box<dyn std::error::Error>> {
        let mut cmd = Command::cargo_bin("check_icmp")?;

        cmd.arg("127.0.0.1").arg("-i").arg("0");

        cmd.assert()
            .success()
            .stdout(predicate::str::contains("[OK]"))
            .stdout(predicate::str::contains("rta="))
            .stdout(predicate::str::contains("pl=0%"));

        Ok(())
    }

    #[ignore] // Depends on the host's socket permissions.
    #[test]
    fn test_cli_unprivileged_message() -> Result<(), Box<dyn std::error::Error>> {
        let mut cmd = Command::cargo_bin("check_icmp")?;

        cmd.arg("127.0.0.1");

        cmd.assert()
            .code(predicate::eq(3))
            .stdout(predicate::str::contains("ICMP socket"));

        Ok(())
    }
}
