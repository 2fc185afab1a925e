//! Containment guard scenarios: path jail, SSRF, command allowlist.

use std::collections::BTreeSet;
use std::fs;
use std::net::IpAddr;

use toolguard_core::domain::{
    CommandMode, CommandSanitizerConfig, PathSandboxConfig, SsrfGuardConfig,
};
use toolguard_core::{shell_escape, CommandSanitizer, GuardViolation, PathSandbox, SsrfGuard};

// -------------------------------------------------------------------------
// PathSandbox
// -------------------------------------------------------------------------

fn workspace() -> (tempfile::TempDir, PathSandbox) {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("work/src")).unwrap();
    fs::write(dir.path().join("work/src/lib.rs"), "").unwrap();
    fs::write(dir.path().join("secret.txt"), "s3cr3t").unwrap();
    let sandbox = PathSandbox::new(&PathSandboxConfig {
        enabled: true,
        allowed_dirs: vec![dir.path().join("work")],
        ..Default::default()
    })
    .unwrap();
    (dir, sandbox)
}

#[test]
fn test_path_inside_workspace_resolves() {
    let (dir, sandbox) = workspace();
    let got = sandbox.validate(dir.path().join("work/src/lib.rs")).unwrap();
    assert!(got.is_absolute());
    assert!(got.ends_with("work/src/lib.rs"));
}

#[test]
fn test_traversal_out_of_workspace_is_denied() {
    let (dir, sandbox) = workspace();
    let err = sandbox
        .validate(dir.path().join("work/src/../../secret.txt"))
        .unwrap_err();
    assert!(matches!(err, GuardViolation::PathSandbox(_)));
    assert!(sandbox.validate("../secret.txt").is_err());
}

#[cfg(unix)]
#[test]
fn test_symlink_pointing_outside_is_denied() {
    let (dir, sandbox) = workspace();
    std::os::unix::fs::symlink(
        dir.path().join("secret.txt"),
        dir.path().join("work/innocent.txt"),
    )
    .unwrap();
    assert!(sandbox.validate(dir.path().join("work/innocent.txt")).is_err());
}

#[test]
fn test_default_blocked_patterns_protect_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = PathSandbox::new(&PathSandboxConfig {
        allowed_dirs: vec![dir.path().to_path_buf()],
        ..Default::default()
    })
    .unwrap();
    for rel in [".ssh/id_rsa", ".aws/credentials", ".env", ".env.local", "certs/server.pem"] {
        assert!(
            sandbox.validate(dir.path().join(rel)).is_err(),
            "{rel} should be blocked"
        );
    }
    assert!(sandbox.validate(dir.path().join("environment.md")).is_ok());
}

// -------------------------------------------------------------------------
// SsrfGuard
// -------------------------------------------------------------------------

fn ssrf(allowed: &[&str]) -> SsrfGuard {
    SsrfGuard::new(&SsrfGuardConfig {
        enabled: true,
        allowed_hosts: allowed.iter().map(|h| h.to_string()).collect(),
        blocked_cidrs: BTreeSet::new(),
    })
    .unwrap()
}

#[test]
fn test_metadata_and_private_literals_denied_regardless_of_allowlist() {
    let guard = ssrf(&["169.254.169.254", "192.168.1.10", "localhost", "[::1]"]);
    for url in [
        "http://169.254.169.254/latest/meta-data/iam/",
        "http://169.254.170.2/v2/credentials",
        "http://[fd00:ec2::254]/latest/",
        "http://192.168.1.10/admin",
        "http://[::1]:8080/",
        "http://172.16.0.1/",
    ] {
        let err = guard.validate_url(url).unwrap_err();
        assert!(matches!(err, GuardViolation::Ssrf(_)), "{url}");
    }
}

#[test]
fn test_public_hosts_pass_pre_dns() {
    let guard = ssrf(&[]);
    assert!(guard.validate_url("https://api.github.com/repos").is_ok());
    assert!(guard.validate_url("http://93.184.216.34/").is_ok());
}

#[test]
fn test_dns_rebinding_to_private_address_is_caught_post_dns() {
    let guard = ssrf(&[]);
    assert!(guard.validate_url("http://rebind.attacker.example/").is_ok());
    let ip: IpAddr = "127.0.0.1".parse().unwrap();
    assert!(guard.validate_resolved("rebind.attacker.example", ip).is_err());
}

// -------------------------------------------------------------------------
// CommandSanitizer
// -------------------------------------------------------------------------

fn allowlist(commands: &[&str]) -> CommandSanitizer {
    CommandSanitizer::new(&CommandSanitizerConfig {
        enabled: true,
        mode: CommandMode::Allowlist,
        allowed_commands: commands.iter().map(|c| c.to_string()).collect(),
        blocked_patterns: vec![],
    })
    .unwrap()
}

#[test]
fn test_allowlist_examples() {
    let sanitizer = allowlist(&["git", "ls", "cat"]);
    assert!(sanitizer.validate("git status").is_ok());
    assert!(sanitizer.validate("git status && ls -la").is_ok());
    assert!(sanitizer.validate("cat README.md | ls").is_ok());
    assert!(sanitizer.validate("git status; rm -rf /").is_err());
    assert!(sanitizer.validate("ls || curl http://x").is_err());
    assert!(sanitizer.validate("/bin/git status").is_err());
}

#[test]
fn test_escaped_argument_cannot_smuggle_commands() {
    let sanitizer = allowlist(&["echo"]);
    let hostile = "hello; rm -rf / && $(reboot)";
    let line = format!("echo {}", shell_escape(hostile));
    assert!(sanitizer.validate(&line).is_ok());
}
