//! toolguard - operator CLI for tool-security policy
//!
//! Works against a TOML policy file (see `FilePolicyStore`).
//!
//! ## Commands
//!
//! - `init`: provision an org with the default profile
//! - `check`: run one containment guard against an agent's effective profile
//! - `escape`: print a shell-escaped command line
//! - `policy`: show, set or reset an agent's overrides

use std::io::Read;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{debug, Level};

use toolguard_core::domain::ToolSecurityOverrides;
use toolguard_core::{
    shell_join, CommandSanitizer, FilePolicyStore, PathSandbox, PolicyError, PolicyResolver,
    PolicyStore, SsrfGuard, ToolSecurityProfile, ToolSecurityUpdate,
};

#[derive(Parser)]
#[command(name = "toolguard")]
#[command(author = "Stevedores Org")]
#[command(version = toolguard_core::VERSION)]
#[command(about = "Containment guards and policy for AI-agent tool calls", long_about = None)]
struct Cli {
    /// Policy file
    #[arg(long, global = true, env = "TOOLGUARD_CONFIG", default_value = "toolguard.toml")]
    config: PathBuf,

    /// Organization whose policy is used
    #[arg(long, global = true, env = "TOOLGUARD_ORG", default_value = "default")]
    org: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON verdicts
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default profile for the org into the policy file
    Init {
        /// Replace existing org defaults
        #[arg(long)]
        force: bool,
    },

    /// Run a containment guard; exits non-zero when the input is denied
    Check {
        #[arg(value_enum)]
        guard: GuardArg,

        /// Path, URL or command line to check
        input: String,

        /// Agent whose effective profile applies
        #[arg(long, default_value = "cli")]
        agent: String,

        /// Also check a DNS answer for the URL's host
        #[arg(long)]
        resolved_ip: Option<IpAddr>,
    },

    /// Print ARGS as one shell-safe command line
    Escape {
        #[arg(required = true, allow_hyphen_values = true, trailing_var_arg = true)]
        args: Vec<String>,
    },

    /// Agent policy operations
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum GuardArg {
    Path,
    Url,
    Command,
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Print org defaults, overrides and the effective profile
    Show {
        #[arg(long)]
        agent: String,
    },

    /// Replace the agent's overrides with a JSON patch
    Set {
        #[arg(long)]
        agent: String,

        /// JSON file holding the overrides, or `-` for stdin
        #[arg(long)]
        patch: PathBuf,

        #[arg(long)]
        updated_by: String,
    },

    /// Drop every override for the agent
    Reset {
        #[arg(long)]
        agent: String,

        #[arg(long)]
        updated_by: String,
    },
}

/// Outcome of `toolguard check`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Verdict {
    allowed: bool,
    input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    normalized: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl Verdict {
    fn allowed(input: &str, normalized: String) -> Self {
        Self {
            allowed: true,
            input: input.to_string(),
            normalized: Some(normalized),
            reason: None,
        }
    }

    fn denied(input: &str, reason: impl ToString) -> Self {
        Self {
            allowed: false,
            input: input.to_string(),
            normalized: None,
            reason: Some(reason.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    toolguard_core::init_tracing(cli.json, level);

    if let Commands::Escape { args } = &cli.command {
        println!("{}", shell_join(args));
        return Ok(ExitCode::SUCCESS);
    }

    let store = Arc::new(
        FilePolicyStore::open(&cli.config)
            .with_context(|| format!("Failed to open policy file {:?}", cli.config))?,
    );
    debug!(path = ?store.path(), org = %cli.org, "policy file opened");

    match cli.command {
        Commands::Init { force } => cmd_init(store.as_ref(), &cli.org, force).await,
        Commands::Check {
            guard,
            input,
            agent,
            resolved_ip,
        } => {
            let resolver = PolicyResolver::new(store);
            cmd_check(&resolver, &cli.org, &agent, guard, &input, resolved_ip, cli.json).await
        }
        Commands::Policy { action } => {
            let resolver = PolicyResolver::new(store);
            match action {
                PolicyAction::Show { agent } => cmd_policy_show(&resolver, &cli.org, &agent).await,
                PolicyAction::Set {
                    agent,
                    patch,
                    updated_by,
                } => cmd_policy_set(&resolver, &cli.org, &agent, &patch, updated_by).await,
                PolicyAction::Reset { agent, updated_by } => {
                    cmd_policy_reset(&resolver, &cli.org, &agent, &updated_by).await
                }
            }
        }
        Commands::Escape { .. } => Ok(ExitCode::SUCCESS),
    }
}

async fn cmd_init(store: &FilePolicyStore, org: &str, force: bool) -> Result<ExitCode> {
    match store.org_defaults(org).await {
        Ok(_) if !force => {
            println!(
                "Org '{}' already provisioned in {:?} (use --force to reset)",
                org,
                store.path()
            );
            return Ok(ExitCode::SUCCESS);
        }
        Ok(_) | Err(PolicyError::OrgNotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }

    store
        .set_org_defaults(org, ToolSecurityProfile::default())
        .await
        .context("Failed to write org defaults")?;
    println!("Provisioned org '{}' in {:?}", org, store.path());
    Ok(ExitCode::SUCCESS)
}

async fn cmd_check(
    resolver: &PolicyResolver,
    org: &str,
    agent: &str,
    guard: GuardArg,
    input: &str,
    resolved_ip: Option<IpAddr>,
    json: bool,
) -> Result<ExitCode> {
    let profile = resolver
        .effective(org, agent)
        .await
        .with_context(|| format!("No policy for org '{}'; run `toolguard init` first", org))?;
    let security = &profile.security;

    let verdict = match guard {
        GuardArg::Path => {
            let sandbox = PathSandbox::new(&security.path_sandbox)?;
            match sandbox.validate(input) {
                Ok(path) => Verdict::allowed(input, path.display().to_string()),
                Err(v) => Verdict::denied(input, v),
            }
        }
        GuardArg::Url => {
            let ssrf = SsrfGuard::new(&security.ssrf)?;
            match ssrf.validate_url(input) {
                Ok(url) => {
                    let post_dns = match (resolved_ip, url.host_str()) {
                        (Some(ip), Some(host)) => ssrf.validate_resolved(host, ip),
                        _ => Ok(()),
                    };
                    match post_dns {
                        Ok(()) => Verdict::allowed(input, url.to_string()),
                        Err(v) => Verdict::denied(input, v),
                    }
                }
                Err(v) => Verdict::denied(input, v),
            }
        }
        GuardArg::Command => {
            let sanitizer = CommandSanitizer::new(&security.command_sanitizer)?;
            match sanitizer.validate(input) {
                Ok(()) => Verdict::allowed(input, input.to_string()),
                Err(v) => Verdict::denied(input, v),
            }
        }
    };

    if json {
        println!("{}", serde_json::to_string(&verdict)?);
    } else if verdict.allowed {
        println!("allowed: {}", verdict.normalized.as_deref().unwrap_or(input));
    } else {
        println!("denied: {}", verdict.reason.as_deref().unwrap_or("policy"));
    }

    Ok(if verdict.allowed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn cmd_policy_show(resolver: &PolicyResolver, org: &str, agent: &str) -> Result<ExitCode> {
    let view = resolver.read_config(org, agent).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(ExitCode::SUCCESS)
}

async fn cmd_policy_set(
    resolver: &PolicyResolver,
    org: &str,
    agent: &str,
    patch: &Path,
    updated_by: String,
) -> Result<ExitCode> {
    let tool_security = read_patch(patch)?;
    let view = resolver
        .write_config(
            org,
            agent,
            ToolSecurityUpdate {
                tool_security,
                updated_by,
            },
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(ExitCode::SUCCESS)
}

async fn cmd_policy_reset(
    resolver: &PolicyResolver,
    org: &str,
    agent: &str,
    updated_by: &str,
) -> Result<ExitCode> {
    let view = resolver.reset_to_defaults(org, agent, updated_by).await?;
    println!("Reset '{}' to org defaults", agent);
    println!("{}", serde_json::to_string_pretty(&view.effective)?);
    Ok(ExitCode::SUCCESS)
}

fn read_patch(path: &Path) -> Result<ToolSecurityOverrides> {
    let text = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read patch from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read patch file {:?}", path))?
    };
    serde_json::from_str(&text).context("Patch is not a valid toolSecurity object")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_check_parses_resolved_ip() {
        let cli = Cli::try_parse_from([
            "toolguard",
            "check",
            "url",
            "http://internal.example/",
            "--resolved-ip",
            "10.0.0.7",
        ])
        .unwrap();
        match cli.command {
            Commands::Check {
                guard: GuardArg::Url,
                resolved_ip,
                ..
            } => assert_eq!(resolved_ip, Some("10.0.0.7".parse().unwrap())),
            _ => panic!("expected check url"),
        }
    }

    #[test]
    fn test_escape_accepts_hyphenated_args() {
        let cli = Cli::try_parse_from(["toolguard", "escape", "rm", "-rf", "it's"]).unwrap();
        match cli.command {
            Commands::Escape { args } => assert_eq!(args, vec!["rm", "-rf", "it's"]),
            _ => panic!("expected escape"),
        }
    }

    #[tokio::test]
    async fn test_init_then_check_against_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FilePolicyStore::open(dir.path().join("policy.toml")).unwrap());
        cmd_init(store.as_ref(), "acme", false).await.unwrap();

        let resolver = PolicyResolver::new(store);
        let denied = cmd_check(
            &resolver,
            "acme",
            "cli",
            GuardArg::Url,
            "http://169.254.169.254/latest/meta-data/",
            None,
            true,
        )
        .await
        .unwrap();
        assert_eq!(denied, ExitCode::FAILURE);

        let allowed = cmd_check(
            &resolver,
            "acme",
            "cli",
            GuardArg::Command,
            "git status",
            None,
            true,
        )
        .await
        .unwrap();
        assert_eq!(allowed, ExitCode::SUCCESS);
    }
}
