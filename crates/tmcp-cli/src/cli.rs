//! CLI command definitions and argument parsing

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use tmcp_core::types::Advertisement;
use tmcp_transport::TransportKind;

use crate::config::Config;
use crate::output::{OutputFormat, OutputFormatter, SuccessMessage};
use crate::ExitCode;

/// tmcp - trust transport bridge for RPC sessions
#[derive(Parser, Debug)]
#[command(name = "tmcp")]
#[command(version, about = "tmcp - RPC sessions over a DID-authenticated trust transport")]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug mode (session-level tracing)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Config file path
    #[arg(long, global = true, env = "TMCP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Identity store path (overrides config)
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// DID registry publish URL (overrides config)
    #[arg(long = "registry-url", global = true, env = "TMCP_REGISTRY_URL")]
    pub registry_url: Option<String>,
}

impl Cli {
    /// Execute the CLI command with a pre-loaded configuration
    pub async fn execute_with_config(self, config: Config) -> anyhow::Result<ExitCode> {
        let formatter = OutputFormatter::new(self.output, self.verbose || config.output.verbose);

        match self.command {
            Commands::Identity(args) => args.execute(&formatter, &config).await,
            Commands::Resolve(args) => args.execute(&formatter, &config).await,
            Commands::Demo(args) => args.execute(&formatter, &config).await,
            Commands::Config(args) => args.execute(&formatter, &config),
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage local identities
    Identity(IdentityArgs),
    /// Resolve a peer DID
    Resolve(ResolveArgs),
    /// Run an in-process client and server session
    Demo(DemoArgs),
    /// Inspect configuration
    Config(ConfigArgs),
}

fn parse_kind(s: &str) -> Result<TransportKind, String> {
    s.parse::<TransportKind>().map_err(|e| e.to_string())
}

// ============================================================================
// identity
// ============================================================================

#[derive(Parser, Debug)]
pub struct IdentityArgs {
    #[command(subcommand)]
    pub action: IdentityAction,
}

/// Identity subcommands
#[derive(Subcommand, Debug)]
pub enum IdentityAction {
    /// Load the identity for an alias, creating or republishing it as needed
    Init {
        /// Local alias, e.g. "demo-server"
        alias: String,
        /// Advertised transport kind: push-stream or bidirectional-socket
        #[arg(long, value_parser = parse_kind, default_value = "push-stream")]
        transport: TransportKind,
        /// Advertised endpoint address (default: client placeholder)
        #[arg(long)]
        address: Option<String>,
    },
    /// Show the published identity for an alias
    Show {
        alias: String,
    },
    /// List every stored identity, including retired ones
    List,
    /// Retire an identity, keeping its record
    Retire {
        id: Uuid,
    },
    /// Delete an identity and its keys
    Delete {
        id: Uuid,
        /// Skip confirmation
        #[arg(long)]
        force: bool,
    },
}

impl IdentityArgs {
    pub async fn execute(self, formatter: &OutputFormatter, config: &Config) -> anyhow::Result<ExitCode> {
        let (store, path) = crate::identity::open_store(config)?;
        formatter.progress(&format!("Identity store: {}", path.display()));

        match self.action {
            IdentityAction::Init {
                alias,
                transport,
                address,
            } => {
                let address =
                    address.unwrap_or_else(|| config.registry.client_placeholder_address.clone());
                formatter.progress(&format!("Loading identity '{alias}'..."));
                let identity = store
                    .load_or_create(&alias, &Advertisement::new(transport, address))
                    .await?;
                formatter.success(&format!("Identity '{alias}' is {}", identity.did));
                println!("{}", formatter.format_identity(&identity, "identity init"));
                Ok(ExitCode::Success)
            }
            IdentityAction::Show { alias } => match store.get(&alias).await? {
                Some(identity) => {
                    println!("{}", formatter.format_identity(&identity, "identity show"));
                    Ok(ExitCode::Success)
                }
                None => {
                    formatter.warning(&format!("No published identity for alias '{alias}'"));
                    Ok(ExitCode::InvalidInput)
                }
            },
            IdentityAction::List => {
                let identities = store.list().await?;
                println!("{}", formatter.format_identities(&identities));
                Ok(ExitCode::Success)
            }
            IdentityAction::Retire { id } => {
                store.retire(id).await?;
                formatter.success(&format!("Identity {id} retired"));
                print_json(formatter, &SuccessMessage::new(format!("retired {id}")), "identity retire");
                Ok(ExitCode::Success)
            }
            IdentityAction::Delete { id, force } => {
                if !force && !confirm(&format!("Delete identity {id} and its keys? Its DID cannot be used again."))? {
                    eprintln!("Aborted.");
                    return Ok(ExitCode::Success);
                }
                store.delete(id).await?;
                formatter.success(&format!("Identity {id} deleted"));
                print_json(formatter, &SuccessMessage::new(format!("deleted {id}")), "identity delete");
                Ok(ExitCode::Success)
            }
        }
    }
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    eprint!("{prompt} [y/N] ");
    io::stderr().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn print_json<T: serde::Serialize>(formatter: &OutputFormatter, data: &T, command: &str) {
    let out = formatter.format_success(data, command);
    if !out.is_empty() {
        println!("{out}");
    }
}

// ============================================================================
// resolve
// ============================================================================

#[derive(Parser, Debug)]
pub struct ResolveArgs {
    /// DID to resolve, e.g. did:web:did.teaspoon.world:endpoint:demo-server-1a2b3c4d
    pub did: String,
}

impl ResolveArgs {
    pub async fn execute(self, formatter: &OutputFormatter, config: &Config) -> anyhow::Result<ExitCode> {
        let resolver = crate::identity::resolver(config)?;
        formatter.progress(&format!("Resolving {}...", self.did));
        let peer = resolver.resolve(&self.did).await?;
        println!("{}", formatter.format_peer(&peer));
        Ok(ExitCode::Success)
    }
}

// ============================================================================
// demo
// ============================================================================

#[derive(Parser, Debug)]
pub struct DemoArgs {
    /// Transport kind the server advertises
    #[arg(long, value_parser = parse_kind, default_value = "bidirectional-socket")]
    pub transport: TransportKind,

    /// Number of request/response round trips
    #[arg(long, default_value_t = 10)]
    pub messages: u32,
}

impl DemoArgs {
    pub async fn execute(self, formatter: &OutputFormatter, config: &Config) -> anyhow::Result<ExitCode> {
        formatter.progress(&format!(
            "Starting demo over {} with {} messages...",
            self.transport, self.messages
        ));
        let interrupt = async {
            // without a signal handler the demo just runs to completion
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        let report = crate::demo::run(config.bridge(), self.transport, self.messages, interrupt)
            .await
            .context("demo session failed")?;
        formatter.success(&format!(
            "{} round trips over {} in {} ms",
            report.round_trips, report.transport_kind, report.elapsed_ms
        ));
        formatter.info(&format!(
            "Session {} ended {}: {} sealed, {} opened, {} replayed",
            report.session_id, report.final_state, report.sealed, report.opened, report.replayed
        ));
        println!("{}", formatter.format_demo(&report));
        Ok(ExitCode::Success)
    }
}

// ============================================================================
// config
// ============================================================================

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the default config file path
    Path,
    /// Print the effective configuration as TOML
    Show,
    /// Print a commented sample configuration
    Sample,
}

impl ConfigArgs {
    pub fn execute(self, formatter: &OutputFormatter, config: &Config) -> anyhow::Result<ExitCode> {
        match self.action {
            ConfigAction::Path => match Config::default_path() {
                Some(path) => {
                    println!("{}", path.display());
                    Ok(ExitCode::Success)
                }
                None => {
                    formatter.warning("No home directory; pass --config explicitly");
                    Ok(ExitCode::GeneralError)
                }
            },
            ConfigAction::Show => {
                match formatter.format() {
                    OutputFormat::Json => print_json(formatter, config, "config show"),
                    OutputFormat::Table => print!("{}", toml::to_string_pretty(config)?),
                    OutputFormat::Quiet => {}
                }
                Ok(ExitCode::Success)
            }
            ConfigAction::Sample => {
                print!("{}", Config::sample_toml());
                Ok(ExitCode::Success)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_identity_init() {
        let cli = Cli::try_parse_from([
            "tmcp",
            "--output",
            "json",
            "identity",
            "init",
            "demo-server",
            "--transport",
            "sse",
            "--address",
            "sse://localhost:8000/sse",
        ])
        .unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        match cli.command {
            Commands::Identity(IdentityArgs {
                action: IdentityAction::Init { alias, transport, address },
            }) => {
                assert_eq!(alias, "demo-server");
                assert_eq!(transport, TransportKind::PushStream);
                assert_eq!(address.as_deref(), Some("sse://localhost:8000/sse"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_demo_defaults() {
        let cli = Cli::try_parse_from(["tmcp", "demo"]).unwrap();
        match cli.command {
            Commands::Demo(args) => {
                assert_eq!(args.transport, TransportKind::BidirectionalSocket);
                assert_eq!(args.messages, 10);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_transport_kind() {
        assert!(Cli::try_parse_from(["tmcp", "demo", "--transport", "carrier-pigeon"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["tmcp", "identity", "list", "--verbose", "--store", "/tmp/ids.json"])
            .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/ids.json")));
    }

    #[tokio::test]
    async fn test_identity_list_on_empty_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.identity.path = Some(dir.path().join("identities.json"));

        let cli = Cli::try_parse_from(["tmcp", "--output", "quiet", "identity", "list"]).unwrap();
        assert_eq!(cli.execute_with_config(config).await.unwrap(), ExitCode::Success);
    }

    #[tokio::test]
    async fn test_demo_command_succeeds() {
        let cli = Cli::try_parse_from(["tmcp", "--output", "quiet", "demo", "--messages", "3"]).unwrap();
        assert_eq!(cli.execute_with_config(Config::default()).await.unwrap(), ExitCode::Success);
    }
}
