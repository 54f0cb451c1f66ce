//! CLI module for glbc
//!
//! Subcommands:
//! - `glbc run` - Run the controller loop and the diagnostics server
//! - `glbc sync` - Run a single sync cycle and print what it did
//! - `glbc validate` - Check a desired-state file and show the planned URL maps
//! - `glbc get` - List the cluster's provider resources
//! - `glbc delete-all` - Delete every load-balancing resource the cluster owns

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

mod display;

pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "glbc")]
#[command(about = "Reconcile ingress routing rules against cloud L7 load balancers")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to config file (default: ~/.glbc/config.yaml)
    #[arg(long, global = true, env = "GLBC_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller loop and the diagnostics server
    Run(RunArgs),

    /// Run one sync cycle and exit
    Sync(SyncArgs),

    /// Validate a desired-state file without touching the provider
    Validate(ValidateArgs),

    /// List provider resources owned by this cluster
    Get(GetArgs),

    /// Delete every load balancer, backend, health check and the instance group
    #[command(name = "delete-all")]
    DeleteAll(CloudArgs),
}

/// Provider selection shared by every command that talks to the cloud
#[derive(Args, Debug, Clone, Default)]
pub struct CloudArgs {
    /// Use an in-memory provider instead of the Compute API
    #[arg(long, global = true)]
    pub fake_cloud: bool,

    /// Path to a .env file holding the access token
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Desired-state file (YAML or JSON), re-read every cycle
    #[arg(long, value_name = "FILE")]
    pub state: PathBuf,

    /// Override the diagnostics server address
    #[arg(long, value_name = "ADDR")]
    pub status_addr: Option<String>,

    /// Delete all cluster resources when shutting down
    #[arg(long)]
    pub delete_all_on_exit: bool,

    #[command(flatten)]
    pub cloud: CloudArgs,
}

/// Arguments for the sync command
#[derive(Parser, Debug)]
pub struct SyncArgs {
    /// Desired-state file (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    pub state: PathBuf,

    /// Print the sync report as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub cloud: CloudArgs,
}

/// Arguments for the validate command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Desired-state file (YAML or JSON)
    pub state: PathBuf,
}

/// Arguments for the get command
#[derive(Parser, Debug)]
pub struct GetArgs {
    #[command(subcommand)]
    pub resource: GetResource,

    #[command(flatten)]
    pub cloud: CloudArgs,
}

#[derive(Subcommand, Debug)]
pub enum GetResource {
    /// List backend services
    #[command(name = "backends", visible_alias = "backend", visible_alias = "be")]
    Backends,

    /// List load balancers
    #[command(name = "loadbalancers", visible_alias = "loadbalancer", visible_alias = "lb")]
    LoadBalancers,

    /// Show instance health behind the backend for a service port
    #[command(name = "health")]
    Health {
        /// Service node port
        port: u16,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "glbc",
            "-vv",
            "run",
            "--state",
            "desired.yaml",
            "--fake-cloud",
            "--delete-all-on-exit",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.state, PathBuf::from("desired.yaml"));
                assert!(args.cloud.fake_cloud);
                assert!(args.delete_all_on_exit);
                assert!(args.status_addr.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_get_health() {
        let cli = Cli::try_parse_from([
            "glbc",
            "get",
            "health",
            "8080",
            "--fake-cloud",
            "--env-file",
            "gce.env",
        ])
        .unwrap();
        match cli.command {
            Commands::Get(GetArgs {
                resource: GetResource::Health { port },
                cloud,
            }) => {
                assert_eq!(port, 8080);
                assert!(cloud.fake_cloud);
                assert_eq!(cloud.env_file, Some(PathBuf::from("gce.env")));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_lb_alias() {
        let cli = Cli::try_parse_from(["glbc", "get", "lb"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Get(GetArgs {
                resource: GetResource::LoadBalancers,
                ..
            })
        ));
    }

    #[test]
    fn test_parse_provider_flags_before_resource() {
        let cli = Cli::try_parse_from(["glbc", "get", "--fake-cloud", "backends"]).unwrap();
        match cli.command {
            Commands::Get(GetArgs {
                resource: GetResource::Backends,
                cloud,
            }) => assert!(cloud.fake_cloud),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
