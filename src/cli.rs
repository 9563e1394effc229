use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cyris", about = "Cyber range orchestrator: KVM/libvirt provisioning, topology, and task execution")]
pub struct Cli {
    /// Path to the environment settings file
    #[arg(short, long, default_value = "/etc/cyris/settings.yml")]
    pub settings: PathBuf,

    /// Enable verbose output (operation tag + stack trace + tool stderr on failure)
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a range from a YAML description file
    Create {
        /// Path to the range description YAML
        description: PathBuf,

        /// Override the range id declared in clone_settings
        #[arg(long)]
        range_id: Option<String>,

        /// Plan and validate only; issue no libvirt calls and write no files
        #[arg(long)]
        dry_run: bool,

        /// Network mode for guest interfaces
        #[arg(long, value_enum, default_value_t = NetworkModeArg::User)]
        network_mode: NetworkModeArg,

        /// Attach guests to the default libvirt network instead of user-mode NAT
        #[arg(long)]
        enable_ssh: bool,
    },

    /// List known ranges
    List {
        /// Show only this range id
        #[arg(long)]
        range_id: Option<String>,

        /// Include destroyed ranges
        #[arg(long)]
        all: bool,

        /// Print resource ids and task results alongside status
        #[arg(long)]
        verbose: bool,
    },

    /// Show a single range's status
    Status {
        range_id: String,

        /// Include per-guest task results and resource ids
        #[arg(long)]
        verbose: bool,
    },

    /// Tear down a range's infrastructure
    Destroy {
        range_id: String,

        /// Destroy even if the range is not in a terminal-reachable state
        #[arg(long)]
        force: bool,

        /// Also remove the range's metadata and directory afterwards
        #[arg(long)]
        rm: bool,
    },

    /// Remove a range's metadata and directory
    Rm {
        range_id: String,

        /// Force-destroy first if the range is not terminal
        #[arg(long)]
        force: bool,
    },

    /// Print per-VM SSH connection details for a range
    SshInfo { range_id: String },

    /// Check that environment dependencies (libvirt, qemu-img, ssh, …) are present
    Validate,

    /// Print the resolved environment settings
    ConfigShow,

    /// Interactively write an environment settings file
    ConfigInit {
        /// Destination path for the settings file
        #[arg(long, default_value = "/etc/cyris/settings.yml")]
        out: PathBuf,
    },

    /// Apply filesystem ACLs needed for qemu:///system libvirt access
    SetupPermissions,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkModeArg {
    User,
    Bridge,
}
