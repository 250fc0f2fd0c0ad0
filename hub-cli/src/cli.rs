use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "hubctl",
    version,
    about = "Log in to the hub and follow notifications from the terminal",
    long_about = None
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the API base URL
    #[arg(long, env = "HUB_BASE_URL", global = true)]
    pub base_url: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Pretty, global = true)]
    pub output: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Log in with an identifier and secret
    Login {
        /// Account identifier (usually the e-mail address)
        identifier: String,

        /// Secret; read from stdin when omitted
        #[arg(long, env = "HUB_SECRET", hide_env_values = true)]
        secret: Option<String>,
    },

    /// Log in with a federated identity provider token
    LoginFederated {
        /// Provider access token
        token: String,
    },

    /// Forget the stored session
    Logout,

    /// Show the logged-in user
    Whoami,

    /// Inspect and acknowledge notifications
    Notifications {
        #[command(subcommand)]
        action: NotificationAction,
    },

    /// Follow pushed notifications until interrupted
    Watch {
        /// Skip fetching the current list before connecting
        #[arg(long)]
        no_initial: bool,
    },

    /// Show or reset configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,

        /// Reset configuration to defaults
        #[arg(long)]
        reset: bool,
    },
}

#[derive(Subcommand)]
pub enum NotificationAction {
    /// List notifications, newest first
    List {
        /// Only unread entries
        #[arg(long)]
        unread: bool,
    },

    /// Mark one notification as read
    Read { id: u64 },

    /// Mark every notification as read
    ReadAll,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human readable
    Pretty,
    /// One JSON document per result
    Json,
}
