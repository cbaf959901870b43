//! Command-line interface definitions for the `cirrus` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Top-level CLI for the `cirrus` binary.
#[derive(Debug, Parser)]
#[command(
    name = "cirrus",
    about = "Provision and manage EC2 instances from the command line",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Region to operate in, overriding the configured location.
    #[arg(long, global = true, value_name = "REGION")]
    pub(crate) region: Option<String>,
    /// Action to perform.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of the `cirrus` binary.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Launch and deploy an instance described by a JSON profile.
    #[command(name = "create")]
    Create(CreateCommand),
    /// Terminate an instance, refusing protected ones.
    #[command(name = "destroy")]
    Destroy(NameArg),
    /// Stop an instance.
    #[command(name = "stop")]
    Stop(NameArg),
    /// Start a stopped instance.
    #[command(name = "start")]
    Start(NameArg),
    /// Reboot an instance.
    #[command(name = "reboot")]
    Reboot(NameArg),
    /// Show every detail of an instance.
    #[command(name = "show")]
    Show(NameArg),
    /// List instances.
    #[command(name = "list")]
    List(ListCommand),
    /// Set tags on an instance.
    #[command(name = "set-tags")]
    SetTags(SetTagsCommand),
    /// Remove tags from an instance.
    #[command(name = "del-tags")]
    DelTags(DelTagsCommand),
    /// Show or change termination protection.
    #[command(name = "term-protect")]
    TermProtect(TermProtectCommand),
}

/// Arguments for `cirrus create`.
#[derive(Debug, Args)]
pub(crate) struct CreateCommand {
    /// Path to the JSON profile.
    #[arg(value_name = "PROFILE")]
    pub(crate) profile: String,
    /// Override the instance name set in the profile.
    #[arg(long, value_name = "NAME")]
    pub(crate) name: Option<String>,
}

/// A single instance name.
#[derive(Debug, Args)]
pub(crate) struct NameArg {
    /// Instance name (its `Name` tag).
    #[arg(value_name = "NAME")]
    pub(crate) name: String,
}

/// Arguments for `cirrus list`.
#[derive(Debug, Args)]
pub(crate) struct ListCommand {
    /// Print full descriptors instead of the summary columns.
    #[arg(long)]
    pub(crate) full: bool,
}

/// Arguments for `cirrus set-tags`.
#[derive(Debug, Args)]
pub(crate) struct SetTagsCommand {
    /// Instance name.
    #[arg(value_name = "NAME")]
    pub(crate) name: String,
    /// Tags as `key=value`.
    #[arg(required = true, value_name = "KEY=VALUE")]
    pub(crate) tags: Vec<String>,
}

/// Arguments for `cirrus del-tags`.
#[derive(Debug, Args)]
pub(crate) struct DelTagsCommand {
    /// Instance name.
    #[arg(value_name = "NAME")]
    pub(crate) name: String,
    /// Tag keys to remove.
    #[arg(required = true, value_name = "KEY")]
    pub(crate) keys: Vec<String>,
}

/// Arguments for `cirrus term-protect`.
#[derive(Debug, Args)]
pub(crate) struct TermProtectCommand {
    /// Instance name.
    #[arg(value_name = "NAME")]
    pub(crate) name: String,
    /// What to do with the protection flag.
    #[arg(value_enum, default_value_t = ProtectAction::Show)]
    pub(crate) action: ProtectAction,
}

/// Termination-protection actions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum ProtectAction {
    /// Report the current setting.
    Show,
    /// Turn protection on.
    Enable,
    /// Turn protection off.
    Disable,
}
