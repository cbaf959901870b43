//! Binary entry point for the `cirrus` CLI.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::process;

use camino::Utf8Path;
use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use cirrus::config::{ConfigError, ProviderConfig};
use cirrus::deploy::{SshDeployer, SshSettings};
use cirrus::ops::{Ec2Client, LifecycleError};
use cirrus::profile::VmProfile;
use cirrus::provision::{ProvisionError, Provisioner};

mod cli;

use cli::{Cli, Command, ProtectAction};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to write output: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let mut config = ProviderConfig::load_without_cli_args()?;
    if let Some(region) = cli.region {
        config.location = region;
    }
    config.validate()?;
    let client = Ec2Client::new(config);

    match cli.command {
        Command::Create(args) => {
            let mut profile = VmProfile::load_json(Utf8Path::new(&args.profile))?;
            if let Some(name) = args.name {
                profile.name = name;
            }
            let deployer = SshDeployer::with_process_runner(SshSettings::default());
            let outcome = Provisioner::new(client, deployer)
                .provision(&profile)
                .await?;
            emit(&outcome)
        }
        Command::Destroy(args) => emit(&client.destroy(&args.name).await?),
        Command::Stop(args) => emit(&client.stop(&args.name).await?),
        Command::Start(args) => emit(&client.start(&args.name).await?),
        Command::Reboot(args) => emit(&client.reboot(&args.name).await?),
        Command::Show(args) => emit(&client.show_instance(&args.name).await?),
        Command::List(args) if args.full => emit(&client.list_nodes_full(None).await?),
        Command::List(_) => emit(&client.list_nodes(None).await?),
        Command::SetTags(args) => {
            let tags = parse_tags(&args.tags)?;
            let instance = client.find_node(&args.name, None).await?;
            emit(&client.set_tags(&instance.id, &tags, None).await?)
        }
        Command::DelTags(args) => {
            let instance = client.find_node(&args.name, None).await?;
            client.del_tags(&instance.id, &args.keys, None).await?;
            emit(&BTreeMap::from([("removed", &args.keys)]))
        }
        Command::TermProtect(args) => {
            let enabled = match args.action {
                ProtectAction::Show => {
                    let instance = client.find_node(&args.name, None).await?;
                    client.show_term_protect(&instance.id).await?
                }
                ProtectAction::Enable => client.set_term_protect(&args.name, true).await?,
                ProtectAction::Disable => client.set_term_protect(&args.name, false).await?,
            };
            emit(&BTreeMap::from([("termination_protection", enabled)]))
        }
    }
}

fn parse_tags(pairs: &[String]) -> Result<BTreeMap<String, String>, CliError> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .filter(|(key, _)| !key.trim().is_empty())
                .map(|(key, value)| (key.trim().to_owned(), value.to_owned()))
                .ok_or_else(|| CliError::InvalidArgument(format!("expected KEY=VALUE, got '{pair}'")))
        })
        .collect()
}

fn emit<S: Serialize>(value: &S) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)
        .map_err(|err| CliError::Output(err.to_string()))?;
    writeln!(stdout).map_err(|err| CliError::Output(err.to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_parse_as_key_value_pairs() {
        let tags = parse_tags(&[String::from("role=web"), String::from("team=a=b")])
            .expect("valid tags");
        assert_eq!(tags.get("role").map(String::as_str), Some("web"));
        assert_eq!(tags.get("team").map(String::as_str), Some("a=b"));
    }

    #[test]
    fn tags_without_a_key_are_rejected() {
        let err = parse_tags(&[String::from("=web")]).expect_err("key required");
        assert!(matches!(err, CliError::InvalidArgument(ref message) if message.contains("=web")));
    }

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        let err = CliError::InvalidArgument(String::from("bad"));
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert_eq!(rendered, "invalid argument: bad\n");
    }
}
