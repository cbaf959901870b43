//! Handoff to a freshly launched host: wait for its login port, find a
//! username that authenticates, then ship and run the deployment script.
//!
//! Provisioning talks to a [`Deployer`]; [`SshDeployer`] is the default
//! implementation and shells out to `ssh` through a [`CommandRunner`] so
//! tests can script every command.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

mod runner;
mod ssh;

pub use runner::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use ssh::{DEPLOY_COMMAND, SshDeployer, SshSettings};

/// Login names tried after any the operator declared.
pub const BUILTIN_USERNAMES: [&str; 5] = ["ec2-user", "ubuntu", "admin", "bitnami", "root"];

/// Default SSH port.
pub const SSH_PORT: u16 = 22;

/// Errors raised while deploying to a host.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum DeployError {
    /// A local command could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying failure.
        message: String,
    },
    /// The login port never accepted a connection.
    #[error("{host}:{port} did not accept connections after {attempts} attempts")]
    PortUnreachable {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
        /// Connection attempts made.
        attempts: u32,
    },
    /// The deployment script exited unsuccessfully.
    #[error("deployment on {host} exited with status {status}: {stderr}")]
    ScriptFailed {
        /// Target host.
        host: String,
        /// Exit status text.
        status: String,
        /// Captured standard error.
        stderr: String,
    },
}

/// Where and as whom to log in.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Login {
    /// Host address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login name.
    pub username: String,
    /// Private key used to authenticate.
    pub key_file: String,
}

/// A private/public key pair delivered to the host.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KeyPairMaterial {
    /// Private key.
    pub pem: String,
    /// Public key.
    pub public: String,
}

/// Everything the deployer needs once a login has been found.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeployRequest {
    /// Instance name.
    pub name: String,
    /// Authenticated login.
    pub login: Login,
    /// Script body.
    pub script: String,
    /// Arguments appended to the script invocation.
    pub script_args: Option<String>,
    /// Environment exported for the script.
    pub script_env: BTreeMap<String, String>,
    /// Run the script through `sudo`.
    pub sudo: bool,
    /// Log the script's output.
    pub display_output: bool,
    /// Identity keys for the host.
    pub minion: Option<KeyPairMaterial>,
    /// Identity configuration for the host.
    pub minion_config: Option<String>,
    /// Whether the host is configured as an identity agent.
    pub make_minion: bool,
    /// Control-node keys, when the host is also a master.
    pub master: Option<KeyPairMaterial>,
    /// Control-node configuration.
    pub master_config: Option<String>,
}

/// Future returned by deployer operations.
pub type DeployFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DeployError>> + Send + 'a>>;

/// Remote deployment collaborator.
pub trait Deployer {
    /// Waits until `host:port` accepts TCP connections.
    fn wait_for_port<'a>(&'a self, host: &'a str, port: u16) -> DeployFuture<'a, ()>;

    /// Returns `Ok(true)` when `login` authenticates.
    fn authenticate<'a>(&'a self, login: &'a Login) -> DeployFuture<'a, bool>;

    /// Ships and runs the deployment script.
    fn deploy<'a>(&'a self, request: &'a DeployRequest) -> DeployFuture<'a, ()>;
}

/// Login names to try, in order.
///
/// Declared names come first, then each built-in name not already
/// declared, then the declared names again: a host may only start
/// accepting its real login after the first pass has moved on.
///
/// # Examples
///
/// ```
/// use cirrus::deploy::candidate_usernames;
///
/// let names = candidate_usernames(&[String::from("centos")]);
/// assert_eq!(names.first().map(String::as_str), Some("centos"));
/// assert_eq!(names.last().map(String::as_str), Some("centos"));
/// assert_eq!(names.len(), 7);
/// ```
#[must_use]
pub fn candidate_usernames(declared: &[String]) -> Vec<String> {
    let initial: Vec<String> = declared
        .iter()
        .filter(|name| !name.trim().is_empty())
        .cloned()
        .collect();
    let mut names = initial.clone();
    for builtin in BUILTIN_USERNAMES {
        if !names.iter().any(|name| name == builtin) {
            names.push(builtin.to_owned());
        }
    }
    names.extend(initial);
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_only_without_declared_names() {
        assert_eq!(candidate_usernames(&[]), BUILTIN_USERNAMES);
    }

    #[test]
    fn declared_builtin_is_not_repeated_in_the_middle() {
        let names = candidate_usernames(&[String::from("ubuntu"), String::new()]);
        assert_eq!(
            names,
            ["ubuntu", "ec2-user", "admin", "bitnami", "root", "ubuntu"]
        );
    }
}
