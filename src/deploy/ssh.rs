//! [`Deployer`] that drives the system `ssh` client.

use std::ffi::OsString;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use shell_escape::unix::escape;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{
    CommandOutput, CommandRunner, DeployError, DeployFuture, DeployRequest, Deployer,
    KeyPairMaterial, Login, ProcessCommandRunner,
};
use crate::paths::expand_tilde;
use crate::retry::{Attempt, RetryError, RetryPolicy, retry};

/// Remote path the deployment script is written to.
pub const DEPLOY_COMMAND: &str = "/tmp/deploy.sh";

/// Staging directory for keys and configuration on the remote host.
const STAGING_DIR: &str = "/tmp/.cirrus-deploy";

/// Client-side SSH settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSettings {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Known hosts file; `/dev/null` for disposable hosts.
    pub known_hosts_file: String,
    /// Seconds `ssh` waits for a connection.
    pub connect_timeout_secs: u32,
    /// Budget for the TCP readiness probe.
    pub port_policy: RetryPolicy,
    /// Timeout of each TCP probe.
    pub probe_timeout: Duration,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            known_hosts_file: String::from("/dev/null"),
            connect_timeout_secs: 60,
            port_policy: RetryPolicy::constant(60, Duration::from_secs(5)),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Deploys by running commands through `ssh`.
#[derive(Clone, Debug)]
pub struct SshDeployer<R: CommandRunner = ProcessCommandRunner> {
    settings: SshSettings,
    runner: R,
}

impl SshDeployer<ProcessCommandRunner> {
    /// Creates a deployer that spawns real processes.
    #[must_use]
    pub const fn with_process_runner(settings: SshSettings) -> Self {
        Self::new(settings, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> SshDeployer<R> {
    /// Creates a deployer using `runner`.
    #[must_use]
    pub const fn new(settings: SshSettings, runner: R) -> Self {
        Self { settings, runner }
    }

    /// Settings in use.
    #[must_use]
    pub const fn settings(&self) -> &SshSettings {
        &self.settings
    }

    fn ssh_args(&self, login: &Login, remote_command: &str) -> Vec<OsString> {
        let options = [
            String::from("BatchMode=yes"),
            String::from("StrictHostKeyChecking=no"),
            format!("UserKnownHostsFile={}", self.settings.known_hosts_file),
            format!("ConnectTimeout={}", self.settings.connect_timeout_secs),
        ];
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(login.port.to_string()),
            OsString::from("-i"),
            OsString::from(expand_tilde(&login.key_file)),
        ];
        for option in options {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }
        args.push(OsString::from(format!("{}@{}", login.username, login.host)));
        args.push(OsString::from(remote_command));
        args
    }

    fn run_remote(&self, login: &Login, remote_command: &str) -> Result<CommandOutput, DeployError> {
        let args = self.ssh_args(login, remote_command);
        self.runner.run(&self.settings.ssh_bin, &args)
    }
}

fn write_file(command: &mut String, path: &str, contents: &str) {
    let encoded = STANDARD.encode(contents);
    command.push_str(&format!(
        "printf '%s' {} | base64 -d > {}; ",
        escape(encoded.into()),
        escape(path.into())
    ));
}

fn write_key_pair(command: &mut String, stem: &str, keys: &KeyPairMaterial) {
    write_file(command, &format!("{STAGING_DIR}/{stem}.pem"), &keys.pem);
    write_file(command, &format!("{STAGING_DIR}/{stem}.pub"), &keys.public);
}

/// Builds the remote shell command that stages files and runs the script.
#[must_use]
pub fn deployment_command(request: &DeployRequest) -> String {
    let mut command = format!("umask 077; mkdir -p {STAGING_DIR}; ");
    write_file(&mut command, DEPLOY_COMMAND, &request.script);
    command.push_str(&format!("chmod 700 {DEPLOY_COMMAND}; "));

    if request.make_minion {
        if let Some(keys) = &request.minion {
            write_key_pair(&mut command, "minion", keys);
        }
        if let Some(config) = &request.minion_config {
            write_file(&mut command, &format!("{STAGING_DIR}/minion"), config);
        }
    }
    if let Some(keys) = &request.master {
        write_key_pair(&mut command, "master", keys);
        if let Some(config) = &request.master_config {
            write_file(&mut command, &format!("{STAGING_DIR}/master"), config);
        }
    }

    let mut invocation = Vec::new();
    if request.sudo {
        invocation.push(String::from("sudo"));
    }
    if !request.script_env.is_empty() {
        invocation.push(String::from("env"));
        for (key, value) in &request.script_env {
            invocation.push(escape(format!("{key}={value}").into()).into_owned());
        }
    }
    invocation.push(String::from("sh"));
    invocation.push(DEPLOY_COMMAND.to_owned());
    if let Some(args) = request.script_args.as_deref().filter(|args| !args.trim().is_empty()) {
        invocation.push(args.to_owned());
    }
    command.push_str(&invocation.join(" "));
    command.push_str(&format!("; status=$?; rm -rf {DEPLOY_COMMAND} {STAGING_DIR}; exit $status"));
    command
}

impl<R: CommandRunner + Sync> Deployer for SshDeployer<R> {
    fn wait_for_port<'a>(&'a self, host: &'a str, port: u16) -> DeployFuture<'a, ()> {
        Box::pin(async move {
            let probe_timeout = self.settings.probe_timeout;
            let outcome = retry(&self.settings.port_policy, "wait_for_port", move || async move {
                match tokio::time::timeout(probe_timeout, TcpStream::connect((host, port))).await {
                    Ok(Ok(_)) => Ok::<_, DeployError>(Attempt::Ready(())),
                    Ok(Err(err)) => Ok(Attempt::Pending(err.to_string())),
                    Err(_) => Ok(Attempt::Pending(String::from("connection timed out"))),
                }
            })
            .await;
            match outcome {
                Ok(()) => {
                    debug!(host, port, "port is accepting connections");
                    Ok(())
                }
                Err(RetryError::Fatal(err)) => Err(err),
                Err(RetryError::Exhausted { attempts, last }) => {
                    warn!(host, port, %last, "port never became reachable");
                    Err(DeployError::PortUnreachable {
                        host: host.to_owned(),
                        port,
                        attempts,
                    })
                }
            }
        })
    }

    fn authenticate<'a>(&'a self, login: &'a Login) -> DeployFuture<'a, bool> {
        Box::pin(async move {
            let output = self.run_remote(login, "true")?;
            if output.is_success() {
                info!(host = %login.host, username = %login.username, "authenticated");
            } else {
                debug!(
                    host = %login.host,
                    username = %login.username,
                    stderr = %output.stderr_excerpt(),
                    "authentication failed"
                );
            }
            Ok(output.is_success())
        })
    }

    fn deploy<'a>(&'a self, request: &'a DeployRequest) -> DeployFuture<'a, ()> {
        Box::pin(async move {
            let output = self.run_remote(&request.login, &deployment_command(request))?;
            if request.display_output && !output.stdout.is_empty() {
                info!(name = %request.name, output = %output.stdout.trim_end(), "deployment output");
            }
            if output.is_success() {
                info!(name = %request.name, host = %request.login.host, "deployment finished");
                return Ok(());
            }
            Err(DeployError::ScriptFailed {
                host: request.login.host.clone(),
                status: output.status_text(),
                stderr: output.stderr_excerpt(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rstest::{fixture, rstest};

    use super::*;
    use crate::test_support::ScriptedRunner;

    #[fixture]
    fn login() -> Login {
        Login {
            host: String::from("203.0.113.9"),
            port: 22,
            username: String::from("ubuntu"),
            key_file: String::from("/keys/deploy.pem"),
        }
    }

    fn request(login: Login) -> DeployRequest {
        DeployRequest {
            name: String::from("web-1"),
            login,
            script: String::from("#!/bin/sh\necho hello\n"),
            script_args: Some(String::from("-P git v2014.1")),
            script_env: BTreeMap::from([(String::from("ROLE"), String::from("web"))]),
            sudo: true,
            display_output: false,
            minion: Some(KeyPairMaterial {
                pem: String::from("PRIVATE"),
                public: String::from("PUBLIC"),
            }),
            minion_config: None,
            make_minion: true,
            master: None,
            master_config: None,
        }
    }

    #[rstest]
    #[tokio::test]
    async fn authentication_runs_true_in_batch_mode(login: Login) {
        let runner = ScriptedRunner::new();
        runner.push_exit_code(255);
        let deployer = SshDeployer::new(SshSettings::default(), runner.clone());

        let ok = deployer.authenticate(&login).await.expect("ssh spawned");
        assert!(!ok);

        let invocations = runner.invocations();
        let command = invocations.first().expect("ssh invoked").command_string();
        assert!(command.starts_with("ssh -p 22 -i /keys/deploy.pem -o BatchMode=yes"));
        assert!(command.ends_with("ubuntu@203.0.113.9 true"));
    }

    #[rstest]
    fn script_is_shipped_encoded_and_run_with_sudo(login: Login) {
        let command = deployment_command(&request(login));
        let encoded = STANDARD.encode("#!/bin/sh\necho hello\n");
        assert!(command.contains(&format!("printf '%s' {encoded} | base64 -d > /tmp/deploy.sh")));
        assert!(command.contains("sudo env ROLE=web sh /tmp/deploy.sh -P git v2014.1"));
        assert!(command.contains("/tmp/.cirrus-deploy/minion.pem"));
        assert!(!command.contains("master.pem"));
    }

    #[rstest]
    fn root_logins_skip_sudo(login: Login) {
        let mut req = request(login);
        req.sudo = false;
        req.script_env.clear();
        let command = deployment_command(&req);
        assert!(command.contains("; sh /tmp/deploy.sh"));
        assert!(!command.contains("sudo"));
    }

    #[rstest]
    #[tokio::test]
    async fn failing_script_reports_status(login: Login) {
        let runner = ScriptedRunner::new();
        runner.push_exit_code(3);
        let deployer = SshDeployer::new(SshSettings::default(), runner);

        let err = deployer
            .deploy(&request(login))
            .await
            .expect_err("script fails");
        assert!(matches!(err, DeployError::ScriptFailed { ref status, .. } if status == "3"));
    }

    #[tokio::test]
    async fn unreachable_port_is_reported() {
        let settings = SshSettings {
            port_policy: RetryPolicy::immediate(2),
            probe_timeout: Duration::from_millis(200),
            ..SshSettings::default()
        };
        let deployer = SshDeployer::new(settings, ScriptedRunner::new());
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);

        let err = deployer
            .wait_for_port("127.0.0.1", port)
            .await
            .expect_err("nothing listening");
        assert!(matches!(err, DeployError::PortUnreachable { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn listening_port_is_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let deployer = SshDeployer::new(SshSettings::default(), ScriptedRunner::new());
        deployer
            .wait_for_port("127.0.0.1", port)
            .await
            .expect("port ready");
    }
}
