//! Instance provisioning.
//!
//! [`Provisioner::provision`] walks a profile through launch, polling,
//! tagging, deployment and volume attachment. Each phase is a
//! [`ProvisionState`]; the states visited are returned in
//! [`ProvisionOutcome::trail`], and a failure reports the state it happened
//! in through [`ProvisionError::state`].
//!
//! Only reads are polled. The launch itself is sent once: the provider
//! creates a new instance for every `RunInstances` it receives.

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::deploy::{
    DeployError, DeployRequest, Deployer, KeyPairMaterial, Login, SSH_PORT, candidate_usernames,
};
use crate::keyfile::{KeyFileError, check_key_file};
use crate::model::Instance;
use crate::ops::{Ec2Client, LifecycleError};
use crate::profile::{SshInterface, VmProfile};
use crate::query::{QueryError, Transport};
use crate::retry::{Attempt, RetryError, RetryPolicy, retry};

mod launch;
mod userdata;

pub use launch::{ROOT_DEVICE, RootVolume, RunInstances};
pub use userdata::{encoded_userdata, render_userdata};

/// Phases of a provisioning run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    /// Checking local inputs and resolving names.
    Validating,
    /// Sending the launch request.
    Launching,
    /// Waiting for the instance to be described.
    AwaitingDescriptor,
    /// Waiting for an address.
    AwaitingNetworkAddress,
    /// Applying the `Name` tag.
    Tagging,
    /// Waiting for the login port and a working username.
    AwaitingDeploymentReadiness,
    /// Running the deployment script.
    Deploying,
    /// Creating and attaching extra volumes.
    AttachingVolumes,
    /// Finished.
    Complete,
    /// Aborted.
    Failed,
}

/// Errors that abort provisioning.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ProvisionError {
    /// The profile is incomplete or inconsistent.
    #[error("invalid profile: {0}")]
    Config(String),
    /// The private key cannot be used.
    #[error(transparent)]
    KeyFile(#[from] KeyFileError),
    /// Zone validation or name resolution failed.
    #[error("validation failed: {0}")]
    Validation(#[source] LifecycleError),
    /// The launch request failed.
    #[error("failed to launch instance: {0}")]
    Launch(#[source] LifecycleError),
    /// The launched instance never became visible.
    #[error("VM creation failed for {instance_id}: {last}")]
    CreationFailed {
        /// Launched instance.
        instance_id: String,
        /// Reason reported by the final poll.
        last: String,
    },
    /// No address was assigned; the instance has been torn down.
    #[error("no address was assigned to {instance_id}: {message}")]
    NetworkTimeout {
        /// Launched instance.
        instance_id: String,
        /// Failure, with a note when teardown also failed.
        message: String,
    },
    /// The `Name` tag could not be applied.
    #[error("failed to tag instance: {0}")]
    Tagging(#[source] LifecycleError),
    /// No candidate username authenticated.
    #[error("failed to authenticate against {host} as any of {}", .tried.join(", "))]
    Authentication {
        /// Host address.
        host: String,
        /// Usernames tried, in order.
        tried: Vec<String>,
    },
    /// The deployment collaborator failed.
    #[error("deployment failed: {0}")]
    Deployment(#[source] DeployError),
    /// Extra volumes could not be created or attached.
    #[error("failed to attach volumes: {0}")]
    Volumes(#[source] LifecycleError),
}

impl ProvisionError {
    /// State the run was in when it failed.
    #[must_use]
    pub const fn state(&self) -> ProvisionState {
        match self {
            Self::Config(_) | Self::KeyFile(_) | Self::Validation(_) => ProvisionState::Validating,
            Self::Launch(_) => ProvisionState::Launching,
            Self::CreationFailed { .. } => ProvisionState::AwaitingDescriptor,
            Self::NetworkTimeout { .. } => ProvisionState::AwaitingNetworkAddress,
            Self::Tagging(_) => ProvisionState::Tagging,
            Self::Authentication { .. } => ProvisionState::AwaitingDeploymentReadiness,
            Self::Deployment(_) => ProvisionState::Deploying,
            Self::Volumes(_) => ProvisionState::AttachingVolumes,
        }
    }
}

/// Result of a successful run.
#[derive(Clone, Debug, Serialize)]
pub struct ProvisionOutcome {
    /// The instance as last described.
    pub instance: Instance,
    /// Address chosen for deployment.
    pub address: String,
    /// Username that authenticated, when deployment ran.
    pub username: Option<String>,
    /// Whether the deployment script ran.
    pub deployed: bool,
    /// One line per attached volume.
    pub attached_volumes: Vec<String>,
    /// States visited, in order.
    pub trail: Vec<ProvisionState>,
}

/// Drives profiles through the provisioning states.
#[derive(Debug)]
pub struct Provisioner<T: Transport, D: Deployer> {
    client: Ec2Client<T>,
    deployer: D,
    descriptor_policy: RetryPolicy,
    address_policy: RetryPolicy,
    ssh_port: u16,
}

struct Run<'p> {
    profile: &'p VmProfile,
    region: Option<&'p str>,
    trail: Vec<ProvisionState>,
}

impl Run<'_> {
    fn enter(&mut self, state: ProvisionState) {
        info!(name = %self.profile.name, ?state, "provisioning");
        self.trail.push(state);
    }
}

impl<T: Transport, D: Deployer> Provisioner<T, D> {
    /// Creates a provisioner with the default polling policies.
    #[must_use]
    pub fn new(client: Ec2Client<T>, deployer: D) -> Self {
        Self {
            client,
            deployer,
            descriptor_policy: RetryPolicy::default(),
            address_policy: RetryPolicy::default(),
            ssh_port: SSH_PORT,
        }
    }

    /// Replaces the policy for waiting on the instance descriptor.
    #[must_use]
    pub const fn with_descriptor_policy(mut self, policy: RetryPolicy) -> Self {
        self.descriptor_policy = policy;
        self
    }

    /// Replaces the policy for waiting on an address.
    #[must_use]
    pub const fn with_address_policy(mut self, policy: RetryPolicy) -> Self {
        self.address_policy = policy;
        self
    }

    /// Replaces the login port.
    #[must_use]
    pub const fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    /// The lifecycle client.
    #[must_use]
    pub const fn client(&self) -> &Ec2Client<T> {
        &self.client
    }

    /// Provisions `vm`, layered over the provider defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] for the first phase that fails. A failure
    /// while waiting for an address terminates the instance first.
    pub async fn provision(&self, vm: &VmProfile) -> Result<ProvisionOutcome, ProvisionError> {
        let profile = vm.merged_over(&self.client.config().as_profile());
        let mut run = Run {
            profile: &profile,
            region: profile.location.as_deref(),
            trail: Vec::new(),
        };
        match self.execute(&mut run).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                run.trail.push(ProvisionState::Failed);
                error!(
                    name = %profile.name,
                    state = ?err.state(),
                    trail = ?run.trail,
                    error = %err,
                    "provisioning failed"
                );
                Err(err)
            }
        }
    }

    async fn execute(&self, run: &mut Run<'_>) -> Result<ProvisionOutcome, ProvisionError> {
        run.enter(ProvisionState::Validating);
        let user_data = encoded_userdata(run.profile)?;
        let request = self.validate(run, user_data.clone()).await?;

        run.enter(ProvisionState::Launching);
        let instance_id = self.launch(&request, run.region).await?;

        run.enter(ProvisionState::AwaitingDescriptor);
        self.await_descriptor(&instance_id, run.region).await?;

        run.enter(ProvisionState::AwaitingNetworkAddress);
        let instance = self.await_address(&instance_id, run.region).await?;

        run.enter(ProvisionState::Tagging);
        let name_tag = BTreeMap::from([(String::from("Name"), run.profile.name.clone())]);
        self.client
            .set_tags(&instance_id, &name_tag, run.region)
            .await
            .map_err(ProvisionError::Tagging)?;
        info!(name = %run.profile.name, instance_id = %instance_id, "created node");

        let address = select_address(&instance, run.profile.ssh_interface.unwrap_or_default())
            .ok_or_else(|| ProvisionError::NetworkTimeout {
                instance_id: instance_id.clone(),
                message: String::from("the descriptor lost its address"),
            })?
            .to_owned();

        let username = if user_data.is_some() {
            info!(name = %run.profile.name, "user data supplied; the host configures itself");
            None
        } else if run.profile.deploy_enabled() {
            Some(self.deploy(run, &address).await?)
        } else {
            None
        };

        let mut attached_volumes = Vec::new();
        if !run.profile.volumes.is_empty() {
            run.enter(ProvisionState::AttachingVolumes);
            let zone = instance.availability_zone.clone().unwrap_or_default();
            attached_volumes = self
                .client
                .create_attach_volumes(&run.profile.name, &instance_id, &zone, &run.profile.volumes)
                .await
                .map_err(ProvisionError::Volumes)?;
        }

        run.enter(ProvisionState::Complete);
        Ok(ProvisionOutcome {
            deployed: username.is_some(),
            instance,
            address,
            username,
            attached_volumes,
            trail: std::mem::take(&mut run.trail),
        })
    }

    async fn validate(
        &self,
        run: &Run<'_>,
        user_data: Option<String>,
    ) -> Result<RunInstances, ProvisionError> {
        let profile = run.profile;
        if profile.name.trim().is_empty() {
            return Err(ProvisionError::Config(String::from("the VM name is required")));
        }
        if let Some(key_file) = profile.private_key.as_deref() {
            check_key_file(key_file)?;
        }
        if let Some(zone) = profile.availability_zone.as_deref() {
            self.client
                .validate_availability_zone(zone, run.region)
                .await
                .map_err(ProvisionError::Validation)?;
        }

        let vpc_id = profile.vpc_id.as_deref();
        let mut group_ids = Vec::with_capacity(profile.securitygroupid.len());
        for group in &profile.securitygroupid {
            let id = self
                .client
                .security_group_id(group, vpc_id)
                .await
                .map_err(ProvisionError::Validation)?;
            group_ids.push(id);
        }
        let subnet_id = match profile.subnetid.as_deref() {
            Some(subnet) => Some(
                self.client
                    .subnet_id(subnet, vpc_id)
                    .await
                    .map_err(ProvisionError::Validation)?,
            ),
            None => None,
        };

        RunInstances::from_profile(profile, group_ids, subnet_id, user_data)
    }

    async fn launch(
        &self,
        request: &RunInstances,
        region: Option<&str>,
    ) -> Result<String, ProvisionError> {
        let records = self.client.call_in(request, region).await.map_err(|err| {
            error!(error = %err, "error creating instance");
            ProvisionError::Launch(err)
        })?;
        let instance_id = records
            .iter()
            .find_map(Instance::from_node)
            .map(|instance| instance.id)
            .ok_or_else(|| {
                ProvisionError::Launch(LifecycleError::UnexpectedReply {
                    action: "RunInstances",
                    detail: String::from("no instance id in reply"),
                })
            })?;
        info!(instance_id = %instance_id, "instance launched");
        Ok(instance_id)
    }

    async fn await_descriptor(
        &self,
        instance_id: &str,
        region: Option<&str>,
    ) -> Result<Instance, ProvisionError> {
        let client = &self.client;
        let outcome = retry(&self.descriptor_policy, "await_descriptor", move || async move {
            poll_instance(client, instance_id, region, |_| true).await
        })
        .await;
        outcome.map_err(|err| ProvisionError::CreationFailed {
            instance_id: instance_id.to_owned(),
            last: retry_reason(err),
        })
    }

    async fn await_address(
        &self,
        instance_id: &str,
        region: Option<&str>,
    ) -> Result<Instance, ProvisionError> {
        let client = &self.client;
        let outcome = retry(&self.address_policy, "await_address", move || async move {
            poll_instance(client, instance_id, region, Instance::has_address).await
        })
        .await;
        match outcome {
            Ok(instance) => Ok(instance),
            Err(err) => {
                let reason = retry_reason(err);
                error!(instance_id, %reason, "could not find an address");
                let teardown = self.client.terminate_instance(instance_id, region).await.err();
                Err(ProvisionError::NetworkTimeout {
                    instance_id: instance_id.to_owned(),
                    message: append_teardown_note(reason, teardown.as_ref()),
                })
            }
        }
    }

    async fn deploy(&self, run: &mut Run<'_>, address: &str) -> Result<String, ProvisionError> {
        let profile = run.profile;
        run.enter(ProvisionState::AwaitingDeploymentReadiness);
        self.deployer
            .wait_for_port(address, self.ssh_port)
            .await
            .map_err(ProvisionError::Deployment)?;

        let key_file = profile.private_key.clone().unwrap_or_default();
        let mut tried = Vec::new();
        let mut accepted = None;
        for username in candidate_usernames(&profile.ssh_username) {
            let login = Login {
                host: address.to_owned(),
                port: self.ssh_port,
                username: username.clone(),
                key_file: key_file.clone(),
            };
            tried.push(username);
            if self
                .deployer
                .authenticate(&login)
                .await
                .map_err(ProvisionError::Deployment)?
            {
                accepted = Some(login);
                break;
            }
        }
        let Some(login) = accepted else {
            return Err(ProvisionError::Authentication {
                host: address.to_owned(),
                tried,
            });
        };

        run.enter(ProvisionState::Deploying);
        let request = deploy_request(profile, login);
        self.deployer
            .deploy(&request)
            .await
            .map_err(ProvisionError::Deployment)?;
        info!(name = %profile.name, "deployment complete");
        Ok(request.login.username)
    }
}

async fn poll_instance<T: Transport>(
    client: &Ec2Client<T>,
    instance_id: &str,
    region: Option<&str>,
    ready: fn(&Instance) -> bool,
) -> Result<Attempt<Instance>, LifecycleError> {
    match client.describe_instance(instance_id, region).await {
        Ok(Some(instance)) if ready(&instance) => Ok(Attempt::Ready(instance)),
        Ok(Some(_)) => Ok(Attempt::Pending(format!("{instance_id} has no address yet"))),
        Ok(None) => Ok(Attempt::Pending(format!("{instance_id} is not described yet"))),
        Err(LifecycleError::Query(QueryError::Decode(err))) => {
            warn!(instance_id, error = %err, "unreadable describe reply; retrying");
            Ok(Attempt::Pending(format!("unreadable reply: {err}")))
        }
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            warn!(instance_id, error = %err, "describe failed; retrying");
            Ok(Attempt::Pending(err.to_string()))
        }
    }
}

fn retry_reason(err: RetryError<LifecycleError>) -> String {
    match err {
        RetryError::Exhausted { last, .. } => last,
        RetryError::Fatal(fatal) => fatal.to_string(),
    }
}

fn append_teardown_note<E: Display>(message: String, teardown_error: Option<&E>) -> String {
    if let Some(teardown) = teardown_error {
        format!("{message} (teardown also failed: {teardown})")
    } else {
        message
    }
}

/// The address for `interface`, falling back to the other one.
fn select_address(instance: &Instance, interface: SshInterface) -> Option<&str> {
    let fallback = match interface {
        SshInterface::PublicIps => SshInterface::PrivateIps,
        SshInterface::PrivateIps => SshInterface::PublicIps,
    };
    instance
        .address(interface)
        .or_else(|| instance.address(fallback))
}

fn key_pair(pem: Option<&String>, public: Option<&String>) -> Option<KeyPairMaterial> {
    Some(KeyPairMaterial {
        pem: pem?.clone(),
        public: public?.clone(),
    })
}

fn deploy_request(profile: &VmProfile, login: Login) -> DeployRequest {
    let make_master = profile.make_master.unwrap_or(false);
    DeployRequest {
        name: profile.name.clone(),
        sudo: profile.sudo.unwrap_or(login.username != "root"),
        login,
        script: profile.script.clone().unwrap_or_default(),
        script_args: profile.script_args.clone(),
        script_env: profile.script_env.clone(),
        display_output: profile.display_ssh_output.unwrap_or(true),
        minion: key_pair(profile.minion_pem.as_ref(), profile.minion_pub.as_ref()),
        minion_config: profile.minion_config.clone(),
        make_minion: profile.make_minion.unwrap_or(true),
        master: make_master
            .then(|| key_pair(profile.master_pem.as_ref(), profile.master_pub.as_ref()))
            .flatten(),
        master_config: make_master.then(|| profile.master_config.clone()).flatten(),
    }
}

#[cfg(all(test, unix))]
mod tests;
