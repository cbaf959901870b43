//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use percent_encoding::percent_decode_str;

use crate::config::ProviderConfig;
use crate::deploy::{
    CommandOutput, CommandRunner, DeployError, DeployFuture, DeployRequest, Deployer, Login,
};
use crate::ops::Ec2Client;
use crate::query::{HttpReply, QueryError, Transport, TransportFuture};
use crate::retry::RetryPolicy;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted transport that returns pre-seeded replies in FIFO order and
/// records every URL it was asked to fetch.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTransport {
    replies: Arc<Mutex<VecDeque<Result<HttpReply, QueryError>>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTransport {
    /// Creates a transport with no queued replies.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply with `status` and `body`.
    pub fn push_reply(&self, status: u16, body: impl Into<String>) {
        lock(&self.replies).push_back(Ok(HttpReply::new(status, body)));
    }

    /// Queues a `200 OK` reply.
    pub fn push_ok(&self, body: impl Into<String>) {
        self.push_reply(200, body);
    }

    /// Queues a transport failure.
    pub fn push_failure(&self, message: &str) {
        lock(&self.replies).push_back(Err(QueryError::Transport(message.to_owned())));
    }

    /// Returns a snapshot of every URL fetched so far.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        lock(&self.requests).clone()
    }

    /// Decoded query parameters of every request, in order.
    #[must_use]
    pub fn request_params(&self) -> Vec<BTreeMap<String, String>> {
        self.requests()
            .iter()
            .map(|url| decode_query(url))
            .collect()
    }

    /// Number of requests whose `Action` equals `action`.
    #[must_use]
    pub fn count_action(&self, action: &str) -> usize {
        self.request_params()
            .iter()
            .filter(|params| params.get("Action").is_some_and(|value| value == action))
            .count()
    }

    /// Actions requested so far, in order.
    #[must_use]
    pub fn actions(&self) -> Vec<String> {
        self.request_params()
            .into_iter()
            .filter_map(|mut params| params.remove("Action"))
            .collect()
    }

    /// Number of replies still queued.
    #[must_use]
    pub fn remaining(&self) -> usize {
        lock(&self.replies).len()
    }
}

/// Splits a URL's query string into decoded key/value pairs.
#[must_use]
pub fn decode_query(url: &str) -> BTreeMap<String, String> {
    let query = url.split_once('?').map_or("", |(_, query)| query);
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (
                percent_decode_str(key).decode_utf8_lossy().into_owned(),
                percent_decode_str(value).decode_utf8_lossy().into_owned(),
            )
        })
        .collect()
}

impl Transport for ScriptedTransport {
    fn get<'a>(&'a self, url: &'a str) -> TransportFuture<'a> {
        lock(&self.requests).push(url.to_owned());
        let next = lock(&self.replies).pop_front().unwrap_or_else(|| {
            Err(QueryError::Transport(String::from(
                "no scripted reply available",
            )))
        });
        Box::pin(async move { next })
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_exit_code(0);
    }

    /// Pushes an exit status with empty output.
    pub fn push_exit_code(&self, code: i32) {
        lock(&self.responses).push_back(CommandOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: String::new(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, DeployError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| DeployError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// [`Deployer`] double that accepts a fixed set of usernames and records
/// every call.
#[derive(Clone, Debug, Default)]
pub struct RecordingDeployer {
    accepted: Vec<String>,
    port_closed: bool,
    logins: Arc<Mutex<Vec<String>>>,
    requests: Arc<Mutex<Vec<DeployRequest>>>,
}

impl RecordingDeployer {
    /// Creates a deployer that authenticates only the given usernames.
    #[must_use]
    pub fn accepting(usernames: &[&str]) -> Self {
        Self {
            accepted: usernames.iter().map(|name| (*name).to_owned()).collect(),
            ..Self::default()
        }
    }

    /// Makes every port probe fail.
    #[must_use]
    pub fn with_closed_port(mut self) -> Self {
        self.port_closed = true;
        self
    }

    /// Usernames tried so far, in order.
    #[must_use]
    pub fn logins(&self) -> Vec<String> {
        lock(&self.logins).clone()
    }

    /// Deployment requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<DeployRequest> {
        lock(&self.requests).clone()
    }
}

impl Deployer for RecordingDeployer {
    fn wait_for_port<'a>(&'a self, host: &'a str, port: u16) -> DeployFuture<'a, ()> {
        let outcome = if self.port_closed {
            Err(DeployError::PortUnreachable {
                host: host.to_owned(),
                port,
                attempts: 1,
            })
        } else {
            Ok(())
        };
        Box::pin(async move { outcome })
    }

    fn authenticate<'a>(&'a self, login: &'a Login) -> DeployFuture<'a, bool> {
        lock(&self.logins).push(login.username.clone());
        let accepted = self.accepted.contains(&login.username);
        Box::pin(async move { Ok(accepted) })
    }

    fn deploy<'a>(&'a self, request: &'a DeployRequest) -> DeployFuture<'a, ()> {
        lock(&self.requests).push(request.clone());
        Box::pin(async move { Ok(()) })
    }
}

/// Configuration with placeholder credentials for tests.
#[must_use]
pub fn test_config() -> ProviderConfig {
    ProviderConfig::new("AKIDEXAMPLE", "secret-key", "deploy", "/keys/deploy.pem")
}

/// Client wired to `transport` with immediate retries.
#[must_use]
pub fn scripted_client(transport: &ScriptedTransport) -> Ec2Client<ScriptedTransport> {
    Ec2Client::with_transport(test_config(), transport.clone())
        .with_lookup_policy(RetryPolicy::immediate(3))
        .with_tag_policy(RetryPolicy::immediate(6))
        .with_attach_policy(RetryPolicy::immediate(3))
}

/// A minimal successful reply for `action`.
#[must_use]
pub fn xml_ok(action: &str) -> String {
    format!(
        "<{action}Response xmlns=\"http://ec2.amazonaws.com/doc/2014-10-01/\">\
         <requestId>req</requestId><return>true</return></{action}Response>"
    )
}

/// A `DescribeTags` reply listing `tags` on `resource_id`.
#[must_use]
pub fn xml_describe_tags(resource_id: &str, tags: &[(&str, &str)]) -> String {
    let items: String = tags
        .iter()
        .map(|(key, value)| {
            format!(
                "<item><resourceId>{resource_id}</resourceId><resourceType>instance</resourceType>\
                 <key>{key}</key><value>{value}</value></item>"
            )
        })
        .collect();
    format!(
        "<DescribeTagsResponse><requestId>req</requestId><tagSet>{items}</tagSet>\
         </DescribeTagsResponse>"
    )
}

/// Description of one instance rendered by [`xml_instance`].
#[derive(Clone, Debug, Default)]
pub struct InstanceXml<'a> {
    /// Instance identifier.
    pub id: &'a str,
    /// Value of the `Name` tag.
    pub name: Option<&'a str>,
    /// Lifecycle state.
    pub state: &'a str,
    /// Public address.
    pub public_ip: Option<&'a str>,
    /// Private address.
    pub private_ip: Option<&'a str>,
}

/// Renders an instance `<item>`.
#[must_use]
pub fn xml_instance(instance: &InstanceXml<'_>) -> String {
    let name = instance
        .name
        .map(|name| format!("<tagSet><item><key>Name</key><value>{name}</value></item></tagSet>"))
        .unwrap_or_default();
    let public_ip = instance
        .public_ip
        .map(|ip| format!("<ipAddress>{ip}</ipAddress>"))
        .unwrap_or_default();
    let private_ip = instance
        .private_ip
        .map(|ip| format!("<privateIpAddress>{ip}</privateIpAddress>"))
        .unwrap_or_default();
    format!(
        "<item><instanceId>{}</instanceId><imageId>ami-1234</imageId>\
         <instanceState><code>16</code><name>{}</name></instanceState>\
         <instanceType>t1.micro</instanceType>{private_ip}{public_ip}\
         <placement><availabilityZone>us-east-1a</availabilityZone></placement>{name}\
         <blockDeviceMapping><item><deviceName>/dev/sda1</deviceName><ebs>\
         <volumeId>vol-root</volumeId><deleteOnTermination>true</deleteOnTermination>\
         </ebs></item></blockDeviceMapping></item>",
        instance.id, instance.state
    )
}

/// A `DescribeInstances` reply with one reservation per instance.
#[must_use]
pub fn xml_reservations(instances: &[InstanceXml<'_>]) -> String {
    let reservations: String = instances
        .iter()
        .enumerate()
        .map(|(index, instance)| {
            format!(
                "<item><reservationId>r-{index}</reservationId><instancesSet>{}</instancesSet></item>",
                xml_instance(instance)
            )
        })
        .collect();
    format!(
        "<DescribeInstancesResponse xmlns=\"http://ec2.amazonaws.com/doc/2014-10-01/\">\
         <requestId>req</requestId><reservationSet>{reservations}</reservationSet>\
         </DescribeInstancesResponse>"
    )
}

/// A `RunInstances` reply for a pending instance.
#[must_use]
pub fn xml_run_instances(instance_id: &str) -> String {
    let instance = xml_instance(&InstanceXml {
        id: instance_id,
        state: "pending",
        ..InstanceXml::default()
    });
    format!(
        "<RunInstancesResponse><requestId>req</requestId><reservationId>r-1</reservationId>\
         <ownerId>1</ownerId><groupSet/><instancesSet>{instance}</instancesSet>\
         </RunInstancesResponse>"
    )
}

/// A `DescribeInstanceAttribute` reply for a boolean attribute.
#[must_use]
pub fn xml_attribute(instance_id: &str, attribute: &str, value: bool) -> String {
    format!(
        "<DescribeInstanceAttributeResponse><requestId>req</requestId>\
         <instanceId>{instance_id}</instanceId><{attribute}><value>{value}</value></{attribute}>\
         </DescribeInstanceAttributeResponse>"
    )
}

/// A provider error reply body.
#[must_use]
pub fn xml_error(code: &str, message: &str) -> String {
    format!(
        "<Response><Errors><Error><Code>{code}</Code><Message>{message}</Message></Error>\
         </Errors><RequestID>req</RequestID></Response>"
    )
}
