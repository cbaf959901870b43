//! Lifecycle operations against the provider.
//!
//! [`Ec2Client`] wraps a [`QueryClient`] and exposes one method per
//! lifecycle action. Each action is backed by a typed request implementing
//! [`ApiRequest`]; required fields are checked before anything is sent, and
//! a missing field is logged and reported as a non-fatal
//! [`LifecycleError::MissingField`].

use std::time::Duration;

use thiserror::Error;
use tracing::error;

use crate::config::ProviderConfig;
use crate::query::{ApiRequest, ErrorResponse, QueryClient, QueryError, ReqwestTransport, Transport};
use crate::retry::RetryPolicy;
use crate::xml::Node;

pub mod catalog;
pub mod cluster;
pub mod elb;
pub mod instance;
pub mod keypair;
pub mod parse;
pub mod security_group;
pub mod tags;
pub mod volume;
pub mod vpc;

/// Kind of resource a name lookup was looking for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResourceKind {
    /// A security group.
    SecurityGroup,
    /// A subnet.
    Subnet,
    /// A VPC.
    Vpc,
    /// A server certificate.
    Certificate,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::SecurityGroup => "security group",
            Self::Subnet => "subnet",
            Self::Vpc => "VPC",
            Self::Certificate => "certificate",
        })
    }
}

/// Errors raised by lifecycle operations.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum LifecycleError {
    /// One or more required inputs were empty.
    #[error("missing required field(s): {0}")]
    MissingField(String),
    /// An input was present but unusable.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// The provider rejected the request.
    #[error("{action} failed: {error}")]
    Api {
        /// Action that was rejected.
        action: &'static str,
        /// Decoded provider error.
        error: ErrorResponse,
    },
    /// No reply could be obtained or decoded.
    #[error(transparent)]
    Query(#[from] QueryError),
    /// No instance carries the requested name.
    #[error("no instance named '{0}' was found")]
    NodeNotFound(String),
    /// A name could not be resolved to an identifier.
    #[error("could not find {kind} '{name}'{}", scope_suffix(.vpc_id.as_deref()))]
    NotFound {
        /// What was being looked up.
        kind: ResourceKind,
        /// Name as supplied.
        name: String,
        /// VPC the lookup was scoped to.
        vpc_id: Option<String>,
    },
    /// Termination protection is enabled on the instance.
    #[error("instance {instance_id} has termination protection enabled")]
    TerminationProtected {
        /// Protected instance.
        instance_id: String,
    },
    /// A volume could not be attached within the retry budget.
    #[error("failed to attach {volume_id} to {instance_id}: {last}")]
    AttachFailed {
        /// Volume being attached.
        volume_id: String,
        /// Target instance.
        instance_id: String,
        /// Reason reported by the final attempt.
        last: String,
    },
    /// Tags written to a resource could not be read back.
    #[error("failed to verify tags on {resource_id}")]
    TagVerification {
        /// Tagged resource.
        resource_id: String,
    },
    /// The reply lacked fields the operation depends on.
    #[error("unexpected reply to {action}: {detail}")]
    UnexpectedReply {
        /// Action whose reply was incomplete.
        action: &'static str,
        /// What was missing.
        detail: String,
    },
}

fn scope_suffix(vpc_id: Option<&str>) -> String {
    vpc_id.map(|id| format!(" in {id}")).unwrap_or_default()
}

impl LifecycleError {
    /// Returns `true` for errors that must abort the calling workflow.
    ///
    /// Missing or invalid inputs and provider rejections are reported to the
    /// caller as values; everything else aborts.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::MissingField(_) | Self::InvalidParameter(_) | Self::Api { .. }
        )
    }

    /// Provider error code, for provider rejections.
    #[must_use]
    pub fn provider_code(&self) -> Option<&str> {
        match self {
            Self::Api { error, .. } => Some(&error.code),
            _ => None,
        }
    }
}

/// Checks that every named field is non-empty, logging each one that is not.
///
/// # Errors
///
/// Returns [`LifecycleError::MissingField`] listing every empty field.
pub fn require(fields: &[(&'static str, &str)]) -> Result<(), LifecycleError> {
    let missing: Vec<&str> = fields
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    for field in &missing {
        error!(field, "required field is missing");
    }
    Err(LifecycleError::MissingField(missing.join(", ")))
}

/// Client for lifecycle operations.
#[derive(Debug)]
pub struct Ec2Client<T = ReqwestTransport> {
    dispatcher: QueryClient<T>,
    lookup_policy: RetryPolicy,
    tag_policy: RetryPolicy,
    attach_policy: RetryPolicy,
}

impl Ec2Client<ReqwestTransport> {
    /// Creates a client that talks to the provider over HTTPS.
    #[must_use]
    pub fn new(config: ProviderConfig) -> Self {
        Self::from_dispatcher(QueryClient::new(config))
    }
}

impl<T: Transport> Ec2Client<T> {
    /// Creates a client sending requests through `transport`.
    #[must_use]
    pub fn with_transport(config: ProviderConfig, transport: T) -> Self {
        Self::from_dispatcher(QueryClient::with_transport(config, transport))
    }

    /// Wraps an existing dispatcher.
    #[must_use]
    pub fn from_dispatcher(dispatcher: QueryClient<T>) -> Self {
        Self {
            dispatcher,
            lookup_policy: RetryPolicy::constant(11, Duration::from_millis(500)),
            tag_policy: RetryPolicy::immediate(6),
            attach_policy: RetryPolicy::default(),
        }
    }

    /// Replaces the policy used when looking instances up by name.
    #[must_use]
    pub fn with_lookup_policy(mut self, policy: RetryPolicy) -> Self {
        self.lookup_policy = policy;
        self
    }

    /// Replaces the policy used when verifying written tags.
    #[must_use]
    pub fn with_tag_policy(mut self, policy: RetryPolicy) -> Self {
        self.tag_policy = policy;
        self
    }

    /// Replaces the policy used when attaching volumes.
    #[must_use]
    pub fn with_attach_policy(mut self, policy: RetryPolicy) -> Self {
        self.attach_policy = policy;
        self
    }

    /// The underlying dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &QueryClient<T> {
        &self.dispatcher
    }

    /// Shared configuration.
    #[must_use]
    pub const fn config(&self) -> &ProviderConfig {
        self.dispatcher.config()
    }

    /// Validates and sends `request` to the configured region.
    pub(crate) async fn call<R: ApiRequest + Sync>(
        &self,
        request: &R,
    ) -> Result<Vec<Node>, LifecycleError> {
        self.call_in(request, None).await
    }

    /// Validates and sends `request` to `region`.
    pub(crate) async fn call_in<R: ApiRequest + Sync>(
        &self,
        request: &R,
        region: Option<&str>,
    ) -> Result<Vec<Node>, LifecycleError> {
        require(&request.required_fields())?;
        let response = self.dispatcher.send(request, region).await?;
        response
            .reply
            .into_result()
            .map_err(|error| LifecycleError::Api {
                action: R::ACTION,
                error,
            })
    }
}
