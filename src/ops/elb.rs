//! Classic load balancers, their listeners and server certificates.
//!
//! Load-balancer actions use the member-list convention: repeated values are
//! written as `Prefix.member.N`. Replies wrap their payload in an
//! `{Action}Result` element, so every request here keeps the raw root.

use std::collections::BTreeMap;

use tracing::{error, info};

use super::parse::parse_str_parameters;
use super::{Ec2Client, LifecycleError, ResourceKind, require};
use crate::model::{Certificate, LoadBalancer, result_members};
use crate::query::{ApiFamily, ApiRequest, Params, Transport};
use crate::xml::Node;

/// One load-balancer listener.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Listener {
    /// Protocol clients use to reach the load balancer.
    pub protocol: String,
    /// Protocol the load balancer uses to reach instances.
    pub instance_protocol: Option<String>,
    /// Port the load balancer listens on.
    pub load_balancer_port: u16,
    /// Port instances listen on.
    pub instance_port: u16,
    /// Server certificate resource name for TLS listeners.
    pub ssl_certificate_id: Option<String>,
}

impl Listener {
    fn write(&self, params: &mut Params, index: usize) {
        params
            .scope("Listeners.member", index)
            .set("Protocol", self.protocol.as_str())
            .set_opt("InstanceProtocol", self.instance_protocol.as_deref())
            .set("LoadBalancerPort", self.load_balancer_port.to_string())
            .set("InstancePort", self.instance_port.to_string())
            .set_opt("SSLCertificateId", self.ssl_certificate_id.as_deref());
    }
}

/// A parsed listener whose certificate may still need resolving by name.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ListenerSpec {
    /// Listener settings; `ssl_certificate_id` is set when given by id.
    pub listener: Listener,
    /// Certificate to look up by name before the listener is created.
    pub certificate_name: Option<String>,
}

fn port(fields: &BTreeMap<String, String>, key: &str) -> Result<u16, LifecycleError> {
    let raw = fields.get(key).ok_or_else(|| {
        error!(key, "listener field is missing");
        LifecycleError::InvalidParameter(String::from(
            "instance-port and lb-port are required; give either protocol or both \
             instance-protocol and lb-protocol",
        ))
    })?;
    raw.parse()
        .map_err(|_| LifecycleError::InvalidParameter(format!("{key} '{raw}' is not a port")))
}

impl ListenerSpec {
    /// Reads a listener from parsed `key=value` fields.
    ///
    /// `lb-protocol` with `instance-protocol` sets each side separately;
    /// `protocol` alone applies to both. A certificate is given by
    /// `cert-id`, `cert-name`, or `cert-lookup`, which names a key in
    /// `lookups` holding the certificate name.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidParameter`] when ports or protocols
    /// are missing, a port is not numeric, or a lookup key is unknown.
    pub fn from_fields(
        fields: &BTreeMap<String, String>,
        lookups: &BTreeMap<String, String>,
    ) -> Result<Self, LifecycleError> {
        let (protocol, instance_protocol) = match (
            fields.get("lb-protocol"),
            fields.get("instance-protocol"),
            fields.get("protocol"),
        ) {
            (Some(lb), Some(instance), _) => (lb.clone(), instance.clone()),
            (_, _, Some(both)) => (both.clone(), both.clone()),
            _ => {
                return Err(LifecycleError::InvalidParameter(String::from(
                    "a listener needs protocol, or both instance-protocol and lb-protocol",
                )));
            }
        };
        let certificate_name = match fields.get("cert-lookup") {
            Some(key) => Some(lookups.get(key).cloned().ok_or_else(|| {
                LifecycleError::InvalidParameter(format!("no certificate lookup named '{key}'"))
            })?),
            None => fields.get("cert-name").cloned(),
        };
        let ssl_certificate_id = certificate_name
            .is_none()
            .then(|| fields.get("cert-id").cloned())
            .flatten();
        Ok(Self {
            listener: Listener {
                protocol,
                instance_protocol: Some(instance_protocol),
                load_balancer_port: port(fields, "lb-port")?,
                instance_port: port(fields, "instance-port")?,
                ssl_certificate_id,
            },
            certificate_name,
        })
    }
}

/// Parses `protocol=HTTP,lb-port=80,instance-port=80;...` into listeners.
///
/// # Errors
///
/// See [`ListenerSpec::from_fields`].
pub fn parse_listeners(
    input: &str,
    lookups: &BTreeMap<String, String>,
) -> Result<Vec<ListenerSpec>, LifecycleError> {
    parse_str_parameters(input)?
        .iter()
        .map(|fields| ListenerSpec::from_fields(fields, lookups))
        .collect()
}

/// Inputs for [`Ec2Client::create_elb`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LoadBalancerSpec {
    /// Load balancer name.
    pub name: String,
    /// Availability zones served.
    pub zones: Vec<String>,
    /// Listeners; at least one is required.
    pub listeners: Vec<ListenerSpec>,
    /// Security group ids, or names resolved within `vpc_id`.
    pub security_groups: Vec<String>,
    /// Subnet ids, or names resolved within `vpc_id`.
    pub subnets: Vec<String>,
    /// VPC used to resolve names.
    pub vpc_id: Option<String>,
}

/// `CreateLoadBalancer` with every name already resolved.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateLoadBalancer {
    /// Load balancer name.
    pub name: String,
    /// Availability zones served.
    pub zones: Vec<String>,
    /// Listeners.
    pub listeners: Vec<Listener>,
    /// Security group ids.
    pub security_group_ids: Vec<String>,
    /// Subnet ids.
    pub subnet_ids: Vec<String>,
}

impl ApiRequest for CreateLoadBalancer {
    const ACTION: &'static str = "CreateLoadBalancer";
    const FAMILY: ApiFamily = ApiFamily::LoadBalancer;

    fn write_params(&self, params: &mut Params) {
        params
            .set("LoadBalancerName", self.name.as_str())
            .members("AvailabilityZones", self.zones.iter().cloned())
            .members("SecurityGroups", self.security_group_ids.iter().cloned())
            .members("Subnets", self.subnet_ids.iter().cloned());
        for (index, listener) in self.listeners.iter().enumerate() {
            listener.write(params, index + 1);
        }
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("loadbalancername", self.name.as_str()),
            (
                "listeners",
                self.listeners.first().map_or("", |first| first.protocol.as_str()),
            ),
        ]
    }
}

macro_rules! lb_action {
    ($(#[$meta:meta])* $name:ident, $action:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, Eq, PartialEq)]
        pub struct $name {
            /// Load balancer name.
            pub lb_name: String,
        }

        impl ApiRequest for $name {
            const ACTION: &'static str = $action;
            const FAMILY: ApiFamily = ApiFamily::LoadBalancer;

            fn write_params(&self, params: &mut Params) {
                params.set("LoadBalancerName", self.lb_name.as_str());
            }

            fn required_fields(&self) -> Vec<(&'static str, &str)> {
                vec![("lb-name", self.lb_name.as_str())]
            }
        }
    };
}

lb_action!(
    /// `DeleteLoadBalancer`.
    DeleteLoadBalancer,
    "DeleteLoadBalancer"
);
lb_action!(
    /// `DescribeInstanceHealth`.
    DescribeInstanceHealth,
    "DescribeInstanceHealth"
);

/// Whether an instance joins or leaves a load balancer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Membership {
    /// `RegisterInstancesWithLoadBalancer`.
    Register,
    /// `DeregisterInstancesFromLoadBalancer`.
    Deregister,
}

/// `RegisterInstancesWithLoadBalancer`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RegisterInstance {
    /// Load balancer name.
    pub lb_name: String,
    /// Instance to register.
    pub instance_id: String,
}

/// `DeregisterInstancesFromLoadBalancer`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeregisterInstance {
    /// Load balancer name.
    pub lb_name: String,
    /// Instance to deregister.
    pub instance_id: String,
}

fn write_membership(params: &mut Params, lb_name: &str, instance_id: &str) {
    params.set("LoadBalancerName", lb_name);
    params
        .scope("Instances.member", 1)
        .set("InstanceId", instance_id);
}

impl ApiRequest for RegisterInstance {
    const ACTION: &'static str = "RegisterInstancesWithLoadBalancer";
    const FAMILY: ApiFamily = ApiFamily::LoadBalancer;

    fn write_params(&self, params: &mut Params) {
        write_membership(params, &self.lb_name, &self.instance_id);
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("lb-name", self.lb_name.as_str()),
            ("instance_id", self.instance_id.as_str()),
        ]
    }
}

impl ApiRequest for DeregisterInstance {
    const ACTION: &'static str = "DeregisterInstancesFromLoadBalancer";
    const FAMILY: ApiFamily = ApiFamily::LoadBalancer;

    fn write_params(&self, params: &mut Params) {
        write_membership(params, &self.lb_name, &self.instance_id);
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("lb-name", self.lb_name.as_str()),
            ("instance_id", self.instance_id.as_str()),
        ]
    }
}

/// `DescribeLoadBalancers`, for one load balancer or all of them.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DescribeLoadBalancers {
    /// Restrict to this load balancer.
    pub lb_name: Option<String>,
}

impl ApiRequest for DescribeLoadBalancers {
    const ACTION: &'static str = "DescribeLoadBalancers";
    const FAMILY: ApiFamily = ApiFamily::LoadBalancer;

    fn write_params(&self, params: &mut Params) {
        params.members("LoadBalancerNames", self.lb_name.iter().cloned());
    }
}

/// `ConfigureHealthCheck`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HealthCheck {
    /// Load balancer name.
    pub lb_name: String,
    /// Consecutive successes before an instance is healthy.
    pub healthy_threshold: u32,
    /// Seconds between checks.
    pub interval: u32,
    /// Check target, for example `HTTP:80/health`.
    pub target: String,
    /// Seconds before a check times out.
    pub timeout: u32,
    /// Consecutive failures before an instance is unhealthy.
    pub unhealthy_threshold: u32,
}

impl ApiRequest for HealthCheck {
    const ACTION: &'static str = "ConfigureHealthCheck";
    const FAMILY: ApiFamily = ApiFamily::LoadBalancer;

    fn write_params(&self, params: &mut Params) {
        params
            .set("LoadBalancerName", self.lb_name.as_str())
            .set("HealthCheck.HealthyThreshold", self.healthy_threshold.to_string())
            .set("HealthCheck.Interval", self.interval.to_string())
            .set("HealthCheck.Target", self.target.as_str())
            .set("HealthCheck.Timeout", self.timeout.to_string())
            .set(
                "HealthCheck.UnhealthyThreshold",
                self.unhealthy_threshold.to_string(),
            );
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("loadbalancername", self.lb_name.as_str()),
            ("target", self.target.as_str()),
        ]
    }
}

/// `CreateLoadBalancerListeners` for one listener.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateListener {
    /// Load balancer name.
    pub lb_name: String,
    /// Listener to add.
    pub listener: Listener,
}

impl ApiRequest for CreateListener {
    const ACTION: &'static str = "CreateLoadBalancerListeners";
    const FAMILY: ApiFamily = ApiFamily::LoadBalancer;

    fn write_params(&self, params: &mut Params) {
        params.set("LoadBalancerName", self.lb_name.as_str());
        self.listener.write(params, 1);
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("lb-name", self.lb_name.as_str()),
            ("lb-protocol", self.listener.protocol.as_str()),
        ]
    }
}

/// `DeleteLoadBalancerListeners` for one port.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeleteListener {
    /// Load balancer name.
    pub lb_name: String,
    /// Listener port to remove.
    pub lb_port: u16,
}

impl ApiRequest for DeleteListener {
    const ACTION: &'static str = "DeleteLoadBalancerListeners";
    const FAMILY: ApiFamily = ApiFamily::LoadBalancer;

    fn write_params(&self, params: &mut Params) {
        params
            .set("LoadBalancerName", self.lb_name.as_str())
            .members("LoadBalancerPorts", [self.lb_port.to_string()]);
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![("lb-name", self.lb_name.as_str())]
    }
}

/// `ListServerCertificates` on the identity service.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ListServerCertificates;

impl ApiRequest for ListServerCertificates {
    const ACTION: &'static str = "ListServerCertificates";
    const FAMILY: ApiFamily = ApiFamily::Identity;

    fn write_params(&self, _params: &mut Params) {}
}

impl<T: Transport> Ec2Client<T> {
    /// Server certificates on the account.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the request fails.
    pub async fn list_certificates(&self) -> Result<Vec<Certificate>, LifecycleError> {
        let records = self.call(&ListServerCertificates).await?;
        Ok(
            result_members(&records, &["ServerCertificateMetadataList", "member"])
                .into_iter()
                .filter_map(Certificate::from_node)
                .collect(),
        )
    }

    /// Resource name of the certificate called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] when no certificate has that
    /// name.
    pub async fn certificate_arn(&self, name: &str) -> Result<String, LifecycleError> {
        info!(name, "looking up certificate");
        self.list_certificates()
            .await?
            .into_iter()
            .find(|certificate| certificate.name == name)
            .map(|certificate| certificate.arn)
            .ok_or_else(|| {
                error!(name, "certificate was not found");
                LifecycleError::NotFound {
                    kind: ResourceKind::Certificate,
                    name: name.to_owned(),
                    vpc_id: None,
                }
            })
    }

    /// Creates a load balancer, resolving certificate, group and subnet
    /// names first.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] when a name cannot be resolved,
    /// [`LifecycleError::MissingField`] when the name or listeners are
    /// absent, and propagates request failures.
    pub async fn create_elb(&self, spec: &LoadBalancerSpec) -> Result<Vec<Node>, LifecycleError> {
        if spec.zones.is_empty() && spec.subnets.is_empty() {
            error!(name = %spec.name, "at least one availability zone or subnet is required");
        }
        let vpc_id = spec.vpc_id.as_deref();
        let mut listeners = Vec::with_capacity(spec.listeners.len());
        for entry in &spec.listeners {
            let mut listener = entry.listener.clone();
            if let Some(name) = &entry.certificate_name {
                listener.ssl_certificate_id = Some(self.certificate_arn(name).await?);
            }
            listeners.push(listener);
        }
        let mut security_group_ids = Vec::with_capacity(spec.security_groups.len());
        for group in &spec.security_groups {
            security_group_ids.push(self.security_group_id(group, vpc_id).await?);
        }
        let mut subnet_ids = Vec::with_capacity(spec.subnets.len());
        for subnet in &spec.subnets {
            subnet_ids.push(self.subnet_id(subnet, vpc_id).await?);
        }
        let request = CreateLoadBalancer {
            name: spec.name.clone(),
            zones: spec.zones.clone(),
            listeners,
            security_group_ids,
            subnet_ids,
        };
        let records = self.call(&request).await?;
        info!(name = %spec.name, "load balancer created");
        Ok(records)
    }

    /// Deletes a load balancer.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the name is empty or the request
    /// fails.
    pub async fn destroy_elb(&self, lb_name: &str) -> Result<Vec<Node>, LifecycleError> {
        self.call(&DeleteLoadBalancer {
            lb_name: lb_name.to_owned(),
        })
        .await
    }

    /// Registers or deregisters the instance named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NodeNotFound`] for unknown instances, and
    /// propagates request failures.
    pub async fn set_elb_membership(
        &self,
        name: &str,
        lb_name: &str,
        membership: Membership,
    ) -> Result<Vec<Node>, LifecycleError> {
        require(&[("lb-name", lb_name)])?;
        let instance_id = self.find_node(name, None).await?.id;
        let lb_name = lb_name.to_owned();
        match membership {
            Membership::Register => {
                self.call(&RegisterInstance {
                    lb_name,
                    instance_id,
                })
                .await
            }
            Membership::Deregister => {
                self.call(&DeregisterInstance {
                    lb_name,
                    instance_id,
                })
                .await
            }
        }
    }

    /// Registers the instance named `name` with `lb_name`.
    ///
    /// # Errors
    ///
    /// See [`Ec2Client::set_elb_membership`].
    pub async fn attach_elb(&self, name: &str, lb_name: &str) -> Result<Vec<Node>, LifecycleError> {
        self.set_elb_membership(name, lb_name, Membership::Register)
            .await
    }

    /// Deregisters the instance named `name` from `lb_name`.
    ///
    /// # Errors
    ///
    /// See [`Ec2Client::set_elb_membership`].
    pub async fn detach_elb(&self, name: &str, lb_name: &str) -> Result<Vec<Node>, LifecycleError> {
        self.set_elb_membership(name, lb_name, Membership::Deregister)
            .await
    }

    /// Health of every instance behind `lb_name`, one `InstanceStates`
    /// member per instance.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the name is empty or the request
    /// fails.
    pub async fn describe_elb_instance_health(
        &self,
        lb_name: &str,
    ) -> Result<Vec<Node>, LifecycleError> {
        let records = self
            .call(&DescribeInstanceHealth {
                lb_name: lb_name.to_owned(),
            })
            .await?;
        Ok(result_members(&records, &["InstanceStates", "member"])
            .into_iter()
            .cloned()
            .collect())
    }

    async fn describe_load_balancers(
        &self,
        lb_name: Option<&str>,
    ) -> Result<Vec<LoadBalancer>, LifecycleError> {
        let records = self
            .call(&DescribeLoadBalancers {
                lb_name: lb_name.map(str::to_owned),
            })
            .await?;
        Ok(
            result_members(&records, &["LoadBalancerDescriptions", "member"])
                .into_iter()
                .filter_map(LoadBalancer::from_node)
                .collect(),
        )
    }

    /// Describes one load balancer.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the name is empty or the request
    /// fails.
    pub async fn describe_elb(&self, lb_name: &str) -> Result<Option<LoadBalancer>, LifecycleError> {
        require(&[("lb-name", lb_name)])?;
        Ok(self
            .describe_load_balancers(Some(lb_name))
            .await?
            .into_iter()
            .next())
    }

    /// Describes every load balancer.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the request fails.
    pub async fn describe_all_elbs(&self) -> Result<Vec<LoadBalancer>, LifecycleError> {
        self.describe_load_balancers(None).await
    }

    /// Replaces the health check of a load balancer.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when a field is empty or the request
    /// fails.
    pub async fn configure_elb_healthcheck(
        &self,
        check: &HealthCheck,
    ) -> Result<Vec<Node>, LifecycleError> {
        self.call(check).await
    }

    /// Adds a listener to `lb_name`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when a field is empty or the request
    /// fails.
    pub async fn create_elb_listener(
        &self,
        lb_name: &str,
        listener: Listener,
    ) -> Result<Vec<Node>, LifecycleError> {
        self.call(&CreateListener {
            lb_name: lb_name.to_owned(),
            listener,
        })
        .await
    }

    /// Removes the listener on `lb_port` from `lb_name`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the name is empty or the request
    /// fails.
    pub async fn delete_elb_listener(
        &self,
        lb_name: &str,
        lb_port: u16,
    ) -> Result<Vec<Node>, LifecycleError> {
        self.call(&DeleteListener {
            lb_name: lb_name.to_owned(),
            lb_port,
        })
        .await
    }
}
