//! VPC networking: VPCs, subnets, gateways, routes, and elastic addresses.

use tracing::info;

use super::{Ec2Client, LifecycleError};
use crate::model::{Subnet, Vpc, all_items, first_item, merge_records};
use crate::query::{ApiRequest, Params, Transport};
use crate::xml::Node;

/// `CreateVpc`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateVpc {
    /// Address block, for example `10.0.0.0/16`.
    pub cidr_block: String,
    /// Tenancy; `default` when unset.
    pub instance_tenancy: Option<String>,
}

impl ApiRequest for CreateVpc {
    const ACTION: &'static str = "CreateVpc";

    fn write_params(&self, params: &mut Params) {
        params
            .set("CidrBlock", self.cidr_block.as_str())
            .set(
                "InstanceTenancy",
                self.instance_tenancy.as_deref().unwrap_or("default"),
            );
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![("cidr-block", self.cidr_block.as_str())]
    }
}

/// `DescribeVpcs`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DescribeVpcs {
    /// VPCs to describe.
    pub vpc_ids: Vec<String>,
}

impl ApiRequest for DescribeVpcs {
    const ACTION: &'static str = "DescribeVpcs";

    fn write_params(&self, params: &mut Params) {
        params.indexed("VpcId", self.vpc_ids.iter().cloned());
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![("vpc-id", self.vpc_ids.first().map_or("", String::as_str))]
    }
}

/// `DescribeSubnets` filtered by VPC and `Name` tag.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DescribeSubnets {
    /// Owning VPC.
    pub vpc_id: String,
    /// Exact `Name` tag value.
    pub name: String,
}

impl ApiRequest for DescribeSubnets {
    const ACTION: &'static str = "DescribeSubnets";

    fn write_params(&self, params: &mut Params) {
        params
            .filter(1, "vpc-id", [self.vpc_id.as_str()])
            .filter(2, "tag:Name", [self.name.as_str()]);
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("vpc-id", self.vpc_id.as_str()),
            ("subnet-name", self.name.as_str()),
        ]
    }
}

/// `CreateSubnet`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateSubnet {
    /// Owning VPC.
    pub vpc_id: String,
    /// Address block.
    pub cidr_block: String,
    /// Availability zone.
    pub zone: Option<String>,
}

impl ApiRequest for CreateSubnet {
    const ACTION: &'static str = "CreateSubnet";

    fn write_params(&self, params: &mut Params) {
        params
            .set("VpcId", self.vpc_id.as_str())
            .set("CidrBlock", self.cidr_block.as_str())
            .set_opt("AvailabilityZone", self.zone.as_deref());
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("vpc-id", self.vpc_id.as_str()),
            ("cidr-block", self.cidr_block.as_str()),
        ]
    }
}

/// `CreateInternetGateway`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CreateInternetGateway;

impl ApiRequest for CreateInternetGateway {
    const ACTION: &'static str = "CreateInternetGateway";

    fn write_params(&self, _params: &mut Params) {}
}

/// `AttachInternetGateway`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AttachInternetGateway {
    /// Target VPC.
    pub vpc_id: String,
    /// Gateway to attach.
    pub gateway_id: String,
}

impl ApiRequest for AttachInternetGateway {
    const ACTION: &'static str = "AttachInternetGateway";

    fn write_params(&self, params: &mut Params) {
        params
            .set("VpcId", self.vpc_id.as_str())
            .set("InternetGatewayId", self.gateway_id.as_str());
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("vpc-id", self.vpc_id.as_str()),
            ("igw-id", self.gateway_id.as_str()),
        ]
    }
}

/// `CreateRouteTable`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateRouteTable {
    /// Owning VPC.
    pub vpc_id: String,
}

impl ApiRequest for CreateRouteTable {
    const ACTION: &'static str = "CreateRouteTable";

    fn write_params(&self, params: &mut Params) {
        params.set("VpcId", self.vpc_id.as_str());
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![("vpc-id", self.vpc_id.as_str())]
    }
}

/// Where a route sends matching traffic.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RouteTarget {
    /// An internet gateway.
    Gateway(String),
    /// A NAT instance.
    Instance(String),
    /// A network interface.
    Interface(String),
}

/// `CreateRoute`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateRoute {
    /// Route table to extend.
    pub route_table_id: String,
    /// Destination address block.
    pub destination_cidr_block: String,
    /// Next hop.
    pub target: RouteTarget,
}

impl ApiRequest for CreateRoute {
    const ACTION: &'static str = "CreateRoute";

    fn write_params(&self, params: &mut Params) {
        params
            .set("RouteTableId", self.route_table_id.as_str())
            .set("DestinationCidrBlock", self.destination_cidr_block.as_str());
        match &self.target {
            RouteTarget::Gateway(id) => params.set("GatewayId", id.as_str()),
            RouteTarget::Instance(id) => params.set("InstanceId", id.as_str()),
            RouteTarget::Interface(id) => params.set("NetworkInterfaceId", id.as_str()),
        };
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        let target = match &self.target {
            RouteTarget::Gateway(id) | RouteTarget::Instance(id) | RouteTarget::Interface(id) => {
                id.as_str()
            }
        };
        vec![
            ("rtb-id", self.route_table_id.as_str()),
            ("dest-cidr-block", self.destination_cidr_block.as_str()),
            ("target", target),
        ]
    }
}

/// `AssociateRouteTable`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AssociateRouteTable {
    /// Route table.
    pub route_table_id: String,
    /// Subnet to associate.
    pub subnet_id: String,
}

impl ApiRequest for AssociateRouteTable {
    const ACTION: &'static str = "AssociateRouteTable";

    fn write_params(&self, params: &mut Params) {
        params
            .set("RouteTableId", self.route_table_id.as_str())
            .set("SubnetId", self.subnet_id.as_str());
    }

    fn required_fields(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("rtb-id", self.route_table_id.as_str()),
            ("subnet-id", self.subnet_id.as_str()),
        ]
    }
}

/// `AllocateAddress`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AllocateAddress {
    /// `vpc` for VPC addresses.
    pub domain: Option<String>,
}

impl ApiRequest for AllocateAddress {
    const ACTION: &'static str = "AllocateAddress";

    fn write_params(&self, params: &mut Params) {
        params.set_opt("Domain", self.domain.as_deref());
    }
}

/// `AssociateAddress`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AssociateAddress {
    /// Classic elastic address.
    pub public_ip: Option<String>,
    /// Target instance.
    pub instance_id: Option<String>,
    /// VPC address allocation.
    pub allocation_id: Option<String>,
    /// Target interface.
    pub network_interface_id: Option<String>,
    /// Private address on the interface.
    pub private_ip: Option<String>,
    /// Whether an address already in use may be moved.
    pub allow_reassociation: Option<bool>,
}

impl ApiRequest for AssociateAddress {
    const ACTION: &'static str = "AssociateAddress";

    fn write_params(&self, params: &mut Params) {
        params
            .set_opt("PublicIp", self.public_ip.as_deref())
            .set_opt("InstanceId", self.instance_id.as_deref())
            .set_opt("AllocationId", self.allocation_id.as_deref())
            .set_opt("NetworkInterfaceId", self.network_interface_id.as_deref())
            .set_opt("PrivateIpAddress", self.private_ip.as_deref())
            .set_opt("AllowReassociation", self.allow_reassociation);
    }
}

fn created(records: &[Node], action: &'static str, id_key: &str) -> Result<Node, LifecycleError> {
    let merged = merge_records(records);
    if merged.text_at(&[id_key]).is_none() {
        return Err(LifecycleError::UnexpectedReply {
            action,
            detail: format!("no {id_key} in reply"),
        });
    }
    Ok(merged)
}

impl<T: Transport> Ec2Client<T> {
    /// Creates a VPC.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the block is missing or the request
    /// fails.
    pub async fn create_vpc(&self, request: &CreateVpc) -> Result<Vpc, LifecycleError> {
        let records = self.call(request).await?;
        let vpc = Vpc::from_node(&merge_records(&records)).ok_or_else(|| {
            LifecycleError::UnexpectedReply {
                action: CreateVpc::ACTION,
                detail: String::from("no vpcId in reply"),
            }
        })?;
        info!(vpc_id = %vpc.id, "VPC created");
        Ok(vpc)
    }

    /// Describes one VPC.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the id is empty or the request fails.
    pub async fn describe_vpc(&self, vpc_id: &str) -> Result<Option<Vpc>, LifecycleError> {
        let records = self
            .call(&DescribeVpcs {
                vpc_ids: vec![vpc_id.to_owned()],
            })
            .await?;
        Ok(first_item(&records).and_then(Vpc::from_node))
    }

    /// Subnets in `vpc_id` whose `Name` tag is exactly `name`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when a field is empty or the request
    /// fails.
    pub async fn describe_subnet(
        &self,
        vpc_id: &str,
        name: &str,
    ) -> Result<Vec<Subnet>, LifecycleError> {
        let records = self
            .call(&DescribeSubnets {
                vpc_id: vpc_id.to_owned(),
                name: name.to_owned(),
            })
            .await?;
        Ok(all_items(&records)
            .into_iter()
            .filter_map(Subnet::from_node)
            .collect())
    }

    /// Creates a subnet.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when a field is empty or the request
    /// fails.
    pub async fn create_subnet(&self, request: &CreateSubnet) -> Result<Subnet, LifecycleError> {
        let records = self.call(request).await?;
        let subnet = Subnet::from_node(&merge_records(&records)).ok_or_else(|| {
            LifecycleError::UnexpectedReply {
                action: CreateSubnet::ACTION,
                detail: String::from("no subnetId in reply"),
            }
        })?;
        info!(subnet_id = %subnet.id, vpc_id = %request.vpc_id, "subnet created");
        Ok(subnet)
    }

    /// Creates an internet gateway.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the request fails.
    pub async fn create_igw(&self) -> Result<Node, LifecycleError> {
        let records = self.call(&CreateInternetGateway).await?;
        created(&records, CreateInternetGateway::ACTION, "internetGatewayId")
    }

    /// Attaches an internet gateway to a VPC.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when a field is empty or the request
    /// fails.
    pub async fn attach_igw(
        &self,
        vpc_id: &str,
        gateway_id: &str,
    ) -> Result<Vec<Node>, LifecycleError> {
        self.call(&AttachInternetGateway {
            vpc_id: vpc_id.to_owned(),
            gateway_id: gateway_id.to_owned(),
        })
        .await
    }

    /// Creates a route table in `vpc_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the id is empty or the request fails.
    pub async fn create_route_table(&self, vpc_id: &str) -> Result<Node, LifecycleError> {
        let records = self
            .call(&CreateRouteTable {
                vpc_id: vpc_id.to_owned(),
            })
            .await?;
        created(&records, CreateRouteTable::ACTION, "routeTableId")
    }

    /// Adds a route.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when a field is empty or the request
    /// fails.
    pub async fn create_route(&self, request: &CreateRoute) -> Result<Vec<Node>, LifecycleError> {
        self.call(request).await
    }

    /// Associates a subnet with a route table.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when a field is empty or the request
    /// fails.
    pub async fn attach_subnet(
        &self,
        route_table_id: &str,
        subnet_id: &str,
    ) -> Result<Vec<Node>, LifecycleError> {
        self.call(&AssociateRouteTable {
            route_table_id: route_table_id.to_owned(),
            subnet_id: subnet_id.to_owned(),
        })
        .await
    }

    /// Allocates an elastic address.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the request fails.
    pub async fn create_eip(&self, domain: Option<&str>) -> Result<Node, LifecycleError> {
        let records = self
            .call(&AllocateAddress {
                domain: domain.map(str::to_owned),
            })
            .await?;
        created(&records, AllocateAddress::ACTION, "publicIp")
    }

    /// Associates an elastic address.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] when the request fails.
    pub async fn attach_eip(&self, request: &AssociateAddress) -> Result<Node, LifecycleError> {
        let records = self.call(request).await?;
        Ok(merge_records(&records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedTransport, scripted_client};

    #[test]
    fn tenancy_defaults() {
        let params = CreateVpc {
            cidr_block: String::from("10.0.0.0/16"),
            instance_tenancy: None,
        }
        .to_params();
        assert_eq!(params.get("InstanceTenancy"), Some("default"));
    }

    #[test]
    fn route_target_selects_parameter() {
        let params = CreateRoute {
            route_table_id: String::from("rtb-1"),
            destination_cidr_block: String::from("0.0.0.0/0"),
            target: RouteTarget::Interface(String::from("eni-1")),
        }
        .to_params();
        assert_eq!(params.get("NetworkInterfaceId"), Some("eni-1"));
        assert_eq!(params.get("GatewayId"), None);
    }

    #[tokio::test]
    async fn describe_vpc_reads_single_item() {
        let transport = ScriptedTransport::new();
        transport.push_ok(
            "<DescribeVpcsResponse><requestId>req</requestId><vpcSet><item>\
             <vpcId>vpc-1</vpcId><state>available</state><cidrBlock>10.0.0.0/16</cidrBlock>\
             <tagSet><item><key>Name</key><value>prod</value></item></tagSet>\
             </item></vpcSet></DescribeVpcsResponse>",
        );
        let vpc = scripted_client(&transport)
            .describe_vpc("vpc-1")
            .await
            .expect("request succeeds")
            .expect("vpc present");
        assert_eq!(vpc.name(), Some("prod"));
        let params = transport.request_params();
        let sent = params.first().expect("request sent");
        assert_eq!(sent.get("VpcId.1").map(String::as_str), Some("vpc-1"));
    }
}
