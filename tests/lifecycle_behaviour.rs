//! Behavioural tests for lifecycle operations driven through a scripted
//! transport.

use cirrus::{LifecycleError, VmProfile};
use cirrus::ops::ResourceKind;
use cirrus::ops::catalog::resolve_instance_type;
use cirrus::ops::security_group::{AuthorizeIngress, GroupRef, parse_rules};
use cirrus::provision::RunInstances;
use cirrus::query::ApiRequest;
use cirrus::test_support::{
    InstanceXml, ScriptedTransport, scripted_client, xml_attribute, xml_ok, xml_reservations,
};
use rstest::rstest;

const VPC: &str = "<DescribeVpcsResponse><requestId>req</requestId><vpcSet><item>\
    <vpcId>vpc-1</vpcId><tagSet><item><key>Name</key><value>prod</value></item></tagSet>\
    </item></vpcSet></DescribeVpcsResponse>";

const NO_GROUPS: &str = "<DescribeSecurityGroupsResponse><requestId>req</requestId>\
    <securityGroupInfo/></DescribeSecurityGroupsResponse>";

fn web_1() -> String {
    xml_reservations(&[InstanceXml {
        id: "i-1",
        name: Some("web-1"),
        state: "running",
        public_ip: Some("203.0.113.10"),
        ..InstanceXml::default()
    }])
}

#[rstest]
#[case("Micro Instance", "t1.micro")]
#[case("High-CPU Medium Instance", "c1.medium")]
#[case("m3.large", "m3.large")]
fn launch_uses_the_aliased_instance_type(#[case] size: &str, #[case] expected: &str) {
    assert_eq!(resolve_instance_type(size), expected);

    let profile = VmProfile {
        size: Some(size.to_owned()),
        keyname: Some(String::from("deploy")),
        ..VmProfile::new("web-1", "ami-1234")
    };
    let params = RunInstances::from_profile(&profile, Vec::new(), None, None)
        .expect("profile is complete")
        .to_params();
    assert_eq!(params.get("InstanceType"), Some(expected));
    assert_eq!(params.get("ImageId"), Some("ami-1234"));
}

#[tokio::test]
async fn protected_instance_survives_until_protection_is_lifted() {
    let transport = ScriptedTransport::new();
    let client = scripted_client(&transport);

    transport.push_ok(web_1());
    transport.push_ok(xml_attribute("i-1", "disableApiTermination", true));
    let err = client.destroy("web-1").await.expect_err("instance is protected");
    assert_eq!(
        err,
        LifecycleError::TerminationProtected {
            instance_id: String::from("i-1")
        }
    );
    assert_eq!(transport.count_action("TerminateInstances"), 0);

    transport.push_ok(web_1());
    transport.push_ok(xml_ok("ModifyInstanceAttribute"));
    transport.push_ok(xml_attribute("i-1", "disableApiTermination", false));
    let enabled = client
        .set_term_protect("web-1", false)
        .await
        .expect("protection lifted");
    assert!(!enabled);

    transport.push_ok(web_1());
    transport.push_ok(xml_attribute("i-1", "disableApiTermination", false));
    transport.push_ok(xml_ok("TerminateInstances"));
    let outcome = client.destroy("web-1").await.expect("instance destroyed");
    assert_eq!(outcome.instance_id, "i-1");
    assert_eq!(outcome.renamed_to, None);
    assert_eq!(transport.count_action("TerminateInstances"), 1);
    assert_eq!(transport.remaining(), 0);
}

#[test]
fn ingress_rules_flatten_into_numbered_permissions() {
    let permissions =
        parse_rules("protocol=tcp,from-port=22,to-port=22,ip-range=0.0.0.0/0;protocol=icmp")
            .expect("rules parse");
    let params = AuthorizeIngress {
        group: GroupRef::Id(String::from("sg-1")),
        permissions,
    }
    .to_params();

    assert_eq!(params.get("GroupId"), Some("sg-1"));
    assert_eq!(params.get("IpPermissions.1.IpProtocol"), Some("tcp"));
    assert_eq!(params.get("IpPermissions.1.FromPort"), Some("22"));
    assert_eq!(params.get("IpPermissions.1.ToPort"), Some("22"));
    assert_eq!(
        params.get("IpPermissions.1.IpRanges.1.CidrIp"),
        Some("0.0.0.0/0")
    );
    assert_eq!(params.get("IpPermissions.2.IpProtocol"), Some("icmp"));
    assert_eq!(params.get("IpPermissions.2.FromPort"), None);
}

#[tokio::test]
async fn unknown_group_name_is_not_found() {
    let transport = ScriptedTransport::new();
    transport.push_ok(VPC);
    transport.push_ok(NO_GROUPS);

    let err = scripted_client(&transport)
        .resolve_security_group("web", "vpc-1")
        .await
        .expect_err("no such group");

    assert_eq!(
        err,
        LifecycleError::NotFound {
            kind: ResourceKind::SecurityGroup,
            name: String::from("prod-web"),
            vpc_id: Some(String::from("vpc-1")),
        }
    );
    assert_eq!(transport.actions(), ["DescribeVpcs", "DescribeSecurityGroups"]);
}
