//! End-to-end provisioning through the public API with a scripted provider
//! and a recording deployer.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;

use cirrus::provision::ProvisionState;
use cirrus::retry::RetryPolicy;
use cirrus::test_support::{
    InstanceXml, RecordingDeployer, ScriptedTransport, scripted_client, xml_describe_tags,
    xml_ok, xml_reservations, xml_run_instances,
};
use cirrus::{Provisioner, VmProfile};
use tempfile::TempDir;

#[tokio::test]
async fn provisioned_instance_reports_its_trail() {
    let dir = TempDir::new().expect("temp dir");
    let key = dir.path().join("deploy.pem");
    std::fs::write(&key, "key").expect("write key");
    std::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o400)).expect("chmod");

    let transport = ScriptedTransport::new();
    transport.push_ok(xml_run_instances("i-9"));
    let described = xml_reservations(&[InstanceXml {
        id: "i-9",
        state: "running",
        public_ip: Some("198.51.100.7"),
        ..InstanceXml::default()
    }]);
    transport.push_ok(described.clone());
    transport.push_ok(described);
    transport.push_ok(xml_ok("CreateTags"));
    transport.push_ok(xml_describe_tags("i-9", &[("Name", "db-1")]));

    let profile = VmProfile {
        size: Some(String::from("m1.small")),
        private_key: Some(key.to_string_lossy().into_owned()),
        ssh_username: vec![String::from("admin")],
        ..VmProfile::new("db-1", "ami-5678")
    };
    let deployer = RecordingDeployer::accepting(&["admin"]);

    let outcome = Provisioner::new(scripted_client(&transport), deployer.clone())
        .with_descriptor_policy(RetryPolicy::immediate(2))
        .with_address_policy(RetryPolicy::immediate(2))
        .provision(&profile)
        .await
        .expect("provisioning succeeds");

    assert_eq!(outcome.address, "198.51.100.7");
    assert_eq!(deployer.logins(), ["admin"]);
    assert_eq!(outcome.trail.last(), Some(&ProvisionState::Complete));

    let rendered = serde_json::to_value(&outcome).expect("outcome serialises");
    assert_eq!(rendered["trail"][0], "validating");
    assert_eq!(rendered["username"], "admin");
    assert_eq!(transport.remaining(), 0);
}
