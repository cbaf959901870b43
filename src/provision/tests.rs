//! Unit tests for the provisioning state machine.

use std::os::unix::fs::PermissionsExt;

use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::test_support::{
    InstanceXml, RecordingDeployer, ScriptedTransport, scripted_client, xml_describe_tags, xml_ok,
    xml_reservations, xml_run_instances,
};

struct KeyDir {
    _dir: TempDir,
    path: String,
}

#[fixture]
fn key() -> KeyDir {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("deploy.pem");
    std::fs::write(&path, "key").expect("write key");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).expect("chmod");
    KeyDir {
        path: path.to_string_lossy().into_owned(),
        _dir: dir,
    }
}

fn profile(key: &KeyDir) -> VmProfile {
    VmProfile {
        size: Some(String::from("Micro Instance")),
        private_key: Some(key.path.clone()),
        script: Some(String::from("#!/bin/sh\ntrue\n")),
        ..VmProfile::new("web-1", "ami-1234")
    }
}

fn provisioner(
    transport: &ScriptedTransport,
    deployer: RecordingDeployer,
) -> Provisioner<ScriptedTransport, RecordingDeployer> {
    Provisioner::new(scripted_client(transport), deployer)
        .with_descriptor_policy(RetryPolicy::immediate(3))
        .with_address_policy(RetryPolicy::immediate(2))
}

fn pending(id: &str) -> String {
    xml_reservations(&[InstanceXml {
        id,
        state: "pending",
        ..InstanceXml::default()
    }])
}

fn running(id: &str) -> String {
    xml_reservations(&[InstanceXml {
        id,
        state: "running",
        public_ip: Some("203.0.113.10"),
        private_ip: Some("10.0.0.5"),
        ..InstanceXml::default()
    }])
}

fn script_launch(transport: &ScriptedTransport) {
    transport.push_ok(xml_run_instances("i-1"));
    transport.push_ok(pending("i-1"));
    transport.push_ok(pending("i-1"));
    transport.push_ok(running("i-1"));
    transport.push_ok(xml_ok("CreateTags"));
    transport.push_ok(xml_describe_tags("i-1", &[("Name", "web-1")]));
}

#[rstest]
#[tokio::test]
async fn launches_tags_and_deploys(key: KeyDir) {
    let transport = ScriptedTransport::new();
    script_launch(&transport);
    let deployer = RecordingDeployer::accepting(&["ubuntu"]);

    let outcome = provisioner(&transport, deployer.clone())
        .provision(&profile(&key))
        .await
        .expect("provisioning succeeds");

    assert_eq!(outcome.instance.id, "i-1");
    assert_eq!(outcome.address, "203.0.113.10");
    assert_eq!(outcome.username.as_deref(), Some("ubuntu"));
    assert!(outcome.deployed);
    assert_eq!(
        outcome.trail,
        [
            ProvisionState::Validating,
            ProvisionState::Launching,
            ProvisionState::AwaitingDescriptor,
            ProvisionState::AwaitingNetworkAddress,
            ProvisionState::Tagging,
            ProvisionState::AwaitingDeploymentReadiness,
            ProvisionState::Deploying,
            ProvisionState::Complete,
        ]
    );
    assert_eq!(
        transport.actions(),
        [
            "RunInstances",
            "DescribeInstances",
            "DescribeInstances",
            "DescribeInstances",
            "CreateTags",
            "DescribeTags",
        ]
    );
    let launch = transport.request_params().remove(0);
    assert_eq!(launch.get("InstanceType").map(String::as_str), Some("t1.micro"));
    assert_eq!(launch.get("KeyName").map(String::as_str), Some("deploy"));

    assert_eq!(deployer.logins(), ["ec2-user", "ubuntu"]);
    let requests = deployer.requests();
    let request = requests.first().expect("deployment requested");
    assert!(request.sudo);
    assert_eq!(request.login.host, "203.0.113.10");
    assert_eq!(request.login.key_file, key.path);
}

#[rstest]
#[tokio::test]
async fn private_interface_uses_private_address(key: KeyDir) {
    let transport = ScriptedTransport::new();
    script_launch(&transport);
    let vm = VmProfile {
        ssh_interface: Some(SshInterface::PrivateIps),
        ssh_username: vec![String::from("root")],
        ..profile(&key)
    };
    let deployer = RecordingDeployer::accepting(&["root"]);

    let outcome = provisioner(&transport, deployer.clone())
        .provision(&vm)
        .await
        .expect("provisioning succeeds");

    assert_eq!(outcome.address, "10.0.0.5");
    let requests = deployer.requests();
    assert!(!requests.first().expect("deployment requested").sudo);
}

#[rstest]
#[tokio::test]
async fn address_timeout_terminates_the_instance(key: KeyDir) {
    let transport = ScriptedTransport::new();
    transport.push_ok(xml_run_instances("i-1"));
    transport.push_ok(pending("i-1"));
    transport.push_ok(pending("i-1"));
    transport.push_ok(pending("i-1"));
    transport.push_ok(xml_ok("TerminateInstances"));

    let err = provisioner(&transport, RecordingDeployer::default())
        .provision(&profile(&key))
        .await
        .expect_err("no address assigned");

    assert!(matches!(err, ProvisionError::NetworkTimeout { ref instance_id, .. } if instance_id == "i-1"));
    assert_eq!(err.state(), ProvisionState::AwaitingNetworkAddress);
    assert_eq!(transport.count_action("TerminateInstances"), 1);
    assert_eq!(transport.count_action("CreateTags"), 0);
}

#[rstest]
#[tokio::test]
async fn invisible_instance_is_a_creation_failure(key: KeyDir) {
    let transport = ScriptedTransport::new();
    transport.push_ok(xml_run_instances("i-1"));
    for _ in 0..3 {
        transport.push_ok(xml_reservations(&[]));
    }

    let err = provisioner(&transport, RecordingDeployer::default())
        .provision(&profile(&key))
        .await
        .expect_err("never described");

    assert!(matches!(err, ProvisionError::CreationFailed { .. }));
    assert_eq!(transport.count_action("TerminateInstances"), 0);
}

#[tokio::test]
async fn shared_key_is_rejected_before_any_request() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("open.pem");
    std::fs::write(&path, "key").expect("write key");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).expect("chmod");
    let vm = VmProfile {
        private_key: Some(path.to_string_lossy().into_owned()),
        ..VmProfile::new("web-1", "ami-1234")
    };
    let transport = ScriptedTransport::new();

    let err = provisioner(&transport, RecordingDeployer::default())
        .provision(&vm)
        .await
        .expect_err("key is group readable");

    assert!(matches!(err, ProvisionError::KeyFile(KeyFileError::InsecureMode { mode: 0o644, .. })));
    assert!(transport.requests().is_empty());
}

#[rstest]
#[tokio::test]
async fn user_data_skips_deployment(key: KeyDir) {
    let dir = TempDir::new().expect("temp dir");
    let template = dir.path().join("userdata.ps1");
    std::fs::write(&template, "<powershell>%MINION_ID%</powershell>").expect("write template");
    let vm = VmProfile {
        userdata_file: Some(template.to_string_lossy().into_owned()),
        ..profile(&key)
    };
    let transport = ScriptedTransport::new();
    script_launch(&transport);
    let deployer = RecordingDeployer::accepting(&["ubuntu"]);

    let outcome = provisioner(&transport, deployer.clone())
        .provision(&vm)
        .await
        .expect("provisioning succeeds");

    assert!(!outcome.deployed);
    assert!(deployer.logins().is_empty());
    let launch = transport.request_params().remove(0);
    assert!(launch.contains_key("UserData"));
}

#[rstest]
#[tokio::test]
async fn no_username_authenticates(key: KeyDir) {
    let transport = ScriptedTransport::new();
    script_launch(&transport);

    let err = provisioner(&transport, RecordingDeployer::accepting(&[]))
        .provision(&profile(&key))
        .await
        .expect_err("nobody authenticates");

    let ProvisionError::Authentication { tried, .. } = err else {
        panic!("expected an authentication failure, got {err:?}");
    };
    assert_eq!(tried.len(), crate::deploy::BUILTIN_USERNAMES.len());
}

#[rstest]
#[tokio::test]
async fn closed_port_fails_deployment(key: KeyDir) {
    let transport = ScriptedTransport::new();
    script_launch(&transport);

    let err = provisioner(
        &transport,
        RecordingDeployer::accepting(&["ubuntu"]).with_closed_port(),
    )
    .provision(&profile(&key))
    .await
    .expect_err("port closed");

    assert!(matches!(
        err,
        ProvisionError::Deployment(DeployError::PortUnreachable { port: 22, .. })
    ));
}

#[rstest]
#[tokio::test]
async fn requested_volumes_are_attached_last(key: KeyDir) {
    let transport = ScriptedTransport::new();
    script_launch(&transport);
    transport.push_ok(xml_ok("AttachVolume"));
    transport.push_ok(xml_ok("ModifyInstanceAttribute"));
    transport.push_ok(xml_ok("DescribeInstanceAttribute"));
    let vm = VmProfile {
        deploy: Some(false),
        volumes: vec![crate::profile::VolumeSpec {
            device: String::from("/dev/sdf"),
            volume_id: Some(String::from("vol-1")),
            ..crate::profile::VolumeSpec::default()
        }],
        ..profile(&key)
    };

    let outcome = provisioner(&transport, RecordingDeployer::default())
        .provision(&vm)
        .await
        .expect("provisioning succeeds");

    assert_eq!(outcome.attached_volumes.len(), 1);
    assert_eq!(
        outcome.trail.get(outcome.trail.len() - 2),
        Some(&ProvisionState::AttachingVolumes)
    );
    assert_eq!(transport.count_action("AttachVolume"), 1);
}

const UNREADABLE: &str = "<DescribeInstancesResponse><unclosed>";

#[rstest]
#[tokio::test]
async fn unreadable_descriptor_reply_is_polled_again(key: KeyDir) {
    let transport = ScriptedTransport::new();
    transport.push_ok(xml_run_instances("i-1"));
    transport.push_ok(UNREADABLE);
    transport.push_ok(pending("i-1"));
    transport.push_ok(running("i-1"));
    transport.push_ok(xml_ok("CreateTags"));
    transport.push_ok(xml_describe_tags("i-1", &[("Name", "web-1")]));

    let outcome = provisioner(&transport, RecordingDeployer::accepting(&["ec2-user"]))
        .provision(&profile(&key))
        .await
        .expect("provisioning survives a garbled reply");

    assert_eq!(outcome.trail.last(), Some(&ProvisionState::Complete));
    assert_eq!(transport.count_action("DescribeInstances"), 3);
}

#[rstest]
#[tokio::test]
async fn unreadable_address_reply_keeps_the_instance(key: KeyDir) {
    let transport = ScriptedTransport::new();
    transport.push_ok(xml_run_instances("i-1"));
    transport.push_ok(pending("i-1"));
    transport.push_ok(UNREADABLE);
    transport.push_ok(running("i-1"));
    transport.push_ok(xml_ok("CreateTags"));
    transport.push_ok(xml_describe_tags("i-1", &[("Name", "web-1")]));

    let outcome = provisioner(&transport, RecordingDeployer::accepting(&["ec2-user"]))
        .provision(&profile(&key))
        .await
        .expect("provisioning survives a garbled reply");

    assert_eq!(outcome.address, "203.0.113.10");
    assert_eq!(transport.count_action("TerminateInstances"), 0);
    assert_eq!(transport.remaining(), 0);
}

#[rstest]
#[tokio::test]
async fn failed_teardown_still_reports_the_timeout(key: KeyDir) {
    let transport = ScriptedTransport::new();
    transport.push_ok(xml_run_instances("i-1"));
    transport.push_ok(pending("i-1"));
    transport.push_ok(pending("i-1"));
    transport.push_ok(pending("i-1"));
    transport.push_failure("connection reset");

    let err = provisioner(&transport, RecordingDeployer::default())
        .provision(&profile(&key))
        .await
        .expect_err("no address assigned");

    let ProvisionError::NetworkTimeout { instance_id, message } = err else {
        panic!("expected a network timeout, got {err:?}");
    };
    assert_eq!(instance_id, "i-1");
    assert!(message.contains("teardown also failed"), "{message}");
    assert!(message.contains("connection reset"), "{message}");
    assert_eq!(transport.count_action("TerminateInstances"), 1);
}
