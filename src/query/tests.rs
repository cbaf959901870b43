//! Unit tests for query dispatch.

use chrono::TimeZone;
use rstest::{fixture, rstest};

use super::*;
use crate::test_support::ScriptedTransport;

fn fixed_clock() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0)
        .single()
        .unwrap_or_default()
}

#[fixture]
fn transport() -> ScriptedTransport {
    ScriptedTransport::new()
}

fn client(transport: &ScriptedTransport) -> QueryClient<ScriptedTransport> {
    QueryClient::with_transport(
        ProviderConfig::new("AKIDEXAMPLE", "secret-key", "deploy", "/keys/deploy.pem"),
        transport.clone(),
    )
    .with_clock(fixed_clock)
}

const DESCRIBE_INSTANCES: &str = r#"<DescribeInstancesResponse xmlns="http://ec2.amazonaws.com/doc/2014-10-01/">
  <requestId>req-1</requestId>
  <reservationSet>
    <item><reservationId>r-1</reservationId></item>
    <item><reservationId>r-2</reservationId></item>
  </reservationSet>
</DescribeInstancesResponse>"#;

#[rstest]
#[tokio::test]
async fn default_collection_is_second_child(transport: ScriptedTransport) {
    transport.push_ok(DESCRIBE_INSTANCES);
    let response = client(&transport)
        .query(Query::new(Params::action("DescribeInstances")))
        .await
        .expect("query succeeds");

    let records = response.reply.into_result().expect("records");
    let ids: Vec<&str> = records
        .iter()
        .filter_map(|record| record.text_at(&["reservationId"]))
        .collect();
    assert_eq!(ids, ["r-1", "r-2"]);
}

#[rstest]
#[tokio::test]
async fn raw_root_returns_every_root_child(transport: ScriptedTransport) {
    transport.push_ok(DESCRIBE_INSTANCES);
    let response = client(&transport)
        .query(Query::new(Params::action("DescribeInstances")).raw_root())
        .await
        .expect("query succeeds");

    let records = response.reply.into_result().expect("records");
    assert_eq!(records.len(), 2);
    assert_eq!(
        records.first().and_then(|r| r.text_at(&["requestId"])),
        Some("req-1")
    );
}

#[rstest]
#[tokio::test]
async fn named_result_set_selects_last_match(transport: ScriptedTransport) {
    transport.push_ok(
        "<R><requestId>x</requestId><tagSet><item><key>a</key></item></tagSet>\
         <tagSet><item><key>b</key></item></tagSet></R>",
    );
    let response = client(&transport)
        .query(Query::new(Params::action("DescribeTags")).result_set("tagSet"))
        .await
        .expect("query succeeds");

    let records = response.reply.into_result().expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(
        records.first().and_then(|r| r.text_at(&["key"])),
        Some("b")
    );
}

#[rstest]
#[tokio::test]
async fn missing_collection_yields_no_records(transport: ScriptedTransport) {
    transport.push_ok("<R><requestId>x</requestId></R>");
    let response = client(&transport)
        .query(Query::new(Params::action("DescribeVolumes")))
        .await
        .expect("query succeeds");
    assert_eq!(response.reply, Reply::Records(Vec::new()));
}

#[rstest]
#[tokio::test]
async fn error_status_decodes_code_and_message(transport: ScriptedTransport) {
    transport.push_reply(
        400,
        "<Response><Errors><Error><Code>InvalidInstanceID.NotFound</Code>\
         <Message>The instance ID 'i-1' does not exist</Message></Error></Errors>\
         <RequestID>r</RequestID></Response>",
    );
    let response = client(&transport)
        .query(Query::new(Params::action("DescribeInstances")))
        .await
        .expect("error replies are values");

    let Reply::Error(error) = response.reply else {
        panic!("expected an error reply");
    };
    assert_eq!(error.status, 400);
    assert_eq!(error.code, "InvalidInstanceID.NotFound");
    assert!(error.message.contains("does not exist"));
}

#[rstest]
#[tokio::test]
async fn error_document_with_success_status_is_an_error(transport: ScriptedTransport) {
    transport.push_ok("<Response><Errors><Error><Code>Throttled</Code></Error></Errors></Response>");
    let response = client(&transport)
        .query(Query::new(Params::action("DescribeInstances")))
        .await
        .expect("error replies are values");
    assert!(matches!(response.reply, Reply::Error(ref e) if e.code == "Throttled"));
}

#[rstest]
#[tokio::test]
async fn transport_failures_are_errors(transport: ScriptedTransport) {
    transport.push_failure("connection refused");
    let result = client(&transport)
        .query(Query::new(Params::action("DescribeInstances")))
        .await;
    assert!(matches!(result, Err(QueryError::Transport(_))));
}

#[rstest]
#[tokio::test]
async fn compute_requests_are_legacy_signed_with_version(transport: ScriptedTransport) {
    transport.push_ok(DESCRIBE_INSTANCES);
    let response = client(&transport)
        .query(Query::new(Params::action("DescribeInstances")).region("eu-west-1"))
        .await
        .expect("query succeeds");

    assert!(
        response
            .request_url
            .starts_with("https://ec2.eu-west-1.amazonaws.com/?")
    );
    let params = transport.request_params();
    let sent = params.first().expect("one request");
    assert_eq!(sent.get("Version").map(String::as_str), Some("2014-10-01"));
    assert_eq!(sent.get("SignatureVersion").map(String::as_str), Some("2"));
    assert!(sent.contains_key("Signature"));
}

#[rstest]
#[tokio::test]
async fn warehouse_requests_are_presigned(transport: ScriptedTransport) {
    transport.push_ok("<R><requestId>x</requestId><Clusters/></R>");
    client(&transport)
        .query(Query::new(Params::action("DescribeClusters")).family(ApiFamily::DataWarehouse))
        .await
        .expect("query succeeds");

    let params = transport.request_params();
    let sent = params.first().expect("one request");
    assert_eq!(sent.get("SignatureVersion").map(String::as_str), Some("4"));
    assert_eq!(
        sent.get("X-Amz-Date").map(String::as_str),
        Some("20150830T123600Z")
    );
    assert!(sent.contains_key("X-Amz-Signature"));
    assert!(
        transport
            .requests()
            .first()
            .is_some_and(|url| url.starts_with("https://redshift.us-east-1.amazonaws.com/"))
    );
}

#[rstest]
#[tokio::test]
async fn explicit_request_url_skips_signing(transport: ScriptedTransport) {
    transport.push_ok(DESCRIBE_INSTANCES);
    client(&transport)
        .query(
            Query::new(Params::action("DescribeInstances"))
                .request_url("https://ec2.example/?Action=DescribeInstances"),
        )
        .await
        .expect("query succeeds");
    assert_eq!(
        transport.requests(),
        vec![String::from("https://ec2.example/?Action=DescribeInstances")]
    );
}

#[test]
fn non_xml_error_bodies_keep_raw_text() {
    let error = ErrorResponse::from_body(503, "Service Unavailable");
    assert_eq!(error.code, "Unknown");
    assert_eq!(error.message, "Service Unavailable");
}
