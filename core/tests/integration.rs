//! End-to-end tests against the live mock server.
//!
//! # Design
//! Each test starts the mock server on a random port and drives it through
//! `RedcapClient` over real HTTP, so encoding, dispatch and classification
//! are exercised together with an independent implementation of the wire
//! format.

use std::time::Duration;

use mock_server::API_TOKEN;
use redcap_core::{
    ApiToken, ClientConfig, DomainError, FileUpload, FsFileStore, ParameterSet, Payload, RedcapClient,
    RedcapError, ReturnFormat,
};
use serde_json::{json, Value};

async fn start() -> RedcapClient {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(mock_server::run(listener));

    let config = ClientConfig::builder(&format!("http://{addr}/api/"))
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    RedcapClient::new(config).unwrap()
}

fn token() -> ApiToken {
    ApiToken::new(API_TOKEN).unwrap()
}

fn parse(body: &str) -> Value {
    serde_json::from_str(body).unwrap()
}

#[tokio::test]
async fn exports_version() {
    let client = start().await;
    assert_eq!(client.export_version(&token()).await.unwrap(), mock_server::VERSION);
}

#[tokio::test]
async fn wrong_token_is_a_recognized_service_error() {
    let client = start().await;
    let wrong = ApiToken::new("FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF").unwrap();

    let err = client.export_arms(&wrong, ParameterSet::new()).await.unwrap_err();
    match err {
        RedcapError::Domain { status, source, .. } => {
            assert_eq!(status, 403);
            assert_eq!(
                source,
                DomainError::RecognizedServiceError("You do not have permissions to use the API".to_string())
            );
        }
        other => panic!("expected domain error, got {other:?}"),
    }
}

#[tokio::test]
async fn xml_error_envelope_round_trip() {
    let client = start().await;
    let options = ParameterSet::new().error_format_as(ReturnFormat::Xml);

    let err = client.export_users(&token(), options).await.unwrap_err();
    assert_eq!(
        err.domain(),
        Some(&DomainError::RecognizedServiceError(
            "The value of the parameter \"content\" is not valid".to_string()
        ))
    );
}

#[tokio::test]
async fn arm_lifecycle() {
    let client = start().await;

    let arms = Payload::records(&[json!({ "arm_num": "2", "name": "Follow-up" })]).unwrap();
    let imported = client.import_arms(&token(), arms, ParameterSet::new()).await.unwrap();
    assert_eq!(imported, "1");

    let exported = parse(&client.export_arms(&token(), ParameterSet::new()).await.unwrap());
    assert_eq!(exported, json!([{ "arm_num": "1", "name": "Arm 1" }, { "arm_num": "2", "name": "Follow-up" }]));

    let only_two = ParameterSet::new().arms(["2"]);
    let exported = parse(&client.export_arms(&token(), only_two).await.unwrap());
    assert_eq!(exported, json!([{ "arm_num": "2", "name": "Follow-up" }]));

    assert_eq!(client.delete_arms(&token(), ["2"]).await.unwrap(), "1");
    let err = client.delete_arms(&token(), ["2"]).await.unwrap_err();
    assert!(matches!(err.domain(), Some(DomainError::RecognizedServiceError(_))));
}

#[tokio::test]
async fn arm_export_as_csv() {
    let client = start().await;
    let csv = client
        .export_arms(&token(), ParameterSet::new().format_as(ReturnFormat::Csv))
        .await
        .unwrap();
    assert_eq!(csv, "arm_num,name\n1,Arm 1\n");
}

#[tokio::test]
async fn record_lifecycle() {
    let client = start().await;

    let next = client.generate_next_record_name(&token()).await.unwrap();
    assert_eq!(next, "2");

    let records = Payload::records(&[json!({ "record_id": next, "age": "61" })]).unwrap();
    let count = client.import_records(&token(), records, ParameterSet::new()).await.unwrap();
    assert_eq!(parse(&count), json!({ "count": 1 }));

    let options = ParameterSet::new().records(["2"]).fields(["record_id", "age"]);
    let exported = parse(&client.export_records(&token(), options).await.unwrap());
    assert_eq!(exported, json!([{ "record_id": "2", "age": "61" }]));

    let deleted = client.delete_records(&token(), ["2"], ParameterSet::new()).await.unwrap();
    assert_eq!(deleted, "1");

    let options = ParameterSet::new().records(["2"]);
    let exported = parse(&client.export_records(&token(), options).await.unwrap());
    assert_eq!(exported, json!([]));
}

#[tokio::test]
async fn record_import_returns_ids_when_asked() {
    let client = start().await;
    let records = Payload::records(&[json!({ "record_id": "7" }), json!({ "record_id": "8" })]).unwrap();
    let options = ParameterSet::new().return_content(redcap_core::ReturnContent::Ids);

    let ids = client.import_records(&token(), records, options).await.unwrap();
    assert_eq!(parse(&ids), json!(["7", "8"]));
}

#[tokio::test]
async fn metadata_export() {
    let client = start().await;
    let metadata = parse(&client.export_metadata(&token(), ParameterSet::new()).await.unwrap());
    let names: Vec<&str> = metadata
        .as_array()
        .unwrap()
        .iter()
        .map(|field| field["field_name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["record_id", "age", "consent"]);
}

#[tokio::test]
async fn file_lifecycle() {
    let client = start().await;
    let upload = FileUpload::new("signed consent.txt", b"I agree".to_vec()).with_content_type("text/plain");

    client
        .import_file(&token(), "1", "consent", upload, ParameterSet::new())
        .await
        .unwrap();

    let download = client.export_file(&token(), "1", "consent", ParameterSet::new()).await.unwrap();
    assert_eq!(download.bytes, b"I agree");
    assert_eq!(download.file_name.as_deref(), Some("signed consent.txt"));
    assert_eq!(download.mime_type.as_deref(), Some("text/plain"));

    let dir = tempfile::tempdir().unwrap();
    let path = client
        .export_file_to(&token(), "1", "consent", ParameterSet::new(), &FsFileStore, dir.path(), false)
        .await
        .unwrap();
    assert_eq!(path, dir.path().join("signed consent.txt"));
    assert_eq!(std::fs::read(&path).unwrap(), b"I agree");

    client.delete_file(&token(), "1", "consent", ParameterSet::new()).await.unwrap();
    let err = client.export_file(&token(), "1", "consent", ParameterSet::new()).await.unwrap_err();
    assert_eq!(
        err.domain(),
        Some(&DomainError::RecognizedServiceError("There is no file to download for this record".to_string()))
    );
}
