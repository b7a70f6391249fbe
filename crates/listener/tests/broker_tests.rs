//! Broker history queries against a mock HTTP server.

mod common;

use common::*;
use hyper::StatusCode;
use kn_alert_listener::alert::{NewAlert, StampKind};
use kn_alert_listener::broker::BrokerClient;
use kn_alert_listener::config::BrokerConfig;
use kn_alert_listener::enrich::{
    AppendPolicy, Enrichment, HistoryOrigin, HistorySource, LightcurveEnricher, NAMESPACE_SEPARATOR,
};
use kn_alert_listener::error::BrokerQueryError;
use kn_alert_listener::processor::ProcessOutcome;
use serde_json::json;
use std::sync::Arc;
use time::macros::datetime;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> BrokerClient {
    BrokerClient::new(&BrokerConfig {
        base_url: server.uri(),
        request_timeout_secs: 5,
    })
    .unwrap()
}

#[tokio::test]
async fn test_object_history_strips_namespaces() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/objects"))
        .and(body_partial_json(json!({"objectId": "ZTF24ggggggg"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"i:jd": 2460090.5, "i:fid": 1, "i:magpsf": 19.1, "i:sigmapsf": 0.1, "d:rf_kn_vs_nonkn": 0.4},
            {"i:jd": 2460091.5, "i:fid": 2, "i:magpsf": null, "i:diffmaglim": 20.2, "d:rf_kn_vs_nonkn": 0.5},
            {"i:jd": 2460092.5, "i:fid": 1, "i:magpsf": 18.9, "i:sigmapsf": 0.1, "d:rf_kn_vs_nonkn": 0.6}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let enricher = LightcurveEnricher::new(Arc::new(client_for(&server)), AppendPolicy::Skip);
    let consumed = alert("ZTF24ggggggg", 1, vec![upper_limit(2460091.5, 2)]);
    let new_alert = NewAlert::from(&consumed.alert);

    let Enrichment::Lightcurve(view) = enricher
        .enrich(&new_alert, consumed.alert.history())
        .await
        .unwrap()
    else {
        panic!("expected a light curve");
    };
    assert_eq!(view.origin, HistoryOrigin::Remote);
    assert_eq!(view.len(), 3);
    assert_eq!(view.non_finite_count(), 1);
    assert!(view.columns().contains("magpsf"));
    assert!(view.columns().contains("rf_kn_vs_nonkn"));
    assert!(view.columns().iter().all(|c| !c.contains(NAMESPACE_SEPARATOR)));
}

#[tokio::test]
async fn test_append_policy_adds_latest_candidate() {
    let server = MockServer::start().await;
    let enricher = LightcurveEnricher::new(Arc::new(client_for(&server)), AppendPolicy::Append);
    let consumed = alert("ZTF24hhhhhhh", 1, five_finite_points());
    let new_alert = NewAlert::from(&consumed.alert);

    let Enrichment::Lightcurve(view) = enricher
        .enrich(&new_alert, consumed.alert.history())
        .await
        .unwrap()
    else {
        panic!("expected a light curve");
    };
    assert_eq!(view.origin, HistoryOrigin::Embedded);
    assert_eq!(view.len(), 6);
    assert_eq!(view.rows().last().unwrap().jd, new_alert.jd);
    // Embedded history is complete, so the broker is never asked.
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_http_500_is_a_query_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/objects"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .object_history("ZTF24iiiiiii")
        .await
        .unwrap_err();
    match &err {
        BrokerQueryError::Status {
            status,
            body,
            likely_timeout,
            ..
        } => {
            assert_eq!(*status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body, "internal error");
            assert!(!likely_timeout);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!err.is_likely_timeout());
}

#[tokio::test]
async fn test_http_500_skips_alert_without_escalation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/objects"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        dir.path(),
        Arc::new(client_for(&server)),
        RecordingNotifier::default(),
        &["alice@example.com"],
        vec![la_silla()],
    );
    let outcome = h
        .processor
        .process(
            &alert("ZTF24jjjjjjj", 9, vec![upper_limit(2460091.5, 2)]),
            datetime!(2024-06-01 12:00 UTC),
        )
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        ProcessOutcome::SkippedQueryError(BrokerQueryError::Status { .. })
    ));
    assert_eq!(h.notifier.total(), 0);
    assert!(h.notifier.sent_to(OPERATOR).is_empty());
    assert!(h.paths.alert_db().join("ZTF24jjjjjjj_9.json").exists());
}

#[tokio::test]
async fn test_latest_alerts_and_explorer_endpoints() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/latests"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"i:objectId": "ZTF1"}])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/explorer"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no match"))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let latest = client
        .query_latest_alerts(&json!({"class": "Kilonova candidate", "n": 5}))
        .await
        .unwrap();
    assert_eq!(latest.records.len(), 1);

    let err = client
        .query_database(&json!({"objectId": "ZTF1"}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("404"));
}

#[tokio::test]
async fn test_cutout_endpoint_returns_pixel_array() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/cutouts"))
        .and(body_partial_json(json!({
            "objectId": "ZTF24jjjjjjj",
            "kind": "Difference",
            "output-format": "array"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"b:cutoutDifference_stampData": [[0.0, 1.0, 2.0], [3.0, 4.0, 5.0]]}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let image = client_for(&server)
        .query_cutout(StampKind::Difference, &json!({"objectId": "ZTF24jjjjjjj"}))
        .await
        .unwrap()
        .expect("stamp in response");
    assert_eq!((image.width, image.height), (3, 2));
    assert_eq!(image.get(2, 1), Some(5.0));
}

#[tokio::test]
async fn test_cutout_without_stamp_is_none_and_500_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/cutouts"))
        .and(body_partial_json(json!({"objectId": "ZTF24kkkkkkk"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"i:jd": 1.0}])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/cutouts"))
        .and(body_partial_json(json!({"objectId": "ZTF24lllllll"})))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let missing = client
        .query_cutout(StampKind::Science, &json!({"objectId": "ZTF24kkkkkkk"}))
        .await
        .unwrap();
    assert!(missing.is_none());

    let failed = client
        .query_cutout(StampKind::Science, &json!({"objectId": "ZTF24lllllll"}))
        .await;
    assert!(matches!(
        failed,
        Err(BrokerQueryError::Status { status: StatusCode::INTERNAL_SERVER_ERROR, .. })
    ));
}
