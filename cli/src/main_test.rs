use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Map;

use super::*;

fn wait_args() -> WaitArgs {
    WaitArgs {
        max_attempts: 3,
        interval_ms: 10,
        await_status: "W".to_owned(),
        fail_on: vec!["R".to_owned(), "C".to_owned(), "E".to_owned()],
    }
}

fn place_args(limit_price: Option<f64>) -> PlaceArgs {
    PlaceArgs {
        model_id: 1,
        symbol: Some("IBM".to_owned()),
        quantity: 2_000,
        limit_price,
        transaction: "buy".to_owned(),
        data: None,
        cancel_after_accept: false,
        wait: wait_args(),
    }
}

#[test]
fn parse_param_splits_on_first_equals() {
    assert_eq!(parse_param("symbols=IBM,AAPL").unwrap(), ("symbols".into(), "IBM,AAPL".into()));
    assert_eq!(parse_param("{orderRef}=a=b").unwrap(), ("{orderRef}".into(), "a=b".into()));
    assert_eq!(parse_param("start=").unwrap(), ("start".into(), String::new()));
}

#[test]
fn parse_param_rejects_missing_key_or_separator() {
    assert!(matches!(parse_param("novalue"), Err(CliError::InvalidParam(_))));
    assert!(matches!(parse_param("=x"), Err(CliError::InvalidParam(_))));
}

#[test]
fn parse_params_keeps_order_and_last_value() {
    let raw = vec!["b=1".to_owned(), "a=2".to_owned(), "b=3".to_owned()];
    let params = parse_params(&raw).unwrap();
    let entries: Vec<_> = params.iter().collect();
    assert_eq!(entries, vec![("b", Some("3")), ("a", Some("2"))]);
}

#[test]
fn classify_status_stops_on_awaited_or_failure() {
    let wait = wait_args();
    assert_eq!(classify_status("W", &wait), WaitStep::Reached);
    assert_eq!(classify_status("R", &wait), WaitStep::Failed);
    assert_eq!(classify_status("E", &wait), WaitStep::Failed);
    assert_eq!(classify_status("P", &wait), WaitStep::Pending);
    assert_eq!(classify_status("", &wait), WaitStep::Pending);
}

#[test]
fn order_status_code_requires_translated_status() {
    let mut object = Map::new();
    object.insert(ORDER_STATUS_FIELD.to_owned(), json!("W"));
    assert_eq!(order_status_code(&DecodedResult::Object(object)).unwrap(), "W");

    assert!(matches!(
        order_status_code(&DecodedResult::Object(Map::new())),
        Err(CliError::MissingField(ORDER_STATUS_FIELD))
    ));
    assert!(order_status_code(&DecodedResult::Empty).is_err());
}

#[test]
fn equity_order_body_builds_limit_order() {
    let body = equity_order_body(&place_args(Some(1.0)));
    assert_eq!(body["model"]["id"], 1);
    assert_eq!(body["order"]["quote"]["symbol"], "IBM");
    assert_eq!(body["order"]["orderType"], "LIMIT");
    assert_eq!(body["order"]["quantity"], 2_000);
    assert_eq!(body["order"]["transaction"], "BUY");
    assert_eq!(body["order"]["limitPrice"], 1.0);
}

#[test]
fn equity_order_body_without_price_is_market() {
    let body = equity_order_body(&place_args(None));
    assert_eq!(body["order"]["orderType"], "MARKET");
    assert!(body["order"].get("limitPrice").is_none());
}

#[test]
fn cli_parses_wait_defaults_and_fail_list() {
    let cli = Cli::try_parse_from([
        "orbis-cli", "--host", "api.example.com", "--token", "t", "order", "wait", "R1",
        "--fail-on", "R,X",
    ])
    .unwrap();
    let Command::Order(OrderCommand { command: OrderSubcommand::Wait { order_ref, wait } }) = cli.command else {
        panic!("expected order wait");
    };
    assert_eq!(order_ref, "R1");
    assert_eq!(wait.max_attempts, 60);
    assert_eq!(wait.await_status, "W");
    assert_eq!(wait.fail_on, vec!["R".to_owned(), "X".to_owned()]);
}

#[derive(Clone)]
struct StatusMock {
    status: &'static str,
    polls: Arc<AtomicU32>,
}

async fn order_status(State(mock): State<StatusMock>) -> Json<Value> {
    mock.polls.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "translatedStatus": mock.status }))
}

/// Client against a server whose order status is always `status`, plus its poll counter.
async fn status_client(status: &'static str) -> (ApiClient, Arc<AtomicU32>) {
    let polls = Arc::new(AtomicU32::new(0));
    let app = Router::new()
        .route("/api/advisory/orders/status/{order_ref}", get(order_status))
        .with_state(StatusMock { status, polls: Arc::clone(&polls) });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock server failed");
    });

    let config = ClientConfig::builder(format!("http://{addr}"))
        .credential(Credential::bearer("t0k"))
        .build()
        .expect("config");
    (ApiClient::new(config).expect("client"), polls)
}

#[tokio::test]
async fn wait_for_status_returns_awaited_status() {
    let (client, polls) = status_client("W").await;
    let status = wait_for_status(&client, "R1", &wait_args()).await.expect("accepted");
    assert_eq!(status, "W");
    assert_eq!(polls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn wait_for_status_gives_up_after_max_attempts() {
    let (client, polls) = status_client("P").await;
    let err = wait_for_status(&client, "R1", &wait_args()).await.expect_err("never accepted");
    match err {
        CliError::WaitExhausted { order_ref, awaited, attempts, last } => {
            assert_eq!(order_ref, "R1");
            assert_eq!(awaited, "W");
            assert_eq!(attempts, 3);
            assert_eq!(last, "P");
        }
        other => panic!("expected WaitExhausted, got {other:?}"),
    }
    assert_eq!(polls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn wait_for_status_stops_on_rejection() {
    let (client, polls) = status_client("R").await;
    let err = wait_for_status(&client, "R1", &wait_args()).await.expect_err("rejected");
    assert!(
        matches!(err, CliError::OrderRejected { ref order_ref, ref status } if order_ref == "R1" && status == "R"),
        "got {err:?}"
    );
    assert_eq!(polls.load(Ordering::SeqCst), 1);
}
