#![allow(non_snake_case)]

use super::{
    transport::parse_retry_after,
    *,
};
use crate::{
    address::AddressStyle,
    cell::Cell,
};
use base64::{
    Engine as _,
    engine::general_purpose::STANDARD,
};
use chrono::{
    TimeZone,
    Utc,
};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        Mutex,
    },
};

const RAW: &str = "0:83dfd552e63729b472fcbcc8c45ebcc6691702558b68ec7527e1ba403a0f31a8";

#[derive(Clone, Default)]
pub struct FakeTransport {
    replies: Arc<Mutex<VecDeque<Result<HttpReply, TransportError>>>>,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl FakeTransport {
    pub fn scripted(replies: Vec<Result<HttpReply, TransportError>>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            requests: Arc::default(),
        }
    }

    pub fn statuses(statuses: &[u16], success: Value) -> Self {
        let replies = statuses
            .iter()
            .map(|status| match status {
                200 => Ok(HttpReply::ok(
                    json!({ "jsonrpc": "2.0", "id": 1, "result": success.clone() }).to_string(),
                )),
                other => Ok(HttpReply::status(*other)),
            })
            .collect();
        Self::scripted(replies)
    }

    pub fn attempts(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

impl Transport for FakeTransport {
    async fn post(&self, body: Vec<u8>) -> Result<HttpReply, TransportError> {
        let request = serde_json::from_slice(&body).unwrap();
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError("script exhausted".to_string())))
    }
}

fn quick_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay_ms: 100,
        max_delay_ms: 1_000,
        max_jitter_ms: 0,
    }
}

fn result_body(result: Value) -> HttpReply {
    HttpReply::ok(json!({ "jsonrpc": "2.0", "id": 1, "result": result }).to_string())
}

#[tokio::test(start_paused = true)]
async fn call__succeeds_after_two_rate_limits() {
    // given
    let transport = FakeTransport::statuses(&[429, 429, 200], json!("42"));
    let client = RpcClient::new(transport.clone(), quick_policy(2));

    // when
    let result = client.call("getAddressBalance", json!({})).await;

    // then
    assert_eq!(result, Ok(json!("42")));
    assert_eq!(transport.attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn call__exhausts_after_max_retries_plus_one_attempts() {
    // given
    let transport = FakeTransport::statuses(&[429, 429, 429], json!("42"));
    let client = RpcClient::new(transport.clone(), quick_policy(2));

    // when
    let result = client.call("getAddressBalance", json!({})).await;

    // then
    match result {
        Err(RpcError::Exhausted {
            attempts,
            last_error,
        }) => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("429"), "{last_error}");
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
    assert_eq!(transport.attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn call__json_rpc_error_is_rejected_without_retry() {
    // given
    let transport = FakeTransport::scripted(vec![Ok(HttpReply::ok(
        json!({ "jsonrpc": "2.0", "id": 1, "error": { "code": -32602, "message": "bad address" } })
            .to_string(),
    ))]);
    let client = RpcClient::new(transport.clone(), quick_policy(4));

    // when
    let result = client.call("getAddressBalance", json!({})).await;

    // then
    assert_eq!(
        result,
        Err(RpcError::Rejected {
            code: -32602,
            message: "bad address".to_string(),
        })
    );
    assert_eq!(transport.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn call__indexer_ok_false_shape_is_rejected() {
    // given
    let transport = FakeTransport::scripted(vec![Ok(HttpReply::ok(
        json!({ "ok": false, "error": "Incorrect address", "code": 416 }).to_string(),
    ))]);
    let client = RpcClient::new(transport.clone(), quick_policy(4));

    // when
    let result = client.call("getTransactions", json!({})).await;

    // then
    assert_eq!(
        result,
        Err(RpcError::Rejected {
            code: 416,
            message: "Incorrect address".to_string(),
        })
    );
    assert_eq!(transport.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn call__other_http_errors_are_rejected_without_retry() {
    // given
    let transport = FakeTransport::scripted(vec![Ok(HttpReply {
        status: 401,
        retry_after: None,
        body: b"unauthorized".to_vec(),
    })]);
    let client = RpcClient::new(transport.clone(), quick_policy(4));

    // when
    let result = client.call("getAddressBalance", json!({})).await;

    // then
    assert!(matches!(result, Err(RpcError::Rejected { code: 401, .. })));
    assert_eq!(transport.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn call__retries_transport_failures_unavailable_and_malformed_bodies() {
    // given
    let transport = FakeTransport::scripted(vec![
        Err(TransportError("connection reset".to_string())),
        Ok(HttpReply::status(503)),
        Ok(HttpReply::ok("<html>gateway</html>")),
        Ok(result_body(json!(true))),
    ]);
    let client = RpcClient::new(transport.clone(), quick_policy(4));

    // when
    let result = client.call("getAddressInformation", json!({})).await;

    // then
    assert_eq!(result, Ok(json!(true)));
    assert_eq!(transport.attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn call__waits_at_least_retry_after() {
    // given
    let transport = FakeTransport::scripted(vec![
        Ok(HttpReply {
            status: 429,
            retry_after: Some(Duration::from_secs(5)),
            body: Vec::new(),
        }),
        Ok(result_body(json!("1"))),
    ]);
    let client = RpcClient::new(transport.clone(), quick_policy(4));
    let started = Instant::now();

    // when
    let result = client.call("getAddressBalance", json!({})).await;

    // then
    assert!(result.is_ok());
    assert!(started.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn call__caps_huge_retry_after() {
    // given
    let transport = FakeTransport::scripted(vec![
        Ok(HttpReply {
            status: 429,
            retry_after: Some(Duration::from_secs(u64::MAX)),
            body: Vec::new(),
        }),
        Ok(result_body(json!("1"))),
    ]);
    let client = RpcClient::new(transport.clone(), quick_policy(4));
    let started = Instant::now();

    // when
    let result = client.call("getAddressBalance", json!({})).await;

    // then
    assert!(result.is_ok());
    let elapsed = started.elapsed();
    assert!(elapsed >= MAX_RETRY_AFTER, "{elapsed:?}");
    assert!(elapsed < MAX_RETRY_AFTER + Duration::from_secs(1), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn call_with_deadline__huge_retry_after_is_exhausted() {
    // given
    let transport = FakeTransport::scripted(vec![Ok(HttpReply {
        status: 429,
        retry_after: Some(Duration::from_secs(u64::MAX)),
        body: Vec::new(),
    })]);
    let client = RpcClient::new(transport.clone(), quick_policy(4));
    let deadline = Instant::now() + Duration::from_secs(5);

    // when
    let result = client
        .call_with_deadline("getAddressBalance", json!({}), deadline)
        .await;

    // then
    assert!(matches!(result, Err(RpcError::Exhausted { attempts: 1, .. })));
    assert_eq!(transport.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn call__backoff_grows_between_attempts() {
    // given
    let transport = FakeTransport::statuses(&[503, 503, 503, 200], json!("1"));
    let client = RpcClient::new(transport.clone(), quick_policy(4));
    let started = Instant::now();

    // when
    let result = client.call("getAddressBalance", json!({})).await;

    // then
    assert!(result.is_ok());
    // 100 + 200 + 400 ms
    assert!(started.elapsed() >= Duration::from_millis(700));
    assert!(started.elapsed() < Duration::from_millis(800));
}

#[tokio::test(start_paused = true)]
async fn call_with_deadline__stops_when_next_wait_passes_deadline() {
    // given
    let transport = FakeTransport::statuses(&[503, 503, 503, 503, 200], json!("1"));
    let policy = RetryPolicy {
        max_retries: 4,
        base_delay_ms: 1_000,
        max_delay_ms: 8_000,
        max_jitter_ms: 0,
    };
    let client = RpcClient::new(transport.clone(), policy);
    let deadline = Instant::now() + Duration::from_millis(1_500);

    // when
    let result = client
        .call_with_deadline("getAddressBalance", json!({}), deadline)
        .await;

    // then
    assert!(matches!(result, Err(RpcError::Exhausted { attempts: 2, .. })));
    assert_eq!(transport.attempts(), 2);
}

#[test]
fn backoff__doubles_and_caps_at_max_delay() {
    // given
    let policy = RetryPolicy::default();

    // then
    assert_eq!(policy.backoff(0), Duration::from_millis(500));
    assert_eq!(policy.backoff(1), Duration::from_millis(1_000));
    assert_eq!(policy.backoff(3), Duration::from_millis(4_000));
    assert_eq!(policy.backoff(4), Duration::from_millis(8_000));
    assert_eq!(policy.backoff(20), Duration::from_millis(8_000));
    assert_eq!(policy.backoff(200), Duration::from_millis(8_000));
}

#[test]
fn wait_before_retry__takes_larger_of_backoff_and_retry_after() {
    // given
    let policy = RetryPolicy::default();
    let jitter = Duration::from_millis(100);

    // then
    assert_eq!(
        policy.wait_before_retry(0, jitter, Some(Duration::from_secs(3))),
        Duration::from_secs(3)
    );
    assert_eq!(
        policy.wait_before_retry(1, jitter, Some(Duration::from_millis(10))),
        Duration::from_millis(1_100)
    );
}

#[test]
fn normalized__applies_delay_floors() {
    // given
    let policy = RetryPolicy {
        max_retries: 1,
        base_delay_ms: 5,
        max_delay_ms: 1,
        max_jitter_ms: 0,
    };

    // when
    let normalized = policy.normalized();

    // then
    assert_eq!(normalized.base_delay_ms, 100);
    assert_eq!(normalized.max_delay_ms, 100);
}

#[test]
fn parse_retry_after__accepts_seconds_and_http_dates() {
    // given
    let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap();

    // then
    assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
    assert_eq!(
        parse_retry_after("Wed, 21 Oct 2015 07:28:30 GMT", now),
        Some(Duration::from_secs(30))
    );
    assert_eq!(
        parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
        Some(Duration::ZERO)
    );
    assert_eq!(parse_retry_after("soon", now), None);
    assert_eq!(
        parse_retry_after("18446744073709551615", now),
        Some(MAX_RETRY_AFTER)
    );
    assert_eq!(
        parse_retry_after("Mon, 21 Oct 2115 07:28:00 GMT", now),
        Some(MAX_RETRY_AFTER)
    );
}

#[tokio::test(start_paused = true)]
async fn get_address_balance__sends_normalized_address() {
    // given
    let friendly = Address::parse(RAW)
        .unwrap()
        .format(AddressStyle::MAINNET_BOUNCEABLE);
    let transport = FakeTransport::scripted(vec![Ok(result_body(json!("2500000000")))]);
    let client = RpcClient::new(transport.clone(), quick_policy(0));

    // when
    let balance = client.get_address_balance(&friendly).await.unwrap();

    // then
    assert_eq!(balance, Coins::from_nanos(2_500_000_000));
    let requests = transport.requests();
    assert_eq!(requests[0]["method"], METHOD_ADDRESS_BALANCE);
    assert_eq!(requests[0]["params"]["address"], RAW);
}

#[tokio::test(start_paused = true)]
async fn get_address_balance__invalid_address_is_not_sent() {
    // given
    let transport = FakeTransport::scripted(vec![]);
    let client = RpcClient::new(transport.clone(), quick_policy(0));

    // when
    let result = client.get_address_balance("nope").await;

    // then
    assert!(matches!(result, Err(RpcError::Address(_))));
    assert_eq!(transport.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn get_address_information__maps_indexer_fields() {
    // given
    let transport = FakeTransport::scripted(vec![Ok(result_body(json!({
        "@type": "raw.fullAccountState",
        "balance": "1500000000",
        "state": "active",
        "last_transaction_id": { "lt": "4100000000001", "hash": "abc=" },
        "sync_utime": 1700000000
    })))]);
    let client = RpcClient::new(transport.clone(), quick_policy(0));

    // when
    let info = client.get_address_information(RAW).await.unwrap();

    // then
    assert_eq!(info.balance, Coins::from_nanos(1_500_000_000));
    assert_eq!(info.state, "active");
    assert_eq!(info.last_transaction_lt, Some(4_100_000_000_001));
    assert_eq!(info.last_transaction_hash.as_deref(), Some("abc="));
}

#[tokio::test(start_paused = true)]
async fn get_transactions__drops_malformed_entries() {
    // given
    let mut flip = Cell::builder();
    flip.store_uint(0x66b9a3fb, 32).unwrap().store_bit(true).unwrap();
    let hash = STANDARD.encode([7u8; 32]);
    let good = json!({
        "@type": "raw.transaction",
        "utime": 1_700_000_000u32,
        "transaction_id": { "lt": "100", "hash": hash },
        "in_msg": {
            "source": RAW,
            "destination": format!("0:{}", "11".repeat(32)),
            "value": "1000000000",
            "msg_data": { "@type": "msg.dataRaw", "body": flip.build().to_boc_base64() }
        },
        "out_msgs": []
    });
    let missing_id = json!({ "utime": 1, "out_msgs": [] });
    let transport =
        FakeTransport::scripted(vec![Ok(result_body(json!([good, missing_id])))]);
    let client = RpcClient::new(transport.clone(), quick_policy(0));

    // when
    let transactions = client
        .get_transactions(&RAW.to_uppercase(), 20, true)
        .await
        .unwrap();

    // then
    assert_eq!(transactions.len(), 1);
    let tx = &transactions[0];
    assert_eq!(tx.logical_time, 100);
    assert_eq!(tx.hash, [7u8; 32]);
    assert_eq!(tx.timestamp_sec, 1_700_000_000);
    let in_message = tx.in_message.as_ref().unwrap();
    assert!(in_message.is_internal());
    assert_eq!(in_message.info.value, Coins::from_nanos(1_000_000_000));
    assert_eq!(in_message.body.parse().load_uint(32).unwrap(), 0x66b9a3fb);
    let params = &transport.requests()[0]["params"];
    assert_eq!(params["address"], RAW);
    assert_eq!(params["limit"], 20);
    assert_eq!(params["archival"], true);
}

#[tokio::test(start_paused = true)]
async fn get_transactions__text_comment_becomes_comment_cell() {
    // given
    let entry = json!({
        "utime": 10,
        "transaction_id": { "lt": 5, "hash": STANDARD.encode([1u8; 32]) },
        "in_msg": {
            "source": "",
            "destination": RAW,
            "value": "0",
            "msg_data": { "@type": "msg.dataText", "text": STANDARD.encode("You lost") }
        },
        "out_msgs": []
    });
    let transport = FakeTransport::scripted(vec![Ok(result_body(json!([entry])))]);
    let client = RpcClient::new(transport, quick_policy(0));

    // when
    let transactions = client.get_transactions(RAW, 1, false).await.unwrap();

    // then
    let message = transactions[0].in_message.as_ref().unwrap();
    assert!(!message.is_internal());
    let mut body = message.body.parse();
    assert_eq!(body.load_uint(32).unwrap(), 0);
    assert_eq!(body.load_string_tail().unwrap(), "You lost");
}
