//! JSON-RPC chain client against a mock node.

use bonder_core::ChainId;
use bonder_core::chain::rpc::RpcChainClient;
use bonder_core::chain::types::{Address, H256, LogFilter, TxRequest};
use bonder_core::chain::{ChainAccess, ChainError};
use serde_json::json;
use std::time::Duration;
use url::Url;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockBuilder, MockServer, ResponseTemplate};

fn hex32(byte: u8) -> String {
    format!("0x{}", hex::encode([byte; 32]))
}

fn hex20(byte: u8) -> String {
    format!("0x{}", hex::encode([byte; 20]))
}

fn result(value: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": value}))
}

fn rpc(name: &str) -> MockBuilder {
    Mock::given(method("POST")).and(body_partial_json(json!({ "method": name })))
}

fn client(server: &MockServer) -> RpcChainClient {
    let url = Url::parse(&server.uri()).unwrap();
    RpcChainClient::new(ChainId(10), vec![url]).unwrap()
}

#[test]
fn client_needs_an_endpoint() {
    assert!(matches!(
        RpcChainClient::new(ChainId(10), vec![]),
        Err(ChainError::NoEndpoint)
    ));
}

#[tokio::test]
async fn reads_block_height_and_header() {
    let server = MockServer::start().await;
    rpc("eth_blockNumber")
        .respond_with(result(json!("0x1b4")))
        .mount(&server)
        .await;
    rpc("eth_getBlockByNumber")
        .and(body_partial_json(json!({ "params": ["0x1b4", false] })))
        .respond_with(result(json!({
            "number": "0x1b4",
            "hash": hex32(0xaa),
            "parentHash": hex32(0xab),
            "transactions": [],
        })))
        .mount(&server)
        .await;

    let client = client(&server);
    let height = client.current_block_height().await.unwrap();
    assert_eq!(height, 436);

    let header = client.block_header(height).await.unwrap();
    assert_eq!(header.number, 436);
    assert_eq!(header.hash, H256([0xaa; 32]));
    assert_eq!(header.parent_hash, H256([0xab; 32]));
}

#[tokio::test]
async fn missing_block_is_not_found() {
    let server = MockServer::start().await;
    rpc("eth_getBlockByNumber")
        .respond_with(result(serde_json::Value::Null))
        .mount(&server)
        .await;

    let err = client(&server).block_header(9).await.unwrap_err();
    assert!(matches!(err, ChainError::NotFound(_)));
}

#[tokio::test]
async fn removed_logs_are_dropped() {
    let server = MockServer::start().await;
    let log = |index: &str, removed: bool| {
        json!({
            "address": hex20(0xa2),
            "topics": [hex32(0x01), hex32(0x02)],
            "data": "0x00ff",
            "blockNumber": "0x10",
            "blockHash": hex32(0xbb),
            "transactionHash": hex32(0xcc),
            "logIndex": index,
            "removed": removed,
        })
    };
    rpc("eth_getLogs")
        .and(body_partial_json(json!({
            "params": [{ "fromBlock": "0x10", "toBlock": "0x12" }]
        })))
        .respond_with(result(json!([log("0x0", false), log("0x1", true)])))
        .mount(&server)
        .await;

    let filter = LogFilter {
        addresses: vec![Address([0xa2; 20])],
        topics0: vec![H256([0x01; 32])],
    };
    let logs = client(&server).logs(16..=18, &filter).await.unwrap();
    assert_eq!(logs.len(), 1);
    let log = &logs[0];
    assert_eq!(log.address, Address([0xa2; 20]));
    assert_eq!(log.topics.len(), 2);
    assert_eq!(log.data, vec![0x00, 0xff]);
    assert_eq!(log.block_number, 16);
    assert_eq!(log.log_index, 0);
}

#[tokio::test]
async fn rpc_errors_are_surfaced() {
    let server = MockServer::start().await;
    rpc("eth_gasPrice")
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32000, "message": "header not found" },
        })))
        .mount(&server)
        .await;

    let err = client(&server).gas_price().await.unwrap_err();
    match err {
        ChainError::Rpc { code, message } => {
            assert_eq!(code, -32000);
            assert_eq!(message, "header not found");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn failing_endpoint_rotates_to_the_next() {
    let broken = MockServer::start().await;
    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&broken)
        .await;
    rpc("eth_gasPrice")
        .respond_with(result(json!("0x3b9aca00")))
        .expect(2)
        .mount(&healthy)
        .await;

    let client = RpcChainClient::new(
        ChainId(10),
        vec![
            Url::parse(&broken.uri()).unwrap(),
            Url::parse(&healthy.uri()).unwrap(),
        ],
    )
    .unwrap();

    assert_eq!(client.gas_price().await.unwrap(), 1_000_000_000);
    // The cursor moved; the broken endpoint is not retried first.
    assert_eq!(client.gas_price().await.unwrap(), 1_000_000_000);
}

#[tokio::test]
async fn all_endpoints_failing_is_a_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = client(&server).current_block_height().await.unwrap_err();
    assert!(matches!(err, ChainError::Transport(_)));
}

#[tokio::test]
async fn sends_transaction_with_gas_limit() {
    let server = MockServer::start().await;
    rpc("eth_sendTransaction")
        .and(body_partial_json(json!({
            "params": [{
                "from": hex20(0xb0),
                "to": hex20(0xa2),
                "data": "0xdeadbeef",
                "value": "0x0",
                "gas": "0x186a0",
            }]
        })))
        .respond_with(result(json!(hex32(0x77))))
        .expect(1)
        .mount(&server)
        .await;

    let hash = client(&server)
        .submit_transaction(TxRequest {
            from: Address([0xb0; 20]),
            to: Address([0xa2; 20]),
            data: vec![0xde, 0xad, 0xbe, 0xef],
            value: 0,
            gas_limit: Some(100_000),
        })
        .await
        .unwrap();
    assert_eq!(hash, H256([0x77; 32]));
}

#[tokio::test]
async fn polls_until_receipt_is_mined() {
    let server = MockServer::start().await;
    rpc("eth_getTransactionReceipt")
        .respond_with(result(serde_json::Value::Null))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    rpc("eth_getTransactionReceipt")
        .respond_with(result(json!({
            "transactionHash": hex32(0x77),
            "blockNumber": "0x20",
            "status": "0x0",
            "gasUsed": "0x5208",
        })))
        .mount(&server)
        .await;

    let receipt = client(&server)
        .with_receipt_poll_interval(Duration::from_millis(5))
        .wait_for_confirmation(H256([0x77; 32]))
        .await
        .unwrap();
    assert_eq!(receipt.tx_hash, H256([0x77; 32]));
    assert_eq!(receipt.block_number, 32);
    assert!(!receipt.success);
    assert_eq!(receipt.gas_used, 21_000);
}
