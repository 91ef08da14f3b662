//! JSON-RPC over HTTP node client.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::{NodeError, SubmitOutcome, TemplateSource};
use crate::template::BlockTemplateData;
use crate::tracing::prelude::*;

/// Bitcoin Core style JSON-RPC client.
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    user: String,
    password: String,
    rules: Vec<String>,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct BlockInfo {
    hash: String,
    #[serde(default)]
    tx: Vec<String>,
}

impl RpcClient {
    /// `rules` are passed to `getblocktemplate`, e.g. `["segwit"]`.
    pub fn new(
        url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        rules: Vec<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            user: user.into(),
            password: password.into(),
            rules,
            next_id: AtomicU64::new(1),
        }
    }

    async fn call_raw(&self, method: &'static str, params: Value) -> Result<Value, NodeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        trace!(method, id, "RPC call");

        // Error replies come with a non-2xx status and a JSON body, so the
        // status is not checked here.
        let response: RpcResponse = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(NodeError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<T, NodeError> {
        let result = self.call_raw(method, params).await?;
        if result.is_null() {
            return Err(NodeError::MissingResult(method));
        }
        serde_json::from_value(result).map_err(|source| NodeError::Decode { method, source })
    }
}

#[async_trait]
impl TemplateSource for RpcClient {
    async fn get_block_template(&self) -> Result<BlockTemplateData, NodeError> {
        self.call(
            "getblocktemplate",
            json!([{ "capabilities": ["coinbasetxn", "workid", "coinbase/append"], "rules": self.rules }]),
        )
        .await
    }

    async fn submit_block(&self, block_hex: &str) -> Result<SubmitOutcome, NodeError> {
        // null means accepted, a string is the rejection reason
        match self.call_raw("submitblock", json!([block_hex])).await? {
            Value::Null => Ok(SubmitOutcome::Accepted),
            Value::String(reason) => Ok(SubmitOutcome::Rejected(reason)),
            other => Ok(SubmitOutcome::Rejected(other.to_string())),
        }
    }

    async fn check_block_accepted(&self, block_hash: &str) -> Result<Option<String>, NodeError> {
        match self.call::<BlockInfo>("getblock", json!([block_hash])).await {
            Ok(info) if info.hash == block_hash => Ok(info.tx.into_iter().next()),
            Ok(_) => Ok(None),
            Err(NodeError::Rpc { code, message }) => {
                debug!(code, message = %message, block_hash, "Block not found by node");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    /// Node stand-in that answers each call with the next canned reply and
    /// keeps the request bodies.
    #[derive(Clone, Default)]
    struct MockNode {
        replies: Arc<Mutex<VecDeque<(StatusCode, Value)>>>,
        requests: Arc<Mutex<Vec<Value>>>,
    }

    impl MockNode {
        fn requests(&self) -> Vec<Value> {
            self.requests.lock().clone()
        }
    }

    async fn rpc(
        State(node): State<MockNode>,
        Json(request): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        node.requests.lock().push(request);
        let (status, reply) = node.replies.lock().pop_front().unwrap_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"result": null, "error": {"code": -1, "message": "no reply queued"}}),
        ));
        (status, Json(reply))
    }

    async fn serve(replies: Vec<(u16, Value)>) -> (String, MockNode) {
        let node = MockNode::default();
        node.replies.lock().extend(
            replies
                .into_iter()
                .map(|(status, reply)| (StatusCode::from_u16(status).unwrap(), reply)),
        );

        let app = Router::new()
            .route("/", post(rpc))
            .with_state(node.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        (url, node)
    }

    fn client(url: String) -> RpcClient {
        RpcClient::new(url, "user", "pass", vec!["segwit".into()])
    }

    #[tokio::test]
    async fn test_get_block_template() {
        let template = json!({
            "result": {
                "version": 536870912,
                "previousblockhash": "00".repeat(32),
                "height": 10,
                "curtime": 1700000000,
                "bits": "207fffff",
                "coinbasevalue": 5000000000u64,
                "transactions": [],
            },
            "error": null,
            "id": 1,
        });
        let (url, node) = serve(vec![(200, template)]).await;

        let data = client(url).get_block_template().await.unwrap();
        assert_eq!(data.height, 10);
        assert_eq!(data.bits, "207fffff");

        let requests = node.requests();
        assert_eq!(requests[0]["method"], "getblocktemplate");
        assert_eq!(requests[0]["params"][0]["rules"], json!(["segwit"]));
    }

    #[tokio::test]
    async fn test_submit_block_outcomes() {
        let (url, node) = serve(vec![
            (200, json!({"result": null, "error": null, "id": 1})),
            (200, json!({"result": "high-hash", "error": null, "id": 2})),
        ])
        .await;
        let client = client(url);

        assert_eq!(client.submit_block("00").await.unwrap(), SubmitOutcome::Accepted);
        assert_eq!(
            client.submit_block("00").await.unwrap(),
            SubmitOutcome::Rejected("high-hash".into())
        );

        let requests = node.requests();
        assert_eq!(requests[1]["params"], json!(["00"]));
    }

    #[tokio::test]
    async fn test_rpc_error() {
        let (url, _node) = serve(vec![(
            500,
            json!({"result": null, "error": {"code": -10, "message": "Bitcoin is downloading blocks..."}, "id": 1}),
        )])
        .await;

        let err = client(url).get_block_template().await.unwrap_err();
        assert!(matches!(err, NodeError::Rpc { code: -10, .. }));
    }

    #[tokio::test]
    async fn test_check_block_accepted() {
        let hash = "ab".repeat(32);
        let (url, _node) = serve(vec![
            (200, json!({"result": {"hash": hash, "tx": ["cb", "t1"]}, "error": null, "id": 1})),
            (500, json!({"result": null, "error": {"code": -5, "message": "Block not found"}, "id": 2})),
        ])
        .await;
        let client = client(url);

        assert_eq!(client.check_block_accepted(&hash).await.unwrap(), Some("cb".into()));
        assert_eq!(client.check_block_accepted(&hash).await.unwrap(), None);
    }
}
