// src/rpc.rs
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use jsonrpsee::core::client::{ClientT, Error as ClientError, SubscriptionClientT};
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::rpc_params;
use jsonrpsee::ws_client::{WsClient, WsClientBuilder};
use serde_json::{Value, json};
use tracing::debug;

use crate::calls::WriteCall;
use crate::decode;
use crate::gateway::{EventStream, GatewayError, LedgerGateway, TxReceipt, TxRequest};
use crate::types::{
    Address, Candidate, ElectionInfo, ElectionStatistics, GasPrice, TxHash, UserRole, Voter,
    WinnerInfo, fmt_address, fmt_hash,
};

/// JSON-RPC "method not found".
const METHOD_NOT_FOUND: i32 = -32601;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Ledger gateway over a JSON-RPC WS connection.
///
/// Reads are `election_<read>` calls answering with positional tuples,
/// transaction plumbing lives under `ledger_*`, and events arrive on the
/// `election_subscribeEvents` subscription.
pub struct RpcClient {
    pub(crate) inner: WsClient,
}

impl RpcClient {
    /// Connect to a node via WebSocket.
    pub async fn connect(uri: &str) -> Result<Self> {
        let inner = WsClientBuilder::default()
            .request_timeout(REQUEST_TIMEOUT)
            .build(uri)
            .await?;
        Ok(Self { inner })
    }

    async fn call(&self, method: &str, params: ArrayParams) -> Result<Value, GatewayError> {
        debug!(method, "rpc request");
        self.inner
            .request::<Value, _>(method, params)
            .await
            .map_err(classify)
    }
}

/// Map a client error onto the gateway taxonomy.
fn classify(e: ClientError) -> GatewayError {
    match e {
        ClientError::Call(obj) => {
            GatewayError::from_rpc(obj.code(), obj.message(), obj.data().map(|d| d.get()))
        }
        ClientError::RequestTimeout => GatewayError::Timeout,
        ClientError::ParseError(e) => GatewayError::Decode(e.to_string()),
        other => GatewayError::Transport(other.to_string()),
    }
}

fn quantity(n: impl Into<u128>) -> String {
    format!("0x{:x}", n.into())
}

/// Unsigned call object for `ledger_estimateGas`.
fn call_object(from: Address, call: &WriteCall) -> Value {
    json!({
        "from": fmt_address(&from),
        "method": call.method(),
        "params": call.params(),
    })
}

/// Transaction object for `ledger_sendTransaction`.
fn tx_object(tx: &TxRequest) -> Value {
    let mut obj = call_object(tx.from, &tx.call);
    obj["gas"] = json!(quantity(tx.gas_limit));
    obj["gasPrice"] = json!(quantity(tx.gas_price));
    obj["nonce"] = json!(quantity(tx.nonce));
    obj
}

#[async_trait]
impl LedgerGateway for RpcClient {
    async fn election_info(&self) -> Result<Option<ElectionInfo>, GatewayError> {
        let v = self.call("election_getElectionInfo", rpc_params![]).await?;
        decode::election_info(&v)
    }

    async fn all_candidates(&self) -> Result<Vec<Candidate>, GatewayError> {
        let v = self.call("election_getAllCandidates", rpc_params![]).await?;
        decode::candidates(&v)
    }

    async fn voter_info(&self, who: Address) -> Result<Voter, GatewayError> {
        let v = self
            .call("election_getVoterInfo", rpc_params![fmt_address(&who)])
            .await?;
        decode::voter(who, &v)
    }

    async fn user_role(&self, who: Address) -> Result<UserRole, GatewayError> {
        let v = self
            .call("election_getUserRole", rpc_params![fmt_address(&who)])
            .await?;
        decode::user_role(who, &v)
    }

    async fn current_winner(&self) -> Result<WinnerInfo, GatewayError> {
        let v = self.call("election_getCurrentWinner", rpc_params![]).await?;
        decode::winner(&v)
    }

    async fn election_statistics(&self) -> Result<ElectionStatistics, GatewayError> {
        let v = self
            .call("election_getElectionStatistics", rpc_params![])
            .await?;
        decode::statistics(&v)
    }

    async fn estimate_gas(&self, from: Address, call: &WriteCall) -> Result<u64, GatewayError> {
        let v = self
            .call("ledger_estimateGas", rpc_params![call_object(from, call)])
            .await?;
        decode::uint64("estimateGas", &v)
    }

    async fn gas_price(&self) -> Result<GasPrice, GatewayError> {
        let v = self.call("ledger_gasPrice", rpc_params![]).await?;
        decode::uint("gasPrice", &v)
    }

    async fn transaction_count(&self, who: Address) -> Result<u64, GatewayError> {
        let v = self
            .call(
                "ledger_getTransactionCount",
                rpc_params![fmt_address(&who), "pending"],
            )
            .await?;
        decode::uint64("transactionCount", &v)
    }

    async fn send_transaction(&self, tx: &TxRequest) -> Result<TxHash, GatewayError> {
        let v = self
            .call("ledger_sendTransaction", rpc_params![tx_object(tx)])
            .await?;
        decode::hash("sendTransaction", &v)
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TxReceipt>, GatewayError> {
        let v = self
            .call("ledger_getTransactionReceipt", rpc_params![fmt_hash(&hash)])
            .await?;
        decode::receipt(&v)
    }

    async fn block_number(&self) -> Result<u64, GatewayError> {
        let v = self.call("ledger_blockNumber", rpc_params![]).await?;
        decode::uint64("blockNumber", &v)
    }

    async fn subscribe_events(&self) -> Result<EventStream, GatewayError> {
        let sub = self
            .inner
            .subscribe::<Value, _>(
                "election_subscribeEvents",
                rpc_params![],
                "election_unsubscribeEvents",
            )
            .await
            .map_err(|e| match e {
                ClientError::Call(obj) if obj.code() == METHOD_NOT_FOUND => {
                    GatewayError::Unsupported(obj.message().to_string())
                }
                other => classify(other),
            })?;

        let stream = sub.map(|item| match item {
            Ok(v) => decode::event(&v),
            Err(e) => Err(GatewayError::Decode(e.to_string())),
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use jsonrpsee::types::ErrorObjectOwned;

    #[test]
    fn call_errors_are_classified() {
        let revert = ClientError::Call(ErrorObjectOwned::owned(
            3,
            "execution reverted: Already voted",
            None::<()>,
        ));
        assert_eq!(
            classify(revert),
            GatewayError::Revert("Already voted".into())
        );

        let rejected = ClientError::Call(ErrorObjectOwned::owned(4001, "rejected", None::<()>));
        assert_eq!(classify(rejected), GatewayError::UserRejected);

        assert_eq!(classify(ClientError::RequestTimeout), GatewayError::Timeout);
    }

    #[test]
    fn transaction_object_uses_hex_quantities() {
        let tx = TxRequest {
            from: [0xA1; 20],
            call: WriteCall::AssignRole {
                user: [0xB2; 20],
                role: Role::Admin,
            },
            gas_limit: 120_000,
            gas_price: 20_000_000_000,
            nonce: 0,
        };
        let obj = tx_object(&tx);
        assert_eq!(obj["method"], "assignRole");
        assert_eq!(obj["params"][1], 3);
        assert_eq!(obj["gas"], "0x1d4c0");
        assert_eq!(obj["gasPrice"], "0x4a817c800");
        assert_eq!(obj["nonce"], "0x0");
        assert_eq!(obj["from"], fmt_address(&[0xA1; 20]));
    }
}
