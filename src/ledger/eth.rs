//! Ethers-backed ledger client
//!
//! Wraps the CrossBorderRemittance contract behind the `LedgerClient`
//! trait: an HTTP provider plus a local signing wallet, abigen bindings
//! for calls and views, and log queries for the event stream.
//!
//! Event sequences are `(block_number << LOG_INDEX_BITS) | log_index`, so
//! block order dominates and intra-block log order breaks ties; a
//! watermark maps back onto the block to resume polling from.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::contract::ContractError;
use ethers::middleware::SignerMiddleware;
use ethers::prelude::abigen;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, U256};
use log::{debug, warn};

use crate::ledger::traits::{LedgerClient, LedgerReceipt, LedgerTransfer, LedgerUserInfo};
use crate::models::{LedgerEvent, ReconcileError, SequencedEvent};

abigen!(
    CrossBorderRemittance,
    r#"[
        function registerUser(address user, string name, string email)
        function requestKYC()
        function approveKYC(address user)
        function revokeKYC(address user)
        function sendRemittance(address receiver, string txID, string currency) payable
        function raiseDispute(string txID)
        function getUserInfo(address user) view returns (string, string, bool)
        function isKYCApproved(address user) view returns (bool)
        function isKYCRequested(address user) view returns (bool)
        function getAllPendingUsers() view returns (address[])
        function getAllApprovedUsers() view returns (address[])
        function getTransaction(string txID) view returns (address, address, uint256, uint256, string, bool)
        function getCurrencyRate(string currency) view returns (uint256)
        event UserRegistered(address indexed user, string name, string email)
        event KYCApproved(address indexed user)
        event KYCRevoked(address indexed user)
        event Sent(string txID, address indexed sender, address indexed receiver, uint256 amount, string currency, uint256 timestamp)
    ]"#
);

/// Bits of the sequence reserved for the intra-block log index.
const LOG_INDEX_BITS: u64 = 24;

type EthClient = SignerMiddleware<Provider<Http>, LocalWallet>;

pub struct EthLedgerClient {
    contract: CrossBorderRemittance<EthClient>,
    confirm_timeout: Duration,
}

fn seq_of(block_number: u64, log_index: u64) -> u64 {
    (block_number << LOG_INDEX_BITS) | (log_index & ((1 << LOG_INDEX_BITS) - 1))
}

fn block_of(sequence: u64) -> u64 {
    sequence >> LOG_INDEX_BITS
}

fn parse_address(address: &str) -> Result<Address, ReconcileError> {
    address
        .trim()
        .parse::<Address>()
        .map_err(|_| ReconcileError::InvalidAddress(address.to_string()))
}

fn format_address(address: &Address) -> String {
    // 0x-prefixed lowercase hex, the cache's key form
    format!("{:#x}", address)
}

/// Decoded contract log to the event model. Addresses come out in the
/// cache's key form.
fn map_event(decoded: CrossBorderRemittanceEvents) -> LedgerEvent {
    match decoded {
        CrossBorderRemittanceEvents::UserRegisteredFilter(e) => LedgerEvent::UserRegistered {
            user: format_address(&e.user),
            name: e.name,
            email: e.email,
        },
        CrossBorderRemittanceEvents::KycapprovedFilter(e) => LedgerEvent::KycApproved {
            user: format_address(&e.user),
        },
        CrossBorderRemittanceEvents::KycrevokedFilter(e) => LedgerEvent::KycRevoked {
            user: format_address(&e.user),
        },
        CrossBorderRemittanceEvents::SentFilter(e) => LedgerEvent::Sent {
            transfer_id: e.tx_id,
            sender: format_address(&e.sender),
            receiver: format_address(&e.receiver),
            amount: u256_to_u128(e.amount),
            currency: e.currency,
            timestamp: e.timestamp.as_u64(),
        },
    }
}

fn u256_to_u128(value: U256) -> u128 {
    // Wei amounts above 2^128 do not occur in practice
    u128::try_from(value).unwrap_or(u128::MAX)
}

/// Reverted executions become `LedgerRejected`; everything else on the
/// transport path is a retryable `LedgerUnavailable`. Mirrors the guard
/// strings the contract reverts with ("user already registered", ...).
fn map_contract_err(err: ContractError<EthClient>) -> ReconcileError {
    if err.is_revert() {
        let reason = err
            .decode_revert::<String>()
            .unwrap_or_else(|| err.to_string());
        return ReconcileError::LedgerRejected(reason);
    }
    let msg = err.to_string();
    if msg.contains("revert") {
        ReconcileError::LedgerRejected(msg)
    } else {
        ReconcileError::LedgerUnavailable(msg)
    }
}

impl EthLedgerClient {
    pub fn connect(
        provider_url: &str,
        contract_address: &str,
        private_key: &str,
        chain_id: u64,
        confirm_timeout: Duration,
    ) -> Result<Self, ReconcileError> {
        let provider = Provider::<Http>::try_from(provider_url)
            .map_err(|e| ReconcileError::LedgerUnavailable(e.to_string()))?;
        let wallet = private_key
            .parse::<LocalWallet>()
            .map_err(|e| ReconcileError::Unknown(format!("bad signing key: {}", e)))?
            .with_chain_id(chain_id);
        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        let contract = CrossBorderRemittance::new(parse_address(contract_address)?, client);
        Ok(Self {
            contract,
            confirm_timeout,
        })
    }

    /// Send a contract call and wait for its receipt under the bounded
    /// confirmation timeout. A timeout is reported as `LedgerUnavailable`;
    /// the transaction may still land and the projector picks it up.
    async fn submit(
        &self,
        call: ethers::contract::builders::ContractCall<EthClient, ()>,
    ) -> Result<LedgerReceipt, ReconcileError> {
        let pending = call.send().await.map_err(map_contract_err)?;
        let receipt = tokio::time::timeout(self.confirm_timeout, pending)
            .await
            .map_err(|_| {
                ReconcileError::LedgerUnavailable("confirmation wait timed out".to_string())
            })?
            .map_err(|e| ReconcileError::LedgerUnavailable(e.to_string()))?
            .ok_or_else(|| {
                ReconcileError::LedgerUnavailable("transaction dropped from mempool".to_string())
            })?;

        if receipt.status == Some(0.into()) {
            return Err(ReconcileError::LedgerRejected(
                "transaction reverted".to_string(),
            ));
        }

        let block = receipt.block_number.map(|b| b.as_u64()).unwrap_or(0);
        let index = receipt.transaction_index.as_u64();
        debug!(
            "ledger write confirmed: tx={:?} block={}",
            receipt.transaction_hash, block
        );
        Ok(LedgerReceipt {
            sequence: seq_of(block, index),
        })
    }
}

#[async_trait]
impl LedgerClient for EthLedgerClient {
    async fn register_user(
        &self,
        address: &str,
        name: &str,
        email: &str,
    ) -> Result<LedgerReceipt, ReconcileError> {
        let user = parse_address(address)?;
        self.submit(
            self.contract
                .register_user(user, name.to_string(), email.to_string()),
        )
        .await
    }

    async fn approve_kyc(&self, address: &str) -> Result<LedgerReceipt, ReconcileError> {
        let user = parse_address(address)?;
        self.submit(self.contract.approve_kyc(user)).await
    }

    async fn revoke_kyc(&self, address: &str) -> Result<LedgerReceipt, ReconcileError> {
        let user = parse_address(address)?;
        self.submit(self.contract.revoke_kyc(user)).await
    }

    async fn send_remittance(
        &self,
        receiver: &str,
        transfer_id: &str,
        currency: &str,
        amount_wei: u128,
    ) -> Result<LedgerReceipt, ReconcileError> {
        let receiver = parse_address(receiver)?;
        let call = self
            .contract
            .send_remittance(receiver, transfer_id.to_string(), currency.to_string())
            .value(U256::from(amount_wei));
        self.submit(call).await
    }

    async fn raise_dispute(&self, transfer_id: &str) -> Result<LedgerReceipt, ReconcileError> {
        self.submit(self.contract.raise_dispute(transfer_id.to_string()))
            .await
    }

    async fn user_info(&self, address: &str) -> Result<Option<LedgerUserInfo>, ReconcileError> {
        let user = parse_address(address)?;
        match self.contract.get_user_info(user).call().await {
            Ok((name, email, approved)) => {
                // The contract returns empty strings for unknown addresses
                if name.is_empty() && email.is_empty() && !approved {
                    Ok(None)
                } else {
                    Ok(Some(LedgerUserInfo {
                        name,
                        email,
                        approved,
                    }))
                }
            }
            Err(err) if err.is_revert() => Ok(None),
            Err(err) => Err(map_contract_err(err)),
        }
    }

    async fn is_kyc_approved(&self, address: &str) -> Result<bool, ReconcileError> {
        let user = parse_address(address)?;
        self.contract
            .is_kyc_approved(user)
            .call()
            .await
            .map_err(map_contract_err)
    }

    async fn is_kyc_requested(&self, address: &str) -> Result<bool, ReconcileError> {
        let user = parse_address(address)?;
        self.contract
            .is_kyc_requested(user)
            .call()
            .await
            .map_err(map_contract_err)
    }

    async fn pending_users(&self) -> Result<Vec<String>, ReconcileError> {
        let addresses = self
            .contract
            .get_all_pending_users()
            .call()
            .await
            .map_err(map_contract_err)?;
        Ok(addresses.iter().map(format_address).collect())
    }

    async fn approved_users(&self) -> Result<Vec<String>, ReconcileError> {
        let addresses = self
            .contract
            .get_all_approved_users()
            .call()
            .await
            .map_err(map_contract_err)?;
        Ok(addresses.iter().map(format_address).collect())
    }

    async fn transaction(
        &self,
        transfer_id: &str,
    ) -> Result<Option<LedgerTransfer>, ReconcileError> {
        match self
            .contract
            .get_transaction(transfer_id.to_string())
            .call()
            .await
        {
            Ok((sender, receiver, amount, timestamp, currency, disputed)) => {
                if sender == Address::zero() {
                    return Ok(None);
                }
                Ok(Some(LedgerTransfer {
                    sender: format_address(&sender),
                    receiver: format_address(&receiver),
                    amount: u256_to_u128(amount),
                    timestamp: timestamp.as_u64(),
                    currency,
                    disputed,
                }))
            }
            Err(err) if err.is_revert() => Ok(None),
            Err(err) => Err(map_contract_err(err)),
        }
    }

    async fn currency_rate(&self, currency: &str) -> Result<u128, ReconcileError> {
        let rate = self
            .contract
            .get_currency_rate(currency.to_string())
            .call()
            .await
            .map_err(map_contract_err)?;
        Ok(u256_to_u128(rate))
    }

    async fn events_from(
        &self,
        watermark: u64,
        limit: usize,
    ) -> Result<Vec<SequencedEvent>, ReconcileError> {
        let latest = self
            .contract
            .client()
            .get_block_number()
            .await
            .map_err(|e| ReconcileError::LedgerUnavailable(e.to_string()))?
            .as_u64();
        let from_block = block_of(watermark);
        if from_block > latest {
            return Ok(Vec::new());
        }

        let logs = self
            .contract
            .events()
            .from_block(from_block)
            .to_block(latest)
            .query_with_meta()
            .await
            .map_err(map_contract_err)?;

        let mut events = Vec::new();
        for (decoded, meta) in logs {
            let sequence = seq_of(meta.block_number.as_u64(), meta.log_index.as_u64());
            if sequence <= watermark {
                continue;
            }
            events.push(SequencedEvent {
                sequence,
                event: map_event(decoded),
            });
            if events.len() >= limit {
                warn!(
                    "event batch truncated at {} entries from block {}",
                    limit, from_block
                );
                break;
            }
        }
        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }
}
