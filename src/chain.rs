use crate::contract::LeapChain;
use crate::error::{classify_submit_error, ChainError, SubmitError};
use crate::intent::{Intent, IntentKind};
use async_trait::async_trait;
use ethers::contract::ContractCall;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, BlockId, BlockNumber, H256, U256, U64};
use std::sync::Arc;
use std::time::Duration;

// RPC policy: 30 s deadline per call, reads retried 3 times with a 1 s delay.
// Submissions are never retried at this layer; a duplicate send is worse than
// a surfaced failure.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);
const RPC_READ_ATTEMPTS: u32 = 3;
const RPC_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptInfo {
    pub success: bool,
    pub block_number: u64,
}

/// Chain access for one account pool. Implementations own the signing
/// material; callers address accounts by pool index only.
#[async_trait]
pub trait Chain: Send + Sync {
    fn accounts(&self) -> usize;

    fn address(&self, index: u32) -> Address;

    /// Pending-tag transaction count for the account, i.e. the next nonce the
    /// chain will accept.
    async fn pending_nonce(&self, index: u32) -> Result<u64, ChainError>;

    /// Simulate then submit the contract call for `intent` with an explicit
    /// nonce. Returns the transaction hash on acceptance.
    async fn submit(&self, index: u32, nonce: u64, intent: &Intent) -> Result<H256, SubmitError>;

    async fn receipt(&self, hash: H256) -> Result<Option<ReceiptInfo>, ChainError>;

    async fn latest_block(&self) -> Result<u64, ChainError>;
}

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

pub struct EthersChain {
    provider: Provider<Http>,
    contracts: Vec<LeapChain<SignerClient>>,
    addresses: Vec<Address>,
}

impl EthersChain {
    pub fn new(
        provider: Provider<Http>,
        contract_address: Address,
        chain_id: u64,
        wallets: Vec<LocalWallet>,
    ) -> Self {
        let mut contracts = Vec::with_capacity(wallets.len());
        let mut addresses = Vec::with_capacity(wallets.len());
        for wallet in wallets {
            let wallet = wallet.with_chain_id(chain_id);
            addresses.push(wallet.address());
            let client = Arc::new(SignerMiddleware::new(provider.clone(), wallet));
            contracts.push(LeapChain::new(contract_address, client));
        }
        Self {
            provider,
            contracts,
            addresses,
        }
    }

    fn build_call(&self, index: usize, intent: &Intent) -> ContractCall<SignerClient, ()> {
        let contract = &self.contracts[index];
        match intent.kind {
            IntentKind::Jump => contract.record_jump(
                intent.player,
                U256::from(intent.height.unwrap_or(0)),
                U256::from(intent.score),
                intent.game_id.clone(),
            ),
            IntentKind::Gameover => contract.record_game_over(
                intent.player,
                U256::from(intent.score),
                intent.game_id.clone(),
            ),
            IntentKind::Setplayer => contract.set_player(
                intent.player,
                intent.username.clone().unwrap_or_default(),
            ),
        }
    }
}

#[async_trait]
impl Chain for EthersChain {
    fn accounts(&self) -> usize {
        self.contracts.len()
    }

    fn address(&self, index: u32) -> Address {
        self.addresses[index as usize]
    }

    async fn pending_nonce(&self, index: u32) -> Result<u64, ChainError> {
        let address = self.address(index);
        let mut last_err = String::new();
        for attempt in 1..=RPC_READ_ATTEMPTS {
            let fut = self
                .provider
                .get_transaction_count(address, Some(BlockId::Number(BlockNumber::Pending)));
            match tokio::time::timeout(RPC_TIMEOUT, fut).await {
                Ok(Ok(n)) => return Ok(n.as_u64()),
                Ok(Err(e)) => last_err = e.to_string(),
                Err(_) => last_err = "nonce query timed out".into(),
            }
            if attempt < RPC_READ_ATTEMPTS {
                tracing::warn!(account = index, attempt, error = %last_err, "pending nonce query failed; retrying");
                tokio::time::sleep(RPC_RETRY_DELAY).await;
            }
        }
        Err(ChainError::Transport(last_err))
    }

    async fn submit(&self, index: u32, nonce: u64, intent: &Intent) -> Result<H256, SubmitError> {
        let idx = index as usize;
        if idx >= self.contracts.len() {
            return Err(SubmitError::Rejected(format!("unknown account index {index}")));
        }

        let mut call = self.build_call(idx, intent);
        call.tx.set_nonce(nonce);

        // Simulate with the chosen nonce first. This validates arguments and
        // surfaces revert reasons before any gas is spent.
        match tokio::time::timeout(RPC_TIMEOUT, call.call()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(classify_submit_error(&e.to_string())),
            Err(_) => return Err(SubmitError::Transport("simulation timed out".into())),
        }

        let result = match tokio::time::timeout(RPC_TIMEOUT, call.send()).await {
            Ok(Ok(pending)) => Ok(pending.tx_hash()),
            Ok(Err(e)) => Err(classify_submit_error(&e.to_string())),
            Err(_) => Err(SubmitError::Transport("submission timed out".into())),
        };
        result
    }

    async fn receipt(&self, hash: H256) -> Result<Option<ReceiptInfo>, ChainError> {
        let mut last_err = String::new();
        for attempt in 1..=RPC_READ_ATTEMPTS {
            match tokio::time::timeout(RPC_TIMEOUT, self.provider.get_transaction_receipt(hash))
                .await
            {
                Ok(Ok(Some(rcpt))) => {
                    return Ok(Some(ReceiptInfo {
                        success: rcpt.status == Some(U64::from(1)),
                        block_number: rcpt.block_number.unwrap_or_default().as_u64(),
                    }));
                }
                Ok(Ok(None)) => return Ok(None),
                Ok(Err(e)) => last_err = e.to_string(),
                Err(_) => last_err = "receipt query timed out".into(),
            }
            if attempt < RPC_READ_ATTEMPTS {
                tokio::time::sleep(RPC_RETRY_DELAY).await;
            }
        }
        Err(ChainError::Transport(last_err))
    }

    async fn latest_block(&self) -> Result<u64, ChainError> {
        let mut last_err = String::new();
        for attempt in 1..=RPC_READ_ATTEMPTS {
            match tokio::time::timeout(RPC_TIMEOUT, self.provider.get_block_number()).await {
                Ok(Ok(n)) => return Ok(n.as_u64()),
                Ok(Err(e)) => last_err = e.to_string(),
                Err(_) => last_err = "block number query timed out".into(),
            }
            if attempt < RPC_READ_ATTEMPTS {
                tokio::time::sleep(RPC_RETRY_DELAY).await;
            }
        }
        Err(ChainError::Transport(last_err))
    }
}
