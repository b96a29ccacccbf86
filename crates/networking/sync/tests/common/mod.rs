//! Simulated remote peers and in-memory stores shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use ethrex_sync::error::RequestError;
use ethrex_sync::messages::{HashOrNumber, Request, Response};
use ethrex_sync::peer::{
    Capability, Peer, PeerConnection, PendingRequests, RequestChannel, RequestTimeouts,
};
use ethrex_sync::store::{ChainStore, MissingAccountData, StateStore, StoreError};
use ethrex_sync::types::{
    AccountState, Block, BlockBody, BlockHeader, H256, Receipt, U256, keccak,
};

const MORE: &[u8] = b"more";
const LAST: &[u8] = b"last";

/// Encodes the "more items to the right" flag the way [`MemoryState`] verifies it
fn proof(more: bool) -> Vec<Bytes> {
    vec![Bytes::from_static(if more { MORE } else { LAST })]
}

fn proof_says_more(proof: &[Bytes]) -> bool {
    proof.first().is_some_and(|node| node.as_ref() == MORE)
}

/// Node whose hash the remote state root is
pub fn root_node() -> Bytes {
    Bytes::from_static(b"state root node")
}

pub fn remote_state_root() -> H256 {
    keccak(root_node())
}

#[derive(Debug)]
pub struct RemoteChain {
    headers: Vec<BlockHeader>,
}

impl RemoteChain {
    /// Blocks `0..=head`, linked by parent hash
    pub fn new(head: u64) -> Self {
        let mut headers: Vec<BlockHeader> = Vec::with_capacity(head as usize + 1);
        for number in 0..=head {
            headers.push(BlockHeader {
                parent_hash: headers.last().map(BlockHeader::hash).unwrap_or_default(),
                number,
                timestamp: number * 12,
                gas_limit: 30_000_000,
                state_root: if number == head {
                    remote_state_root()
                } else {
                    H256::from_low_u64_be(number + 1)
                },
                ..Default::default()
            });
        }
        Self { headers }
    }

    pub fn header(&self, number: u64) -> &BlockHeader {
        &self.headers[number as usize]
    }

    pub fn head(&self) -> &BlockHeader {
        &self.headers[self.headers.len() - 1]
    }

    fn number_of(&self, start: &HashOrNumber) -> Option<u64> {
        match start {
            HashOrNumber::Number(number) => {
                (*number < self.headers.len() as u64).then_some(*number)
            }
            HashOrNumber::Hash(hash) => self
                .headers
                .iter()
                .find(|header| header.hash() == *hash)
                .map(|header| header.number),
        }
    }
}

/// Stand-in for the storage trie root: a hash over every slot, so a local
/// storage trie matches its account only once every slot is stored
pub fn storage_root_of(storage: &BTreeMap<H256, U256>) -> H256 {
    let mut preimage = Vec::with_capacity(storage.len() * 40);
    for (slot, value) in storage {
        preimage.extend_from_slice(slot.as_bytes());
        preimage.extend_from_slice(&value.low_u64().to_be_bytes());
    }
    keccak(preimage)
}

#[derive(Debug, Default)]
pub struct RemoteState {
    pub accounts: BTreeMap<H256, AccountState>,
    pub storage: HashMap<H256, BTreeMap<H256, U256>>,
    pub codes: HashMap<H256, Bytes>,
    pub nodes: HashMap<H256, Bytes>,
}

impl RemoteState {
    /// `count` accounts, every third one with `slots` storage slots and
    /// every fourth one with code. Codes repeat, so some are shared.
    pub fn generate(count: u64, slots: u64) -> Self {
        let mut state = RemoteState::default();
        for i in 0..count {
            let hash = keccak(i.to_be_bytes());
            let mut account = AccountState {
                nonce: i,
                balance: U256::from(i * 1_000),
                ..Default::default()
            };
            if i % 3 == 0 {
                let storage = (1..=slots)
                    .map(|slot| (keccak((i * 100 + slot).to_be_bytes()), U256::from(slot)))
                    .collect();
                account.storage_root = storage_root_of(&storage);
                state.storage.insert(hash, storage);
            }
            if i % 4 == 0 {
                let code = Bytes::from(vec![0x60, (i % 3) as u8, 0x00]);
                account.code_hash = keccak(&code);
                state.codes.insert(account.code_hash, code);
            }
            state.accounts.insert(hash, account);
        }
        state.nodes.insert(remote_state_root(), root_node());
        state
    }
}

/// Per-peer serving limits
#[derive(Debug, Clone, Default)]
pub struct Serving {
    pub max_headers: Option<usize>,
    pub max_bodies: Option<usize>,
    pub max_accounts: Option<usize>,
    pub max_slots: Option<usize>,
    /// Never answers, every request times out
    pub silent: bool,
}

/// Transport of one simulated peer. Answers synchronously from the remote
/// chain and state through the peer's pending request registry.
#[derive(Debug)]
pub struct MockChannel {
    pending: Arc<PendingRequests>,
    chain: Arc<RemoteChain>,
    state: Arc<RemoteState>,
    serving: Serving,
    requests: Mutex<Vec<Request>>,
}

impl MockChannel {
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// `(start, limit)` of every numbered header request, in send order
    pub fn header_requests(&self) -> Vec<(u64, u64)> {
        self.requests()
            .into_iter()
            .filter_map(|request| match request {
                Request::GetBlockHeaders {
                    start: HashOrNumber::Number(start),
                    limit,
                    ..
                } => Some((start, limit)),
                _ => None,
            })
            .collect()
    }

    fn respond(&self, request: &Request) -> Response {
        match request {
            Request::GetBlockHeaders {
                start,
                limit,
                skip,
                reverse,
            } => {
                let mut headers = vec![];
                let max = self.serving.max_headers.unwrap_or(usize::MAX);
                let mut next = self.chain.number_of(start);
                while let Some(number) = next {
                    if headers.len() as u64 >= *limit || headers.len() >= max {
                        break;
                    }
                    let Some(header) = self.chain.headers.get(number as usize) else {
                        break;
                    };
                    headers.push(header.clone());
                    next = if *reverse {
                        number.checked_sub(skip + 1)
                    } else {
                        Some(number + skip + 1)
                    };
                }
                Response::BlockHeaders(headers)
            }
            Request::GetBlockBodies { hashes } => {
                let max = self.serving.max_bodies.unwrap_or(usize::MAX);
                let known = hashes
                    .iter()
                    .take_while(|hash| self.chain.number_of(&HashOrNumber::Hash(**hash)).is_some())
                    .take(max)
                    .count();
                Response::BlockBodies(vec![BlockBody::default(); known])
            }
            Request::GetReceipts { hashes } => {
                Response::Receipts(hashes.iter().map(|_| vec![]).collect())
            }
            Request::GetAccountRange { origin, limit, .. } => {
                let max = self.serving.max_accounts.unwrap_or(usize::MAX);
                let mut accounts = vec![];
                for (hash, account) in self.state.accounts.range(*origin..) {
                    accounts.push((*hash, account.clone()));
                    // One account past the limit proves the end of the range
                    if accounts.len() >= max || hash > limit {
                        break;
                    }
                }
                let more = accounts.last().is_some_and(|(last, _)| {
                    self.state
                        .accounts
                        .range(*last..)
                        .nth(1)
                        .is_some()
                });
                Response::AccountRange {
                    accounts,
                    proof: proof(more),
                }
            }
            Request::GetStorageRanges {
                accounts, origin, ..
            } => {
                let mut budget = self.serving.max_slots.unwrap_or(usize::MAX);
                let mut slots = vec![];
                let mut more = false;
                for (i, account) in accounts.iter().enumerate() {
                    let from = if i == 0 { *origin } else { H256::zero() };
                    let all: Vec<(H256, U256)> = self
                        .state
                        .storage
                        .get(account)
                        .map(|storage| storage.range(from..).map(|(k, v)| (*k, *v)).collect())
                        .unwrap_or_default();
                    let served = all.len().min(budget);
                    more = served < all.len();
                    slots.push(all[..served].to_vec());
                    budget -= served;
                    if more || budget == 0 {
                        break;
                    }
                }
                Response::StorageRanges {
                    slots,
                    proof: proof(more),
                }
            }
            Request::GetByteCodes { hashes, .. } => Response::ByteCodes(
                hashes
                    .iter()
                    .filter_map(|hash| self.state.codes.get(hash).cloned())
                    .collect(),
            ),
            Request::GetTrieNodes { hashes, .. } => Response::TrieNodes(
                hashes
                    .iter()
                    .filter_map(|hash| self.state.nodes.get(hash).cloned())
                    .collect(),
            ),
        }
    }
}

impl RequestChannel for MockChannel {
    fn send(&self, req_id: u64, request: Request) -> Result<(), RequestError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        if !self.serving.silent {
            self.pending.resolve(req_id, self.respond(&request));
        }
        Ok(())
    }
}

pub struct TestPeer {
    pub peer: Arc<Peer>,
    pub channel: Arc<MockChannel>,
}

pub fn test_peer(
    byte: u8,
    capabilities: Vec<Capability>,
    chain: Arc<RemoteChain>,
    state: Arc<RemoteState>,
    serving: Serving,
) -> TestPeer {
    let id = H256::repeat_byte(byte);
    let pending = PendingRequests::new(id);
    let best_hash = chain.head().hash();
    let channel = Arc::new(MockChannel {
        pending: pending.clone(),
        chain,
        state,
        serving,
        requests: Mutex::new(vec![]),
    });
    let transport: Arc<dyn RequestChannel> = channel.clone();
    let connection = PeerConnection::with_pending(transport, pending, RequestTimeouts::default());
    let peer = Peer::new(
        id,
        SocketAddr::from(([127, 0, 0, 1], 30300 + byte as u16)),
        capabilities,
        connection,
        best_hash,
    );
    TestPeer {
        peer: Arc::new(peer),
        channel,
    }
}

pub fn eth_peer(byte: u8, chain: Arc<RemoteChain>, serving: Serving) -> TestPeer {
    test_peer(
        byte,
        vec![Capability::ETH_68],
        chain,
        Arc::new(RemoteState::default()),
        serving,
    )
}

pub fn snap_peer(
    byte: u8,
    chain: Arc<RemoteChain>,
    state: Arc<RemoteState>,
    serving: Serving,
) -> TestPeer {
    test_peer(
        byte,
        vec![Capability::ETH_68, Capability::SNAP_1],
        chain,
        state,
        serving,
    )
}

#[derive(Debug, Default)]
struct ChainInner {
    blocks: BTreeMap<u64, Block>,
    receipts: HashMap<H256, Vec<Receipt>>,
    put_calls: Vec<Vec<u64>>,
    accept_limit: Option<usize>,
    failing: bool,
}

#[derive(Debug, Default)]
pub struct MemoryChain {
    inner: Mutex<ChainInner>,
}

impl MemoryChain {
    pub fn with_genesis(genesis: BlockHeader) -> Arc<Self> {
        let chain = MemoryChain::default();
        chain
            .lock()
            .blocks
            .insert(genesis.number, Block::new(genesis, BlockBody::default()));
        Arc::new(chain)
    }

    /// Block numbers handed to every `put_blocks` call, in call order
    pub fn put_calls(&self) -> Vec<Vec<u64>> {
        self.lock().put_calls.clone()
    }

    pub fn stored_numbers(&self) -> Vec<u64> {
        self.lock().blocks.keys().copied().collect()
    }

    pub fn receipt_count(&self) -> usize {
        self.lock().receipts.len()
    }

    /// Accept at most `limit` blocks per call
    pub fn set_accept_limit(&self, limit: Option<usize>) {
        self.lock().accept_limit = limit;
    }

    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChainInner> {
        self.inner.lock().expect("chain lock")
    }
}

#[async_trait]
impl ChainStore for MemoryChain {
    async fn latest_block_number(&self) -> Result<u64, StoreError> {
        Ok(self.lock().blocks.keys().last().copied().unwrap_or_default())
    }

    async fn block_header(&self, number: u64) -> Result<Option<BlockHeader>, StoreError> {
        Ok(self.lock().blocks.get(&number).map(|block| block.header.clone()))
    }

    async fn put_blocks(&self, blocks: Vec<Block>) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        if inner.failing {
            return Err(StoreError::Custom("write failed".to_string()));
        }
        inner
            .put_calls
            .push(blocks.iter().map(Block::number).collect());
        let accepted = inner.accept_limit.unwrap_or(usize::MAX).min(blocks.len());
        for block in blocks.into_iter().take(accepted) {
            inner.blocks.insert(block.number(), block);
        }
        Ok(accepted)
    }

    async fn put_receipts(&self, receipts: Vec<(H256, Vec<Receipt>)>) -> Result<(), StoreError> {
        self.lock().receipts.extend(receipts);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StateInner {
    accounts: BTreeMap<H256, AccountState>,
    storage: HashMap<H256, BTreeMap<H256, U256>>,
    codes: HashMap<H256, Bytes>,
    nodes: HashMap<H256, Bytes>,
}

/// Local state store. Range proofs are simulated: the proof carries the
/// "more items" flag directly.
#[derive(Debug)]
pub struct MemoryState {
    inner: Mutex<StateInner>,
    /// Root the store reports as computed from the downloaded state
    computed_root: H256,
}

impl MemoryState {
    pub fn new(computed_root: H256) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(StateInner::default()),
            computed_root,
        })
    }

    pub fn accounts(&self) -> BTreeMap<H256, AccountState> {
        self.lock().accounts.clone()
    }

    pub fn storage(&self) -> HashMap<H256, BTreeMap<H256, U256>> {
        self.lock().storage.clone()
    }

    pub fn codes(&self) -> HashMap<H256, Bytes> {
        self.lock().codes.clone()
    }

    pub fn nodes(&self) -> HashMap<H256, Bytes> {
        self.lock().nodes.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.inner.lock().expect("state lock")
    }
}

#[async_trait]
impl StateStore for MemoryState {
    async fn state_root(&self) -> Result<H256, StoreError> {
        Ok(self.computed_root)
    }

    async fn last_account_hash(&self) -> Result<Option<H256>, StoreError> {
        Ok(self.lock().accounts.keys().last().copied())
    }

    fn verify_account_range(
        &self,
        _root: H256,
        _origin: H256,
        _accounts: &[(H256, AccountState)],
        proof: &[Bytes],
    ) -> Result<bool, String> {
        Ok(proof_says_more(proof))
    }

    fn verify_storage_range(
        &self,
        _storage_root: H256,
        _origin: H256,
        _slots: &[(H256, U256)],
        proof: &[Bytes],
    ) -> Result<bool, String> {
        Ok(proof_says_more(proof))
    }

    async fn put_accounts(&self, accounts: Vec<(H256, AccountState)>) -> Result<(), StoreError> {
        self.lock().accounts.extend(accounts);
        Ok(())
    }

    async fn missing_account_data(&self) -> Result<MissingAccountData, StoreError> {
        let inner = self.lock();
        let mut missing = MissingAccountData::default();
        for (hash, account) in &inner.accounts {
            let storage_complete = inner
                .storage
                .get(hash)
                .is_some_and(|storage| storage_root_of(storage) == account.storage_root);
            if account.has_storage() && !storage_complete {
                missing.storage.push((*hash, account.storage_root));
            }
            if account.has_code() && !inner.codes.contains_key(&account.code_hash) {
                missing.codes.push(account.code_hash);
            }
        }
        Ok(missing)
    }

    async fn put_storage(
        &self,
        account_hash: H256,
        slots: Vec<(H256, U256)>,
    ) -> Result<(), StoreError> {
        self.lock()
            .storage
            .entry(account_hash)
            .or_default()
            .extend(slots);
        Ok(())
    }

    async fn put_codes(&self, codes: Vec<(H256, Bytes)>) -> Result<(), StoreError> {
        self.lock().codes.extend(codes);
        Ok(())
    }

    async fn put_trie_nodes(&self, nodes: Vec<(H256, Bytes)>) -> Result<(), StoreError> {
        self.lock().nodes.extend(nodes);
        Ok(())
    }

    async fn has_trie_node(&self, hash: H256) -> Result<bool, StoreError> {
        Ok(hash == self.computed_root || self.lock().nodes.contains_key(&hash))
    }

    async fn missing_children(&self, _node: &Bytes) -> Result<Vec<H256>, StoreError> {
        Ok(vec![])
    }
}
