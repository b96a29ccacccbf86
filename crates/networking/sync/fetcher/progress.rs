//! Shared record of one snap sync attempt.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::types::H256;

use super::FetcherKind;

/// The block whose state a snap sync attempt downloads.
/// Fixed for the whole attempt, every proof is checked against `root`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapTarget {
    pub height: u64,
    pub root: H256,
    pub hash: H256,
}

/// Target plus the per-fetcher done flags, shared by the four snap fetchers
/// and the synchronizer that waits for them.
#[derive(Debug)]
pub struct SnapProgress {
    target: SnapTarget,
    account: AtomicBool,
    storage: AtomicBool,
    byte_code: AtomicBool,
    trie_node: AtomicBool,
}

impl SnapProgress {
    pub fn new(target: SnapTarget) -> Self {
        Self {
            target,
            account: AtomicBool::new(false),
            storage: AtomicBool::new(false),
            byte_code: AtomicBool::new(false),
            trie_node: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> SnapTarget {
        self.target
    }

    pub fn mark_done(&self, kind: FetcherKind) {
        if let Some(flag) = self.flag(kind) {
            flag.store(true, Ordering::Release);
        }
    }

    pub fn is_done(&self, kind: FetcherKind) -> bool {
        self.flag(kind)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    pub fn all_done(&self) -> bool {
        [
            &self.account,
            &self.storage,
            &self.byte_code,
            &self.trie_node,
        ]
        .iter()
        .all(|flag| flag.load(Ordering::Acquire))
    }

    fn flag(&self, kind: FetcherKind) -> Option<&AtomicBool> {
        match kind {
            FetcherKind::Account => Some(&self.account),
            FetcherKind::Storage => Some(&self.storage),
            FetcherKind::ByteCode => Some(&self.byte_code),
            FetcherKind::TrieNode => Some(&self.trie_node),
            FetcherKind::Block | FetcherKind::Receipt => None,
        }
    }
}
