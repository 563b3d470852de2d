//! DecryptionCoordinator sub-state machine.
//!
//! Holds at most one committed block at a time and collects per-node
//! [`BlockShare`]s for it until the sharing threshold is met.
//!
//! ## Lazy Contribution
//!
//! A node only emits its own share while the in-flight block is still below
//! threshold. Once `k` distinct shares are held the block is finalized and
//! no further shares are sent.
//!
//! ## Early Shares
//!
//! Shares can overtake the `Committed` message that starts decryption on
//! this node. Those are buffered by block hash and replayed when the block
//! enters the decrypt stage; without this, late nodes could wait forever
//! for shares that peers sent before they were listening.

use oapbft_core::Action;
use oapbft_types::{
    BlockProof, BlockShare, CryptoMessage, DecryptedBlock, EncryptedBlock, Hash, Message, NodeId,
    Term,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, trace, warn};

/// A block that reached the sharing threshold.
#[derive(Debug, Clone)]
pub struct Decrypted {
    pub decrypted: DecryptedBlock,
    pub encrypted: EncryptedBlock,
    pub proof: BlockProof,
    /// Distinct shares, ordered by node.
    pub shares: Vec<BlockShare>,
}

/// Result of feeding the coordinator.
#[derive(Debug, Default)]
pub struct DecryptionOutput {
    /// Share broadcasts to execute.
    pub actions: Vec<Action>,
    /// Set when the in-flight block was finalized.
    pub decrypted: Option<Decrypted>,
}

#[derive(Debug)]
struct InFlight {
    block: EncryptedBlock,
    proof: BlockProof,
    shares: BTreeMap<NodeId, BlockShare>,
    contributed: bool,
}

/// Per-node decryption state.
pub struct DecryptionCoordinator {
    // ═══════════════════════════════════════════════════════════════════
    // Configuration
    // ═══════════════════════════════════════════════════════════════════
    node: NodeId,

    /// Sharing threshold `k`.
    threshold: usize,

    // ═══════════════════════════════════════════════════════════════════
    // Decryption Lifecycle
    // ═══════════════════════════════════════════════════════════════════
    in_flight: Option<InFlight>,

    /// Committed blocks seen per unfinalized term. Doubles as the fastcast
    /// relay guard; pruned as terms finalize.
    registered: BTreeMap<Term, BTreeSet<Hash>>,

    /// Shares for blocks not yet in flight, keyed by block hash.
    early_shares: BTreeMap<Hash, BTreeMap<NodeId, BlockShare>>,

    /// Highest term finalized (or skipped by sync). Shares at or below it are stale.
    finalized_term: Term,
}

impl std::fmt::Debug for DecryptionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionCoordinator")
            .field("node", &self.node)
            .field("threshold", &self.threshold)
            .field(
                "in_flight",
                &self.in_flight.as_ref().map(|i| (i.block.term, i.shares.len())),
            )
            .field("registered", &self.registered.len())
            .field("early_shares", &self.early_shares.len())
            .field("finalized_term", &self.finalized_term)
            .finish()
    }
}

impl DecryptionCoordinator {
    pub fn new(node: NodeId, threshold: usize) -> Self {
        Self {
            node,
            threshold,
            in_flight: None,
            registered: BTreeMap::new(),
            early_shares: BTreeMap::new(),
            finalized_term: 0,
        }
    }

    /// Whether this block was already registered on this node.
    pub fn is_registered(&self, hash: &Hash) -> bool {
        self.registered.values().any(|hashes| hashes.contains(hash))
    }

    /// Record a committed block. Returns `false` if it was already known or
    /// its term is finalized.
    pub fn register(&mut self, term: Term, hash: Hash) -> bool {
        if term <= self.finalized_term {
            return false;
        }
        self.registered.entry(term).or_default().insert(hash)
    }

    /// Number of terms with registered blocks.
    pub fn registered_terms(&self) -> usize {
        self.registered.len()
    }

    /// Whether a block is currently being decrypted.
    pub fn is_decrypting(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Term of the in-flight block, if any.
    pub fn in_flight_term(&self) -> Option<Term> {
        self.in_flight.as_ref().map(|i| i.block.term)
    }

    /// Number of distinct shares held for the in-flight block.
    pub fn share_count(&self) -> usize {
        self.in_flight.as_ref().map_or(0, |i| i.shares.len())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Decryption Lifecycle Methods
    // ═══════════════════════════════════════════════════════════════════════

    /// Start decrypting a committed block.
    ///
    /// No-op while another block is in flight.
    pub fn enter_decrypt_stage(
        &mut self,
        block: EncryptedBlock,
        proof: BlockProof,
    ) -> DecryptionOutput {
        if let Some(current) = &self.in_flight {
            debug!(
                node = %self.node,
                in_flight = current.block.term,
                incoming = block.term,
                "Already decrypting, ignoring"
            );
            return DecryptionOutput::default();
        }

        let hash = block.hash;
        let term = block.term;
        self.register(term, hash);

        let shares: BTreeMap<NodeId, BlockShare> = self
            .early_shares
            .remove(&hash)
            .unwrap_or_default()
            .into_iter()
            .filter(|(_, share)| share.term == term)
            .collect();

        debug!(
            node = %self.node,
            term,
            ?hash,
            buffered = shares.len(),
            "Entering decrypt stage"
        );

        self.in_flight = Some(InFlight {
            block,
            proof,
            shares,
            contributed: false,
        });

        self.progress()
    }

    /// Record a share from the network.
    pub fn handle_block_share(&mut self, share: BlockShare) -> DecryptionOutput {
        let Some(in_flight) = self.in_flight.as_mut() else {
            self.buffer_or_drop(share);
            return DecryptionOutput::default();
        };

        if share.term != in_flight.block.term {
            if share.term > in_flight.block.term {
                self.buffer_or_drop(share);
            } else {
                trace!(node = %self.node, term = share.term, "Stale block share");
            }
            return DecryptionOutput::default();
        }

        if share.block_hash != in_flight.block.hash {
            warn!(
                node = %self.node,
                from = %share.node,
                term = share.term,
                expected = ?in_flight.block.hash,
                got = ?share.block_hash,
                "Rejecting block share for a different block"
            );
            return DecryptionOutput::default();
        }

        if in_flight.shares.contains_key(&share.node) {
            trace!(node = %self.node, from = %share.node, "Duplicate block share");
            return DecryptionOutput::default();
        }

        in_flight.shares.insert(share.node, share);
        self.progress()
    }

    /// Drop any in-flight decryption and everything up to `closed_term`.
    ///
    /// Called when sync installs blocks directly.
    pub fn reset(&mut self, closed_term: Term) {
        if let Some(in_flight) = self.in_flight.take() {
            debug!(
                node = %self.node,
                term = in_flight.block.term,
                "Discarding in-flight decryption"
            );
        }
        self.advance_finalized(closed_term);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Internal Helpers
    // ═══════════════════════════════════════════════════════════════════════

    fn progress(&mut self) -> DecryptionOutput {
        let mut output = DecryptionOutput::default();
        let node = self.node;
        let threshold = self.threshold;

        let Some(in_flight) = self.in_flight.as_mut() else {
            return output;
        };

        if in_flight.shares.len() < threshold
            && !in_flight.contributed
            && !in_flight.shares.contains_key(&node)
        {
            let share = BlockShare {
                block_hash: in_flight.block.hash,
                term: in_flight.block.term,
                node,
            };
            in_flight.shares.insert(node, share.clone());
            in_flight.contributed = true;
            trace!(node = %node, term = share.term, "Contributing block share");
            output.actions.push(Action::Broadcast {
                message: Message::Crypto(CryptoMessage::BlockShare(share)),
            });
        }

        if in_flight.shares.len() >= threshold {
            output.decrypted = self.finalize();
        }

        output
    }

    fn finalize(&mut self) -> Option<Decrypted> {
        let in_flight = self.in_flight.take()?;
        let decrypted = DecryptedBlock::from_encrypted(&in_flight.block);

        info!(
            node = %self.node,
            term = decrypted.term,
            hash = ?decrypted.hash,
            shares = in_flight.shares.len(),
            "Block decrypted"
        );

        self.advance_finalized(decrypted.term);

        Some(Decrypted {
            decrypted,
            encrypted: in_flight.block,
            proof: in_flight.proof,
            shares: in_flight.shares.into_values().collect(),
        })
    }

    fn advance_finalized(&mut self, term: Term) {
        self.finalized_term = self.finalized_term.max(term);
        let finalized = self.finalized_term;
        self.registered = self.registered.split_off(&(finalized + 1));
        self.early_shares.retain(|_, shares| {
            shares
                .values()
                .next()
                .is_some_and(|share| share.term > finalized)
        });
    }

    fn buffer_or_drop(&mut self, share: BlockShare) {
        if share.term <= self.finalized_term {
            trace!(node = %self.node, term = share.term, "Stale block share");
            return;
        }
        trace!(
            node = %self.node,
            from = %share.node,
            term = share.term,
            "Buffering early block share"
        );
        self.early_shares
            .entry(share.block_hash)
            .or_default()
            .entry(share.node)
            .or_insert(share);
    }
}
