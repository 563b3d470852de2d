//! Decryption phase gating block finality.
//!
//! A block committed by its term's committee is not final until `k`
//! distinct nodes have contributed a [`BlockShare`](oapbft_types::BlockShare)
//! for it. The [`DecryptionCoordinator`] collects shares for one block at a
//! time and yields a [`Decrypted`] result for the consensus engine to append.
//!
//! # Flow
//!
//! ```text
//! Engine: valid Committed message
//!     │
//!     ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ DecryptionCoordinator.enter_decrypt_stage(block, proof)  │
//! │   1. Register block hash (fastcast relay guard)          │
//! │   2. Replay buffered early shares                        │
//! │   3. Broadcast own share if still below threshold        │
//! └──────────────────────────────────────────────────────────┘
//!     │            ▲
//!     ▼            │ handle_block_share(share)
//!   k distinct valid shares?
//!     │
//!     ▼
//! Decrypted { decrypted, encrypted, proof, shares } → engine appends
//! ```
//!
//! Shares are placeholders: "decryption" is a deterministic hash of the
//! content, not real threshold cryptography.

mod coordinator;

pub use coordinator::{Decrypted, DecryptionCoordinator, DecryptionOutput};
