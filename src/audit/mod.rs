//! Audit Log System
//!
//! Tamper-evident, append-only record of inbound requests. The integrity of
//! the whole log is summarized by a Merkle root that is recomputed on every
//! append and checked on demand.

pub mod digest;
pub mod entry;
pub mod merkle;
pub mod middleware;
pub mod recorder;
pub mod store;

pub use entry::{HeaderAllowList, LogEntry, RequestDescriptor};
pub use merkle::{build_merkle_tree, generate_proof, merkle_root, MerkleProof, Node};
pub use recorder::AuditRecorder;
pub use store::{AuditLogStore, VerificationReport};
