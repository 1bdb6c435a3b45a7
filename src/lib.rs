//! Retrieval and context fusion for a cybersecurity-training chat agent.
//!
//! Two retrieval strategies feed one bounded context string:
//!
//! - **RAG** ([`rag`]): similarity search over embedded documents held in a
//!   collection-scoped [`vector_store`].
//! - **CAG** ([`cag`]): bounded traversal of a triplet [`graph`] plus a
//!   preloaded, ranked document block.
//!
//! [`fusion`] merges those with explicit lookups ([`knowledge`]) under a
//! combine mode; [`manager::RagCagManager`] is the entry point that wires it
//! all together.

pub mod cache;
pub mod cag;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod fusion;
pub mod graph;
pub mod knowledge;
pub mod logger;
pub mod manager;
pub mod rag;
pub mod vector_store;

pub use error::AppError;
pub use manager::{ContextOptions, EnhancedContext, RagCagManager, RetrievalStats};
