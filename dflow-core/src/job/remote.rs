use std::time::Duration;

use crate::domain::Item;
use crate::error::Result;

/// Suggested request timeout for transport implementations.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(2);

/// The one slice of the peer transport the job controller needs: fetching the
/// items of a chunk it does not hold locally. Discovery, liveness gossip and
/// the rest of the peer protocol live outside this crate; implementations
/// wrap whatever transport the node uses.
pub trait RemoteChunkSource: Send {
    /// `Ok(None)` when no peer holds the chunk.
    fn fetch_chunk(&self, fingerprint: &str, index: u64) -> Result<Option<Vec<Item>>>;
}
