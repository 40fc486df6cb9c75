use serde::Serialize;

/// Snapshot of an engine's bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Script objects pinned for the host
    pub pinned_handles: usize,
    /// Distinct host ids referenced by live proxies
    pub foreign_ids: usize,
    /// Live proxies across all ids
    pub live_proxies: usize,
    /// Removals waiting for the outermost call to finish
    pub pending_removals: usize,
    /// Script heap in use; unavailable while a call is running
    pub heap_bytes: Option<u64>,
}
