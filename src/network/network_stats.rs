//! Per-endpoint connection statistics.

/// A snapshot of the connection quality towards one remote endpoint.
///
/// Returned by [`P2PSession::network_stats`](crate::P2PSession::network_stats).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct NetworkStats {
    /// Number of unacked inputs queued for retransmission.
    pub send_queue_len: usize,
    /// Estimated round trip time in ms.
    pub ping: u64,
    /// Frames the local client runs behind the remote, as last reported by
    /// the remote's quality report.
    pub local_frames_behind: i32,
    /// Frames the remote client runs behind the local client.
    pub remote_frames_behind: i32,
}
