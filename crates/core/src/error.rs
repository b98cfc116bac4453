use thiserror::Error;

/// The fatal/propagated error surface (§7). Recoverable per-packet conditions
/// (malformed packets, unknown peers, stale baselines, ...) are never
/// represented here; they are counted on the owning session instead.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("initialization failed: {0}")]
    InitFailed(String),

    #[error("socket error binding {addr}: {source}")]
    Socket {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no free client slot (max_clients reached)")]
    Full,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("message truncated during decode")]
    Truncated,
}

pub type NetResult<T> = Result<T, NetError>;

/// Non-fatal per-packet conditions the spec requires to be counted rather
/// than propagated (§7, §4.12). Kept as plain counters on the owning
/// session/slot rather than threaded through `Result`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DropCounters {
    pub packets_malformed: u64,
    pub inputs_late: u64,
    pub inputs_duplicated: u64,
    pub snapshots_dropped: u64,
}

impl DropCounters {
    pub fn record_malformed(&mut self) {
        self.packets_malformed += 1;
    }

    pub fn record_late_input(&mut self) {
        self.inputs_late += 1;
    }

    pub fn record_duplicate_input(&mut self) {
        self.inputs_duplicated += 1;
    }

    pub fn record_dropped_snapshot(&mut self) {
        self.snapshots_dropped += 1;
    }
}

pub(crate) fn socket_error(addr: impl ToString, source: std::io::Error) -> NetError {
    NetError::Socket {
        addr: addr.to_string(),
        source,
    }
}
