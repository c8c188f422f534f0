use std::convert::TryFrom;
use tokio::time::Duration;

/// Tunables for a single server. Every field has a default; construction goes
/// through validation so nonsense combinations fail before any task spawns.
#[derive(Clone, Default)]
pub struct ServerOptions {
    pub heartbeat_interval: Option<Duration>,
    pub election_timeout_min: Option<Duration>,
    pub election_timeout_max: Option<Duration>,
    pub session_check_interval: Option<Duration>,
    pub member_heartbeat_interval: Option<Duration>,
    pub compaction_interval: Option<Duration>,
    /// Byte budget for one AppendEntries batch.
    pub max_batch_bytes: Option<usize>,
    /// Chunk size for streaming snapshots to lagging peers.
    pub install_chunk_bytes: Option<usize>,
    /// Voting-member count the rebalancer promotes toward.
    pub quorum_hint: Option<usize>,
    /// Passive-member count the rebalancer promotes toward.
    pub passive_hint: Option<usize>,
    /// Deterministic window after which a member missing heartbeats is
    /// considered Unavailable.
    pub availability_window_ms: Option<u64>,
}

pub(crate) struct ServerOptionsValidated {
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub session_check_interval: Duration,
    pub member_heartbeat_interval: Duration,
    pub compaction_interval: Duration,
    pub max_batch_bytes: usize,
    pub install_chunk_bytes: usize,
    pub quorum_hint: usize,
    pub passive_hint: usize,
    pub availability_window_ms: u64,
}

impl ServerOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err("heartbeat interval must be less than the minimum election timeout");
        }
        if self.election_timeout_min >= self.election_timeout_max {
            return Err("minimum election timeout must be less than the maximum");
        }
        if self.max_batch_bytes == 0 {
            return Err("append batch byte budget must be non-zero");
        }
        if self.install_chunk_bytes == 0 {
            return Err("install chunk size must be non-zero");
        }
        if self.quorum_hint == 0 {
            return Err("quorum hint must be at least 1");
        }
        Ok(())
    }
}

impl TryFrom<ServerOptions> for ServerOptionsValidated {
    type Error = &'static str;

    fn try_from(options: ServerOptions) -> Result<Self, Self::Error> {
        let values = ServerOptionsValidated {
            heartbeat_interval: options.heartbeat_interval.unwrap_or(Duration::from_millis(150)),
            election_timeout_min: options.election_timeout_min.unwrap_or(Duration::from_millis(500)),
            election_timeout_max: options.election_timeout_max.unwrap_or(Duration::from_millis(1500)),
            session_check_interval: options.session_check_interval.unwrap_or(Duration::from_millis(250)),
            member_heartbeat_interval: options
                .member_heartbeat_interval
                .unwrap_or(Duration::from_millis(1000)),
            compaction_interval: options.compaction_interval.unwrap_or(Duration::from_secs(60)),
            max_batch_bytes: options.max_batch_bytes.unwrap_or(1024 * 32),
            install_chunk_bytes: options.install_chunk_bytes.unwrap_or(1024 * 32),
            quorum_hint: options.quorum_hint.unwrap_or(3),
            passive_hint: options.passive_hint.unwrap_or(2),
            availability_window_ms: options.availability_window_ms.unwrap_or(5_000),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ServerOptionsValidated::try_from(ServerOptions::default()).is_ok());
    }

    #[test]
    fn heartbeat_must_undercut_election_timeout() {
        let options = ServerOptions {
            heartbeat_interval: Some(Duration::from_millis(600)),
            election_timeout_min: Some(Duration::from_millis(500)),
            ..ServerOptions::default()
        };
        assert!(ServerOptionsValidated::try_from(options).is_err());
    }
}
