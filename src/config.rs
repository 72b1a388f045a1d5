//! Runtime configuration for a Raft `Server`.

use rand::Rng;

use crate::error::ConfigError;

/// Runtime configuration for a `Server`.
///
/// Construct via [`Config::build`], tune the fields, then call
/// [`Config::validate`] before handing it to `Server::new`.
#[derive(Clone, Debug)]
pub struct Config {
    /// A name for the cluster this server belongs to, used only for tracing spans.
    pub cluster_name: String,

    /// Lower bound (inclusive) of the randomised election timeout, in milliseconds (§4.4).
    pub election_timeout_min_ms: u64,
    /// Upper bound (exclusive) of the randomised election timeout, in milliseconds (§4.4).
    pub election_timeout_max_ms: u64,

    /// Period between heartbeat AppendEntries RPCs a leader sends each peer (§4.3).
    pub heartbeat_interval_ms: u64,

    /// Deadline a client command waits for its entry to commit before returning
    /// `CommandTimeout` (§4.8, default 1 second).
    pub command_timeout_ms: u64,

    /// Interval between background `takeSnapshot` attempts (§5, default 60s).
    pub snapshot_interval_secs: u64,

    /// Number of newly-applied entries since the last snapshot before
    /// `takeSnapshot` is attempted by the background task.
    pub snapshot_entry_threshold: u64,

    /// Bounded capacity of the server's event channel (§5, default 256).
    pub event_channel_capacity: usize,
}

impl Config {
    /// Start building a new `Config` with the teacher's defaults.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            inner: Config {
                cluster_name,
                election_timeout_min_ms: 150,
                election_timeout_max_ms: 300,
                heartbeat_interval_ms: 50,
                command_timeout_ms: 1_000,
                snapshot_interval_secs: 60,
                snapshot_entry_threshold: 10_000,
                event_channel_capacity: 256,
            },
        }
    }

    /// Generate a new randomised election timeout in `[min, max)`, per §4.4.
    pub fn new_rand_election_timeout(&self) -> u64 {
        rand::thread_rng().gen_range(self.election_timeout_min_ms..self.election_timeout_max_ms)
    }
}

/// Builder for `Config`, mirroring the teacher's `Config::build(..).validate()` chain.
pub struct ConfigBuilder {
    inner: Config,
}

impl ConfigBuilder {
    pub fn election_timeout_min_ms(mut self, v: u64) -> Self {
        self.inner.election_timeout_min_ms = v;
        self
    }

    pub fn election_timeout_max_ms(mut self, v: u64) -> Self {
        self.inner.election_timeout_max_ms = v;
        self
    }

    pub fn heartbeat_interval_ms(mut self, v: u64) -> Self {
        self.inner.heartbeat_interval_ms = v;
        self
    }

    pub fn command_timeout_ms(mut self, v: u64) -> Self {
        self.inner.command_timeout_ms = v;
        self
    }

    pub fn snapshot_interval_secs(mut self, v: u64) -> Self {
        self.inner.snapshot_interval_secs = v;
        self
    }

    pub fn snapshot_entry_threshold(mut self, v: u64) -> Self {
        self.inner.snapshot_entry_threshold = v;
        self
    }

    pub fn event_channel_capacity(mut self, v: usize) -> Self {
        self.inner.event_channel_capacity = v;
        self
    }

    /// Validate the accumulated config, matching the invariants `RaftCore` relies on.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let c = self.inner;
        if c.election_timeout_min_ms >= c.election_timeout_max_ms {
            return Err(ConfigError::ElectionTimeoutRange {
                min: c.election_timeout_min_ms,
                max: c.election_timeout_max_ms,
            });
        }
        if c.heartbeat_interval_ms >= c.election_timeout_min_ms {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: c.heartbeat_interval_ms,
                min: c.election_timeout_min_ms,
            });
        }
        Ok(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_sane_defaults() {
        let cfg = Config::build("test".into()).validate().expect("defaults must validate");
        assert_eq!(cfg.cluster_name, "test");
    }

    #[test]
    fn validate_rejects_inverted_election_timeout() {
        let err = Config::build("test".into())
            .election_timeout_min_ms(300)
            .election_timeout_max_ms(150)
            .validate()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::ElectionTimeoutRange { min: 300, max: 150 }
        );
    }

    #[test]
    fn validate_rejects_slow_heartbeat() {
        let err = Config::build("test".into())
            .heartbeat_interval_ms(200)
            .validate()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::HeartbeatTooSlow { heartbeat: 200, min: 150 }
        );
    }

    #[test]
    fn rand_election_timeout_is_in_range() {
        let cfg = Config::build("test".into()).validate().unwrap();
        for _ in 0..100 {
            let t = cfg.new_rand_election_timeout();
            assert!(t >= cfg.election_timeout_min_ms && t < cfg.election_timeout_max_ms);
        }
    }
}
