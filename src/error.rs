//! Collection error taxonomy.
//!
//! Every failure in the sampling path is one of these kinds; callers decide
//! recovery by variant. Per-PID churn is silently skipped, a failed global
//! read fails only the current cycle, protocol trouble downgrades one
//! taskstats observation, and fatal errors terminate the agent.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CollectError {
    /// The PID disappeared between directory enumeration and file read.
    /// Normal churn, never logged.
    #[error("pid {pid} vanished")]
    PidVanished { pid: u32 },

    /// A global procfs read failed; the cycle is abandoned and retried on
    /// the next tick.
    #[error("reading {path}: {source}")]
    SystemRead {
        path: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Content did not have the structure the kernel documents.
    #[error("malformed {what}")]
    Malformed { what: &'static str },

    /// The kernel replied NLMSG_ERROR with a non-EPERM errno for one PID;
    /// that PID's delay block is absent this interval.
    #[error("taskstats unavailable for pid {pid} (errno {errno})")]
    TaskstatsUnavailable { pid: u32, errno: i32 },

    /// A netlink reply that does not follow the taskstats layout.
    #[error("netlink protocol: {what}")]
    Protocol { what: &'static str },

    /// Unrecoverable: privileges, socket setup, or family discovery.
    #[error("{0}")]
    Fatal(String),
}

impl CollectError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// True when the agent must terminate rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(CollectError::fatal("no permission").is_fatal());
        assert!(!CollectError::PidVanished { pid: 1 }.is_fatal());
        assert!(!CollectError::TaskstatsUnavailable { pid: 1, errno: -3 }.is_fatal());
    }

    #[test]
    fn test_display_includes_context() {
        let err = CollectError::TaskstatsUnavailable {
            pid: 42,
            errno: -2,
        };
        assert_eq!(err.to_string(), "taskstats unavailable for pid 42 (errno -2)");
    }
}
