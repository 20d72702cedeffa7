//! Session engine for the Chrome DevTools Protocol.
//!
//! One [`Session`] owns one persistent connection to a browser endpoint and
//! multiplexes any number of concurrent commands over it: ids are allocated
//! from a monotonic counter, every outstanding call is parked in a
//! correlation table until its reply arrives, and unsolicited events are
//! fanned out to name-keyed subscribers. The engine is domain-agnostic
//! plumbing; the typed command family in [`commands`] is a thin layer over
//! it.

pub mod commands;
pub mod correlation;
pub mod discovery;
pub mod events;
pub mod launcher;
pub mod metrics;
pub mod session;
pub mod transport;

pub use cdp_wire::{
    escape_text, parse_message, CallId, CodecError, Command, CommandResponse, Envelope,
    EventMessage, Message, Method, ProtocolError, Response,
};

pub use config::SessionConfig;
pub use error::SessionError;
pub use events::SubscriptionHandle;
pub use launcher::{BrowserHandle, LaunchOptions};
pub use session::{Session, SessionState};
pub use transport::{ChannelTransport, NoopTransport, Transport, WebSocketTransport};

pub mod error {
    use std::time::Duration;

    use thiserror::Error;

    use cdp_wire::{CallId, CodecError};

    /// Everything a session operation can fail with.
    ///
    /// `InvalidParams`, `NotConnected` and `DuplicateId` surface before any
    /// network traffic; `Protocol` and `Closed` come back through the same
    /// asynchronous path as a success would.
    #[derive(Debug, Error)]
    pub enum SessionError {
        /// Command validation failed locally; nothing was sent.
        #[error("invalid parameters for {method}: {reason}")]
        InvalidParams { method: String, reason: String },

        /// The session is not in the `Open` state.
        #[error("session is not open")]
        NotConnected,

        /// The remote answered the command with an error object.
        #[error("devtools error {code} for command {id}: {message}")]
        Protocol {
            id: CallId,
            code: i64,
            message: String,
            data: Option<String>,
        },

        /// The session tore down while the command was still outstanding.
        #[error("session closed before command {id} received a reply")]
        Closed { id: CallId },

        /// Connection-level failure on the send path.
        #[error("transport failure: {reason}")]
        Transport { reason: String },

        /// The handshake did not finish within the configured deadline.
        #[error("connect timed out after {0:?}")]
        ConnectTimeout(Duration),

        /// Id collision in the correlation table. This is an allocator
        /// invariant violation, not a recoverable protocol condition.
        #[error("duplicate command id {0}")]
        DuplicateId(CallId),

        /// The browser process could not be started or stopped.
        #[error("launch failure: {reason}")]
        Launch { reason: String },

        /// JSON encode/decode failure on either side of the wire.
        #[error("codec failure: {0}")]
        Codec(#[from] CodecError),
    }

    impl SessionError {
        pub fn transport(reason: impl Into<String>) -> Self {
            Self::Transport {
                reason: reason.into(),
            }
        }

        /// True for the failure classes delivered through a command's own
        /// result channel rather than thrown before the send.
        pub fn is_command_failure(&self) -> bool {
            matches!(self, Self::Protocol { .. } | Self::Closed { .. })
        }
    }
}

pub mod config {
    use std::env;
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    /// Tuning knobs for one session.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct SessionConfig {
        /// Handshake deadline in seconds; zero or negative disables it.
        pub connect_timeout_secs: i64,
        /// Size of the worker pool built when no executor is injected.
        pub worker_threads: usize,
        /// Whether `close` shuts the owned worker pool down, or leaves that
        /// to the caller.
        pub own_executor: bool,
    }

    impl Default for SessionConfig {
        fn default() -> Self {
            Self {
                connect_timeout_secs: resolve_connect_timeout(),
                worker_threads: resolve_worker_threads(),
                own_executor: true,
            }
        }
    }

    impl SessionConfig {
        pub fn connect_timeout(&self) -> Option<Duration> {
            if self.connect_timeout_secs > 0 {
                Some(Duration::from_secs(self.connect_timeout_secs as u64))
            } else {
                None
            }
        }
    }

    fn resolve_connect_timeout() -> i64 {
        match env::var("CDP_CONNECT_TIMEOUT_SECS") {
            Ok(value) => value.trim().parse().unwrap_or(30),
            Err(_) => 30,
        }
    }

    fn resolve_worker_threads() -> usize {
        match env::var("CDP_WORKER_THREADS") {
            Ok(value) => match value.trim().parse() {
                Ok(count) if count > 0 => count,
                _ => 1,
            },
            Err(_) => 1,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serial_test::serial;

        #[test]
        #[serial]
        fn env_overrides_defaults() {
            let original_timeout = env::var("CDP_CONNECT_TIMEOUT_SECS").ok();
            let original_threads = env::var("CDP_WORKER_THREADS").ok();

            env::set_var("CDP_CONNECT_TIMEOUT_SECS", "5");
            env::set_var("CDP_WORKER_THREADS", "4");
            let cfg = SessionConfig::default();
            assert_eq!(cfg.connect_timeout_secs, 5);
            assert_eq!(cfg.worker_threads, 4);

            env::set_var("CDP_CONNECT_TIMEOUT_SECS", "0");
            env::set_var("CDP_WORKER_THREADS", "0");
            let cfg = SessionConfig::default();
            assert_eq!(cfg.connect_timeout(), None);
            assert_eq!(cfg.worker_threads, 1);

            match original_timeout {
                Some(value) => env::set_var("CDP_CONNECT_TIMEOUT_SECS", value),
                None => env::remove_var("CDP_CONNECT_TIMEOUT_SECS"),
            }
            match original_threads {
                Some(value) => env::set_var("CDP_WORKER_THREADS", value),
                None => env::remove_var("CDP_WORKER_THREADS"),
            }
        }

        #[test]
        fn positive_timeout_maps_to_duration() {
            let cfg = SessionConfig {
                connect_timeout_secs: 12,
                worker_threads: 1,
                own_executor: true,
            };
            assert_eq!(cfg.connect_timeout(), Some(Duration::from_secs(12)));
        }
    }
}
