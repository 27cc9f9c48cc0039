//! Transport session
//!
//! A [`Session`] owns the transport connection and the channel/timing
//! settings of one bridge instance. It is opened once when a node is
//! initialized and reused for every call until the node shuts down.
//!
//! Calls on a session are strictly sequential: [`Session::begin_call`] hands
//! out a guard, and a second call while the guard is alive is rejected with
//! `Error::CallInProgress`. Dropping the guard returns the session to
//! [`CallState::Idle`] on every path, including errors raised by converters.

use crate::config::{ConnectionConfig, Timing};
use crate::listener::{self, ListenerHandle};
use crate::transport::{self, PubSubTransport};
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Bridge call state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallState {
    /// No listener armed, no reply pending
    Idle = 0,
    /// Request is being published (filter mode only)
    Publishing = 1,
    /// Listener armed, waiting for a reply or the deadline
    Waiting = 2,
    /// Reply received, being converted
    Delivered = 3,
    /// Deadline passed, timeout policy being applied
    TimedOut = 4,
    /// Call finished, about to return to idle
    Done = 5,
}

impl CallState {
    /// Convert from u8 (for atomic storage)
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => CallState::Idle,
            1 => CallState::Publishing,
            2 => CallState::Waiting,
            3 => CallState::Delivered,
            4 => CallState::TimedOut,
            5 => CallState::Done,
            _ => CallState::Idle,
        }
    }

    /// Convert to string for logging/display
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Publishing => "publishing",
            CallState::Waiting => "waiting",
            CallState::Delivered => "delivered",
            CallState::TimedOut => "timed_out",
            CallState::Done => "done",
        }
    }
}

/// Channel names of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channels {
    /// Outbound channel; `None` for wait-only (reader) sessions
    pub channel_out: Option<String>,
    /// Inbound channel pattern; empty for outbound-only sessions
    pub channel_in: String,
}

impl Channels {
    /// Request/response channels
    pub fn request_response(channel_out: impl Into<String>, channel_in: impl Into<String>) -> Self {
        Self {
            channel_out: Some(channel_out.into()),
            channel_in: channel_in.into(),
        }
    }

    /// Inbound-only channel
    pub fn inbound(channel_in: impl Into<String>) -> Self {
        Self {
            channel_out: None,
            channel_in: channel_in.into(),
        }
    }

    /// Outbound-only channel (broadcast writers never listen)
    pub fn outbound(channel_out: impl Into<String>) -> Self {
        Self {
            channel_out: Some(channel_out.into()),
            channel_in: String::new(),
        }
    }
}

/// One bridge instance's connection and settings
pub struct Session {
    transport: Arc<dyn PubSubTransport>,
    channels: Channels,
    timing: Timing,
    state: AtomicU8,
    in_flight: AtomicBool,
    active_listeners: Arc<AtomicUsize>,
    owns_transport: bool,
    closed: AtomicBool,
}

impl Session {
    /// Connect to the pub/sub service and create a session
    ///
    /// # Errors
    ///
    /// * `Error::Connection` - Service unreachable (not retried)
    pub async fn open(connection: &ConnectionConfig, channels: Channels, timing: Timing) -> Result<Self> {
        let transport = transport::connect(connection).await?;
        let mut session = Self::with_transport(transport, channels, timing);
        session.owns_transport = true;
        Ok(session)
    }

    /// Create a session on an already connected transport
    ///
    /// The transport stays open when the session is closed; it belongs to
    /// the caller.
    pub fn with_transport(transport: Arc<dyn PubSubTransport>, channels: Channels, timing: Timing) -> Self {
        tracing::debug!(
            "Session on {} (out={:?}, in='{}', timeout={:?}, sleep={:?})",
            transport.endpoint(),
            channels.channel_out,
            channels.channel_in,
            timing.timeout,
            timing.sleep_time
        );
        Self {
            transport,
            channels,
            timing,
            state: AtomicU8::new(CallState::Idle as u8),
            in_flight: AtomicBool::new(false),
            active_listeners: Arc::new(AtomicUsize::new(0)),
            owns_transport: false,
            closed: AtomicBool::new(false),
        }
    }

    /// Channel settings
    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    /// Timing settings
    pub fn timing(&self) -> Timing {
        self.timing
    }

    /// Transport endpoint description
    pub fn endpoint(&self) -> String {
        self.transport.endpoint()
    }

    /// Current call state
    pub fn state(&self) -> CallState {
        CallState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: CallState) {
        tracing::trace!("Session on '{}' -> {}", self.channels.channel_in, state.as_str());
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether a listener task is still holding a subscription
    pub fn listener_active(&self) -> bool {
        self.active_listeners.load(Ordering::Acquire) > 0
    }

    /// Whether `close()` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reserve the session for one call
    ///
    /// # Errors
    ///
    /// * `Error::Transport` - Session already closed
    /// * `Error::CallInProgress` - Another call holds the session
    pub fn begin_call(&self) -> Result<CallGuard<'_>> {
        if self.is_closed() {
            return Err(Error::Transport(format!(
                "Session for channel '{}' is closed",
                self.channels.channel_in
            )));
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::CallInProgress(self.channels.channel_in.clone()));
        }
        Ok(CallGuard { session: self })
    }

    /// Subscribe to the inbound channel and start a listener task
    pub(crate) async fn arm_listener(&self) -> Result<ListenerHandle> {
        if self.channels.channel_in.is_empty() {
            return Err(Error::ConfigError(
                "Session has no inbound channel to listen on".into(),
            ));
        }
        listener::arm(
            Arc::clone(&self.transport),
            &self.channels.channel_in,
            Arc::clone(&self.active_listeners),
        )
        .await
    }

    /// Publish on the outbound channel
    pub(crate) async fn publish(&self, payload: Bytes) -> Result<usize> {
        let channel = self.channels.channel_out.as_deref().ok_or_else(|| {
            Error::ConfigError(format!(
                "Session for channel '{}' has no outbound channel",
                self.channels.channel_in
            ))
        })?;
        self.transport.publish(channel, payload).await
    }

    /// Release the connection
    ///
    /// Idempotent; later calls are rejected.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!("Closing session on {}", self.transport.endpoint());
        if self.owns_transport {
            self.transport.close().await?;
        }
        Ok(())
    }
}

/// Exclusive hold on a session for the duration of one call
pub struct CallGuard<'a> {
    session: &'a Session,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.session.set_state(CallState::Idle);
        self.session.in_flight.store(false, Ordering::Release);
    }
}
