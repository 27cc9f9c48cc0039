//! Bridge call state machine
//!
//! ```text
//! IDLE -> PUBLISHING (filter only) -> WAITING -> DELIVERED | TIMED_OUT -> DONE -> IDLE
//! ```
//!
//! A call arms the listener first and only then publishes, so the reply can
//! never be published before the subscription exists. The wait is a
//! deadline-aware receive on the listener's one-shot slot, stepped at the
//! session's `sleep_time`. On timeout the listener is cancelled and its
//! subscription released before the timeout policy is applied.

use crate::converters::{ConverterOutput, ReaderConverter, ResponseConverter};
use crate::data::DataItem;
use crate::listener::ListenerHandle;
use crate::policy::{FilterTimeoutAction, ReaderTimeoutAction};
use crate::session::{CallState, Session};
use crate::transport::Message;
use crate::Result;
use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;

/// Result of one bridge call, before conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// A reply arrived before the deadline
    Delivered {
        /// Raw reply payload
        payload: Bytes,
        /// Time from the start of the wait to the reply
        elapsed: Duration,
    },
    /// The deadline passed without a reply
    TimedOut {
        /// Time spent waiting
        elapsed: Duration,
    },
}

impl CallOutcome {
    /// Raw payload, if delivered
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            CallOutcome::Delivered { payload, .. } => Some(payload),
            CallOutcome::TimedOut { .. } => None,
        }
    }

    /// Time spent waiting
    pub fn elapsed(&self) -> Duration {
        match self {
            CallOutcome::Delivered { elapsed, .. } | CallOutcome::TimedOut { elapsed } => *elapsed,
        }
    }
}

/// Wait on the listener until it fires or the session deadline passes
///
/// Returns `None` on timeout. The listener is left armed either way.
async fn wait_for_reply(
    session: &Session,
    listener: &mut ListenerHandle,
) -> (Option<Result<Message>>, Duration) {
    let timing = session.timing();
    let start = Instant::now();
    // A deadline past the clock's range means no deadline
    let deadline = timing.timeout.and_then(|timeout| start.checked_add(timeout));

    loop {
        let step = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return (None, start.elapsed());
                }
                (deadline - now).min(timing.sleep_time)
            }
            None => timing.sleep_time,
        };

        if let Some(reply) = listener.wait_for(step).await {
            return (Some(reply), start.elapsed());
        }
    }
}

/// Run one full call on the session
///
/// With `Some(request)` the payload is published on the session's outbound
/// channel once the listener is armed (filter mode); with `None` the call only
/// waits (reader mode).
///
/// # Errors
///
/// * `Error::CallInProgress` - Another call holds the session
/// * `Error::Transport` - Subscribe or publish failed
/// * `Error::ListenerTerminated` - The subscription ended without a reply
pub async fn call(session: &Session, request: Option<Bytes>) -> Result<CallOutcome> {
    let _guard = session.begin_call()?;
    let mut listener = session.arm_listener().await?;

    if let Some(request) = request {
        session.set_state(CallState::Publishing);
        let size = request.len();
        if let Err(e) = session.publish(request).await {
            listener.cancel().await;
            return Err(e);
        }
        tracing::debug!(
            "Published {} byte(s) on '{}'",
            size,
            session.channels().channel_out.as_deref().unwrap_or_default()
        );
    }

    session.set_state(CallState::Waiting);
    let (reply, elapsed) = wait_for_reply(session, &mut listener).await;
    // Teardown on every path; a no-op when the listener already fired
    listener.cancel().await;

    let outcome = match reply {
        Some(Ok(message)) => {
            session.set_state(CallState::Delivered);
            tracing::info!("Round trip time: {:.6} sec", elapsed.as_secs_f64());
            CallOutcome::Delivered {
                payload: message.payload,
                elapsed,
            }
        }
        Some(Err(e)) => return Err(e),
        None => {
            session.set_state(CallState::TimedOut);
            tracing::info!("Timeout reached!");
            CallOutcome::TimedOut { elapsed }
        }
    };

    session.set_state(CallState::Done);
    Ok(outcome)
}

/// Send one item and convert the reply
///
/// On timeout the policy decides: `Drop` yields nothing, `PassThrough`
/// yields the original item unchanged.
pub async fn request(
    session: &Session,
    converter: &dyn ResponseConverter,
    action: FilterTimeoutAction,
    item: &DataItem,
) -> Result<ConverterOutput> {
    match call(session, Some(item.data.clone())).await? {
        CallOutcome::Delivered { payload, .. } => converter.convert(item, &payload),
        CallOutcome::TimedOut { .. } => Ok(match action {
            FilterTimeoutAction::Drop => ConverterOutput::Empty,
            FilterTimeoutAction::PassThrough => ConverterOutput::Single(item.clone()),
        }),
    }
}

/// Send a batch item by item, strictly in order, flattening the results
///
/// A converter failure aborts the rest of the batch; the session stays usable.
pub async fn request_batch(
    session: &Session,
    converter: &dyn ResponseConverter,
    action: FilterTimeoutAction,
    items: &[DataItem],
) -> Result<Vec<DataItem>> {
    let mut results = Vec::with_capacity(items.len());
    for item in items {
        results.extend(request(session, converter, action, item).await?);
    }
    Ok(results)
}

/// Wait for the next inbound payload (reader mode)
///
/// With `KeepWaiting` the same listener stays armed across deadlines, so a
/// payload published between two deadlines is not lost. `Stop` ends with
/// `Ok(None)`.
pub async fn receive(session: &Session, action: ReaderTimeoutAction) -> Result<Option<Bytes>> {
    let _guard = session.begin_call()?;
    let mut listener = session.arm_listener().await?;
    session.set_state(CallState::Waiting);

    let mut waited = Duration::ZERO;
    loop {
        let (reply, elapsed) = wait_for_reply(session, &mut listener).await;
        waited += elapsed;

        match reply {
            Some(Ok(message)) => {
                listener.cancel().await;
                session.set_state(CallState::Delivered);
                tracing::debug!("Wait time: {:.6} sec", waited.as_secs_f64());
                session.set_state(CallState::Done);
                return Ok(Some(message.payload));
            }
            Some(Err(e)) => {
                listener.cancel().await;
                return Err(e);
            }
            None => {
                session.set_state(CallState::TimedOut);
                tracing::info!("Timeout reached!");
                match action {
                    ReaderTimeoutAction::KeepWaiting => {
                        session.set_state(CallState::Waiting);
                    }
                    ReaderTimeoutAction::Stop => {
                        listener.cancel().await;
                        session.set_state(CallState::Done);
                        return Ok(None);
                    }
                }
            }
        }
    }
}

/// Wait for the next payload and convert it (reader mode)
///
/// `Ok(None)` marks the end of the stream.
pub async fn receive_converted(
    session: &Session,
    converter: &mut dyn ReaderConverter,
    action: ReaderTimeoutAction,
) -> Result<Option<ConverterOutput>> {
    match receive(session, action).await? {
        Some(payload) => converter.convert(&payload).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timing;
    use crate::session::Channels;
    use crate::transport::{InMemoryTransport, PubSubTransport, Subscription};
    use crate::Error;
    use std::sync::Arc;

    fn session(transport: &InMemoryTransport, timeout: f64) -> Session {
        Session::with_transport(
            Arc::new(transport.clone()),
            Channels::request_response("images", "predictions"),
            Timing::new(timeout, 0.01),
        )
    }

    /// Answers every request on "images" with `reply` after `delay`
    async fn spawn_echo(transport: &InMemoryTransport, reply: &'static [u8], delay: Duration) {
        let transport = transport.clone();
        let mut requests = transport.subscribe("images").await.unwrap();
        tokio::spawn(async move {
            while let Ok(Some(_)) = requests.next_message().await {
                tokio::time::sleep(delay).await;
                let _ = transport
                    .publish("predictions", Bytes::from_static(reply))
                    .await;
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_before_deadline() {
        let transport = InMemoryTransport::new();
        let mut requests = transport.subscribe("images").await.unwrap();
        let session = session(&transport, 0.2);

        let responder = {
            let transport = transport.clone();
            tokio::spawn(async move {
                let request = requests.next_message().await.unwrap().unwrap();
                assert_eq!(request.payload, Bytes::from_static(b"img"));
                tokio::time::sleep(Duration::from_millis(50)).await;
                transport
                    .publish("predictions", Bytes::from_static(b"reply"))
                    .await
                    .unwrap();
            })
        };

        let outcome = call(&session, Some(Bytes::from_static(b"img"))).await.unwrap();
        responder.await.unwrap();

        assert_eq!(outcome.payload(), Some(&Bytes::from_static(b"reply")));
        assert!(outcome.elapsed() >= Duration::from_millis(50));
        assert!(outcome.elapsed() < Duration::from_millis(200));
        assert!(!session.listener_active());
        assert_eq!(session.state(), CallState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_elapsed_within_one_step() {
        let transport = InMemoryTransport::new();
        let session = session(&transport, 0.2);

        let outcome = call(&session, Some(Bytes::from_static(b"img"))).await.unwrap();

        match outcome {
            CallOutcome::TimedOut { elapsed } => {
                assert!(elapsed >= Duration::from_millis(200));
                assert!(elapsed <= Duration::from_millis(210));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(!session.listener_active());
        assert_eq!(transport.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_not_seen_by_next_call() {
        let transport = InMemoryTransport::new();
        let session = session(&transport, 0.05);

        let first = call(&session, Some(Bytes::from_static(b"one"))).await.unwrap();
        assert!(matches!(first, CallOutcome::TimedOut { .. }));

        // Reply to the first request arrives between calls
        transport
            .publish("predictions", Bytes::from_static(b"stale"))
            .await
            .unwrap();

        spawn_echo(&transport, b"fresh", Duration::from_millis(5)).await;

        let second = call(&session, Some(Bytes::from_static(b"two"))).await.unwrap();
        assert_eq!(second.payload(), Some(&Bytes::from_static(b"fresh")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_beyond_clock_range_waits_for_reply() {
        let transport = InMemoryTransport::new();
        let session = session(&transport, 1e18);
        assert!(session.timing().timeout.is_some());

        spawn_echo(&transport, b"late but fine", Duration::from_millis(20)).await;

        let outcome = call(&session, Some(Bytes::from_static(b"img"))).await.unwrap();
        assert_eq!(outcome.payload(), Some(&Bytes::from_static(b"late but fine")));
        assert_eq!(session.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_publish_failure_releases_listener() {
        let transport = InMemoryTransport::new();
        let session = Session::with_transport(
            Arc::new(transport.clone()),
            Channels::inbound("predictions"),
            Timing::new(0.1, 0.01),
        );

        let result = call(&session, Some(Bytes::from_static(b"img"))).await;
        assert!(matches!(result, Err(Error::ConfigError(_))));
        assert!(!session.listener_active());
        assert_eq!(session.state(), CallState::Idle);
        assert_eq!(transport.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_stop_ends() {
        let transport = InMemoryTransport::new();
        let session = Session::with_transport(
            Arc::new(transport.clone()),
            Channels::inbound("data_in"),
            Timing::new(0.1, 0.01),
        );

        let received = receive(&session, ReaderTimeoutAction::Stop).await.unwrap();
        assert!(received.is_none());
        assert!(!session.listener_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_keep_waiting_spans_deadlines() {
        let transport = InMemoryTransport::new();
        let session = Session::with_transport(
            Arc::new(transport.clone()),
            Channels::inbound("data_in"),
            Timing::new(0.1, 0.01),
        );

        let publisher = {
            let transport = transport.clone();
            tokio::spawn(async move {
                // Three deadlines pass before the payload shows up
                tokio::time::sleep(Duration::from_millis(350)).await;
                transport
                    .publish("data_in", Bytes::from_static(b"late"))
                    .await
                    .unwrap();
            })
        };

        let received = receive(&session, ReaderTimeoutAction::KeepWaiting)
            .await
            .unwrap();
        publisher.await.unwrap();
        assert_eq!(received, Some(Bytes::from_static(b"late")));
    }
}
