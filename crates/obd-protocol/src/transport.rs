//! Frame Transport
//!
//! The seam between the OBD-II engine and whatever moves frames on the
//! physical bus (SocketCAN, a serial adapter, an SPI controller, a test
//! double). A transport sends one frame and waits a bounded time for one
//! frame; it never filters by identifier and never queues more than the
//! frame it hands back.

use crate::error::TransportError;
use crate::frame::CanFrame;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Default re-check interval for register-polled controllers
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Send/receive single CAN frames on one bus
#[async_trait]
pub trait CanTransport: Send {
    /// Whether the bus controller has been brought up
    fn is_ready(&self) -> bool;

    /// Transmit one frame.
    ///
    /// Fails with `NotReady` before initialization and `Rejected` when the
    /// controller reports a transmit failure.
    async fn send(&mut self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Wait up to `timeout` for any frame.
    ///
    /// Returns at most one frame per call. If several frames are already
    /// pending when the controller is checked, only the most recent one is
    /// returned and the older ones are lost.
    async fn receive(&mut self, timeout: Duration) -> Result<CanFrame, TransportError>;
}

#[async_trait]
impl<T: CanTransport + ?Sized> CanTransport for Box<T> {
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    async fn send(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        (**self).send(frame).await
    }

    async fn receive(&mut self, timeout: Duration) -> Result<CanFrame, TransportError> {
        (**self).receive(timeout).await
    }
}

/// A controller whose receive side can only be checked, not awaited
pub trait FramePoller: Send {
    /// Non-blocking check of the controller's receive slot
    fn poll_frame(&mut self) -> Result<Option<CanFrame>, TransportError>;
}

/// Re-check `poller` every `interval` until a frame shows up or `timeout` elapses
pub async fn poll_receive<P: FramePoller + ?Sized>(
    poller: &mut P,
    timeout: Duration,
    interval: Duration,
) -> Result<CanFrame, TransportError> {
    let deadline = Instant::now()
        .checked_add(timeout)
        .ok_or(TransportError::InvalidTimeout(timeout))?;

    loop {
        if let Some(frame) = poller.poll_frame()? {
            return Ok(frame);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(TransportError::Timeout(timeout.as_millis() as u64));
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
