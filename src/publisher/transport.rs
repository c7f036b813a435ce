//! Transport collaborator.
//!
//! The publisher only needs "send this message within this timeout". The
//! in-process [`ChannelTransport`] carries encoded messages to a coordinator
//! over a bounded crossbeam channel and can be switched off to simulate a
//! network outage.

use crate::error::{ArbiterError, Result};
use crate::publisher::message::OutboundMessage;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default depth of the in-process link
pub const DEFAULT_LINK_CAPACITY: usize = 1024;

/// Delivers encoded messages to the coordinator
pub trait Transport: Send + Sync {
    /// Deliver one message, giving up after `timeout`
    fn send(&self, message: &OutboundMessage, timeout: Duration) -> Result<()>;

    /// Cheap link check; delivery may still fail while this returns true
    fn is_connected(&self) -> bool {
        true
    }
}

/// Switch shared between a [`ChannelTransport`] and whoever simulates outages
#[derive(Debug, Clone)]
pub struct LinkSwitch(Arc<AtomicBool>);

impl LinkSwitch {
    pub fn set_connected(&self, connected: bool) {
        let was = self.0.swap(connected, Ordering::SeqCst);
        if was != connected {
            tracing::info!("Link {}", if connected { "restored" } else { "down" });
        }
    }

    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounded in-process link to a coordinator
pub struct ChannelTransport {
    tx: Sender<Vec<u8>>,
    link: LinkSwitch,
    sent: AtomicU64,
}

impl ChannelTransport {
    /// Create a transport and the receiving end for the coordinator
    pub fn new(capacity: usize) -> (Self, Receiver<Vec<u8>>) {
        let (tx, rx) = bounded(capacity);
        let transport = Self {
            tx,
            link: LinkSwitch(Arc::new(AtomicBool::new(true))),
            sent: AtomicU64::new(0),
        };
        (transport, rx)
    }

    pub fn link(&self) -> LinkSwitch {
        self.link.clone()
    }

    /// Messages accepted by the link so far
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, message: &OutboundMessage, timeout: Duration) -> Result<()> {
        if !self.link.is_connected() {
            return Err(ArbiterError::TransportFailure("link down".to_string()));
        }
        let bytes = message.encode()?;
        match self.tx.send_timeout(bytes, timeout) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => Err(ArbiterError::Timeout(format!(
                "link full for {} ms",
                timeout.as_millis()
            ))),
            Err(SendTimeoutError::Disconnected(_)) => Err(ArbiterError::TransportFailure(
                "coordinator disconnected".to_string(),
            )),
        }
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }
}
