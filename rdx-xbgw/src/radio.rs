//! The radio transport seen by the XBee event managers.
//!
//! The physical transport is external to the gateway. Managers only see a
//! [`RadioLink`]: a non-blocking, datagram-style link carrying [`Frame`]s. The
//! in-memory [`ChannelRadio`] implements it for simulation and tests, with a
//! [`RadioPeer`] playing the part of the remote radios.

use crate::components::xbee::XBeeAddress;
use crate::dispatcher::Readiness;
use crate::error::RadioError;
use crate::reactor::Waker;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Addressing of an explicit (endpoint/profile/cluster) radio frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplicitAddress {
    pub node: XBeeAddress,
    pub endpoint: u8,
    pub profile: u16,
    pub cluster: u16,
    pub options: u8,
    pub tx_id: u8,
}

impl fmt::Display for ExplicitAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "('{}', {:#x}, {:#x}, {:#x}",
            self.node, self.endpoint, self.profile, self.cluster
        )?;
        if self.options != 0 || self.tx_id != 0 {
            write!(f, ", {:#x}, {:#x}", self.options, self.tx_id)?;
        }
        f.write_str(")")
    }
}

/// Addressing of a DDO (remote AT command) frame.
///
/// `status` is only meaningful on frames received from the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdoAddress {
    pub node: XBeeAddress,
    pub command: String,
    pub options: u8,
    pub tx_id: u8,
    pub status: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Explicit {
        address: ExplicitAddress,
        data: Vec<u8>,
    },
    Ddo {
        address: DdoAddress,
        data: Vec<u8>,
    },
}

/// A non-blocking link to the radio network.
pub trait RadioLink: Send {
    /// Reports whether a frame is waiting and whether a send would succeed.
    fn poll_ready(&mut self) -> Readiness;

    /// Hands the link the dispatcher's waker, to call when frames arrive.
    fn attach(&mut self, waker: Waker);

    /// Takes the next received frame, if any. Never blocks.
    fn recv_frame(&mut self) -> Result<Option<Frame>, RadioError>;

    /// Sends a frame, failing with [`RadioError::Unavailable`] rather than
    /// blocking when the link is busy.
    fn send_frame(&mut self, frame: Frame) -> Result<(), RadioError>;
}

#[derive(Default)]
struct LinkShared {
    writable: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

/// Held by every [`RadioPeer`] clone. Dropping the last one wakes the link's
/// dispatcher so it notices the closed link.
struct PeerToken(Arc<LinkShared>);

impl Drop for PeerToken {
    fn drop(&mut self) {
        if let Some(waker) = self.0.waker.lock().as_ref() {
            waker.wake();
        }
    }
}

/// An in-memory [`RadioLink`] backed by crossbeam channels.
pub struct ChannelRadio {
    inbound: Receiver<Frame>,
    outbound: Sender<Frame>,
    shared: Arc<LinkShared>,
    peers: Weak<PeerToken>,
}

impl ChannelRadio {
    /// True once every peer is gone. Frames already injected can still be read.
    pub fn is_closed(&self) -> bool {
        self.peers.strong_count() == 0
    }
}

/// The far end of a [`ChannelRadio`]: injects received frames and observes
/// sent ones.
#[derive(Clone)]
pub struct RadioPeer {
    inbound: Sender<Frame>,
    outbound: Receiver<Frame>,
    shared: Arc<LinkShared>,
    // Dropped after `inbound`, so a closed link always reads as disconnected.
    token: Arc<PeerToken>,
}

/// Creates a connected in-memory link and its peer. The link starts writable.
pub fn channel_radio() -> (ChannelRadio, RadioPeer) {
    let (in_tx, in_rx) = crossbeam_channel::unbounded();
    let (out_tx, out_rx) = crossbeam_channel::unbounded();
    let shared = Arc::new(LinkShared {
        writable: AtomicBool::new(true),
        waker: Mutex::new(None),
    });
    let token = Arc::new(PeerToken(shared.clone()));
    (
        ChannelRadio {
            inbound: in_rx,
            outbound: out_tx,
            shared: shared.clone(),
            peers: Arc::downgrade(&token),
        },
        RadioPeer {
            inbound: in_tx,
            outbound: out_rx,
            shared,
            token,
        },
    )
}

impl RadioLink for ChannelRadio {
    fn poll_ready(&mut self) -> Readiness {
        // A closed link is readable so the reader sees `RadioError::Closed`.
        Readiness {
            readable: !self.inbound.is_empty() || self.is_closed(),
            writable: self.shared.writable.load(Ordering::Acquire),
        }
    }

    fn attach(&mut self, waker: Waker) {
        let pending = !self.inbound.is_empty() || self.is_closed();
        *self.shared.waker.lock() = Some(waker.clone());
        if pending {
            waker.wake();
        }
    }

    fn recv_frame(&mut self) -> Result<Option<Frame>, RadioError> {
        match self.inbound.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(RadioError::Closed),
        }
    }

    fn send_frame(&mut self, frame: Frame) -> Result<(), RadioError> {
        if !self.shared.writable.load(Ordering::Acquire) {
            return Err(RadioError::Unavailable);
        }
        self.outbound.send(frame).map_err(|_| RadioError::Closed)
    }
}

impl RadioPeer {
    /// Delivers a frame to the gateway side and wakes its dispatcher.
    pub fn inject(&self, frame: Frame) -> Result<(), RadioError> {
        self.inbound.send(frame).map_err(|_| RadioError::Closed)?;
        if let Some(waker) = self.shared.waker.lock().as_ref() {
            waker.wake();
        }
        Ok(())
    }

    pub fn set_writable(&self, writable: bool) {
        self.shared.writable.store(writable, Ordering::Release);
    }

    pub fn try_recv_sent(&self) -> Option<Frame> {
        self.outbound.try_recv().ok()
    }

    /// Waits up to `timeout` for the gateway to send a frame.
    pub fn recv_sent_timeout(&self, timeout: Duration) -> Option<Frame> {
        match self.outbound.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Every frame sent so far and not yet taken.
    pub fn sent(&self) -> Vec<Frame> {
        self.outbound.try_iter().collect()
    }
}
