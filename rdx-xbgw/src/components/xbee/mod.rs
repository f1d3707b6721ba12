//! Event managers for the XBee radio network.
//!
//! [`XBeeEventManager`] handles explicit-addressing traffic: serial data, I/O
//! samples and transmit status. [`DdoEventManager`] handles remote AT (DDO)
//! commands. Both sit on a [`RadioLink`](crate::radio::RadioLink) and are
//! driven by the dispatcher.

mod address;
mod ddo;
mod filter;
mod io_sample;
mod manager;
mod tx;

pub use address::{AddressError, XBeeAddress};
pub use ddo::{DdoEventManager, DDO_ERRORS};
pub use filter::SampleFilter;
pub use io_sample::{IoSample, SampleError};
pub use manager::{XBeeEventManager, XBeeSettings, XBEE_ERRORS};
pub use tx::{InvalidTxId, SlotsFull, TxStatusSlots};

use crate::radio::{DdoAddress, ExplicitAddress, Frame};

pub const DEFAULT_ENDPOINT: u8 = 0xe8;
pub const DIGI_PROFILE: u16 = 0xc105;
pub const SERIAL_CLUSTER: u16 = 0x11;
pub const IO_CLUSTER: u16 = 0x92;
pub const TX_STATUS_CLUSTER: u16 = 0x8b;

/// DDO option asking the remote radio to apply a setting immediately.
pub const DDO_OPT_APPLY: u8 = 0x02;

/// Status codes reported for DDO commands.
pub mod ddo_status {
    pub const OK: u8 = 0;
    pub const ERROR: u8 = 1;
    pub const BAD_COMMAND: u8 = 2;
    pub const BAD_PARAMETER: u8 = 3;
    pub const TX_FAILURE: u8 = 4;
}

fn explicit(node: XBeeAddress, cluster: u16, tx_id: u8, data: Vec<u8>) -> Frame {
    Frame::Explicit {
        address: ExplicitAddress {
            node,
            endpoint: DEFAULT_ENDPOINT,
            profile: DIGI_PROFILE,
            cluster,
            options: 0,
            tx_id,
        },
        data,
    }
}

/// A serial data frame, as received from or sent to `node`.
pub fn serial_frame(node: XBeeAddress, data: impl Into<Vec<u8>>) -> Frame {
    explicit(node, SERIAL_CLUSTER, 0, data.into())
}

/// An I/O sample frame from `node`, in the series 2 layout.
pub fn io_sample_frame(node: XBeeAddress, sample: &IoSample) -> Frame {
    explicit(node, IO_CLUSTER, 0, sample.encode())
}

/// A transmit status frame for `tx_id`. A `delivery_status` of 0 is success.
pub fn tx_status_frame(node: XBeeAddress, tx_id: u8, delivery_status: u8) -> Frame {
    // Frame type, frame id, 16-bit destination, retries, delivery, discovery.
    let data = vec![0x8b, tx_id, 0xff, 0xfe, 0, delivery_status, 0];
    explicit(node, TX_STATUS_CLUSTER, tx_id, data)
}

/// The answer to a DDO command, as the radio reports it.
pub fn ddo_status_frame(node: XBeeAddress, command: &str, tx_id: u8, status: u8) -> Frame {
    Frame::Ddo {
        address: DdoAddress {
            node,
            command: command.to_string(),
            options: 0,
            tx_id,
            status,
        },
        data: Vec::new(),
    }
}

/// Builds the frame that acknowledges `sent`, for simulated peers.
///
/// Serial transmissions get a transmit status, DDO commands a DDO status.
/// Frames sent without a transmit id get nothing.
pub fn acknowledge(sent: &Frame, status: u8) -> Option<Frame> {
    match sent {
        Frame::Explicit { address, .. } if address.tx_id != 0 => {
            Some(tx_status_frame(address.node, address.tx_id, status))
        }
        Frame::Ddo { address, .. } if address.tx_id != 0 => Some(ddo_status_frame(
            address.node,
            &address.command,
            address.tx_id,
            status,
        )),
        _ => None,
    }
}
