//! Types and wire format shared by the synchronization server and its clients.
//!
//! Both directions of the protocol carry the same frame layout: a 4-byte
//! big-endian payload length, a 4-byte big-endian record count, then that many
//! fixed-width [`ClientState`] records. See [`codec`] for the details.

use serde::{Deserialize, Serialize};

pub mod codec;

pub use codec::{
    decode_frame, decode_payload, encode_frame, read_frame, read_length_prefix, read_payload,
    CodecError, Frame, LENGTH_PREFIX_LEN, MAX_PAYLOAD_LEN, RECORD_COUNT_LEN, RECORD_LEN,
};

/// Identifier assigned by the server when a client connects.
///
/// Only positive values identify a client; zero and negatives never do.
pub type ClientId = i32;

/// Last-known movement state of one client.
///
/// Field order is the wire order of a record, so do not reorder.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct ClientState {
    pub id: ClientId,
    pub x: f64,
    pub y: f64,
    /// Movement accumulated since the state was last broadcast.
    pub delta: f64,
}

impl ClientState {
    pub fn new(id: ClientId, x: f64, y: f64) -> Self {
        Self {
            id,
            x,
            y,
            delta: 0.0,
        }
    }

    pub fn has_valid_id(&self) -> bool {
        self.id > 0
    }

    /// Folds a reported update into this state.
    ///
    /// Position is overwritten and delta is accumulated. The identifier of
    /// `self` is kept whatever the update carries.
    pub fn merge_update(&mut self, update: &ClientState) {
        self.x = update.x;
        self.y = update.y;
        self.delta += update.delta;
    }
}
