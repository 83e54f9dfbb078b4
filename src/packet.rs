/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! The payload of an S101 "ember payload" frame: a flags byte, a DTD
//! byte, an application-bytes block, and the BER fragment itself. This
//! type is referenced by the teacher's `s101.rs`/`com.rs` but never
//! defined there; it is built fresh here against spec.md §3/§4.1.

use crate::{
    error::{EmberError, EmberResult},
    glow::{GLOW_VERSION_MAJOR, GLOW_VERSION_MINOR},
    s101::Flags,
};

/// The only DTD Glow ever defines on the wire.
pub const GLOW_DTD: u8 = 0x01;

/// Maximum BER payload carried by a single physical frame; larger
/// Ember messages are split across multiple frames.
pub const MAX_PAYLOAD_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmberPacket {
    flags: Flags,
    dtd: u8,
    app_bytes: Vec<u8>,
    payload: Vec<u8>,
}

impl EmberPacket {
    pub fn new(flags: Flags, payload: Vec<u8>) -> Self {
        EmberPacket {
            flags,
            dtd: GLOW_DTD,
            app_bytes: vec![GLOW_VERSION_MAJOR, GLOW_VERSION_MINOR],
            payload,
        }
    }

    pub fn flag(&self) -> Flags {
        self.flags
    }

    pub fn set_flag(&mut self, flags: Flags) {
        self.flags = flags;
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn len(&self) -> usize {
        1 + 1 + 1 + self.app_bytes.len() + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn to_bytes(&self, buf: &mut [u8]) {
        if buf.len() < self.len() {
            panic!("insufficient buffer size");
        }
        buf[0] = self.flags as u8;
        buf[1] = self.dtd;
        buf[2] = self.app_bytes.len() as u8;
        let app_end = 3 + self.app_bytes.len();
        buf[3..app_end].copy_from_slice(&self.app_bytes);
        buf[app_end..app_end + self.payload.len()].copy_from_slice(&self.payload);
    }

    pub fn from_bytes(buf: &[u8]) -> EmberResult<Self> {
        if buf.len() < 3 {
            return Err(EmberError::Deserialization(
                "ember packet shorter than its fixed header".to_owned(),
            ));
        }
        let flags = Flags::try_from(buf[0] as i32)?;
        let dtd = buf[1];
        let app_len = buf[2] as usize;
        let app_end = 3 + app_len;
        if buf.len() < app_end {
            return Err(EmberError::Deserialization(
                "ember packet truncated in application-bytes block".to_owned(),
            ));
        }
        let app_bytes = buf[3..app_end].to_vec();
        let payload = buf[app_end..].to_vec();
        Ok(EmberPacket {
            flags,
            dtd,
            app_bytes,
            payload,
        })
    }

    /// Splits a complete Ember message's BER bytes into the sequence
    /// of packets needed to carry it, each capped at
    /// [`MAX_PAYLOAD_LEN`], tagged with first/middle/last/single flags.
    pub fn packetize(message: &[u8]) -> Vec<EmberPacket> {
        if message.is_empty() {
            return vec![EmberPacket::new(Flags::EmptyPacket, Vec::new())];
        }

        let chunks: Vec<&[u8]> = message.chunks(MAX_PAYLOAD_LEN).collect();
        let last_index = chunks.len() - 1;

        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let flags = match (i == 0, i == last_index) {
                    (true, true) => Flags::SinglePacket,
                    (true, false) => Flags::MultiPacketFirst,
                    (false, true) => Flags::MultiPacketLast,
                    (false, false) => Flags::MultiPacket,
                };
                EmberPacket::new(flags, chunk.to_vec())
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let packet = EmberPacket::new(Flags::SinglePacket, vec![1, 2, 3, 4]);
        let mut buf = vec![0u8; packet.len()];
        packet.to_bytes(&mut buf);
        let decoded = EmberPacket::from_bytes(&buf).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn packetize_single_chunk_is_single_packet() {
        let packets = EmberPacket::packetize(&[0u8; 10]);
        assert_eq!(1, packets.len());
        assert_eq!(Flags::SinglePacket, packets[0].flag());
    }

    #[test]
    fn packetize_splits_oversized_payload() {
        let message = vec![0xABu8; MAX_PAYLOAD_LEN * 2 + 500];
        let packets = EmberPacket::packetize(&message);
        assert_eq!(3, packets.len());
        assert_eq!(Flags::MultiPacketFirst, packets[0].flag());
        assert_eq!(Flags::MultiPacket, packets[1].flag());
        assert_eq!(Flags::MultiPacketLast, packets[2].flag());

        let reassembled: Vec<u8> = packets.iter().flat_map(|p| p.payload().to_vec()).collect();
        assert_eq!(message, reassembled);
    }

    #[test]
    fn packetize_empty_message_is_empty_packet() {
        let packets = EmberPacket::packetize(&[]);
        assert_eq!(1, packets.len());
        assert_eq!(Flags::EmptyPacket, packets[0].flag());
    }
}
