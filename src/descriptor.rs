//! Wire descriptors exchanged during the two-sided circuit handshake
//!
//! A [`PortDescriptor`] is a fixed-layout record of one port's buffer
//! geometry, flag addresses and role. It travels inside a
//! [`DescriptorMessage`] that adds a magic number, a version, the message
//! kind and the sender's byte order. Receivers on a host of the other byte
//! order swap every numeric field before use; the origin endpoint string is
//! raw bytes and is never swapped.
//!
//! Addresses are offsets inside the sender's endpoint region.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::buffer::{BufferMetaData, PortLayout};
use crate::constants::{DESCRIPTOR_MAGIC, DESCRIPTOR_VERSION, ENDPOINT_STRING_LEN, FLAG_WORD_SIZE};
use crate::error::{Result, TransportError};
use crate::port::{PortRole, RoleOptions};

/// Flag address that the receiver must not touch
pub const FLAG_ADDR_NONE: u64 = u64::MAX;

const LITTLE_ENDIAN: u8 = 0;
const BIG_ENDIAN: u8 = 1;

fn host_byte_order() -> u8 {
    if cfg!(target_endian = "big") {
        BIG_ENDIAN
    } else {
        LITTLE_ENDIAN
    }
}

/// Data the transport carries for the peer without interpreting it
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct OutOfBandData {
    /// Ordinal of the described port in its set
    pub port_id: u32,
    /// Valid bytes of `origin_endpoint`
    pub origin_len: u32,
    /// Opaque correlation value, echoed by the answering side
    pub cookie: u64,
    /// Endpoint address of the region the addresses refer to
    pub origin_endpoint: [u8; ENDPOINT_STRING_LEN],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PortDescriptor {
    pub buffer_count: u32,
    /// `PortRole` as its discriminant
    pub role: u32,
    /// `RoleOptions` bits
    pub option_bits: u32,
    pub _pad: u32,
    pub data_buffer_base_addr: u64,
    pub data_buffer_pitch: u64,
    pub data_buffer_size: u64,
    pub metadata_base_addr: u64,
    pub metadata_pitch: u64,
    pub full_flag_base_addr: u64,
    pub full_flag_size: u64,
    pub full_flag_pitch: u64,
    /// Mask of significant bits in full flag words
    pub full_flag_value: u64,
    pub empty_flag_base_addr: u64,
    pub empty_flag_size: u64,
    /// Bytes between consecutive buffers' drain lanes
    pub empty_flag_pitch: u64,
    /// Mask of significant bits in empty flag words
    pub empty_flag_value: u64,
    /// Shadow block the sender allocated for the receiver to write
    pub shadow_flag_base_addr: u64,
    pub shadow_flag_count: u64,
    pub oob: OutOfBandData,
}

const _: () = assert!(std::mem::size_of::<PortDescriptor>() == 136 + 16 + ENDPOINT_STRING_LEN);

impl PortDescriptor {
    pub fn role(&self) -> Result<PortRole> {
        PortRole::from_u32(self.role)
            .ok_or_else(|| TransportError::InvalidDescriptor(format!("unknown role {}", self.role)))
    }

    pub fn options(&self) -> RoleOptions {
        RoleOptions::from_bits(self.option_bits)
    }

    pub fn set_origin(&mut self, endpoint: &str) -> Result<()> {
        let bytes = endpoint.as_bytes();
        if bytes.len() > ENDPOINT_STRING_LEN {
            return Err(TransportError::InvalidDescriptor(format!(
                "endpoint '{}' longer than {} bytes",
                endpoint, ENDPOINT_STRING_LEN
            )));
        }
        self.oob.origin_endpoint = [0; ENDPOINT_STRING_LEN];
        self.oob.origin_endpoint[..bytes.len()].copy_from_slice(bytes);
        self.oob.origin_len = bytes.len() as u32;
        Ok(())
    }

    pub fn origin(&self) -> Result<&str> {
        let len = self.oob.origin_len as usize;
        if len == 0 || len > ENDPOINT_STRING_LEN {
            return Err(TransportError::InvalidDescriptor(format!(
                "origin endpoint length {}",
                len
            )));
        }
        std::str::from_utf8(&self.oob.origin_endpoint[..len])
            .map_err(|e| TransportError::InvalidDescriptor(format!("origin endpoint: {}", e)))
    }

    /// Shadow block advertised to the receiver, as (base, word count)
    pub fn shadow(&self) -> Option<(u64, usize)> {
        (self.shadow_flag_count > 0 && self.shadow_flag_base_addr != FLAG_ADDR_NONE)
            .then_some((self.shadow_flag_base_addr, self.shadow_flag_count as usize))
    }

    pub fn set_shadow(&mut self, base: usize, count: usize) {
        self.shadow_flag_base_addr = base as u64;
        self.shadow_flag_count = count as u64;
    }

    /// Rebuild and check the sender's buffer layout
    pub fn layout(&self) -> Result<PortLayout> {
        let invalid = |what: &str| TransportError::InvalidDescriptor(what.to_string());

        if self.empty_flag_pitch == 0 || self.empty_flag_pitch % FLAG_WORD_SIZE as u64 != 0 {
            return Err(invalid("empty flag pitch is not a whole number of words"));
        }
        let lanes = usize::try_from(self.empty_flag_pitch / FLAG_WORD_SIZE as u64)
            .map_err(|_| invalid("empty flag pitch out of range"))?;
        let buffer_size = usize::try_from(self.data_buffer_size)
            .map_err(|_| invalid("data buffer size out of range"))?;
        let layout = PortLayout::new(self.buffer_count as usize, buffer_size, lanes)
            .map_err(|e| TransportError::InvalidDescriptor(e.to_string()))?;

        if self.data_buffer_pitch != layout.data_pitch as u64 {
            return Err(invalid("data pitch does not match buffer size"));
        }
        if self.metadata_pitch != std::mem::size_of::<BufferMetaData>() as u64 {
            return Err(invalid("metadata pitch does not match metadata record"));
        }
        if self.full_flag_size != FLAG_WORD_SIZE as u64 || self.empty_flag_size != FLAG_WORD_SIZE as u64 {
            return Err(invalid("flag words must be 8 bytes"));
        }
        if self.full_flag_value != self.empty_flag_value {
            return Err(invalid("full and empty flag masks differ"));
        }

        let base = self.block_base(&layout)?;
        let expect = |addr: u64, offset: usize, what: &str| {
            let at = base.checked_add(offset).map(|a| a as u64);
            if addr == FLAG_ADDR_NONE || Some(addr) == at {
                Ok(())
            } else {
                Err(TransportError::InvalidDescriptor(format!(
                    "{} address {} does not match layout",
                    what, addr
                )))
            }
        };
        expect(self.metadata_base_addr, layout.meta_offset, "metadata")?;
        expect(self.full_flag_base_addr, layout.full_offset, "full flag")?;
        expect(self.empty_flag_base_addr, layout.empty_offset, "empty flag")?;

        Ok(layout)
    }

    /// Region offset of the sender's buffer block
    pub fn block_base(&self, layout: &PortLayout) -> Result<usize> {
        let data = usize::try_from(self.data_buffer_base_addr).map_err(|_| {
            TransportError::InvalidDescriptor("data base address out of range".to_string())
        })?;
        data.checked_sub(layout.data_offset).ok_or_else(|| {
            TransportError::InvalidDescriptor("data base precedes buffer block".to_string())
        })
    }

    fn swap_bytes(&mut self) {
        self.buffer_count = self.buffer_count.swap_bytes();
        self.role = self.role.swap_bytes();
        self.option_bits = self.option_bits.swap_bytes();
        self._pad = self._pad.swap_bytes();
        for field in [
            &mut self.data_buffer_base_addr,
            &mut self.data_buffer_pitch,
            &mut self.data_buffer_size,
            &mut self.metadata_base_addr,
            &mut self.metadata_pitch,
            &mut self.full_flag_base_addr,
            &mut self.full_flag_size,
            &mut self.full_flag_pitch,
            &mut self.full_flag_value,
            &mut self.empty_flag_base_addr,
            &mut self.empty_flag_size,
            &mut self.empty_flag_pitch,
            &mut self.empty_flag_value,
            &mut self.shadow_flag_base_addr,
            &mut self.shadow_flag_count,
        ] {
            *field = field.swap_bytes();
        }
        self.oob.port_id = self.oob.port_id.swap_bytes();
        self.oob.origin_len = self.oob.origin_len.swap_bytes();
        self.oob.cookie = self.oob.cookie.swap_bytes();
    }
}

/// Step of the handshake a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Consumer's first descriptor, roles still requested
    ConsumerInitial = 1,
    /// Producer's answer carrying the negotiated producer role
    ProducerFinal = 2,
    /// Consumer's closing descriptor
    ConsumerFinal = 3,
}

impl MessageKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageKind::ConsumerInitial),
            2 => Some(MessageKind::ProducerFinal),
            3 => Some(MessageKind::ConsumerFinal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct WireMessage {
    magic: u32,
    version: u16,
    byte_order: u8,
    kind: u8,
    descriptor: PortDescriptor,
}

/// A descriptor as sent between circuit halves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorMessage {
    pub kind: MessageKind,
    pub descriptor: PortDescriptor,
}

impl DescriptorMessage {
    pub const WIRE_SIZE: usize = std::mem::size_of::<WireMessage>();

    pub fn new(kind: MessageKind, descriptor: PortDescriptor) -> Self {
        Self { kind, descriptor }
    }

    /// Serialize in host byte order
    pub fn encode(&self) -> Vec<u8> {
        let wire = WireMessage {
            magic: DESCRIPTOR_MAGIC,
            version: DESCRIPTOR_VERSION,
            byte_order: host_byte_order(),
            kind: self.kind as u8,
            descriptor: self.descriptor,
        };
        wire.as_bytes().to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut wire = WireMessage::read_from_bytes(bytes).map_err(|_| {
            TransportError::InvalidDescriptor(format!(
                "expected {} bytes, got {}",
                Self::WIRE_SIZE,
                bytes.len()
            ))
        })?;

        match wire.byte_order {
            LITTLE_ENDIAN | BIG_ENDIAN => {}
            other => {
                return Err(TransportError::InvalidDescriptor(format!(
                    "unknown byte order tag {}",
                    other
                )))
            }
        }
        if wire.byte_order != host_byte_order() {
            wire.magic = wire.magic.swap_bytes();
            wire.version = wire.version.swap_bytes();
            wire.descriptor.swap_bytes();
        }

        if wire.magic != DESCRIPTOR_MAGIC {
            return Err(TransportError::InvalidDescriptor(format!(
                "bad magic {:#x}",
                wire.magic
            )));
        }
        if wire.version != DESCRIPTOR_VERSION {
            return Err(TransportError::InvalidDescriptor(format!(
                "unsupported version {}",
                wire.version
            )));
        }
        let kind = MessageKind::from_u8(wire.kind).ok_or_else(|| {
            TransportError::InvalidDescriptor(format!("unknown message kind {}", wire.kind))
        })?;

        Ok(Self {
            kind,
            descriptor: wire.descriptor,
        })
    }

    /// Decode and require a specific handshake step
    pub fn expect(bytes: &[u8], kind: MessageKind) -> Result<PortDescriptor> {
        let message = Self::decode(bytes)?;
        if message.kind != kind {
            return Err(TransportError::InvalidDescriptor(format!(
                "expected {:?} message, got {:?}",
                kind, message.kind
            )));
        }
        Ok(message.descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_BUFFERS;
    use zerocopy::FromZeros;

    fn sample() -> PortDescriptor {
        let layout = PortLayout::new(2, 64, 1).unwrap();
        let base = 8192u64;
        let mut d = PortDescriptor::new_zeroed();
        d.buffer_count = 2;
        d.role = PortRole::ActiveFlowControl as u32;
        d.option_bits = RoleOptions::default().bits();
        d.data_buffer_base_addr = base;
        d.data_buffer_pitch = layout.data_pitch as u64;
        d.data_buffer_size = 64;
        d.metadata_base_addr = base + layout.meta_offset as u64;
        d.metadata_pitch = 32;
        d.full_flag_base_addr = base + layout.full_offset as u64;
        d.full_flag_size = 8;
        d.full_flag_pitch = 8;
        d.full_flag_value = u64::MAX;
        d.empty_flag_base_addr = FLAG_ADDR_NONE;
        d.empty_flag_size = 8;
        d.empty_flag_pitch = 8;
        d.empty_flag_value = u64::MAX;
        d.oob.cookie = 0x0102_0304_0506_0708;
        d.set_origin("local:local1-0:65536.4.0").unwrap();
        d
    }

    #[test]
    fn test_encode_decode() {
        let msg = DescriptorMessage::new(MessageKind::ConsumerInitial, sample());
        let bytes = msg.encode();
        assert_eq!(bytes.len(), DescriptorMessage::WIRE_SIZE);
        assert_eq!(DescriptorMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_foreign_byte_order_is_swapped() {
        let original = sample();
        let mut foreign = WireMessage {
            magic: DESCRIPTOR_MAGIC.swap_bytes(),
            version: DESCRIPTOR_VERSION.swap_bytes(),
            byte_order: if host_byte_order() == LITTLE_ENDIAN {
                BIG_ENDIAN
            } else {
                LITTLE_ENDIAN
            },
            kind: MessageKind::ProducerFinal as u8,
            descriptor: original,
        };
        foreign.descriptor.swap_bytes();

        let decoded = DescriptorMessage::decode(foreign.as_bytes()).unwrap();
        assert_eq!(decoded.kind, MessageKind::ProducerFinal);
        assert_eq!(decoded.descriptor, original);
        assert_eq!(decoded.descriptor.origin().unwrap(), "local:local1-0:65536.4.0");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(DescriptorMessage::decode(&[0u8; 10]).is_err());

        let mut bytes = DescriptorMessage::new(MessageKind::ConsumerFinal, sample()).encode();
        bytes[0] ^= 0xff;
        assert!(matches!(
            DescriptorMessage::decode(&bytes),
            Err(TransportError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_expect_checks_kind() {
        let bytes = DescriptorMessage::new(MessageKind::ConsumerInitial, sample()).encode();
        assert!(DescriptorMessage::expect(&bytes, MessageKind::ConsumerInitial).is_ok());
        assert!(DescriptorMessage::expect(&bytes, MessageKind::ProducerFinal).is_err());
    }

    #[test]
    fn test_layout_recovered() {
        let d = sample();
        let layout = d.layout().unwrap();
        assert_eq!(layout, PortLayout::new(2, 64, 1).unwrap());
        assert_eq!(d.block_base(&layout).unwrap(), 8192);
        assert_eq!(d.role().unwrap(), PortRole::ActiveFlowControl);
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let mut d = sample();
        d.full_flag_base_addr += 8;
        assert!(d.layout().is_err());

        let mut d = sample();
        d.data_buffer_pitch = 60;
        assert!(d.layout().is_err());
    }

    #[test]
    fn test_overflowing_geometry_rejected() {
        let mut d = sample();
        d.data_buffer_size = u64::MAX - 10;
        assert!(matches!(d.layout(), Err(TransportError::InvalidDescriptor(_))));

        let mut d = sample();
        d.buffer_count = MAX_BUFFERS as u32;
        d.data_buffer_size = u32::MAX as u64 + 1;
        assert!(matches!(d.layout(), Err(TransportError::InvalidDescriptor(_))));

        let mut d = sample();
        d.empty_flag_pitch = u64::MAX - 7;
        assert!(matches!(d.layout(), Err(TransportError::InvalidDescriptor(_))));

        let mut d = sample();
        d.data_buffer_base_addr = u64::MAX - 16;
        assert!(matches!(d.layout(), Err(TransportError::InvalidDescriptor(_))));
    }

    #[test]
    fn test_shadow_and_origin() {
        let mut d = sample();
        assert!(d.shadow().is_none());
        d.set_shadow(12288, 4);
        assert_eq!(d.shadow(), Some((12288, 4)));
        assert!(d.set_origin(&"x".repeat(ENDPOINT_STRING_LEN + 1)).is_err());
        d.oob.origin_len = 0;
        assert!(d.origin().is_err());
    }
}
