//! Logical DCC packets: address, instruction bytes and scheduling hints.
//!
//! A [`Packet`] is what protocol translators hand to the track controller. It
//! never carries a checksum; the error detection byte is derived when the
//! packet is framed (see [`Packet::checksum`]).
//!
//! # Example
//!
//! ```rust
//! use dcc_track::{Address, Packet, Priority};
//!
//! // Speed and direction for loco 3, with a RailCom cutout afterwards
//! let packet = Packet::new(Address::short(3).unwrap(), &[0b0010_0001])
//!     .unwrap()
//!     .with_cutout(true);
//!
//! assert_eq!(packet.bytes().as_slice(), &[0x03, 0x21, 0x22]);
//! assert_eq!(packet.priority(), Priority::Normal);
//! ```

use heapless::Vec;

use crate::error::EncodingError;

/// Highest short (one byte) address.
pub const MAX_SHORT_ADDRESS: u16 = 127;

/// Lowest long (two byte) address.
pub const MIN_LONG_ADDRESS: u16 = 128;

/// Highest long (two byte) address.
pub const MAX_LONG_ADDRESS: u16 = 10239;

/// Maximum instruction bytes in one packet, checksum excluded.
pub const MAX_INSTRUCTION_BYTES: usize = 5;

/// Maximum framed bytes: two address bytes, instructions and checksum.
pub const MAX_PACKET_BYTES: usize = 2 + MAX_INSTRUCTION_BYTES + 1;

/// Decoder address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Address {
    /// Broadcast to every decoder (address byte `0x00`).
    Broadcast,
    /// Short address, 1 to 127, one address byte.
    Short(u8),
    /// Long address, 128 to 10239, two address bytes.
    Long(u16),
    /// Idle packet marker (address byte `0xFF`), addressed to nobody.
    Idle,
}

impl Address {
    /// Creates a short address.
    pub fn short(addr: u8) -> Result<Self, EncodingError> {
        if addr == 0 || u16::from(addr) > MAX_SHORT_ADDRESS {
            return Err(EncodingError::AddressOutOfRange(addr.into()));
        }
        Ok(Self::Short(addr))
    }

    /// Creates a long address.
    pub fn long(addr: u16) -> Result<Self, EncodingError> {
        if !(MIN_LONG_ADDRESS..=MAX_LONG_ADDRESS).contains(&addr) {
            return Err(EncodingError::AddressOutOfRange(addr));
        }
        Ok(Self::Long(addr))
    }

    /// Picks the short or long form from the numeric range.
    ///
    /// ```
    /// use dcc_track::Address;
    ///
    /// assert_eq!(Address::from_number(3), Ok(Address::Short(3)));
    /// assert_eq!(Address::from_number(1000), Ok(Address::Long(1000)));
    /// assert!(Address::from_number(0).is_err());
    /// assert!(Address::from_number(10240).is_err());
    /// ```
    pub fn from_number(addr: u16) -> Result<Self, EncodingError> {
        match addr {
            1..=MAX_SHORT_ADDRESS => Self::short(addr as u8),
            _ => Self::long(addr),
        }
    }

    /// Checks the stored value against the range of its variant.
    pub fn validate(&self) -> Result<(), EncodingError> {
        match *self {
            Self::Short(addr) => Self::short(addr).map(|_| ()),
            Self::Long(addr) => Self::long(addr).map(|_| ()),
            Self::Broadcast | Self::Idle => Ok(()),
        }
    }

    /// Numeric address, 0 for broadcast and 255 for idle.
    pub const fn number(&self) -> u16 {
        match *self {
            Self::Broadcast => 0,
            Self::Short(addr) => addr as u16,
            Self::Long(addr) => addr,
            Self::Idle => 0xFF,
        }
    }

    /// Returns true for two-byte addresses.
    pub const fn is_long(&self) -> bool {
        matches!(self, Self::Long(_))
    }

    fn write_bytes<const N: usize>(&self, out: &mut Vec<u8, N>) {
        match *self {
            Self::Broadcast => {
                let _ = out.push(0x00);
            }
            Self::Short(addr) => {
                let _ = out.push(addr);
            }
            Self::Long(addr) => {
                let _ = out.push(0xC0 | (addr >> 8) as u8);
                let _ = out.push(addr as u8);
            }
            Self::Idle => {
                let _ = out.push(0xFF);
            }
        }
    }
}

/// Queue priority.
///
/// Urgent packets (emergency stops, for instance) jump ahead of every normal
/// packet still waiting; order within a priority is preserved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Priority {
    /// Regular traffic.
    #[default]
    Normal,
    /// Preempts all normal traffic.
    Urgent,
}

/// A logical DCC packet.
///
/// Built once, then handed to the controller by value. There are no setters
/// for the payload; the `with_*` methods consume and return the packet so
/// nothing can change after it has been queued.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    address: Address,
    data: Vec<u8, MAX_INSTRUCTION_BYTES>,
    repeat: u8,
    priority: Priority,
    cutout: bool,
}

impl Packet {
    /// Creates a packet sent once, normal priority, no cutout.
    ///
    /// # Errors
    ///
    /// - [`EncodingError::AddressOutOfRange`] if the address is invalid
    /// - [`EncodingError::Empty`] if `data` is empty
    /// - [`EncodingError::TooManyBytes`] if `data` exceeds [`MAX_INSTRUCTION_BYTES`]
    pub fn new(address: Address, data: &[u8]) -> Result<Self, EncodingError> {
        address.validate()?;
        if data.is_empty() {
            return Err(EncodingError::Empty);
        }
        let data = Vec::from_slice(data).map_err(|_| EncodingError::TooManyBytes {
            len: data.len(),
            max: MAX_INSTRUCTION_BYTES,
        })?;
        Ok(Self {
            address,
            data,
            repeat: 1,
            priority: Priority::Normal,
            cutout: false,
        })
    }

    /// The idle packet `FF 00 FF`, used as filler whenever nothing is pending.
    pub fn idle() -> Self {
        Self {
            address: Address::Idle,
            data: Vec::from_slice(&[0x00]).unwrap_or_default(),
            repeat: 1,
            priority: Priority::Normal,
            cutout: false,
        }
    }

    /// The digital decoder reset packet `00 00 00`.
    pub fn reset() -> Self {
        Self {
            address: Address::Broadcast,
            data: Vec::from_slice(&[0x00]).unwrap_or_default(),
            repeat: 1,
            priority: Priority::Normal,
            cutout: false,
        }
    }

    /// Sets how many times the packet is transmitted back to back.
    pub fn with_repeat(mut self, repeat: u8) -> Result<Self, EncodingError> {
        if repeat == 0 {
            return Err(EncodingError::ZeroRepeat);
        }
        self.repeat = repeat;
        Ok(self)
    }

    /// Sets the queue priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Shorthand for `with_priority(Priority::Urgent)`.
    pub fn urgent(self) -> Self {
        self.with_priority(Priority::Urgent)
    }

    /// Requests a bidirectional cutout after this packet.
    pub fn with_cutout(mut self, cutout: bool) -> Self {
        self.cutout = cutout;
        self
    }

    /// Decoder address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Instruction bytes, checksum excluded.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of transmissions.
    pub fn repeat(&self) -> u8 {
        self.repeat
    }

    /// Queue priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// True if a cutout follows this packet.
    pub fn cutout(&self) -> bool {
        self.cutout
    }

    /// True for the idle filler packet.
    pub fn is_idle(&self) -> bool {
        self.address == Address::Idle
    }

    /// XOR of all address and instruction bytes.
    pub fn checksum(&self) -> u8 {
        let mut head: Vec<u8, MAX_PACKET_BYTES> = Vec::new();
        self.address.write_bytes(&mut head);
        head.iter().chain(self.data.iter()).fold(0, |acc, b| acc ^ b)
    }

    /// Framed bytes: address, instructions, checksum.
    pub fn bytes(&self) -> Vec<u8, MAX_PACKET_BYTES> {
        let mut out = Vec::new();
        self.address.write_bytes(&mut out);
        // Capacity covers the longest address plus MAX_INSTRUCTION_BYTES and the checksum
        let _ = out.extend_from_slice(&self.data);
        let _ = out.push(self.checksum());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_address_range() {
        assert!(Address::short(0).is_err());
        assert!(Address::short(1).is_ok());
        assert!(Address::short(127).is_ok());
        assert_eq!(Address::short(128), Err(EncodingError::AddressOutOfRange(128)));
    }

    #[test]
    fn long_address_range() {
        assert!(Address::long(127).is_err());
        assert!(Address::long(128).is_ok());
        assert!(Address::long(10239).is_ok());
        assert_eq!(
            Address::long(10240),
            Err(EncodingError::AddressOutOfRange(10240))
        );
    }

    #[test]
    fn hand_built_variant_rejected() {
        let result = Packet::new(Address::Short(200), &[0x3F]);
        assert_eq!(result, Err(EncodingError::AddressOutOfRange(200)));

        let result = Packet::new(Address::Long(5), &[0x3F]);
        assert_eq!(result, Err(EncodingError::AddressOutOfRange(5)));
    }

    #[test]
    fn long_address_bytes() {
        let packet = Packet::new(Address::long(1000).unwrap(), &[0x3F, 0x80]).unwrap();
        let bytes = packet.bytes();
        // 1000 = 0x03E8 -> 0xC3 0xE8
        assert_eq!(&bytes[..4], &[0xC3, 0xE8, 0x3F, 0x80]);
        assert_eq!(bytes[4], 0xC3 ^ 0xE8 ^ 0x3F ^ 0x80);
    }

    #[test]
    fn highest_long_address_bytes() {
        let packet = Packet::new(Address::long(10239).unwrap(), &[0x00]).unwrap();
        assert_eq!(&packet.bytes()[..2], &[0xE7, 0xFF]);
    }

    #[test]
    fn idle_packet_bytes() {
        let idle = Packet::idle();
        assert_eq!(idle.bytes().as_slice(), &[0xFF, 0x00, 0xFF]);
        assert!(idle.is_idle());
        assert!(!idle.cutout());
    }

    #[test]
    fn reset_packet_bytes() {
        assert_eq!(Packet::reset().bytes().as_slice(), &[0x00, 0x00, 0x00]);
    }

    #[test]
    fn too_many_bytes() {
        let result = Packet::new(Address::Broadcast, &[0; MAX_INSTRUCTION_BYTES + 1]);
        assert_eq!(
            result,
            Err(EncodingError::TooManyBytes {
                len: MAX_INSTRUCTION_BYTES + 1,
                max: MAX_INSTRUCTION_BYTES
            })
        );
    }

    #[test]
    fn max_bytes_with_long_address_fit() {
        let packet =
            Packet::new(Address::long(5000).unwrap(), &[0xAA; MAX_INSTRUCTION_BYTES]).unwrap();
        assert_eq!(packet.bytes().len(), MAX_PACKET_BYTES);
    }

    #[test]
    fn empty_data_rejected() {
        assert_eq!(
            Packet::new(Address::short(3).unwrap(), &[]),
            Err(EncodingError::Empty)
        );
    }

    #[test]
    fn zero_repeat_rejected() {
        let packet = Packet::new(Address::short(3).unwrap(), &[0x3F]).unwrap();
        assert_eq!(packet.with_repeat(0), Err(EncodingError::ZeroRepeat));
    }

    #[test]
    fn builder_flags() {
        let packet = Packet::new(Address::short(3).unwrap(), &[0x41])
            .unwrap()
            .with_repeat(3)
            .unwrap()
            .urgent()
            .with_cutout(true);
        assert_eq!(packet.repeat(), 3);
        assert_eq!(packet.priority(), Priority::Urgent);
        assert!(packet.cutout());
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Urgent > Priority::Normal);
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
