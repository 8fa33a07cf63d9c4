//! Packet framing: turns a [`Packet`] into a timed [`SymbolBuffer`].
//!
//! A DCC bit is a symmetric two-phase pulse. '1' bits use the short half
//! period, '0' bits the long one. A framed packet is:
//!
//! ```text
//! preamble (n x 1) | 0 | address | 0 | data ... | 0 | checksum | 1 | [cutout tail]
//! ```
//!
//! The packet end bit is the reference edge for the cutout window. Packets
//! flagged for a cutout get a tail of cutout symbols long enough that the
//! window closes before the next frame's preamble starts.
//!
//! The encoder is a pure transform: no hardware access and no allocation,
//! buffers are fixed-capacity [`heapless::Vec`]s.
//!
//! # Example
//!
//! ```rust
//! use dcc_track::{Address, EncoderConfig, Packet, PacketEncoder, SymbolKind};
//!
//! let encoder = PacketEncoder::new(&EncoderConfig::default()).unwrap();
//! let packet = Packet::new(Address::short(3).unwrap(), &[0x21]).unwrap();
//! let buffer = encoder.encode(&packet).unwrap();
//!
//! // 17 preamble bits, 3 bytes of 9 bits each, 1 end bit
//! assert_eq!(buffer.len(), 17 + 3 * 9 + 1);
//! assert_eq!(buffer.symbols()[0].kind, SymbolKind::One);
//! ```

use heapless::Vec;

use crate::error::{EncodingError, TimingViolationError, TrackError};
use crate::packet::{Packet, MAX_PACKET_BYTES};

/// Minimum preamble a command station may send.
pub const MIN_PREAMBLE_BITS: u8 = 14;

/// Default preamble, long enough to survive a cutout eating the first bits.
pub const DEFAULT_PREAMBLE_BITS: u8 = 17;

/// Longest preamble a symbol buffer is sized for.
pub const MAX_PREAMBLE_BITS: u8 = 30;

/// Allowed '1' bit half-period in microseconds.
pub const BIT1_RANGE_US: core::ops::RangeInclusive<u16> = 56..=60;

/// Allowed '0' bit half-period in microseconds.
pub const BIT0_RANGE_US: core::ops::RangeInclusive<u16> = 97..=114;

/// Allowed cutout symbol half-period in microseconds.
pub const CUTOUT_SYMBOL_RANGE_US: core::ops::RangeInclusive<u16> = 57..=61;

/// Upper bound on cutout tail symbols.
pub const MAX_CUTOUT_SYMBOLS: usize = 8;

/// Symbol capacity of one buffer.
pub const MAX_SYMBOLS: usize =
    MAX_PREAMBLE_BITS as usize + MAX_PACKET_BYTES * 9 + 1 + MAX_CUTOUT_SYMBOLS;

/// What a symbol represents on the rails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    /// DCC '1' bit.
    One,
    /// DCC '0' bit.
    Zero,
    /// Filler clocked out while the cutout holds the track.
    Cutout,
}

/// One encoded bit: two equal phases.
///
/// The constructors always set both phases to the same duration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Symbol {
    /// Bit value.
    pub kind: SymbolKind,
    /// First phase duration in microseconds.
    pub phase_a_us: u16,
    /// Second phase duration in microseconds.
    pub phase_b_us: u16,
}

impl Symbol {
    /// A '1' bit with the given half period.
    pub const fn one(half_us: u16) -> Self {
        Self::symmetric(SymbolKind::One, half_us)
    }

    /// A '0' bit with the given half period.
    pub const fn zero(half_us: u16) -> Self {
        Self::symmetric(SymbolKind::Zero, half_us)
    }

    /// A cutout tail symbol with the given half period.
    pub const fn cutout(half_us: u16) -> Self {
        Self::symmetric(SymbolKind::Cutout, half_us)
    }

    const fn symmetric(kind: SymbolKind, half_us: u16) -> Self {
        Self {
            kind,
            phase_a_us: half_us,
            phase_b_us: half_us,
        }
    }

    /// Full bit period.
    pub const fn duration_us(&self) -> u32 {
        self.phase_a_us as u32 + self.phase_b_us as u32
    }
}

/// A fully framed packet ready for the output channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SymbolBuffer {
    symbols: Vec<Symbol, MAX_SYMBOLS>,
    end_bit: usize,
    cutout: bool,
}

impl SymbolBuffer {
    /// Creates an empty buffer.
    pub const fn new() -> Self {
        Self {
            symbols: Vec::new(),
            end_bit: 0,
            cutout: false,
        }
    }

    /// True if a cutout window follows this frame.
    pub fn has_cutout(&self) -> bool {
        self.cutout
    }

    /// All symbols in transmit order.
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Number of symbols.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// True if nothing has been encoded.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Index of the packet end bit.
    pub fn end_bit_index(&self) -> usize {
        self.end_bit
    }

    /// Offset of the packet end bit from the start of the buffer.
    ///
    /// This is the reference edge the cutout offsets are measured from.
    pub fn reference_offset_us(&self) -> u32 {
        self.symbols[..self.end_bit]
            .iter()
            .map(Symbol::duration_us)
            .sum()
    }

    /// Total transmit time.
    pub fn duration_us(&self) -> u32 {
        self.symbols.iter().map(Symbol::duration_us).sum()
    }

    /// Number of cutout tail symbols.
    pub fn cutout_symbols(&self) -> usize {
        self.symbols
            .iter()
            .filter(|s| s.kind == SymbolKind::Cutout)
            .count()
    }

    /// Bit values of the DCC part, cutout tail excluded.
    pub fn bits(&self) -> impl Iterator<Item = bool> + '_ {
        self.symbols
            .iter()
            .filter(|s| s.kind != SymbolKind::Cutout)
            .map(|s| s.kind == SymbolKind::One)
    }

    fn clear(&mut self) {
        self.symbols.clear();
        self.end_bit = 0;
        self.cutout = false;
    }

    fn push(&mut self, symbol: Symbol) {
        // Capacity is sized for the longest preamble, packet and tail; the
        // encoder checks all three before pushing.
        let _ = self.symbols.push(symbol);
    }
}

/// Encoder timing configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EncoderConfig {
    /// Preamble length in bits
    pub preamble_bits: u8,
    /// Shortest preamble accepted
    pub min_preamble_bits: u8,
    /// '1' bit half period in microseconds
    pub bit1_us: u16,
    /// '0' bit half period in microseconds
    pub bit0_us: u16,
    /// Cutout symbol half period in microseconds (0 = no cutouts)
    pub cutout_symbol_us: u16,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            preamble_bits: DEFAULT_PREAMBLE_BITS,
            min_preamble_bits: MIN_PREAMBLE_BITS,
            bit1_us: 58,
            bit0_us: 100,
            cutout_symbol_us: 60,
        }
    }
}

impl EncoderConfig {
    /// Set the preamble length
    pub fn with_preamble_bits(mut self, bits: u8) -> Self {
        self.preamble_bits = bits;
        self
    }

    /// Set the shortest accepted preamble
    pub fn with_min_preamble_bits(mut self, bits: u8) -> Self {
        self.min_preamble_bits = bits;
        self
    }

    /// Set the '1' bit half period
    pub fn with_bit1_us(mut self, us: u16) -> Self {
        self.bit1_us = us;
        self
    }

    /// Set the '0' bit half period
    pub fn with_bit0_us(mut self, us: u16) -> Self {
        self.bit0_us = us;
        self
    }

    /// Set the cutout symbol half period (0 disables cutouts)
    pub fn with_cutout_symbol_us(mut self, us: u16) -> Self {
        self.cutout_symbol_us = us;
        self
    }

    /// Longest frame these timings can produce: a packet of
    /// [`MAX_PACKET_BYTES`] bytes that are all zeros, followed by the longest
    /// cutout tail.
    pub fn max_frame_us(&self) -> u32 {
        let one = 2 * u32::from(self.bit1_us);
        let zero = 2 * u32::from(self.bit0_us);
        let tail = if self.cutout_capable() {
            MAX_CUTOUT_SYMBOLS as u32 * 2 * u32::from(self.cutout_symbol_us)
        } else {
            0
        };
        u32::from(self.preamble_bits) * one + MAX_PACKET_BYTES as u32 * 9 * zero + one + tail
    }

    /// True if cutout tails can be generated.
    pub fn cutout_capable(&self) -> bool {
        self.cutout_symbol_us != 0
    }

    /// Checks preamble bounds and bit timings.
    pub fn validate(&self) -> Result<(), TrackError> {
        if self.preamble_bits < self.min_preamble_bits.max(MIN_PREAMBLE_BITS) {
            return Err(EncodingError::PreambleTooShort {
                bits: self.preamble_bits,
                min: self.min_preamble_bits.max(MIN_PREAMBLE_BITS),
            }
            .into());
        }
        if self.preamble_bits > MAX_PREAMBLE_BITS {
            return Err(EncodingError::PreambleTooLong {
                bits: self.preamble_bits,
                max: MAX_PREAMBLE_BITS,
            }
            .into());
        }
        if !BIT1_RANGE_US.contains(&self.bit1_us) {
            return Err(TimingViolationError::Bit1Duration(self.bit1_us).into());
        }
        if !BIT0_RANGE_US.contains(&self.bit0_us) {
            return Err(TimingViolationError::Bit0Duration(self.bit0_us).into());
        }
        if self.cutout_capable() && !CUTOUT_SYMBOL_RANGE_US.contains(&self.cutout_symbol_us) {
            return Err(TimingViolationError::CutoutSymbolDuration(self.cutout_symbol_us).into());
        }
        Ok(())
    }
}

/// Converts packets into symbol buffers.
#[derive(Clone, Debug)]
pub struct PacketEncoder {
    config: EncoderConfig,
    cutout: bool,
    tail_symbols: usize,
}

impl PacketEncoder {
    /// Creates an encoder after validating the configuration.
    ///
    /// # Errors
    ///
    /// - [`TrackError::Encoding`] for a preamble outside the accepted range
    /// - [`TrackError::TimingViolation`] for bit durations out of band
    pub fn new(config: &EncoderConfig) -> Result<Self, TrackError> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            cutout: false,
            tail_symbols: 0,
        })
    }

    /// Enables cutout frames and sizes their tail so a window closing
    /// `close_us` after the reference edge ends before the next preamble.
    ///
    /// Without this call, or with `cutout_symbol_us == 0`, the cutout flag of
    /// a packet is ignored.
    pub fn with_cutout_tail(mut self, close_us: u16) -> Self {
        self.cutout = self.config.cutout_capable();
        if !self.cutout {
            self.tail_symbols = 0;
            return self;
        }
        let covered = 2 * u32::from(self.config.bit1_us);
        let needed = u32::from(close_us).saturating_sub(covered);
        let period = 2 * u32::from(self.config.cutout_symbol_us);
        let symbols = needed.div_ceil(period) as usize;
        self.tail_symbols = symbols.min(MAX_CUTOUT_SYMBOLS);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// True if flagged packets get a cutout.
    pub fn cutout_enabled(&self) -> bool {
        self.cutout
    }

    /// Number of cutout symbols appended to flagged packets.
    pub fn tail_symbols(&self) -> usize {
        self.tail_symbols
    }

    /// Encodes into a fresh buffer.
    pub fn encode(&self, packet: &Packet) -> Result<SymbolBuffer, EncodingError> {
        let mut buffer = SymbolBuffer::new();
        self.encode_into(packet, &mut buffer)?;
        Ok(buffer)
    }

    /// Encodes into an existing buffer, replacing its contents.
    ///
    /// On error the buffer is left empty.
    pub fn encode_into(&self, packet: &Packet, out: &mut SymbolBuffer) -> Result<(), EncodingError> {
        out.clear();
        packet.address().validate()?;

        let one = Symbol::one(self.config.bit1_us);
        let zero = Symbol::zero(self.config.bit0_us);

        for _ in 0..self.config.preamble_bits {
            out.push(one);
        }
        for byte in packet.bytes() {
            out.push(zero);
            for bit in (0..8).rev() {
                out.push(if byte & (1 << bit) != 0 { one } else { zero });
            }
        }
        out.end_bit = out.len();
        out.push(one);

        if packet.cutout() && self.cutout {
            out.cutout = true;
            for _ in 0..self.tail_symbols {
                out.push(Symbol::cutout(self.config.cutout_symbol_us));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Address;

    fn loco3() -> Packet {
        Packet::new(Address::short(3).unwrap(), &[0b0010_0001]).unwrap()
    }

    #[test]
    fn symbols_are_symmetric() {
        for s in [Symbol::one(58), Symbol::zero(100), Symbol::cutout(60)] {
            assert_eq!(s.phase_a_us, s.phase_b_us);
        }
        assert_eq!(Symbol::one(58).duration_us(), 116);
    }

    #[test]
    fn default_config_valid() {
        assert!(EncoderConfig::default().validate().is_ok());
    }

    #[test]
    fn preamble_below_minimum() {
        let config = EncoderConfig::default().with_preamble_bits(13);
        assert_eq!(
            PacketEncoder::new(&config).unwrap_err(),
            TrackError::Encoding(EncodingError::PreambleTooShort { bits: 13, min: 14 })
        );
    }

    #[test]
    fn configured_minimum_raises_floor() {
        let config = EncoderConfig::default()
            .with_min_preamble_bits(20)
            .with_preamble_bits(17);
        assert!(matches!(
            config.validate(),
            Err(TrackError::Encoding(EncodingError::PreambleTooShort { min: 20, .. }))
        ));
    }

    #[test]
    fn preamble_above_maximum() {
        let config = EncoderConfig::default().with_preamble_bits(31);
        assert!(matches!(
            config.validate(),
            Err(TrackError::Encoding(EncodingError::PreambleTooLong { .. }))
        ));
    }

    #[test]
    fn bit_timing_bands() {
        assert_eq!(
            EncoderConfig::default().with_bit1_us(50).validate(),
            Err(TrackError::TimingViolation(TimingViolationError::Bit1Duration(50)))
        );
        assert_eq!(
            EncoderConfig::default().with_bit0_us(120).validate(),
            Err(TrackError::TimingViolation(TimingViolationError::Bit0Duration(120)))
        );
        assert!(EncoderConfig::default()
            .with_cutout_symbol_us(0)
            .validate()
            .is_ok());
        assert!(EncoderConfig::default()
            .with_cutout_symbol_us(40)
            .validate()
            .is_err());
    }

    #[test]
    fn reference_offset_points_at_end_bit() {
        let encoder = PacketEncoder::new(&EncoderConfig::default()).unwrap();
        let buffer = encoder.encode(&loco3()).unwrap();
        let end = buffer.end_bit_index();
        assert_eq!(end, buffer.len() - 1);
        assert_eq!(buffer.symbols()[end].kind, SymbolKind::One);

        let expected: u32 = buffer.symbols()[..end]
            .iter()
            .map(|s| s.duration_us())
            .sum();
        assert_eq!(buffer.reference_offset_us(), expected);
    }

    #[test]
    fn tail_only_on_flagged_packets() {
        let encoder = PacketEncoder::new(&EncoderConfig::default())
            .unwrap()
            .with_cutout_tail(454);
        // (454 - 116) / 120 rounded up
        assert_eq!(encoder.tail_symbols(), 3);

        let plain = encoder.encode(&loco3()).unwrap();
        assert_eq!(plain.cutout_symbols(), 0);
        assert!(!plain.has_cutout());

        let flagged = encoder.encode(&loco3().with_cutout(true)).unwrap();
        assert_eq!(flagged.cutout_symbols(), 3);
        assert!(flagged.has_cutout());
        assert_eq!(flagged.len(), plain.len() + 3);
        assert_eq!(flagged.reference_offset_us(), plain.reference_offset_us());
    }

    #[test]
    fn tail_covers_close_offset() {
        let encoder = PacketEncoder::new(&EncoderConfig::default())
            .unwrap()
            .with_cutout_tail(488);
        let buffer = encoder.encode(&loco3().with_cutout(true)).unwrap();
        let after_reference = buffer.duration_us() - buffer.reference_offset_us();
        assert!(after_reference >= 488);
    }

    #[test]
    fn no_tail_when_cutout_disabled() {
        let config = EncoderConfig::default().with_cutout_symbol_us(0);
        let encoder = PacketEncoder::new(&config).unwrap().with_cutout_tail(454);
        let buffer = encoder.encode(&loco3().with_cutout(true)).unwrap();
        assert_eq!(buffer.cutout_symbols(), 0);
        assert!(!buffer.has_cutout());
        assert!(!encoder.cutout_enabled());
    }

    #[test]
    fn flag_ignored_without_tail() {
        let encoder = PacketEncoder::new(&EncoderConfig::default()).unwrap();
        let buffer = encoder.encode(&loco3().with_cutout(true)).unwrap();
        assert!(!buffer.has_cutout());
    }

    #[test]
    fn encode_into_reuses_buffer() {
        let encoder = PacketEncoder::new(&EncoderConfig::default()).unwrap();
        let mut buffer = encoder.encode(&Packet::idle()).unwrap();
        encoder.encode_into(&loco3(), &mut buffer).unwrap();
        assert_eq!(buffer, encoder.encode(&loco3()).unwrap());
    }

    #[test]
    fn longest_packet_fits() {
        let config = EncoderConfig::default().with_preamble_bits(MAX_PREAMBLE_BITS);
        let encoder = PacketEncoder::new(&config).unwrap().with_cutout_tail(488);
        let packet = Packet::new(Address::long(10239).unwrap(), &[0xFF; 5])
            .unwrap()
            .with_cutout(true);
        let buffer = encoder.encode(&packet).unwrap();
        assert_eq!(
            buffer.len(),
            MAX_PREAMBLE_BITS as usize + MAX_PACKET_BYTES * 9 + 1 + encoder.tail_symbols()
        );
        assert!(buffer.len() <= MAX_SYMBOLS);
    }
}
