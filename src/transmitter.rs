//! Gap-free double-buffered transmission.
//!
//! [`SymbolTransmitter`] owns the [`OutputChannel`] and at most two frames:
//! the one in flight and the one queued behind it. Both have already been
//! handed to the hardware, which keeps clocking without software help until
//! its queue runs dry.
//!
//! ```text
//!            enqueue()                on_complete()
//!  service ────────────► [ next ] ──────────────────► [ in flight ] ──► rails
//!                                      │ next empty?
//!                                      └──► idle frame (underrun)
//! ```
//!
//! `on_complete` is the transmit-done handler. It only moves the queued frame
//! into the in-flight slot, or starts the pre-encoded idle frame if nothing
//! was queued, and reports where the cutout reference edge of the new frame
//! lies. A promoted frame started the moment its predecessor finished, so the
//! edge is computed from the completion time, not from when the handler ran.
//! Encoding the next frame is left to the caller's task context.

use crate::encoder::SymbolBuffer;
use crate::traits::{IsrCallback, OutputChannel};

/// A frame owned by the transmitter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// The pre-encoded idle packet; no copy is made.
    Idle,
    /// An encoded packet.
    Packet(SymbolBuffer),
}

impl Frame {
    /// True for the idle filler.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// Where a frame went after `enqueue`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// Nothing was in flight; the frame started right away.
    Started {
        /// Reference edge if the frame carries a cutout.
        cutout_reference_us: Option<u64>,
    },
    /// The frame waits behind the one in flight.
    Queued,
}

/// Why `enqueue` refused a frame.
#[derive(Debug)]
pub enum Rejected<E> {
    /// Both slots are occupied. The frame is handed back.
    Full(Frame),
    /// The channel is not enabled or is draining.
    Inactive(Frame),
    /// The channel refused the buffer.
    Channel(E),
}

/// Result of a transmit-done event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Completion {
    /// Nothing was queued, so the idle frame was started instead.
    pub underrun: bool,
    /// The channel refused the substitute idle frame.
    pub channel_fault: bool,
    /// Draining and nothing is left in flight.
    pub drained: bool,
    /// The frame now in flight is the idle filler.
    pub idle: bool,
    /// Reference edge of the frame now in flight, if it carries a cutout.
    pub cutout_reference_us: Option<u64>,
}

#[derive(Debug)]
struct InFlight {
    frame: Frame,
    started_us: u64,
}

/// Owns the output channel and the two frame slots.
pub struct SymbolTransmitter<C: OutputChannel> {
    channel: C,
    idle: SymbolBuffer,
    in_flight: Option<InFlight>,
    next: Option<Frame>,
    enabled: bool,
    draining: bool,
}

impl<C: OutputChannel> SymbolTransmitter<C> {
    /// Wraps a disabled channel.
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            idle: SymbolBuffer::new(),
            in_flight: None,
            next: None,
            enabled: false,
            draining: false,
        }
    }

    /// Claims the channel and installs the idle frame used for underruns.
    pub fn enable(&mut self, idle: SymbolBuffer, on_done: Option<IsrCallback>) -> Result<(), C::Error> {
        self.channel.enable(on_done)?;
        self.idle = idle;
        self.in_flight = None;
        self.next = None;
        self.enabled = true;
        self.draining = false;
        Ok(())
    }

    /// Releases the channel. Frames still held are dropped.
    pub fn disable(&mut self) -> Result<(), C::Error> {
        self.enabled = false;
        self.draining = false;
        self.in_flight = None;
        self.next = None;
        self.channel.disable()
    }

    /// Stops idle substitution; the channel runs dry after the queued frames.
    pub fn begin_drain(&mut self) {
        self.draining = true;
    }

    /// Waits for the hardware to finish everything it holds, then empties
    /// both slots.
    pub fn wait_drained(&mut self, timeout_us: u32) -> Result<(), C::Error> {
        self.draining = true;
        let result = self.channel.wait_all_done(timeout_us);
        self.in_flight = None;
        self.next = None;
        result
    }

    /// Hands a frame to the hardware.
    ///
    /// Never blocks. With both slots taken the frame comes back in
    /// [`Rejected::Full`].
    pub fn enqueue(&mut self, frame: Frame, now_us: u64) -> Result<Enqueued, Rejected<C::Error>> {
        if !self.enabled || self.draining {
            return Err(Rejected::Inactive(frame));
        }
        if self.next.is_some() {
            return Err(Rejected::Full(frame));
        }

        let buffer = match &frame {
            Frame::Idle => &self.idle,
            Frame::Packet(buffer) => buffer,
        };
        self.channel.transmit(buffer).map_err(Rejected::Channel)?;

        if self.in_flight.is_none() {
            let cutout_reference_us = reference(buffer, now_us);
            self.in_flight = Some(InFlight {
                frame,
                started_us: now_us,
            });
            Ok(Enqueued::Started { cutout_reference_us })
        } else {
            self.next = Some(frame);
            Ok(Enqueued::Queued)
        }
    }

    /// Transmit-done handler.
    ///
    /// `done_us` is when the previous frame finished, `now_us` the current
    /// time. Constant time and allocation free. The frame that finished is
    /// dropped here; the caller refills the free slot from task context.
    pub fn on_complete(&mut self, done_us: u64, now_us: u64) -> Completion {
        self.in_flight = None;
        if !self.enabled {
            return Completion {
                drained: true,
                ..Completion::default()
            };
        }

        if let Some(frame) = self.next.take() {
            let buffer = match &frame {
                Frame::Idle => &self.idle,
                Frame::Packet(buffer) => buffer,
            };
            let completion = Completion {
                idle: frame.is_idle(),
                cutout_reference_us: reference(buffer, done_us),
                ..Completion::default()
            };
            self.in_flight = Some(InFlight {
                frame,
                started_us: done_us,
            });
            return completion;
        }

        if self.draining {
            return Completion {
                drained: true,
                ..Completion::default()
            };
        }

        match self.channel.transmit(&self.idle) {
            Ok(()) => {
                self.in_flight = Some(InFlight {
                    frame: Frame::Idle,
                    started_us: now_us,
                });
                Completion {
                    underrun: true,
                    idle: true,
                    ..Completion::default()
                }
            }
            Err(_) => Completion {
                underrun: true,
                channel_fault: true,
                ..Completion::default()
            },
        }
    }

    /// True if `enqueue` would accept a frame.
    pub fn has_free_slot(&self) -> bool {
        self.enabled && !self.draining && self.next.is_none()
    }

    /// Number of frames held, zero to two.
    pub fn frames_held(&self) -> usize {
        usize::from(self.in_flight.is_some()) + usize::from(self.next.is_some())
    }

    /// Frame currently on the rails.
    pub fn in_flight(&self) -> Option<&Frame> {
        self.in_flight.as_ref().map(|f| &f.frame)
    }

    /// Start time of the frame on the rails.
    pub fn in_flight_since_us(&self) -> Option<u64> {
        self.in_flight.as_ref().map(|f| f.started_us)
    }

    /// Pre-encoded idle frame.
    pub fn idle_frame(&self) -> &SymbolBuffer {
        &self.idle
    }

    /// True between `enable` and `disable`.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// True after `begin_drain` until the next `enable`.
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// The wrapped channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// The wrapped channel, mutably.
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }
}

fn reference(buffer: &SymbolBuffer, started_us: u64) -> Option<u64> {
    buffer
        .has_cutout()
        .then(|| started_us + u64::from(buffer.reference_offset_us()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{EncoderConfig, PacketEncoder};
    use crate::hal::MockChannel;
    use crate::packet::{Address, Packet};

    fn encoder() -> PacketEncoder {
        PacketEncoder::new(&EncoderConfig::default())
            .unwrap()
            .with_cutout_tail(454)
    }

    fn enabled() -> SymbolTransmitter<MockChannel> {
        let idle = encoder().encode(&Packet::idle()).unwrap();
        let mut tx = SymbolTransmitter::new(MockChannel::new());
        tx.enable(idle, None).unwrap();
        tx
    }

    fn loco(cutout: bool) -> Frame {
        let packet = Packet::new(Address::short(3).unwrap(), &[0x3F, 0x90])
            .unwrap()
            .with_cutout(cutout);
        Frame::Packet(encoder().encode(&packet).unwrap())
    }

    #[test]
    fn rejects_while_disabled() {
        let mut tx = SymbolTransmitter::new(MockChannel::new());
        assert!(matches!(
            tx.enqueue(Frame::Idle, 0),
            Err(Rejected::Inactive(Frame::Idle))
        ));
    }

    #[test]
    fn first_frame_starts_second_queues() {
        let mut tx = enabled();
        assert_eq!(
            tx.enqueue(Frame::Idle, 0).unwrap(),
            Enqueued::Started {
                cutout_reference_us: None
            }
        );
        assert_eq!(tx.enqueue(loco(false), 0).unwrap(), Enqueued::Queued);
        assert_eq!(tx.frames_held(), 2);
        assert!(!tx.has_free_slot());
        assert_eq!(tx.channel().queued.len(), 2);
    }

    #[test]
    fn third_frame_handed_back() {
        let mut tx = enabled();
        tx.enqueue(Frame::Idle, 0).unwrap();
        tx.enqueue(Frame::Idle, 0).unwrap();
        match tx.enqueue(loco(false), 0) {
            Err(Rejected::Full(frame)) => assert!(!frame.is_idle()),
            other => panic!("expected Full, got {:?}", other.map(|_| ())),
        }
        assert_eq!(tx.channel().queued.len(), 2);
    }

    #[test]
    fn completion_promotes_next() {
        let mut tx = enabled();
        tx.enqueue(Frame::Idle, 0).unwrap();
        tx.enqueue(loco(false), 0).unwrap();

        let done = tx.on_complete(5_000, 5_040);
        assert!(!done.underrun);
        assert!(!done.idle);
        assert_eq!(tx.in_flight_since_us(), Some(5_000));
        assert!(tx.has_free_slot());
    }

    #[test]
    fn substitute_idle_starts_when_handled() {
        let mut tx = enabled();
        tx.enqueue(loco(false), 0).unwrap();
        tx.channel_mut().complete();
        tx.on_complete(8_000, 8_300);
        assert_eq!(tx.in_flight_since_us(), Some(8_300));
    }

    #[test]
    fn underrun_substitutes_idle() {
        let mut tx = enabled();
        tx.enqueue(loco(false), 0).unwrap();
        tx.channel_mut().complete();

        let done = tx.on_complete(8_000, 8_000);
        assert!(done.underrun);
        assert!(done.idle);
        assert_eq!(tx.in_flight(), Some(&Frame::Idle));
        assert_eq!(tx.channel().queued.len(), 1);
        assert_eq!(tx.channel().queued[0], *tx.idle_frame());
    }

    #[test]
    fn cutout_reference_from_start_time() {
        let mut tx = enabled();
        tx.enqueue(Frame::Idle, 0).unwrap();
        let frame = loco(true);
        let offset = match &frame {
            Frame::Packet(buffer) => buffer.reference_offset_us(),
            Frame::Idle => unreachable!(),
        };
        tx.enqueue(frame, 0).unwrap();

        // handled 40us after the hardware finished
        let done = tx.on_complete(10_000, 10_040);
        assert_eq!(done.cutout_reference_us, Some(10_000 + u64::from(offset)));
    }

    #[test]
    fn started_cutout_frame_reports_reference() {
        let mut tx = enabled();
        match tx.enqueue(loco(true), 100).unwrap() {
            Enqueued::Started {
                cutout_reference_us: Some(at),
            } => assert!(at > 100),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn drain_stops_idle_substitution() {
        let mut tx = enabled();
        tx.enqueue(Frame::Idle, 0).unwrap();
        tx.begin_drain();
        assert!(!tx.has_free_slot());
        assert!(matches!(
            tx.enqueue(Frame::Idle, 0),
            Err(Rejected::Inactive(_))
        ));

        tx.channel_mut().complete();
        let done = tx.on_complete(1_000, 1_000);
        assert!(done.drained);
        assert!(!done.underrun);
        assert_eq!(tx.frames_held(), 0);
        assert!(tx.channel().queued.is_empty());
    }

    #[test]
    fn wait_drained_empties_slots() {
        let mut tx = enabled();
        tx.enqueue(Frame::Idle, 0).unwrap();
        tx.enqueue(loco(false), 0).unwrap();
        tx.wait_drained(40_000).unwrap();
        assert_eq!(tx.frames_held(), 0);
        assert_eq!(tx.channel().sent.len(), 2);
        assert!(tx.is_draining());
    }

    #[test]
    fn fault_when_idle_refused() {
        let mut tx = enabled();
        tx.enqueue(Frame::Idle, 0).unwrap();
        tx.channel_mut().fail_transmit = true;
        tx.channel_mut().complete();
        let done = tx.on_complete(1_000, 1_000);
        assert!(done.underrun);
        assert!(done.channel_fault);
        assert!(tx.in_flight().is_none());
    }

    #[test]
    fn disable_releases_channel() {
        let mut tx = enabled();
        tx.enqueue(Frame::Idle, 0).unwrap();
        tx.disable().unwrap();
        assert!(!tx.is_enabled());
        assert!(!tx.channel().enabled);
        assert_eq!(tx.frames_held(), 0);
    }
}
