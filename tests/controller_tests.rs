//! End-to-end tests of the track controller on mock hardware

use dcc_track::{
    hal::{MockAlarm, MockChannel, MockDelay, MockPins},
    Address, CutoutConfig, EncoderConfig, HardwareInitError, InitStage, LineState, Packet,
    QueueFullError, QueuePolicy, SymbolBuffer, TimingViolationError, TrackCallbacks,
    TrackConfig, TrackController, TrackError, TrackMode, TrackState,
};

type Track = TrackController<MockChannel, MockAlarm, MockPins, MockDelay, 8>;

fn new_track() -> Track {
    TrackController::new(
        MockChannel::new(),
        MockAlarm::new(),
        MockPins::new(),
        MockDelay::new(),
    )
}

fn running(config: TrackConfig) -> Track {
    let mut track = new_track();
    track.init(config, TrackCallbacks::default()).unwrap();
    track
}

/// Hardware finishes the oldest frame; the task handles it and refills.
fn step(track: &mut Track) -> SymbolBuffer {
    let done = track.channel_mut().complete().expect("frame in flight");
    track.on_tx_done();
    track.service();
    done
}

fn encode(track: &Track, packet: &Packet) -> SymbolBuffer {
    track.encoder().unwrap().encode(packet).unwrap()
}

fn loco(addr: u8, speed: u8) -> Packet {
    Packet::new(Address::short(addr).unwrap(), &[0x3F, speed]).unwrap()
}

fn estop() -> Packet {
    Packet::new(Address::Broadcast, &[0x41]).unwrap().urgent()
}

fn expected_bits(preamble: usize, bytes: &[u8]) -> Vec<bool> {
    let mut bits = vec![true; preamble];
    for byte in bytes {
        bits.push(false);
        for bit in (0..8).rev() {
            bits.push(byte & (1 << bit) != 0);
        }
    }
    bits.push(true);
    bits
}

// ============================================================================
// Signal Content
// ============================================================================

#[test]
fn packet_goes_out_framed() {
    let mut track = running(TrackConfig::default());
    let packet = Packet::new(Address::short(3).unwrap(), &[0x60]).unwrap();
    track.enqueue(packet).unwrap();

    step(&mut track);
    step(&mut track);
    let sent = step(&mut track);

    let bits: Vec<bool> = sent.bits().collect();
    assert_eq!(bits, expected_bits(17, &[0x03, 0x60, 0x63]));
    assert_eq!(sent.end_bit_index(), 17 + 3 * 9);
}

#[test]
fn idle_fills_every_gap() {
    let mut track = running(TrackConfig::default());
    let idle_bits = expected_bits(17, &[0xFF, 0x00, 0xFF]);

    for _ in 0..10 {
        let sent = step(&mut track);
        assert_eq!(sent.bits().collect::<Vec<_>>(), idle_bits);
    }
    assert_eq!(track.channel().queued.len(), 2);
    assert_eq!(track.stats().frames_sent, 10);
    assert_eq!(track.stats().underruns, 0);
}

#[test]
fn underrun_substitutes_idle() {
    let mut track = running(TrackConfig::default());

    // Two completions without a service call in between
    track.channel_mut().complete();
    track.on_tx_done();
    track.channel_mut().complete();
    track.on_tx_done();

    assert_eq!(track.stats().underruns, 1);
    assert_eq!(track.channel().queued.len(), 1);
    assert!(track.transmitter().in_flight().unwrap().is_idle());

    track.service();
    assert_eq!(track.channel().queued.len(), 2);
}

#[test]
fn service_recovers_after_channel_fault() {
    let mut track = running(TrackConfig::default());
    track.channel_mut().fail_transmit = true;

    step(&mut track);
    track.channel_mut().complete();
    track.on_tx_done();
    assert_eq!(track.stats().channel_faults, 2);
    assert_eq!(track.stats().underruns, 1);
    assert!(track.channel().queued.is_empty());

    track.channel_mut().fail_transmit = false;
    assert_eq!(track.service(), 2);
    assert_eq!(track.channel().queued.len(), 2);
}

#[test]
fn refused_packet_stays_queued() {
    let mut track = running(TrackConfig::default());
    let packet = loco(5, 0x90);
    track.enqueue(packet.clone()).unwrap();
    track.channel_mut().fail_transmit = true;

    step(&mut track);
    assert_eq!(track.queue_len(), 1);
    assert_eq!(track.stats().channel_faults, 1);

    track.channel_mut().fail_transmit = false;
    for _ in 0..6 {
        step(&mut track);
    }
    assert_eq!(track.queue_len(), 0);
    let expected = encode(&track, &packet);
    assert_eq!(
        track.channel().sent.iter().filter(|f| **f == expected).count(),
        1
    );
}

// ============================================================================
// Queueing
// ============================================================================

#[test]
fn urgent_overtakes_waiting_packets() {
    let mut track = running(TrackConfig::default());
    let normal = [loco(3, 0x90), loco(4, 0x90), loco(5, 0x90)];
    for packet in &normal {
        track.enqueue(packet.clone()).unwrap();
    }
    track.enqueue(estop()).unwrap();

    for _ in 0..6 {
        step(&mut track);
    }
    let sent = &track.channel().sent;
    assert_eq!(sent[2], encode(&track, &estop()));
    assert_eq!(sent[3], encode(&track, &normal[0]));
    assert_eq!(sent[4], encode(&track, &normal[1]));
    assert_eq!(sent[5], encode(&track, &normal[2]));
}

#[test]
fn repeated_packet_sent_back_to_back() {
    let mut track = running(TrackConfig::default());
    let packet = loco(3, 0x85).with_repeat(3).unwrap();
    track.enqueue(packet.clone()).unwrap();

    for _ in 0..6 {
        step(&mut track);
    }
    let expected = encode(&track, &packet);
    let sent = &track.channel().sent;
    assert_eq!(&sent[2..5], &[expected.clone(), expected.clone(), expected]);
    assert!(sent[5].bits().eq(expected_bits(17, &[0xFF, 0x00, 0xFF])));
}

#[test]
fn urgent_interrupts_repeats() {
    let mut track = running(TrackConfig::default());
    let packet = loco(3, 0x85).with_repeat(3).unwrap();
    track.enqueue(packet.clone()).unwrap();

    step(&mut track);
    step(&mut track);
    track.enqueue(estop()).unwrap();
    for _ in 0..4 {
        step(&mut track);
    }

    let repeat = encode(&track, &packet);
    let stop = encode(&track, &estop());
    let sent = &track.channel().sent;
    assert_eq!(sent[2], repeat);
    assert_eq!(sent[3], repeat);
    assert_eq!(sent[4], stop);
    assert_eq!(sent[5], repeat);
}

#[test]
fn full_queue_rejects_until_slot_frees() {
    let mut track = running(TrackConfig::default());
    for speed in 0..8 {
        track.enqueue(loco(3, 0x80 + speed)).unwrap();
    }
    assert_eq!(
        track.enqueue(loco(3, 0x90)),
        Err(TrackError::QueueFull(QueueFullError { capacity: 8 }))
    );
    // urgent packets share the same capacity
    assert!(track.enqueue(estop()).is_err());

    step(&mut track);
    assert_eq!(track.queue_len(), 7);
    track.enqueue(estop()).unwrap();
    assert_eq!(track.stats().urgent_queued, 1);
}

// ============================================================================
// Cutout
// ============================================================================

/// Runs until the cutout-flagged `packet` is on the rails, advancing time by
/// each idle frame's duration. Returns the frame start time.
fn start_cutout_frame(track: &mut Track, packet: &Packet) -> u64 {
    track.enqueue(packet.clone()).unwrap();
    let idle = track.transmitter().idle_frame().duration_us() as u64;
    for _ in 0..2 {
        track.alarm_mut().advance(idle);
        step(track);
    }
    track.transmitter().in_flight_since_us().unwrap()
}

#[test]
fn cutout_window_timing() {
    let mut track = running(TrackConfig::default());
    let packet = loco(3, 0x90).with_cutout(true);
    let frame = encode(&track, &packet);
    assert!(frame.has_cutout());

    let start = start_cutout_frame(&mut track, &packet);
    let window = track.cutout_timer().window().unwrap();

    assert_eq!(window.reference_us, start + frame.reference_offset_us() as u64);
    let open = window.open_at_us - window.reference_us;
    assert!((26..=32).contains(&open));
    assert!(window.close_at_us - window.open_at_us <= 488);
    // closes before the next preamble starts
    assert!(window.close_at_us <= start + frame.duration_us() as u64);
    assert_eq!(track.alarm().deadline, Some(window.open_at_us));

    // The alarm interrupt switches the line on its own
    track.alarm_mut().advance_to(window.open_at_us - 1);
    assert_eq!(track.line_state(), LineState::Drive);
    track.alarm_mut().advance_to(window.open_at_us);
    assert_eq!(track.line_state(), LineState::Cutout);
    assert!(track.pins().cutout.get());

    track.alarm_mut().advance_to(window.channel1_end_at_us);
    assert_eq!(track.line_state(), LineState::Cutout);

    track.alarm_mut().advance_to(window.close_at_us);
    assert_eq!(track.line_state(), LineState::Drive);
    assert!(!track.pins().cutout.get());
    assert!(!track.cutout_pending());
    assert_eq!(
        track.alarm().scheduled,
        [window.open_at_us, window.channel1_end_at_us, window.close_at_us]
    );

    track.on_alarm();
    track
        .alarm_mut()
        .advance_to(start + frame.duration_us() as u64);
    assert_eq!(step(&mut track), frame);

    let stats = track.stats();
    assert_eq!(stats.cutouts, 1);
    assert_eq!(stats.missed_alarms, 0);
    assert_eq!(stats.max_alarm_latency_us, 0);
}

#[test]
fn unfinished_cutout_closed_at_frame_end() {
    let mut track = running(TrackConfig::default());
    let packet = loco(3, 0x90).with_cutout(true);
    let frame = encode(&track, &packet);

    let start = start_cutout_frame(&mut track, &packet);
    let window = track.cutout_timer().window().unwrap();

    track.alarm_mut().isr_latency_us = 5;
    track.alarm_mut().advance_to(window.open_at_us + 5);
    track.on_alarm();
    assert_eq!(track.line_state(), LineState::Cutout);

    // The remaining steps never fire
    track.alarm_mut().deadline = None;
    track
        .alarm_mut()
        .advance_to(start + frame.duration_us() as u64);
    step(&mut track);

    assert_eq!(track.line_state(), LineState::Drive);
    assert!(!track.cutout_pending());
    let stats = track.stats();
    assert_eq!(stats.missed_alarms, 1);
    assert_eq!(stats.cutouts, 0);
    assert_eq!(stats.max_alarm_latency_us, 5);
}

#[test]
fn cutout_anchored_to_completion_stamp() {
    let mut track = running(TrackConfig::default());
    let packet = loco(3, 0x90).with_cutout(true);
    let frame = encode(&track, &packet);
    track.enqueue(packet).unwrap();

    let idle = track.transmitter().idle_frame().duration_us() as u64;
    track.alarm_mut().advance(idle);
    step(&mut track);

    // The flagged frame starts at `done`; the task gets to it 40us later
    let done = 2 * idle;
    track.alarm_mut().advance_to(done);
    track.channel_mut().complete_at(done).unwrap();
    track.alarm_mut().advance(40);
    track.on_tx_done();

    assert_eq!(track.transmitter().in_flight_since_us(), Some(done));
    let window = track.cutout_timer().window().unwrap();
    assert_eq!(window.reference_us, done + frame.reference_offset_us() as u64);
    assert_eq!(window.open_at_us - window.reference_us, 29);

    track.alarm_mut().advance_to(window.open_at_us - 1);
    assert!(!track.pins().cutout.get());
    track.alarm_mut().advance_to(window.open_at_us);
    assert!(track.pins().cutout.get());
    track.alarm_mut().advance_to(window.close_at_us);
    assert!(!track.pins().cutout.get());

    track.on_alarm();
    let stats = track.stats();
    assert_eq!(stats.cutouts, 1);
    assert_eq!(stats.max_alarm_latency_us, 0);
}

#[test]
fn window_skipped_when_handler_too_late() {
    let mut track = running(TrackConfig::default());
    let packet = loco(3, 0x90).with_cutout(true);
    let frame = encode(&track, &packet);
    track.enqueue(packet).unwrap();

    let idle = track.transmitter().idle_frame().duration_us() as u64;
    track.alarm_mut().advance(idle);
    step(&mut track);

    let done = 2 * idle;
    track.alarm_mut().advance_to(done);
    track.channel_mut().complete_at(done).unwrap();
    track
        .alarm_mut()
        .advance_to(done + frame.reference_offset_us() as u64 + 29);
    track.on_tx_done();

    assert!(!track.cutout_pending());
    assert!(track.alarm().scheduled.is_empty());
    assert_eq!(track.line_state(), LineState::Drive);
    assert_eq!(track.stats().missed_alarms, 1);
}

#[test]
fn unflagged_packets_arm_nothing() {
    let mut track = running(TrackConfig::default());
    track.enqueue(loco(3, 0x90)).unwrap();
    for _ in 0..4 {
        step(&mut track);
    }
    assert!(track.alarm().scheduled.is_empty());
    assert!(track.channel().sent.iter().all(|f| !f.has_cutout()));
}

#[test]
fn zero_cutout_symbol_disables_cutouts() {
    let config =
        TrackConfig::default().with_encoder(EncoderConfig::default().with_cutout_symbol_us(0));
    let mut track = running(config);
    track.enqueue(loco(3, 0x90).with_cutout(true)).unwrap();
    for _ in 0..4 {
        step(&mut track);
    }
    assert!(track.alarm().scheduled.is_empty());
    assert_eq!(track.channel().sent[2].cutout_symbols(), 0);
}

// ============================================================================
// Service Mode
// ============================================================================

#[test]
fn service_mode_long_preamble_no_cutout() {
    let mut track = running(TrackConfig::default().with_mode(TrackMode::Service));
    track.enqueue(loco(3, 0x90).with_cutout(true)).unwrap();
    for _ in 0..3 {
        step(&mut track);
    }

    let sent = &track.channel().sent;
    assert_eq!(sent[0].bits().take_while(|b| *b).count(), 20);
    assert!(!sent[2].has_cutout());
    assert!(track.alarm().scheduled.is_empty());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn init_rejects_bad_timing_without_touching_hardware() {
    let mut track = new_track();
    let config = TrackConfig::default().with_cutout(CutoutConfig::default().with_close_us(600));
    assert_eq!(
        track.init(config, TrackCallbacks::default()),
        Err(TrackError::TimingViolation(TimingViolationError::Duration(571)))
    );
    assert_eq!(track.state(), TrackState::Uninitialized);
    assert_eq!(track.channel().enable_calls, 0);
    assert!(!track.pins().configured.get());
}

#[test]
fn init_gives_up_and_rolls_back() {
    let mut track = TrackController::<_, _, _, _, 8>::new(
        MockChannel::new(),
        MockAlarm::new(),
        MockPins::new().failing_configure(3),
        MockDelay::new(),
    );
    assert_eq!(
        track.init(TrackConfig::default(), TrackCallbacks::default()),
        Err(TrackError::HardwareInit(HardwareInitError {
            stage: InitStage::Gpio,
            attempts: 3,
        }))
    );
    assert_eq!(track.state(), TrackState::Uninitialized);
    assert_eq!(track.channel().disable_calls, 3);
    assert!(!track.channel().enabled);
    assert!(!track.alarm().running);
    assert_eq!(track.line_state(), LineState::Released);
    // backoff of 2ms then 4ms
    assert_eq!(track.delay().total_ms(), 6);
}

#[test]
fn init_can_be_retried() {
    let mut track = TrackController::<_, _, _, _, 8>::new(
        MockChannel::new().failing_enable(5),
        MockAlarm::new(),
        MockPins::new(),
        MockDelay::new(),
    );
    assert!(matches!(
        track.init(TrackConfig::default(), TrackCallbacks::default()),
        Err(TrackError::HardwareInit(HardwareInitError {
            stage: InitStage::Transmitter,
            ..
        }))
    ));
    assert!(!track.pins().configured.get());

    track
        .init(TrackConfig::default(), TrackCallbacks::default())
        .unwrap();
    assert_eq!(track.state(), TrackState::Running);
    assert_eq!(track.channel().enable_calls, 6);
}

#[test]
fn lifecycle_calls_before_init() {
    let mut track = new_track();
    assert_eq!(track.pause(), Err(TrackError::NotInitialized));
    assert_eq!(
        track.resume(TrackConfig::default(), TrackCallbacks::default()),
        Err(TrackError::NotInitialized)
    );
    // packets may be queued before the track comes up
    track.enqueue(loco(3, 0x90)).unwrap();
    assert_eq!(track.queue_len(), 1);
}

#[test]
fn pause_releases_everything() {
    let mut track = running(TrackConfig::default());
    track.enqueue(loco(3, 0x90)).unwrap();
    track.enqueue(loco(4, 0x90)).unwrap();

    track.pause().unwrap();

    assert_eq!(track.state(), TrackState::Paused);
    assert_eq!(track.line_state(), LineState::Released);
    assert!(!track.pins().enable.get());
    assert!(track.pins().force_low.get());
    assert!(!track.pins().configured.get());
    assert!(!track.channel().enabled);
    assert!(track.channel().queued.is_empty());
    assert!(!track.alarm().running);
    assert_eq!(track.alarm().deadline, None);
    assert!(track.encoder().is_none());
    assert_eq!(track.queue_len(), 2);

    // idempotent
    track.pause().unwrap();
    assert_eq!(track.state(), TrackState::Paused);
}

#[test]
fn handlers_ignored_while_paused() {
    let mut track = running(TrackConfig::default());
    track.pause().unwrap();
    let frames = track.stats().frames_sent;

    track.on_tx_done();
    track.on_alarm();
    assert_eq!(track.service(), 0);
    assert_eq!(track.stats().frames_sent, frames);
    assert_eq!(track.line_state(), LineState::Released);
}

#[test]
fn resume_sends_retained_packets() {
    let mut track = running(TrackConfig::default());
    let first = loco(3, 0x90);
    track.enqueue(first.clone()).unwrap();
    track.pause().unwrap();
    track.enqueue(loco(4, 0x90)).unwrap();
    let drained = track.channel().sent.len();

    track
        .resume(TrackConfig::default(), TrackCallbacks::default())
        .unwrap();
    assert_eq!(track.state(), TrackState::Running);
    assert_eq!(track.line_state(), LineState::Drive);
    assert!(track.pins().enable.get());
    assert!(!track.pins().force_low.get());

    step(&mut track);
    step(&mut track);
    assert_eq!(track.channel().sent[drained + 1], encode(&track, &first));
    assert_eq!(track.queue_len(), 0);
}

#[test]
fn discard_policy_drops_queue_on_pause() {
    let mut track = running(TrackConfig::default().with_queue_policy(QueuePolicy::Discard));
    track.enqueue(loco(3, 0x90)).unwrap();
    track.enqueue(estop()).unwrap();

    track.pause().unwrap();
    assert_eq!(track.queue_len(), 0);
}

#[test]
fn resume_while_running_is_a_no_op() {
    let mut track = running(TrackConfig::default());
    track
        .resume(TrackConfig::default(), TrackCallbacks::default())
        .unwrap();
    assert_eq!(track.state(), TrackState::Running);
    assert_eq!(track.channel().enable_calls, 1);
    assert_eq!(track.channel().queued.len(), 2);
}

#[test]
fn resume_applies_new_config() {
    let mut track = running(TrackConfig::default());
    track.pause().unwrap();
    track
        .resume(
            TrackConfig::default().with_mode(TrackMode::Service),
            TrackCallbacks::default(),
        )
        .unwrap();
    assert_eq!(track.config().mode, TrackMode::Service);
    assert_eq!(track.encoder().unwrap().config().preamble_bits, 20);
    assert!(!track.cutout_timer().config().enabled);
}

#[test]
fn pause_resume_cycles() {
    let mut track = running(TrackConfig::default());
    for _ in 0..3 {
        step(&mut track);
        track.pause().unwrap();
        track
            .resume(TrackConfig::default(), TrackCallbacks::default())
            .unwrap();
    }
    assert_eq!(track.state(), TrackState::Running);
    assert_eq!(track.channel().enable_calls, 4);
    assert_eq!(track.channel().disable_calls, 3);
    assert_eq!(track.channel().queued.len(), 2);
}
