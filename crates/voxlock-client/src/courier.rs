//! Voice courier: ordered delivery of decoded audio.
//!
//! Decrypted Opus packets are parked per speaker and flushed by a
//! dedicated thread every `iteration_interval` (or sooner when signaled).
//! Each flush drains every parking lot atomically, decodes packets in
//! sequence order, conceals gaps with packet-loss concealment, and hands
//! per-speaker PCM (and optionally a combined mixdown) to the sink.
//!
//! Packets behind a speaker's delivered position are dropped: their slot
//! in the output stream has already been played.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap},
    sync::{Arc, Condvar, Mutex},
    thread,
    time::Duration,
};

use tracing::{debug, warn};

use crate::{
    decoder::{AudioDecoder, DecoderFactory, OPUS_CHANNEL_COUNT, OPUS_FRAME_SAMPLES},
    mixer::{GainRamp, MovingAverager, gain_target, mix_block},
};

/// Sequence comparison window around the u16 wrap point.
const SEQUENCE_WRAP_WINDOW: u16 = 5000;

/// Most packet-loss-concealment frames generated for one gap.
const MAX_PLC_FRAMES: u16 = 10;

/// Iterations of speaker-count history feeding the mix gain.
const GAIN_AVERAGE_ITERATIONS: usize = 16;

/// A decrypted voice packet awaiting decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoicePayload {
    /// RTP sequence number.
    pub sequence: u16,
    /// RTP timestamp.
    pub timestamp: u32,
    /// Decrypted Opus packet.
    pub opus: Vec<u8>,
}

/// Wrap-aware sequence comparison.
///
/// Two sequences straddling a [`SEQUENCE_WRAP_WINDOW`]-wide boundary near
/// 0/65535 are compared after both are shifted by the window, so a packet
/// numbered 3 sorts after one numbered 65530.
pub fn sequence_order(a: u16, b: u16) -> Ordering {
    let straddles = (a >= u16::MAX - SEQUENCE_WRAP_WINDOW && b <= SEQUENCE_WRAP_WINDOW)
        || (b >= u16::MAX - SEQUENCE_WRAP_WINDOW && a <= SEQUENCE_WRAP_WINDOW);
    if straddles {
        a.wrapping_add(SEQUENCE_WRAP_WINDOW).cmp(&b.wrapping_add(SEQUENCE_WRAP_WINDOW))
    } else {
        a.cmp(&b)
    }
}

/// Payload ordering: timestamp ascending, then wrap-aware sequence.
fn payload_order(a: &VoicePayload, b: &VoicePayload) -> Ordering {
    a.timestamp.cmp(&b.timestamp).then_with(|| sequence_order(a.sequence, b.sequence))
}

#[derive(Debug, PartialEq, Eq)]
struct Ordered(VoicePayload);

impl Ord for Ordered {
    fn cmp(&self, other: &Self) -> Ordering {
        payload_order(&self.0, &other.0)
    }
}

impl PartialOrd for Ordered {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending decoder control, applied before the next decode.
enum DecoderCtl {
    Gain(i16),
}

#[derive(Default)]
struct ParkingLot {
    /// First sequence the next flush may deliver. Packets behind it have
    /// been delivered (or concealed) and are dropped on arrival. `None`
    /// until the first flush.
    next_expected: Option<u16>,
    parked: BinaryHeap<Reverse<Ordered>>,
    pending_ctls: Vec<DecoderCtl>,
    decoder: Option<Box<dyn AudioDecoder>>,
}

struct CourierState {
    lots: HashMap<String, ParkingLot>,
    terminating: bool,
}

struct Shared {
    state: Mutex<CourierState>,
    signal: Condvar,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(CourierState { lots: HashMap::new(), terminating: false }),
            signal: Condvar::new(),
        }
    }
}

/// Consumer of decoded audio.
pub trait VoiceSink: Send {
    /// One speaker's decoded 16-bit interleaved stereo PCM.
    fn user_audio(&mut self, user_id: &str, pcm: &[i16], sequence: u16, timestamp: u32);

    /// The gain-ramped mixdown of every speaker this iteration.
    fn combined_audio(&mut self, _pcm: &[i16]) {}

    /// Whether to run the mixdown at all.
    fn wants_combined(&self) -> bool {
        false
    }
}

fn park_into(shared: &Shared, user_id: &str, payload: VoicePayload) {
    let Ok(mut state) = shared.state.lock() else {
        unreachable!("courier mutex poisoned");
    };
    let lot = state.lots.entry(user_id.to_owned()).or_default();

    if let Some(next) = lot.next_expected {
        if sequence_order(payload.sequence, next) == Ordering::Less {
            debug!(user_id, sequence = payload.sequence, "dropping late packet");
            return;
        }
    }

    lot.parked.push(Reverse(Ordered(payload)));
    shared.signal.notify_one();
}

/// One speaker's drained work for an iteration.
struct Batch {
    user_id: String,
    payloads: Vec<VoicePayload>,
    decoder: Box<dyn AudioDecoder>,
    /// Where the previous flush left off; `None` on the first flush.
    expected_start: Option<u16>,
}

/// The flush engine: everything the courier thread does between waits.
///
/// Separated from the thread so the drain/decode/mix path is testable
/// synchronously.
struct Deliverer {
    decoder_factory: DecoderFactory,
    sink: Box<dyn VoiceSink>,
    mix: Vec<i32>,
    mixed_out: Vec<i16>,
    speaker_average: MovingAverager,
    gain_ramp: GainRamp,
}

impl Deliverer {
    fn new(decoder_factory: DecoderFactory, sink: Box<dyn VoiceSink>) -> Self {
        Self {
            decoder_factory,
            sink,
            mix: Vec::new(),
            mixed_out: Vec::new(),
            speaker_average: MovingAverager::new(GAIN_AVERAGE_ITERATIONS),
            gain_ramp: GainRamp::new(),
        }
    }

    /// Drain every lot atomically, then decode and deliver outside the
    /// lock. Returns whether termination was requested.
    fn flush(&mut self, shared: &Shared) -> bool {
        let (batches, terminating) = {
            let Ok(mut state) = shared.state.lock() else {
                unreachable!("courier mutex poisoned");
            };

            let mut batches = Vec::new();
            for (user_id, lot) in &mut state.lots {
                if lot.parked.is_empty() {
                    continue;
                }

                let mut decoder = lot.decoder.take().unwrap_or_else(|| (self.decoder_factory)());
                for ctl in lot.pending_ctls.drain(..) {
                    match ctl {
                        DecoderCtl::Gain(gain) => decoder.set_gain_q8_db(gain),
                    }
                }

                let mut payloads = Vec::with_capacity(lot.parked.len());
                while let Some(Reverse(Ordered(payload))) = lot.parked.pop() {
                    payloads.push(payload);
                }

                let expected_start = lot.next_expected;

                // Everything drained is final: the next flush starts
                // after the highest sequence delivered.
                if let Some(last) = payloads.last() {
                    lot.next_expected = Some(last.sequence.wrapping_add(1));
                }

                batches.push(Batch {
                    user_id: user_id.clone(),
                    payloads,
                    decoder,
                    expected_start,
                });
            }
            (batches, state.terminating)
        };

        let active_speakers = batches.len();
        if self.sink.wants_combined() {
            self.mix.clear();
        }

        let mut returned = Vec::with_capacity(active_speakers);
        for mut batch in batches {
            let mut pcm = vec![0i16; OPUS_FRAME_SAMPLES * OPUS_CHANNEL_COUNT];
            let mut expected = batch.expected_start;

            for payload in &batch.payloads {
                // Conceal a sequence gap before decoding the real packet.
                if let Some(expected) = expected {
                    let mut missing = expected;
                    let mut concealed = 0u16;
                    while sequence_order(missing, payload.sequence) == Ordering::Less
                        && concealed < MAX_PLC_FRAMES
                    {
                        let samples = batch.decoder.decode(None, &mut pcm);
                        if samples > 0 {
                            self.deliver(
                                &batch.user_id,
                                &pcm[..samples * OPUS_CHANNEL_COUNT],
                                missing,
                                payload.timestamp,
                            );
                        }
                        missing = missing.wrapping_add(1);
                        concealed += 1;
                    }
                    if concealed == MAX_PLC_FRAMES {
                        warn!(user_id = %batch.user_id, "sequence gap too large to conceal");
                    }
                }

                let samples = batch.decoder.decode(Some(&payload.opus), &mut pcm);
                if samples > 0 {
                    self.deliver(
                        &batch.user_id,
                        &pcm[..samples * OPUS_CHANNEL_COUNT],
                        payload.sequence,
                        payload.timestamp,
                    );
                }
                expected = Some(payload.sequence.wrapping_add(1));
            }

            returned.push((batch.user_id, batch.decoder));
        }

        if self.sink.wants_combined() && !self.mix.is_empty() {
            self.speaker_average.push(active_speakers as i64);
            let target = gain_target(self.speaker_average.average());
            self.mixed_out.resize(self.mix.len(), 0);
            self.gain_ramp.apply(&self.mix, &mut self.mixed_out, target);
            self.sink.combined_audio(&self.mixed_out);
        }

        // Return decoders to their lots for the next iteration.
        {
            let Ok(mut state) = shared.state.lock() else {
                unreachable!("courier mutex poisoned");
            };
            for (user_id, decoder) in returned {
                if let Some(lot) = state.lots.get_mut(&user_id) {
                    lot.decoder = Some(decoder);
                }
            }
        }

        terminating
    }

    fn deliver(&mut self, user_id: &str, pcm: &[i16], sequence: u16, timestamp: u32) {
        if self.sink.wants_combined() {
            if self.mix.len() < pcm.len() {
                self.mix.resize(pcm.len(), 0);
            }
            mix_block(&mut self.mix[..pcm.len()], pcm);
        }
        self.sink.user_audio(user_id, pcm, sequence, timestamp);
    }
}

/// Handle to the courier thread.
pub struct Courier {
    shared: Arc<Shared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Courier {
    /// Spawn the courier thread.
    pub fn spawn(
        iteration_interval: Duration,
        decoder_factory: DecoderFactory,
        sink: Box<dyn VoiceSink>,
    ) -> Self {
        let shared = Arc::new(Shared::new());

        let thread_shared = shared.clone();
        let handle = thread::Builder::new().name("voice-courier".into()).spawn(move || {
            let mut deliverer = Deliverer::new(decoder_factory, sink);
            loop {
                {
                    let Ok(guard) = thread_shared.state.lock() else {
                        unreachable!("courier mutex poisoned");
                    };
                    let Ok(_unused) =
                        thread_shared.signal.wait_timeout(guard, iteration_interval)
                    else {
                        unreachable!("courier mutex poisoned");
                    };
                }
                // Pending payloads are delivered before termination.
                if deliverer.flush(&thread_shared) {
                    return;
                }
            }
        });
        let Ok(handle) = handle else {
            unreachable!("spawning the courier thread cannot fail under normal limits");
        };

        Self { shared, handle: Some(handle) }
    }

    /// Park a decrypted packet for a speaker and signal the courier.
    pub fn park(&self, user_id: &str, payload: VoicePayload) {
        park_into(&self.shared, user_id, payload);
    }

    /// Queue a gain control for a speaker's decoder.
    ///
    /// Works before the speaker has ever spoken: the lot (and later the
    /// decoder) is created on demand and the setting applies before the
    /// first decode.
    pub fn set_user_gain(&self, user_id: &str, gain_q8_db: i16) {
        let Ok(mut state) = self.shared.state.lock() else {
            unreachable!("courier mutex poisoned");
        };
        state
            .lots
            .entry(user_id.to_owned())
            .or_default()
            .pending_ctls
            .push(DecoderCtl::Gain(gain_q8_db));
    }

    /// Stop the courier; parked payloads are delivered first.
    pub fn stop(mut self) {
        self.terminate();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn terminate(&self) {
        let Ok(mut state) = self.shared.state.lock() else {
            unreachable!("courier mutex poisoned");
        };
        state.terminating = true;
        self.shared.signal.notify_all();
    }
}

impl Drop for Courier {
    fn drop(&mut self) {
        self.terminate();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn sequence_order_is_plain_away_from_wrap() {
        assert_eq!(sequence_order(10, 20), Ordering::Less);
        assert_eq!(sequence_order(20, 10), Ordering::Greater);
        assert_eq!(sequence_order(7, 7), Ordering::Equal);
    }

    #[test]
    fn sequence_order_handles_wraparound() {
        // 65530 comes before 3: they straddle the boundary.
        assert_eq!(sequence_order(65530, 3), Ordering::Less);
        assert_eq!(sequence_order(3, 65530), Ordering::Greater);
    }

    #[test]
    fn payload_ordering_prefers_timestamp() {
        let early = VoicePayload { sequence: 9, timestamp: 100, opus: vec![] };
        let late = VoicePayload { sequence: 1, timestamp: 200, opus: vec![] };
        assert_eq!(payload_order(&early, &late), Ordering::Less);
    }

    /// Decoder that echoes the packet's first byte across one frame, and
    /// zeros for concealment.
    struct EchoDecoder;
    impl AudioDecoder for EchoDecoder {
        fn decode(&mut self, packet: Option<&[u8]>, pcm_out: &mut [i16]) -> usize {
            let value = packet.map(|p| i16::from(p[0])).unwrap_or(0);
            for sample in pcm_out.iter_mut() {
                *sample = value;
            }
            OPUS_FRAME_SAMPLES
        }
    }

    struct ChannelSink {
        user: mpsc::Sender<(String, u16, i16)>,
        combined: Option<mpsc::Sender<Vec<i16>>>,
    }
    impl VoiceSink for ChannelSink {
        fn user_audio(&mut self, user_id: &str, pcm: &[i16], sequence: u16, _timestamp: u32) {
            let _ = self.user.send((user_id.to_owned(), sequence, pcm[0]));
        }
        fn combined_audio(&mut self, pcm: &[i16]) {
            if let Some(combined) = &self.combined {
                let _ = combined.send(pcm.to_vec());
            }
        }
        fn wants_combined(&self) -> bool {
            self.combined.is_some()
        }
    }

    fn payload(sequence: u16, timestamp: u32, value: u8) -> VoicePayload {
        VoicePayload { sequence, timestamp, opus: vec![value] }
    }

    fn engine(
        combined: bool,
    ) -> (Shared, Deliverer, mpsc::Receiver<(String, u16, i16)>, mpsc::Receiver<Vec<i16>>) {
        let (user_tx, user_rx) = mpsc::channel();
        let (combined_tx, combined_rx) = mpsc::channel();
        let sink = ChannelSink {
            user: user_tx,
            combined: combined.then_some(combined_tx),
        };
        let deliverer = Deliverer::new(Box::new(|| Box::new(EchoDecoder)), Box::new(sink));
        (Shared::new(), deliverer, user_rx, combined_rx)
    }

    #[test]
    fn flush_delivers_in_sequence_order() {
        let (shared, mut deliverer, user_rx, _combined_rx) = engine(false);

        // Parked out of order: 3, 1, 2.
        park_into(&shared, "user-a", payload(3, 300, 33));
        park_into(&shared, "user-a", payload(1, 100, 11));
        park_into(&shared, "user-a", payload(2, 200, 22));

        deliverer.flush(&shared);

        let received: Vec<_> = user_rx.try_iter().map(|(_, seq, value)| (seq, value)).collect();
        assert_eq!(received, vec![(1, 11), (2, 22), (3, 33)]);
    }

    #[test]
    fn flush_conceals_gaps_across_flushes() {
        let (shared, mut deliverer, user_rx, _combined_rx) = engine(false);

        park_into(&shared, "user-a", payload(1, 100, 11));
        deliverer.flush(&shared);

        park_into(&shared, "user-a", payload(4, 400, 44));
        deliverer.flush(&shared);

        let received: Vec<_> = user_rx.try_iter().map(|(_, seq, value)| (seq, value)).collect();
        // Sequences 2 and 3 are concealed with silence.
        assert_eq!(received, vec![(1, 11), (2, 0), (3, 0), (4, 44)]);
    }

    #[test]
    fn late_packets_are_dropped_after_flush() {
        let (shared, mut deliverer, user_rx, _combined_rx) = engine(false);

        park_into(&shared, "user-a", payload(5, 500, 55));
        deliverer.flush(&shared);

        // Sequence 4 is now behind the delivered position.
        park_into(&shared, "user-a", payload(4, 400, 44));
        deliverer.flush(&shared);

        let received: Vec<_> = user_rx.try_iter().map(|(_, seq, _)| seq).collect();
        assert_eq!(received, vec![5]);
    }

    #[test]
    fn combined_audio_mixes_speakers() {
        let (shared, mut deliverer, _user_rx, combined_rx) = engine(true);

        park_into(&shared, "user-a", payload(1, 100, 10));
        park_into(&shared, "user-b", payload(1, 100, 20));
        deliverer.flush(&shared);

        let mixed = combined_rx.try_recv().expect("combined block");
        // Two speakers at unity gain on the first iterations: samples sum.
        assert_eq!(mixed[0], 30);
    }

    #[test]
    fn gain_ctl_applies_before_first_decode() {
        struct GainProbe(mpsc::Sender<i16>);
        impl AudioDecoder for GainProbe {
            fn decode(&mut self, _packet: Option<&[u8]>, pcm_out: &mut [i16]) -> usize {
                pcm_out.fill(1);
                OPUS_FRAME_SAMPLES
            }
            fn set_gain_q8_db(&mut self, gain: i16) {
                let _ = self.0.send(gain);
            }
        }

        let (gain_tx, gain_rx) = mpsc::channel();
        let (user_tx, _user_rx) = mpsc::channel();
        let sink = ChannelSink { user: user_tx, combined: None };
        let factory_tx = gain_tx.clone();
        let mut deliverer = Deliverer::new(
            Box::new(move || Box::new(GainProbe(factory_tx.clone()))),
            Box::new(sink),
        );
        let shared = Shared::new();

        // Gain is set before the user ever speaks.
        {
            let mut state = shared.state.lock().unwrap();
            state.lots.entry("user-a".into()).or_default().pending_ctls.push(DecoderCtl::Gain(-128));
        }
        park_into(&shared, "user-a", payload(1, 100, 1));
        deliverer.flush(&shared);

        assert_eq!(gain_rx.try_recv(), Ok(-128));
        drop(gain_tx);
    }

    #[test]
    fn courier_thread_delivers() {
        let (user_tx, user_rx) = mpsc::channel();
        let courier = Courier::spawn(
            Duration::from_millis(5),
            Box::new(|| Box::new(EchoDecoder)),
            Box::new(ChannelSink { user: user_tx, combined: None }),
        );

        courier.park("user-a", payload(1, 100, 42));
        let (user, sequence, value) =
            user_rx.recv_timeout(Duration::from_secs(2)).expect("threaded delivery");
        assert_eq!((user.as_str(), sequence, value), ("user-a", 1, 42));

        courier.stop();
    }
}
