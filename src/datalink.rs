// Datalink layer: byte framing, stream reception and the transmit machine.

use crate::{
    SciResult,
    buffer::FrameBuffer,
    config::{ETX, NUM_DEBUG_HOOKS, STX, TxMode},
};
use log::trace;

/// Transmit side of the wire, supplied by the host.
///
/// Blocking hosts only need [`send_blocking`](Self::send_blocking); buffered
/// transmit additionally uses [`send`](Self::send) and
/// [`busy`](Self::busy).
pub trait WireTx: Send {
    /// Transmits the whole chunk before returning.
    fn send_blocking(&mut self, data: &[u8]) -> SciResult<()>;

    /// Hands bytes to the wire without blocking, returning how many were
    /// accepted.
    fn send(&mut self, data: &[u8]) -> SciResult<usize> {
        self.send_blocking(data)?;
        Ok(data.len())
    }

    /// Whether the wire cannot currently accept bytes.
    fn busy(&mut self) -> bool {
        false
    }
}

/// Parameterless hook invoked by the `Dbg<d>` trigger.
pub type DebugHook = Box<dyn FnMut() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RxState {
    Idle,
    WaitStx,
    Busy,
    Pending,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxState {
    Idle,
    SendStx,
    SendBuffer,
    SendEtx,
    Ready,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbgState {
    Idle,
    S1,
    S2,
    S3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReceiveMode {
    Transfer,
    Stream,
}

/// Framing state machines between the raw wire and the frame buffers.
pub(crate) struct Datalink {
    rx_state: RxState,
    tx_state: TxState,
    dbg_state: DbgState,
    mode: ReceiveMode,
    /// Stream-mode byte budget left across frames.
    bytes_to_go: u32,
    /// Payload bytes consumed within the current stream frame.
    msg_byte_count: usize,
    /// Payload length snapshot taken when a frame transmission starts.
    tx_len: usize,
    tx_pos: usize,
    tx_mode: TxMode,
    wire: Box<dyn WireTx>,
    debug_hooks: [Option<DebugHook>; NUM_DEBUG_HOOKS],
}

impl std::fmt::Debug for Datalink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datalink")
            .field("rx_state", &self.rx_state)
            .field("tx_state", &self.tx_state)
            .field("mode", &self.mode)
            .field("bytes_to_go", &self.bytes_to_go)
            .finish_non_exhaustive()
    }
}

impl Datalink {
    pub(crate) fn new(wire: Box<dyn WireTx>, tx_mode: TxMode) -> Self {
        Self {
            rx_state: RxState::Idle,
            tx_state: TxState::Idle,
            dbg_state: DbgState::Idle,
            mode: ReceiveMode::Transfer,
            bytes_to_go: 0,
            msg_byte_count: 0,
            tx_len: 0,
            tx_pos: 0,
            tx_mode,
            wire,
            debug_hooks: Default::default(),
        }
    }

    pub(crate) fn rx_state(&self) -> RxState {
        self.rx_state
    }

    pub(crate) fn tx_state(&self) -> TxState {
        self.tx_state
    }

    pub(crate) fn mode(&self) -> ReceiveMode {
        self.mode
    }

    pub(crate) fn stream_remaining(&self) -> u32 {
        self.bytes_to_go
    }

    pub(crate) fn set_debug_hook(&mut self, slot: usize, hook: DebugHook) {
        if slot < NUM_DEBUG_HOOKS {
            self.debug_hooks[slot] = Some(hook);
        }
    }

    /// Arms the receiver for an expected reply.
    pub(crate) fn start_rx(&mut self) {
        self.rx_state = RxState::WaitStx;
    }

    /// Consumes a pending frame notification.
    pub(crate) fn ack_rx(&mut self) {
        if self.rx_state == RxState::Pending {
            self.rx_state = RxState::Idle;
        }
    }

    /// Consumes the transmit-complete notification.
    pub(crate) fn ack_tx(&mut self) {
        if self.tx_state == TxState::Ready {
            self.tx_state = TxState::Idle;
        }
    }

    /// Switches reception to byte-counted stream mode with the given budget.
    pub(crate) fn initiate_stream(&mut self, byte_count: u32) {
        trace!("stream mode on, budget {} bytes", byte_count);
        self.mode = ReceiveMode::Stream;
        self.bytes_to_go = byte_count;
        self.msg_byte_count = 0;
    }

    /// Restores framed transfer reception.
    pub(crate) fn finish_stream(&mut self) {
        trace!("stream mode off");
        self.mode = ReceiveMode::Transfer;
        self.bytes_to_go = 0;
    }

    /// Feeds one inbound byte through the receive machine of the active mode.
    pub(crate) fn receive(&mut self, rx: &mut FrameBuffer, byte: u8) {
        match self.mode {
            ReceiveMode::Transfer => self.receive_transfer(rx, byte),
            ReceiveMode::Stream => self.receive_stream(rx, byte),
        }
    }

    fn receive_transfer(&mut self, rx: &mut FrameBuffer, byte: u8) {
        match (self.rx_state, byte) {
            // A pending frame must be acknowledged before new input counts
            (RxState::Pending, _) => return,
            (RxState::Idle | RxState::WaitStx, STX) => {
                rx.flush();
                self.rx_state = RxState::Busy;
            }
            // Stray STX mid-frame: silent reset, nothing is delivered
            (RxState::Busy, STX) => {
                self.rx_state = RxState::Idle;
            }
            (RxState::Busy, ETX) => {
                trace!("frame complete, {} payload bytes", rx.len());
                self.rx_state = RxState::Pending;
            }
            (RxState::Busy, data) => {
                rx.put(data);
                // An overrun frame is dropped, never delivered truncated
                if rx.overflowed() {
                    self.rx_state = RxState::Idle;
                }
            }
            (RxState::WaitStx, _) => {
                self.rx_state = RxState::Idle;
            }
            (RxState::Idle | RxState::Error, _) => {}
        }

        // The debug trigger only listens while reception is idle
        if self.rx_state == RxState::Idle {
            self.feed_debug(byte);
        } else {
            self.dbg_state = DbgState::Idle;
        }
    }

    fn receive_stream(&mut self, rx: &mut FrameBuffer, byte: u8) {
        match self.rx_state {
            RxState::WaitStx => {
                if byte == STX {
                    rx.flush();
                    self.msg_byte_count = 0;
                    self.rx_state = RxState::Busy;
                }
            }
            RxState::Busy => {
                if self.bytes_to_go > 0 && self.msg_byte_count < rx.capacity() {
                    rx.put(byte);
                    self.bytes_to_go -= 1;
                    self.msg_byte_count += 1;
                } else if byte == ETX {
                    trace!(
                        "stream frame complete, {} bytes, {} to go",
                        self.msg_byte_count, self.bytes_to_go
                    );
                    self.rx_state = RxState::Pending;
                } else {
                    self.rx_state = RxState::Idle;
                }
            }
            _ => {}
        }
    }

    fn feed_debug(&mut self, byte: u8) {
        self.dbg_state = match self.dbg_state {
            DbgState::Idle if byte == b'D' => DbgState::S1,
            DbgState::S1 if byte == b'b' => DbgState::S2,
            DbgState::S2 if byte == b'g' => DbgState::S3,
            DbgState::S3 => {
                if byte.is_ascii_digit() {
                    let slot = usize::from(byte - b'0');
                    if let Some(hook) = self.debug_hooks[slot].as_mut() {
                        hook();
                    }
                }
                DbgState::Idle
            }
            _ => DbgState::Idle,
        };
    }

    /// Advances the transmit machine by one tick. `payload` is the populated
    /// transmit buffer; its length is snapshotted when the frame starts.
    pub(crate) fn transmit(&mut self, payload: &[u8]) -> SciResult<()> {
        match self.tx_state {
            TxState::Idle => {
                self.tx_len = payload.len();
                self.tx_pos = 0;
                self.tx_state = TxState::SendStx;
            }
            TxState::SendStx => {
                if self.send_chunk(&[STX])? == 1 {
                    self.tx_state = TxState::SendBuffer;
                }
            }
            TxState::SendBuffer => {
                if self.tx_pos < self.tx_len {
                    let chunk = match self.tx_mode {
                        TxMode::ByteByByte => &payload[self.tx_pos..self.tx_pos + 1],
                        TxMode::Buffered => &payload[self.tx_pos..self.tx_len],
                    };
                    self.tx_pos += self.send_chunk(chunk)?;
                }
                if self.tx_pos >= self.tx_len {
                    self.tx_state = TxState::SendEtx;
                }
            }
            TxState::SendEtx => {
                if self.send_chunk(&[ETX])? == 1 {
                    trace!("frame sent, {} payload bytes", self.tx_len);
                    self.tx_state = TxState::Ready;
                }
            }
            TxState::Ready | TxState::Error => {}
        }
        Ok(())
    }

    fn send_chunk(&mut self, chunk: &[u8]) -> SciResult<usize> {
        let sent = match self.tx_mode {
            TxMode::ByteByByte => self
                .wire
                .send_blocking(chunk)
                .map(|()| chunk.len()),
            TxMode::Buffered => {
                if self.wire.busy() {
                    return Ok(0);
                }
                self.wire.send(chunk)
            }
        };
        sent.inspect_err(|_| self.tx_state = TxState::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingWire {
        sent: Arc<Mutex<Vec<u8>>>,
        busy: Arc<Mutex<bool>>,
        accept_at_most: Option<usize>,
    }
    impl WireTx for RecordingWire {
        fn send_blocking(&mut self, data: &[u8]) -> SciResult<()> {
            self.sent.lock().unwrap().extend_from_slice(data);
            Ok(())
        }
        fn send(&mut self, data: &[u8]) -> SciResult<usize> {
            let n = self.accept_at_most.map_or(data.len(), |m| m.min(data.len()));
            self.sent.lock().unwrap().extend_from_slice(&data[..n]);
            Ok(n)
        }
        fn busy(&mut self) -> bool {
            *self.busy.lock().unwrap()
        }
    }

    fn link(tx_mode: TxMode) -> (Datalink, Arc<Mutex<Vec<u8>>>) {
        let wire = RecordingWire::default();
        let sent = wire.sent.clone();
        (Datalink::new(Box::new(wire), tx_mode), sent)
    }

    fn feed(dl: &mut Datalink, rx: &mut FrameBuffer, bytes: &[u8]) {
        for &b in bytes {
            dl.receive(rx, b);
        }
    }

    #[test]
    fn receives_one_frame() {
        let (mut dl, _) = link(TxMode::ByteByByte);
        let mut rx = FrameBuffer::with_capacity(32);
        dl.start_rx();
        feed(&mut dl, &mut rx, b"\x021?ACK;2A\x03");
        assert_eq!(dl.rx_state(), RxState::Pending);
        assert_eq!(rx.as_slice(), b"1?ACK;2A");
    }

    #[test]
    fn bytes_before_stx_are_dropped() {
        let (mut dl, _) = link(TxMode::ByteByByte);
        let mut rx = FrameBuffer::with_capacity(32);
        dl.start_rx();
        // Noise moves WaitStx back to Idle; the later STX still opens a frame
        feed(&mut dl, &mut rx, b"xy\x02AB\x03");
        assert_eq!(dl.rx_state(), RxState::Pending);
        assert_eq!(rx.as_slice(), b"AB");
    }

    #[test]
    fn stray_stx_aborts_the_frame() {
        let (mut dl, _) = link(TxMode::ByteByByte);
        let mut rx = FrameBuffer::with_capacity(32);
        dl.start_rx();
        feed(&mut dl, &mut rx, b"\x02AB\x02");
        assert_eq!(dl.rx_state(), RxState::Idle);
        // Nothing is delivered for the aborted frame
        feed(&mut dl, &mut rx, b"CD\x03");
        assert_eq!(dl.rx_state(), RxState::Idle);
    }

    #[test]
    fn overlong_frame_is_dropped() {
        let (mut dl, _) = link(TxMode::ByteByByte);
        let mut rx = FrameBuffer::with_capacity(4);
        dl.start_rx();
        feed(&mut dl, &mut rx, b"\x02ABCDE\x03");
        assert_eq!(dl.rx_state(), RxState::Idle);
    }

    #[test]
    fn pending_frame_ignores_input_until_acknowledged() {
        let (mut dl, _) = link(TxMode::ByteByByte);
        let mut rx = FrameBuffer::with_capacity(32);
        dl.start_rx();
        feed(&mut dl, &mut rx, b"\x02AB\x03\x02ZZ\x03");
        assert_eq!(rx.as_slice(), b"AB");
        dl.ack_rx();
        assert_eq!(dl.rx_state(), RxState::Idle);
    }

    #[test]
    fn debug_trigger_fires_hook_slot() {
        let (mut dl, _) = link(TxMode::ByteByByte);
        let mut rx = FrameBuffer::with_capacity(32);
        let fired = Arc::new(Mutex::new(0u32));
        let counter = fired.clone();
        dl.set_debug_hook(3, Box::new(move || *counter.lock().unwrap() += 1));
        feed(&mut dl, &mut rx, b"Dbg3");
        assert_eq!(*fired.lock().unwrap(), 1);
        // Mismatch resets the trigger sequence
        feed(&mut dl, &mut rx, b"Dbx3Dbg9Dbg3");
        assert_eq!(*fired.lock().unwrap(), 2);
    }

    #[test]
    fn debug_trigger_is_disabled_mid_frame() {
        let (mut dl, _) = link(TxMode::ByteByByte);
        let mut rx = FrameBuffer::with_capacity(32);
        let fired = Arc::new(Mutex::new(0u32));
        let counter = fired.clone();
        dl.set_debug_hook(0, Box::new(move || *counter.lock().unwrap() += 1));
        dl.start_rx();
        feed(&mut dl, &mut rx, b"\x02Dbg0\x03");
        assert_eq!(*fired.lock().unwrap(), 0);
        assert_eq!(rx.as_slice(), b"Dbg0");
    }

    #[test]
    fn stream_mode_consumes_budget_across_frames() {
        let (mut dl, _) = link(TxMode::ByteByByte);
        let mut rx = FrameBuffer::with_capacity(4);
        dl.initiate_stream(6);
        dl.start_rx();
        // Sentinel bytes inside the budget are payload, not framing
        feed(&mut dl, &mut rx, &[STX, 0xAA, ETX, STX, 0xBB, ETX]);
        assert_eq!(dl.rx_state(), RxState::Pending);
        assert_eq!(rx.as_slice(), &[0xAA, ETX, STX, 0xBB]);
        assert_eq!(dl.stream_remaining(), 2);

        dl.ack_rx();
        dl.start_rx();
        feed(&mut dl, &mut rx, &[STX, 0xCC, 0xDD, ETX]);
        assert_eq!(dl.rx_state(), RxState::Pending);
        assert_eq!(rx.as_slice(), &[0xCC, 0xDD]);
        assert_eq!(dl.stream_remaining(), 0);

        dl.finish_stream();
        assert_eq!(dl.mode(), ReceiveMode::Transfer);
    }

    #[test]
    fn transmit_wraps_payload_in_sentinels() {
        let (mut dl, sent) = link(TxMode::ByteByByte);
        let payload = b"FF:3,40000000,FF";
        while dl.tx_state() != TxState::Ready {
            dl.transmit(payload).unwrap();
        }
        let mut expected = vec![STX];
        expected.extend_from_slice(payload);
        expected.push(ETX);
        assert_eq!(*sent.lock().unwrap(), expected);
        dl.ack_tx();
        assert_eq!(dl.tx_state(), TxState::Idle);
    }

    #[test]
    fn byte_by_byte_sends_one_payload_byte_per_tick() {
        let (mut dl, sent) = link(TxMode::ByteByByte);
        let payload = b"1?";
        dl.transmit(payload).unwrap(); // prime
        dl.transmit(payload).unwrap(); // STX
        assert_eq!(*sent.lock().unwrap(), vec![STX]);
        dl.transmit(payload).unwrap();
        assert_eq!(*sent.lock().unwrap(), vec![STX, b'1']);
    }

    #[test]
    fn buffered_mode_respects_busy_wire() {
        let wire = RecordingWire::default();
        let sent = wire.sent.clone();
        let busy = wire.busy.clone();
        let mut dl = Datalink::new(Box::new(wire), TxMode::Buffered);

        *busy.lock().unwrap() = true;
        dl.transmit(b"AB").unwrap(); // prime
        dl.transmit(b"AB").unwrap(); // blocked on busy
        assert!(sent.lock().unwrap().is_empty());

        *busy.lock().unwrap() = false;
        while dl.tx_state() != TxState::Ready {
            dl.transmit(b"AB").unwrap();
        }
        assert_eq!(*sent.lock().unwrap(), vec![STX, b'A', b'B', ETX]);
    }

    #[test]
    fn buffered_mode_resumes_after_partial_accept() {
        let wire = RecordingWire {
            accept_at_most: Some(1),
            ..RecordingWire::default()
        };
        let sent = wire.sent.clone();
        let mut dl = Datalink::new(Box::new(wire), TxMode::Buffered);
        while dl.tx_state() != TxState::Ready {
            dl.transmit(b"AB").unwrap();
        }
        assert_eq!(*sent.lock().unwrap(), vec![STX, b'A', b'B', ETX]);
    }
}
