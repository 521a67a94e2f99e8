// Master façade: owns the buffers, the datalink and the transfer controller.

use crate::{
    Error, SciResult,
    buffer::FrameBuffer,
    config::{MasterConfig, NUM_DEBUG_HOOKS},
    dataframe::{self, Request, RequestKind, Value},
    datalink::{Datalink, DebugHook, ReceiveMode, RxState, TxState, WireTx},
    transfer::{Directive, ResultSink, TransferController},
};
use log::{debug, trace};

/// Protocol-level state owning the link. Only `Idle` accepts a new request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ProtocolState {
    Idle,
    Sending,
    Receiving,
    Evaluating,
    /// Terminal until released by the host.
    Error,
}

/// The protocol master: one instance per device link.
///
/// The host pushes inbound bytes through [`receive`](Self::receive) and
/// drives the state machine with periodic calls to [`step`](Self::step);
/// decoded results are delivered through the [`ResultSink`] wired at
/// construction.
#[derive(Debug)]
pub struct Master {
    config: MasterConfig,
    state: ProtocolState,
    rx: FrameBuffer,
    tx: FrameBuffer,
    datalink: Datalink,
    transfer: TransferController,
}

impl Master {
    /// Protocol revision implemented by this master.
    pub const VERSION: (u8, u8, u8) = (0, 5, 0);

    pub fn builder() -> MasterBuilder {
        MasterBuilder::new()
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Pushes inbound bytes through the active datalink receive routine.
    /// Safe to call with any length, including zero.
    pub fn receive(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.datalink.receive(&mut self.rx, byte);
        }
    }

    /// Advances the protocol by at most one state transition.
    pub fn step(&mut self) -> SciResult<()> {
        match self.state {
            ProtocolState::Idle | ProtocolState::Error => Ok(()),
            ProtocolState::Sending => {
                if self.datalink.tx_state() != TxState::Ready {
                    if let Err(e) = self.datalink.transmit(self.tx.as_slice()) {
                        self.state = ProtocolState::Error;
                        return Err(e);
                    }
                }
                if self.datalink.tx_state() == TxState::Ready {
                    self.datalink.ack_tx();
                    self.state = ProtocolState::Receiving;
                    self.datalink.start_rx();
                }
                Ok(())
            }
            ProtocolState::Receiving => {
                if self.datalink.rx_state() == RxState::Pending {
                    self.datalink.ack_rx();
                    self.state = ProtocolState::Evaluating;
                }
                Ok(())
            }
            ProtocolState::Evaluating => self.evaluate(),
        }
    }

    /// Renders a request into the transmit buffer and starts sending it.
    ///
    /// Hand-built `Upstream`, `Downstream` and `None` requests are refused
    /// with [`Error::FeatureNotImplemented`] before touching the wire; the
    /// upstream flow is driven internally by the transfer controller. Fails
    /// with [`Error::ProtocolBusy`] when the protocol is not idle; the
    /// transmit buffer is left untouched in that case and empty on a
    /// rendering failure.
    pub fn initiate_request(&mut self, request: &Request) -> SciResult<()> {
        match request.kind {
            RequestKind::GetVar | RequestKind::SetVar | RequestKind::Command => {}
            RequestKind::Upstream | RequestKind::Downstream | RequestKind::None => {
                return Err(Error::FeatureNotImplemented);
            }
        }
        self.issue(request)
    }

    // Unvalidated render-and-send path shared with the directive executor,
    // which also issues the controller-built upstream requests.
    fn issue(&mut self, request: &Request) -> SciResult<()> {
        if self.state != ProtocolState::Idle {
            return Err(Error::ProtocolBusy);
        }
        self.tx.flush();
        if let Err(e) = dataframe::build_request(request, self.config.value_mode, &mut self.tx) {
            self.tx.flush();
            return Err(e);
        }
        debug!("issuing {} request #{}", request.kind, request.num);
        self.state = ProtocolState::Sending;
        Ok(())
    }

    /// Reads the value of a device variable.
    pub fn request_get_var(&mut self, num: i16) -> SciResult<()> {
        self.start_transfer(Request::get_var(num))
    }

    /// Writes one value to a device variable.
    pub fn request_set_var(&mut self, num: i16, value: Value) -> SciResult<()> {
        self.start_transfer(Request::set_var(num, value))
    }

    /// Invokes a device command with up to ten argument values.
    pub fn request_command(&mut self, num: i16, values: &[Value]) -> SciResult<()> {
        self.start_transfer(Request::command(num, values))
    }

    /// Switches reception to byte-counted stream mode.
    pub fn initiate_stream(&mut self, byte_count: u32) {
        self.datalink.initiate_stream(byte_count);
    }

    /// Restores framed transfer reception.
    pub fn finish_stream(&mut self) {
        self.datalink.finish_stream();
    }

    /// Unconditionally returns the protocol to idle, e.g. after a timeout
    /// enforced by the host.
    pub fn release_protocol(&mut self) {
        trace!("protocol released");
        self.state = ProtocolState::Idle;
    }

    fn start_transfer(&mut self, request: Request) -> SciResult<()> {
        if self.state != ProtocolState::Idle {
            return Err(Error::ProtocolBusy);
        }
        let request = self.transfer.start(request)?;
        self.issue(&request)
    }

    // Decodes the pending frame and lets the transfer controller react.
    fn evaluate(&mut self) -> SciResult<()> {
        let directives = {
            let payload = self.rx.as_slice();
            let parsed = match self.datalink.mode() {
                ReceiveMode::Transfer => {
                    dataframe::parse_response(payload, self.config.value_mode)
                }
                ReceiveMode::Stream => Ok(dataframe::parse_stream(payload)),
            };
            match parsed {
                Ok(response) => self.transfer.control(&response),
                Err(e) => {
                    debug!("response rejected: {}", e);
                    self.state = ProtocolState::Error;
                    return Err(e);
                }
            }
        };

        match directives {
            Ok(list) => {
                for directive in list {
                    self.apply(directive)?;
                }
                Ok(())
            }
            // Transfer fault: buffers are already freed, release for retry
            Err(e) => {
                self.release_protocol();
                Err(e)
            }
        }
    }

    fn apply(&mut self, directive: Directive) -> SciResult<()> {
        match directive {
            Directive::Release => {
                self.release_protocol();
                Ok(())
            }
            Directive::InitiateStream(count) => {
                self.initiate_stream(count);
                Ok(())
            }
            Directive::FinishStream => {
                self.finish_stream();
                Ok(())
            }
            Directive::Issue(request) => self.issue(&request),
        }
    }
}

/// Wires the configuration, result sink, wire hook and debug hooks into a
/// ready [`Master`].
pub struct MasterBuilder {
    config: MasterConfig,
    debug_hooks: Vec<(usize, DebugHook)>,
}

impl Default for MasterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterBuilder {
    pub fn new() -> Self {
        Self {
            config: MasterConfig::default(),
            debug_hooks: Vec::new(),
        }
    }

    pub fn config(mut self, config: MasterConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a hook for one `Dbg<d>` trigger slot. Slots beyond the
    /// table are ignored.
    pub fn debug_hook(mut self, slot: usize, hook: DebugHook) -> Self {
        if slot < NUM_DEBUG_HOOKS {
            self.debug_hooks.push((slot, hook));
        }
        self
    }

    pub fn build(self, sink: Box<dyn ResultSink>, wire: Box<dyn WireTx>) -> SciResult<Master> {
        self.config.validate()?;
        let mut datalink = Datalink::new(wire, self.config.tx_mode);
        for (slot, hook) in self.debug_hooks {
            datalink.set_debug_hook(slot, hook);
        }
        Ok(Master {
            rx: FrameBuffer::with_capacity(self.config.rx_capacity),
            tx: FrameBuffer::with_capacity(self.config.tx_capacity),
            state: ProtocolState::Idle,
            datalink,
            transfer: TransferController::new(sink),
            config: self.config,
        })
    }
}
