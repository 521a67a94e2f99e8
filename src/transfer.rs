// Transfer controller: binds requests to responses and drives follow-ups.

use crate::{
    Error, SciResult,
    dataframe::{Acknowledge, Request, RequestKind, Response, Value},
};
use log::trace;
use std::mem;

/// Verdict returned by the host's result callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferAck {
    Success,
    /// Re-issue the original request. Honoured on `GetVar`/`SetVar` only.
    RepeatRequest,
    Abort,
}

/// Host-supplied result callbacks, one per request kind.
///
/// Slices handed to the callbacks borrow transfer-scoped storage and must
/// not escape the call.
pub trait ResultSink: Send {
    fn set_var(&mut self, ack: Acknowledge, num: i16, err_num: u16) -> TransferAck;
    fn get_var(&mut self, ack: Acknowledge, num: i16, value: Value, err_num: u16) -> TransferAck;
    fn command(&mut self, ack: Acknowledge, num: i16, results: &[Value], err_num: u16)
    -> TransferAck;
    fn upstream(&mut self, num: i16, data: &[u8]) -> TransferAck;
}

/// Follow-up actions the master executes after `control` returns, in order.
/// Queueing them instead of calling back keeps the chain non-reentrant.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Directive {
    /// Return the protocol to idle.
    Release,
    /// Put a request on the wire. Always preceded by `Release`.
    Issue(Request),
    /// Switch the datalink into stream mode with the given byte budget.
    InitiateStream(u32),
    /// Restore framed reception.
    FinishStream,
}

/// Per-request state machine. Reactive: the master hands it one parsed
/// response at a time.
pub(crate) struct TransferController {
    request: Request,
    expected_count: u32,
    received_count: u32,
    transfer_count: u32,
    /// Reassembled command results, alive for one transfer.
    results: Vec<Value>,
    /// Reassembled upstream payload, alive for one transfer.
    upstream_buf: Vec<u8>,
    sink: Box<dyn ResultSink>,
}

impl std::fmt::Debug for TransferController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferController")
            .field("request", &self.request)
            .field("expected_count", &self.expected_count)
            .field("received_count", &self.received_count)
            .field("transfer_count", &self.transfer_count)
            .finish_non_exhaustive()
    }
}

impl TransferController {
    pub(crate) fn new(sink: Box<dyn ResultSink>) -> Self {
        Self {
            request: Request::default(),
            expected_count: 0,
            received_count: 0,
            transfer_count: 0,
            results: Vec::new(),
            upstream_buf: Vec::new(),
            sink,
        }
    }

    /// Records a fresh request and resets the transfer accounting. Returns
    /// the request to be placed on the wire.
    pub(crate) fn start(&mut self, request: Request) -> SciResult<Request> {
        match request.kind {
            RequestKind::GetVar | RequestKind::SetVar | RequestKind::Command => {}
            // Downstream is declared by the grammar but not serviced yet
            RequestKind::Upstream | RequestKind::Downstream | RequestKind::None => {
                return Err(Error::FeatureNotImplemented);
            }
        }
        self.reset();
        self.request = request.clone();
        Ok(request)
    }

    /// Consumes one parsed response and yields the follow-up directives.
    ///
    /// On error the transfer-scoped buffers are already released; the caller
    /// is responsible for releasing the protocol.
    pub(crate) fn control(&mut self, rsp: &Response<'_>) -> SciResult<Vec<Directive>> {
        match rsp.kind {
            RequestKind::SetVar => {
                let ack = self.sink.set_var(rsp.ack, rsp.num, rsp.err_num);
                Ok(self.single_shot_followup(ack))
            }
            RequestKind::GetVar => {
                let value = rsp.values.first().copied().unwrap_or(Value::Hex(0));
                let ack = self.sink.get_var(rsp.ack, rsp.num, value, rsp.err_num);
                Ok(self.single_shot_followup(ack))
            }
            RequestKind::Command => match rsp.ack {
                Acknowledge::Data => self.on_command_data(rsp),
                Acknowledge::Upstream => self.on_command_upstream(rsp),
                _ => {
                    self.sink.command(rsp.ack, rsp.num, &[], rsp.err_num);
                    self.reset();
                    Ok(vec![Directive::Release])
                }
            },
            RequestKind::Upstream => self.on_stream_frame(rsp),
            RequestKind::Downstream | RequestKind::None => {
                self.reset();
                Err(Error::FeatureNotImplemented)
            }
        }
    }

    fn single_shot_followup(&mut self, ack: TransferAck) -> Vec<Directive> {
        if ack == TransferAck::RepeatRequest {
            vec![Directive::Release, Directive::Issue(self.request.clone())]
        } else {
            self.reset();
            vec![Directive::Release]
        }
    }

    fn on_command_data(&mut self, rsp: &Response<'_>) -> SciResult<Vec<Directive>> {
        if self.transfer_count == 0 {
            self.expected_count = rsp.data_length;
            self.results = Vec::new();
            if self
                .results
                .try_reserve_exact(self.expected_count as usize)
                .is_err()
            {
                self.reset();
                return Err(Error::TransferAllocationFailed);
            }
        }

        let incoming = rsp.values.len() as u32;
        if self.received_count + incoming > self.expected_count {
            self.reset();
            return Err(Error::ExpectedDataLengthNotMet);
        }
        self.results.extend_from_slice(&rsp.values);
        self.received_count += incoming;
        self.transfer_count += 1;

        if self.received_count == self.expected_count {
            let results = mem::take(&mut self.results);
            trace!(
                "command #{} complete, {} values over {} frames",
                rsp.num, self.received_count, self.transfer_count
            );
            self.sink.command(rsp.ack, rsp.num, &results, rsp.err_num);
            self.reset();
            Ok(vec![Directive::Release])
        } else {
            // Consecutive fetches carry no parameters
            self.request.values.clear();
            Ok(vec![
                Directive::Release,
                Directive::Issue(self.request.clone()),
            ])
        }
    }

    fn on_command_upstream(&mut self, rsp: &Response<'_>) -> SciResult<Vec<Directive>> {
        self.expected_count = rsp.data_length;
        self.received_count = 0;
        self.transfer_count += 1;
        self.upstream_buf = Vec::new();
        if self
            .upstream_buf
            .try_reserve_exact(self.expected_count as usize)
            .is_err()
        {
            self.reset();
            return Err(Error::TransferAllocationFailed);
        }

        trace!("command #{} escalates to upstream of {} bytes", rsp.num, self.expected_count);
        let request = Request::upstream(rsp.num);
        self.request = request.clone();
        Ok(vec![
            Directive::InitiateStream(self.expected_count),
            Directive::Release,
            Directive::Issue(request),
        ])
    }

    fn on_stream_frame(&mut self, rsp: &Response<'_>) -> SciResult<Vec<Directive>> {
        let chunk = rsp.raw;
        if self.received_count + chunk.len() as u32 > self.expected_count {
            self.reset();
            return Err(Error::ExpectedDataLengthNotMet);
        }
        self.upstream_buf.extend_from_slice(chunk);
        self.received_count += chunk.len() as u32;
        self.transfer_count += 1;

        if self.received_count < self.expected_count {
            Ok(vec![
                Directive::Release,
                Directive::Issue(self.request.clone()),
            ])
        } else {
            let data = mem::take(&mut self.upstream_buf);
            trace!(
                "upstream #{} complete, {} bytes over {} frames",
                self.request.num,
                data.len(),
                self.transfer_count
            );
            self.sink.upstream(self.request.num, &data);
            self.reset();
            Ok(vec![Directive::FinishStream, Directive::Release])
        }
    }

    // Releases the transfer-scoped buffers and zeroes the accounting.
    fn reset(&mut self) {
        self.expected_count = 0;
        self.received_count = 0;
        self.transfer_count = 0;
        self.results = Vec::new();
        self.upstream_buf = Vec::new();
    }
}
