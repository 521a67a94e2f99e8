// Request rendering and response parsing against the ASCII dataframe grammar.

use crate::{
    Error, SciResult,
    ascii::{FTOA_MAX_LEN, ftoa, hex_to_str_dword, hex_to_str_word, str_to_hex},
    buffer::FrameBuffer,
    config::{MAX_VALUES, ValueMode},
};

/// The request type, selecting the sigil placed after the numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_more::Display)]
pub enum RequestKind {
    /// Reserved slot, never placed on the wire (`#` sigil).
    #[default]
    None,
    GetVar,
    SetVar,
    Command,
    Upstream,
    Downstream,
}
impl RequestKind {
    pub(crate) fn sigil(self) -> u8 {
        match self {
            Self::None => b'#',
            Self::GetVar => b'?',
            Self::SetVar => b'!',
            Self::Command => b':',
            Self::Upstream => b'>',
            Self::Downstream => b'<',
        }
    }

    // `#` is reserved and intentionally absent here.
    fn from_sigil(byte: u8) -> Option<Self> {
        match byte {
            b'?' => Some(Self::GetVar),
            b'!' => Some(Self::SetVar),
            b':' => Some(Self::Command),
            b'>' => Some(Self::Upstream),
            b'<' => Some(Self::Downstream),
            _ => None,
        }
    }
}

/// Device acknowledgement carried in the response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Acknowledge {
    /// `ACK` — request executed, no bulk data follows.
    Success,
    /// `DAT` — command results follow, possibly across several frames.
    Data,
    /// `UPS` — the device announces a raw byte upstream.
    Upstream,
    /// `ERR` — the device reports an error number.
    Error,
    /// `NAK` — the device did not understand the request.
    Unknown,
}
impl Acknowledge {
    fn from_token(token: &[u8]) -> Option<Self> {
        match token {
            b"ACK" => Some(Self::Success),
            b"DAT" => Some(Self::Data),
            b"UPS" => Some(Self::Upstream),
            b"ERR" => Some(Self::Error),
            b"NAK" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// One transported value. The wire rendering is selected by [`ValueMode`],
/// independent of which variant the host handed in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Hex(u32),
    Float(f32),
}
impl Value {
    /// Raw bit pattern, reinterpreting a float losslessly.
    pub fn as_hex(self) -> u32 {
        match self {
            Self::Hex(v) => v,
            Self::Float(f) => f.to_bits(),
        }
    }
    /// Float view, reinterpreting a hex value's bit pattern losslessly.
    pub fn as_float(self) -> f32 {
        match self {
            Self::Float(f) => f,
            Self::Hex(v) => f32::from_bits(v),
        }
    }
    /// Strict hex accessor, failing on a float value.
    pub fn hex(self) -> SciResult<u32> {
        match self {
            Self::Hex(v) => Ok(v),
            Self::Float(_) => Err(Error::UnknownDatatype),
        }
    }
    /// Strict float accessor, failing on a hex value.
    pub fn float(self) -> SciResult<f32> {
        match self {
            Self::Float(f) => Ok(f),
            Self::Hex(_) => Err(Error::UnknownDatatype),
        }
    }
}

/// A typed request, rendered to the wire by the master.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Request {
    pub kind: RequestKind,
    pub num: i16,
    pub values: Vec<Value>,
}
impl Request {
    pub fn get_var(num: i16) -> Self {
        Self {
            kind: RequestKind::GetVar,
            num,
            values: Vec::new(),
        }
    }
    pub fn set_var(num: i16, value: Value) -> Self {
        Self {
            kind: RequestKind::SetVar,
            num,
            values: vec![value],
        }
    }
    pub fn command(num: i16, values: &[Value]) -> Self {
        Self {
            kind: RequestKind::Command,
            num,
            values: values.to_vec(),
        }
    }
    pub(crate) fn upstream(num: i16) -> Self {
        Self {
            kind: RequestKind::Upstream,
            num,
            values: Vec::new(),
        }
    }
}

/// A parsed response. `raw` borrows the receive buffer and must not escape
/// the evaluation of the frame it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<'a> {
    pub kind: RequestKind,
    pub num: i16,
    pub ack: Acknowledge,
    pub values: Vec<Value>,
    pub raw: &'a [u8],
    pub err_num: u16,
    /// Total payload the device announces for this logical transfer.
    pub data_length: u32,
}

/// Renders `req` into the free tail of the transmit buffer and commits the
/// written size. On failure the buffer index is left untouched.
pub(crate) fn build_request(
    req: &Request,
    mode: ValueMode,
    buf: &mut FrameBuffer,
) -> SciResult<()> {
    let written = {
        let free = buf.reserve().ok_or(Error::MessageExceedsTxBufferSize)?;
        render_request(req, mode, free)?
    };
    buf.commit(written);
    Ok(())
}

fn render_request(req: &Request, mode: ValueMode, out: &mut [u8]) -> SciResult<usize> {
    let mut scratch = [0u8; FTOA_MAX_LEN];
    let mut pos = 0usize;

    let n = match mode {
        ValueMode::Hex => {
            if req.num < 0 {
                return Err(Error::VarNumberInvalid);
            }
            hex_to_str_word(&mut scratch, req.num as u16, true)
        }
        ValueMode::Decimal => ftoa(&mut scratch, f32::from(req.num), true),
    };
    pos = push(out, pos, &scratch[..n])?;
    pos = push(out, pos, &[req.kind.sigil()])?;

    // Values beyond the protocol maximum are ignored
    let values = &req.values[..req.values.len().min(MAX_VALUES)];
    for (i, val) in values.iter().enumerate() {
        if i > 0 {
            pos = push(out, pos, b",")?;
        }
        let n = match mode {
            ValueMode::Hex => hex_to_str_dword(&mut scratch, val.as_hex(), true),
            ValueMode::Decimal => ftoa(&mut scratch, val.as_float(), true),
        };
        pos = push(out, pos, &scratch[..n])?;
    }
    Ok(pos)
}

fn push(out: &mut [u8], pos: usize, bytes: &[u8]) -> SciResult<usize> {
    if pos + bytes.len() > out.len() {
        return Err(Error::MessageExceedsTxBufferSize);
    }
    out[pos..pos + bytes.len()].copy_from_slice(bytes);
    Ok(pos + bytes.len())
}

/// Parses a transfer-mode response frame.
pub(crate) fn parse_response(raw: &[u8], mode: ValueMode) -> SciResult<Response<'_>> {
    let (sigil_at, kind) = raw
        .iter()
        .enumerate()
        .find_map(|(i, &b)| RequestKind::from_sigil(b).map(|k| (i, k)))
        .ok_or(Error::CommandIdentifierNotFound)?;

    let num = parse_num(&raw[..sigil_at], mode)?;
    let mut rsp = Response {
        kind,
        num,
        // A frame without an acknowledge token is a consecutive data frame
        ack: Acknowledge::Data,
        values: Vec::new(),
        raw,
        err_num: 0,
        data_length: 0,
    };

    let mut rest = &raw[sigil_at + 1..];
    let ack = if rest.len() >= 3 {
        Acknowledge::from_token(&rest[..3])
    } else {
        None
    };

    match ack {
        Some(ack) => {
            rsp.ack = ack;
            rest = &rest[3..];
            if rest.first() == Some(&b';') {
                rest = &rest[1..];
            }
            if !rest.is_empty() {
                let ctrl_end = rest.iter().position(|&b| b == b';').unwrap_or(rest.len());
                let ctrl = &rest[..ctrl_end];
                match ack {
                    Acknowledge::Data | Acknowledge::Upstream => {
                        rsp.data_length = parse_ctrl(ctrl, mode)?;
                    }
                    Acknowledge::Error => {
                        rsp.err_num = parse_ctrl(ctrl, mode)? as u16;
                    }
                    // Only GetVar replies carry their value in the control field
                    _ if kind == RequestKind::GetVar => {
                        let val = parse_value(ctrl, mode).ok_or(Error::ParameterConversionFailed)?;
                        rsp.values.push(val);
                    }
                    _ => {}
                }
                rest = if ctrl_end < rest.len() {
                    &rest[ctrl_end + 1..]
                } else {
                    &[]
                };
                if !rest.is_empty() {
                    parse_value_list(rest, mode, &mut rsp.values)?;
                }
            }
        }
        // A ';' right after a three byte field marks a garbled ack token
        None if rest.get(3) == Some(&b';') => return Err(Error::AcknowledgeUnknown),
        None => {
            if !rest.is_empty() {
                parse_value_list(rest, mode, &mut rsp.values)?;
            }
        }
    }
    Ok(rsp)
}

/// Parses a stream-mode frame: the payload is opaque.
pub(crate) fn parse_stream(raw: &[u8]) -> Response<'_> {
    Response {
        kind: RequestKind::Upstream,
        num: 0,
        ack: Acknowledge::Upstream,
        values: Vec::new(),
        raw,
        err_num: 0,
        data_length: 0,
    }
}

fn parse_num(src: &[u8], mode: ValueMode) -> SciResult<i16> {
    match mode {
        ValueMode::Hex => {
            let val = str_to_hex(src).ok_or(Error::NumberConversionFailed)?;
            if val > u32::from(u16::MAX) {
                return Err(Error::NumberConversionFailed);
            }
            Ok(val as u16 as i16)
        }
        ValueMode::Decimal => std::str::from_utf8(src)
            .ok()
            .and_then(|s| s.parse::<i16>().ok())
            .ok_or(Error::NumberConversionFailed),
    }
}

fn parse_ctrl(src: &[u8], mode: ValueMode) -> SciResult<u32> {
    match mode {
        ValueMode::Hex => str_to_hex(src).ok_or(Error::NumberConversionFailed),
        ValueMode::Decimal => std::str::from_utf8(src)
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or(Error::NumberConversionFailed),
    }
}

fn parse_value(src: &[u8], mode: ValueMode) -> Option<Value> {
    match mode {
        ValueMode::Hex => str_to_hex(src).map(Value::Hex),
        ValueMode::Decimal => std::str::from_utf8(src)
            .ok()
            .and_then(|s| s.parse::<f32>().ok())
            .map(Value::Float),
    }
}

fn parse_value_list(rest: &[u8], mode: ValueMode, out: &mut Vec<Value>) -> SciResult<()> {
    for part in rest.split(|&b| b == b',') {
        if out.len() >= MAX_VALUES {
            break;
        }
        let val = parse_value(part, mode).ok_or(Error::ParameterConversionFailed)?;
        out.push(val);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(req: &Request, mode: ValueMode) -> SciResult<Vec<u8>> {
        let mut buf = FrameBuffer::with_capacity(128);
        build_request(req, mode, &mut buf)?;
        Ok(buf.as_slice().to_vec())
    }

    #[test]
    fn builds_get_var() {
        assert_eq!(build(&Request::get_var(1), ValueMode::Hex).unwrap(), b"1?");
        assert_eq!(
            build(&Request::get_var(255), ValueMode::Decimal).unwrap(),
            b"255?"
        );
    }

    #[test]
    fn builds_set_var_hex() {
        let req = Request::set_var(0x0A, Value::Hex(0xDEAD));
        assert_eq!(build(&req, ValueMode::Hex).unwrap(), b"A!DEAD");
    }

    #[test]
    fn builds_command_with_reinterpreted_float() {
        let req = Request::command(0xFF, &[Value::Hex(3), Value::Float(2.0), Value::Hex(255)]);
        assert_eq!(build(&req, ValueMode::Hex).unwrap(), b"FF:3,40000000,FF");
    }

    #[test]
    fn negative_num_is_invalid_in_hex_mode() {
        let req = Request::get_var(-1);
        assert!(matches!(
            build(&req, ValueMode::Hex),
            Err(Error::VarNumberInvalid)
        ));
        assert_eq!(build(&req, ValueMode::Decimal).unwrap(), b"-1?");
    }

    #[test]
    fn oversized_request_is_rejected() {
        let mut buf = FrameBuffer::with_capacity(16);
        let req = Request::command(0xFF, &[Value::Hex(0xAAAA_AAAA); 4]);
        assert!(matches!(
            build_request(&req, ValueMode::Hex, &mut buf),
            Err(Error::MessageExceedsTxBufferSize)
        ));
        // Nothing committed on failure
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn parses_get_var_success() {
        let rsp = parse_response(b"1?ACK;2A", ValueMode::Hex).unwrap();
        assert_eq!(rsp.kind, RequestKind::GetVar);
        assert_eq!(rsp.num, 1);
        assert_eq!(rsp.ack, Acknowledge::Success);
        assert_eq!(rsp.values, vec![Value::Hex(0x2A)]);
    }

    #[test]
    fn parses_error_number() {
        let rsp = parse_response(b"A!ERR;7", ValueMode::Hex).unwrap();
        assert_eq!(rsp.kind, RequestKind::SetVar);
        assert_eq!(rsp.num, 10);
        assert_eq!(rsp.ack, Acknowledge::Error);
        assert_eq!(rsp.err_num, 7);
    }

    #[test]
    fn parses_data_announcement_with_values() {
        let rsp = parse_response(b"FF:DAT;2;FF,3", ValueMode::Hex).unwrap();
        assert_eq!(rsp.kind, RequestKind::Command);
        assert_eq!(rsp.num, 255);
        assert_eq!(rsp.ack, Acknowledge::Data);
        assert_eq!(rsp.data_length, 2);
        assert_eq!(rsp.values, vec![Value::Hex(0xFF), Value::Hex(3)]);
    }

    #[test]
    fn parses_upstream_announcement() {
        let rsp = parse_response(b"FF:UPS;200", ValueMode::Hex).unwrap();
        assert_eq!(rsp.ack, Acknowledge::Upstream);
        assert_eq!(rsp.data_length, 0x200);
        assert!(rsp.values.is_empty());
    }

    #[test]
    fn parses_consecutive_data_frame() {
        let rsp = parse_response(b"FF:AB,CD", ValueMode::Hex).unwrap();
        assert_eq!(rsp.ack, Acknowledge::Data);
        assert_eq!(rsp.values, vec![Value::Hex(0xAB), Value::Hex(0xCD)]);
    }

    #[test]
    fn parses_nak_without_value() {
        let rsp = parse_response(b"1?NAK", ValueMode::Hex).unwrap();
        assert_eq!(rsp.ack, Acknowledge::Unknown);
        assert!(rsp.values.is_empty());
    }

    #[test]
    fn missing_sigil_is_rejected() {
        assert!(matches!(
            parse_response(b"XYZ", ValueMode::Hex),
            Err(Error::CommandIdentifierNotFound)
        ));
    }

    #[test]
    fn garbled_num_is_rejected() {
        assert!(matches!(
            parse_response(b"G1?ACK;0", ValueMode::Hex),
            Err(Error::NumberConversionFailed)
        ));
    }

    #[test]
    fn garbled_ack_token_is_rejected() {
        assert!(matches!(
            parse_response(b"1?ABC;0", ValueMode::Hex),
            Err(Error::AcknowledgeUnknown)
        ));
    }

    #[test]
    fn garbled_value_is_rejected() {
        assert!(matches!(
            parse_response(b"FF:DAT;2;FF,GG", ValueMode::Hex),
            Err(Error::ParameterConversionFailed)
        ));
    }

    #[test]
    fn stream_frames_are_opaque() {
        let payload = [0x00, 0x02, 0x03, 0xFF];
        let rsp = parse_stream(&payload);
        assert_eq!(rsp.kind, RequestKind::Upstream);
        assert_eq!(rsp.raw, &payload);
    }

    #[test]
    fn round_trips_request_num_and_kind() {
        for mode in [ValueMode::Hex, ValueMode::Decimal] {
            for num in [0i16, 1, 0x2A, 255, 4096] {
                let wire = build(&Request::get_var(num), mode).unwrap();
                // A device echoes the id and sigil back in front of the ack
                let mut echoed = wire.clone();
                echoed.extend_from_slice(b"ACK;0");
                let rsp = parse_response(&echoed, mode).unwrap();
                assert_eq!(rsp.num, num);
                assert_eq!(rsp.kind, RequestKind::GetVar);
            }
        }
    }

    #[test]
    fn round_trips_values_in_hex_mode() {
        let values = [Value::Hex(0), Value::Hex(0xDEAD_BEEF), Value::Float(2.0)];
        let wire = build(&Request::command(1, &values), ValueMode::Hex).unwrap();
        let rsp = parse_response(&wire, ValueMode::Hex).unwrap();
        let got: Vec<u32> = rsp.values.iter().map(|v| v.as_hex()).collect();
        assert_eq!(got, vec![0, 0xDEAD_BEEF, 2.0f32.to_bits()]);
    }

    #[test]
    fn round_trips_values_in_decimal_mode() {
        let values = [Value::Float(1.5), Value::Float(-12.25)];
        let wire = build(&Request::command(1, &values), ValueMode::Decimal).unwrap();
        let rsp = parse_response(&wire, ValueMode::Decimal).unwrap();
        for (sent, got) in values.iter().zip(&rsp.values) {
            assert!((sent.as_float() - got.as_float()).abs() < 1e-5);
        }
    }

    #[test]
    fn value_accessors_check_kind() {
        assert_eq!(Value::Hex(7).hex().unwrap(), 7);
        assert!(Value::Hex(7).float().is_err());
        assert!(Value::Float(1.0).hex().is_err());
        assert_eq!(Value::Float(2.0).as_hex(), 0x4000_0000);
    }
}
