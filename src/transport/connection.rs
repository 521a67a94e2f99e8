use super::{DEFAULT_DEADLINE, READ_CHUNK_SIZE, READ_TIMEOUT};
use crate::{
    Error, Master, MasterConfig, ProtocolState, ResultSink, SciResult, Value, WireTx,
};
use bytes::BytesMut;
use log::trace;
use serial2::SerialPort;
use std::{
    io::{ErrorKind, Read, Write},
    net::TcpStream,
    sync::Arc,
    time::{Duration, Instant},
};

/// Byte-level port access shared between the master's transmit hook and the
/// adapter's read loop.
pub trait SharedPort: Send + Sync + std::fmt::Debug {
    /// Reads whatever is available, returning `Ok(0)` when nothing is.
    fn read_some(&self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn write_all(&self, buf: &[u8]) -> std::io::Result<()>;
    fn clear_input(&self) -> std::io::Result<()>;
}

impl SharedPort for SerialPort {
    fn read_some(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match SerialPort::read(self, buf) {
            Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Ok(0)
            }
            other => other,
        }
    }

    fn write_all(&self, mut buf: &[u8]) -> std::io::Result<()> {
        while !buf.is_empty() {
            match SerialPort::write(self, buf) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn clear_input(&self) -> std::io::Result<()> {
        self.discard_input_buffer()
    }
}

impl SharedPort for TcpStream {
    fn read_some(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut stream = self;
        match stream.read(buf) {
            Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Ok(0)
            }
            other => other,
        }
    }

    fn write_all(&self, buf: &[u8]) -> std::io::Result<()> {
        let mut stream = self;
        loop {
            match Write::write_all(&mut stream, buf) {
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => continue,
                other => return other,
            }
        }
    }

    /// Drains stale bytes so the request/response pairing stays in sync.
    fn clear_input(&self) -> std::io::Result<()> {
        let mut stream = self;
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match stream.read(&mut chunk) {
                // Stream closed
                Ok(0) => break,
                // Discard whatever was left over
                Ok(_) => continue,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

// Transmit hook writing straight through the shared port handle.
#[derive(Debug)]
struct PortTx<P: SharedPort>(Arc<P>);
impl<P: SharedPort> WireTx for PortTx<P> {
    fn send_blocking(&mut self, data: &[u8]) -> SciResult<()> {
        self.0.write_all(data)?;
        Ok(())
    }
}

/// Owns a port plus the master driven over it and supplies the poll loop the
/// sans-IO core leaves to the host, including the reply deadline.
#[derive(Debug)]
pub struct Connection<P: SharedPort + 'static> {
    port: Arc<P>,
    master: Master,
    read_buf: BytesMut,
    deadline: Duration,
}

impl Connection<SerialPort> {
    /// Opens a serial port and wires a master over it.
    pub fn open_serial(
        path: &str,
        baud: u32,
        config: MasterConfig,
        sink: Box<dyn ResultSink>,
    ) -> SciResult<Self> {
        let mut port = SerialPort::open(path, baud)?;
        port.set_read_timeout(READ_TIMEOUT)?;
        Self::new(port, config, sink)
    }
}

impl Connection<TcpStream> {
    /// Connects to a device reachable over TCP (e.g. a serial bridge).
    pub fn connect(addr: &str, config: MasterConfig, sink: Box<dyn ResultSink>) -> SciResult<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nonblocking(true)?;
        Self::new(stream, config, sink)
    }
}

impl<P: SharedPort + 'static> Connection<P> {
    pub fn new(port: P, config: MasterConfig, sink: Box<dyn ResultSink>) -> SciResult<Self> {
        let port = Arc::new(port);
        let master = Master::builder()
            .config(config)
            .build(sink, Box::new(PortTx(port.clone())))?;
        Ok(Self {
            port,
            master,
            read_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            deadline: DEFAULT_DEADLINE,
        })
    }

    /// Replaces the per-transfer reply deadline.
    pub fn set_deadline(&mut self, deadline: Duration) {
        self.deadline = deadline;
    }

    pub fn master(&mut self) -> &mut Master {
        &mut self.master
    }

    /// Reads a device variable and delivers it through the sink.
    pub fn get_var(&mut self, num: i16) -> SciResult<()> {
        self.master.request_get_var(num)?;
        self.run_to_idle()
    }

    /// Writes a device variable and delivers the acknowledge through the sink.
    pub fn set_var(&mut self, num: i16, value: Value) -> SciResult<()> {
        self.master.request_set_var(num, value)?;
        self.run_to_idle()
    }

    /// Invokes a device command and delivers the collected results through
    /// the sink.
    pub fn command(&mut self, num: i16, values: &[Value]) -> SciResult<()> {
        self.master.request_command(num, values)?;
        self.run_to_idle()
    }

    /// Drives the master until the transfer completes or the deadline
    /// expires. On expiry the protocol is force-released and
    /// [`Error::Timeout`] is returned so the host can retry.
    pub fn run_to_idle(&mut self) -> SciResult<()> {
        let timer = Instant::now();
        let _ = self.port.clear_input();

        while self.master.state() != ProtocolState::Idle {
            self.master.step()?;

            if self.master.state() == ProtocolState::Receiving {
                self.read_buf.clear();
                self.read_buf.resize(READ_CHUNK_SIZE, 0);
                let n = self.port.read_some(&mut self.read_buf)?;
                if n > 0 {
                    trace!("rx {} bytes", n);
                    let chunk = self.read_buf.split_to(n);
                    self.master.receive(&chunk);
                }
            }

            if timer.elapsed() > self.deadline {
                self.master.release_protocol();
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }
}
