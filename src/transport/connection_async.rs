use super::{DEFAULT_DEADLINE, READ_CHUNK_SIZE, READ_TIMEOUT};
use crate::{
    Error, Master, MasterConfig, ProtocolState, ResultSink, SciResult, Value, WireTx,
};
use bytes::BytesMut;
use log::trace;
use serial2_tokio::SerialPort;
use std::{
    io::ErrorKind,
    mem,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    net::TcpStream,
    time::{Instant, timeout},
};

/// Byte-level port access used by the async poll loop.
#[allow(async_fn_in_trait)]
pub trait AsyncSharedPort: Send + Sync {
    /// Reads whatever is available, returning `Ok(0)` when nothing is.
    async fn read_some(&self, buf: &mut [u8]) -> std::io::Result<usize>;
    async fn write_all(&self, buf: &[u8]) -> std::io::Result<()>;
}

impl AsyncSharedPort for SerialPort {
    async fn read_some(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.read(buf).await
    }

    async fn write_all(&self, mut buf: &[u8]) -> std::io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf).await {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl AsyncSharedPort for TcpStream {
    async fn read_some(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.readable().await?;
        match self.try_read(buf) {
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            other => other,
        }
    }

    async fn write_all(&self, mut buf: &[u8]) -> std::io::Result<()> {
        while !buf.is_empty() {
            self.writable().await?;
            match self.try_write(buf) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

// The master's transmit hook cannot await, so outbound bytes are queued and
// drained by the poll loop between steps.
#[derive(Debug, Clone, Default)]
struct QueuedTx(Arc<Mutex<Vec<u8>>>);
impl WireTx for QueuedTx {
    fn send_blocking(&mut self, data: &[u8]) -> SciResult<()> {
        self.0
            .lock()
            .expect("tx queue poisoned")
            .extend_from_slice(data);
        Ok(())
    }
}

/// Async mirror of [`Connection`](super::Connection) for tokio hosts.
pub struct ConnectionAsync<P: AsyncSharedPort> {
    port: P,
    master: Master,
    outbound: Arc<Mutex<Vec<u8>>>,
    read_buf: BytesMut,
    deadline: Duration,
}

impl ConnectionAsync<SerialPort> {
    /// Opens a serial port and wires a master over it.
    pub fn open_serial(
        path: &str,
        baud: u32,
        config: MasterConfig,
        sink: Box<dyn ResultSink>,
    ) -> SciResult<Self> {
        let port = SerialPort::open(path, baud)?;
        Self::new(port, config, sink)
    }
}

impl ConnectionAsync<TcpStream> {
    /// Connects to a device reachable over TCP (e.g. a serial bridge).
    pub async fn connect(
        addr: &str,
        config: MasterConfig,
        sink: Box<dyn ResultSink>,
    ) -> SciResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::new(stream, config, sink)
    }
}

impl<P: AsyncSharedPort> ConnectionAsync<P> {
    pub fn new(port: P, config: MasterConfig, sink: Box<dyn ResultSink>) -> SciResult<Self> {
        let outbound = Arc::new(Mutex::new(Vec::new()));
        let master = Master::builder()
            .config(config)
            .build(sink, Box::new(QueuedTx(outbound.clone())))?;
        Ok(Self {
            port,
            master,
            outbound,
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
    pub async fn get_var(&mut self, num: i16) -> SciResult<()> {
        self.master.request_get_var(num)?;
        self.run_to_idle().await
    }

    /// Writes a device variable and delivers the acknowledge through the sink.
    pub async fn set_var(&mut self, num: i16, value: Value) -> SciResult<()> {
        self.master.request_set_var(num, value)?;
        self.run_to_idle().await
    }

    /// Invokes a device command and delivers the collected results through
    /// the sink.
    pub async fn command(&mut self, num: i16, values: &[Value]) -> SciResult<()> {
        self.master.request_command(num, values)?;
        self.run_to_idle().await
    }

    /// Drives the master until the transfer completes or the deadline
    /// expires. On expiry the protocol is force-released and
    /// [`Error::Timeout`] is returned so the host can retry.
    pub async fn run_to_idle(&mut self) -> SciResult<()> {
        let timer = Instant::now();

        while self.master.state() != ProtocolState::Idle {
            self.master.step()?;
            self.drain_outbound().await?;

            if self.master.state() == ProtocolState::Receiving {
                self.read_buf.clear();
                self.read_buf.resize(READ_CHUNK_SIZE, 0);
                match timeout(READ_TIMEOUT, self.port.read_some(&mut self.read_buf)).await {
                    Ok(Ok(n)) if n > 0 => {
                        trace!("rx {} bytes", n);
                        let chunk = self.read_buf.split_to(n);
                        self.master.receive(&chunk);
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => return Err(e.into()),
                    // Poll window elapsed without data
                    Err(_) => {}
                }
            }

            if timer.elapsed() > self.deadline {
                self.master.release_protocol();
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }

    async fn drain_outbound(&mut self) -> SciResult<()> {
        let pending = mem::take(&mut *self.outbound.lock().expect("tx queue poisoned"));
        if !pending.is_empty() {
            self.port.write_all(&pending).await?;
        }
        Ok(())
    }
}
