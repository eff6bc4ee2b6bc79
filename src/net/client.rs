use crate::net::{NetError, ProtocolError, STATUS_OK};
use crate::raft::rpc::{RaftMessage, RaftResponse};
use log::{debug, info};
use parking_lot::Mutex;
use std::convert::TryInto;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Synchronous client for one peer controller.
///
/// The TCP session is reused across calls and re-established after any
/// failure; a connection-level error gets a single in-deadline retry on a
/// fresh session. Deadlines are enforced through socket timeouts.
pub struct PeerClient {
    addr: String,
    session: Mutex<Option<TcpStream>>,
}

impl PeerClient {
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            session: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn call(&self, msg: &RaftMessage, deadline: Duration) -> Result<RaftResponse, NetError> {
        let payload = msg.encode().map_err(|err| {
            NetError::from(ProtocolError::FrameEncode {
                context: "raft_message",
                details: err.to_string(),
            })
        })?;
        let start = Instant::now();
        let mut first_error: Option<NetError> = None;
        for attempt in 0..2 {
            let remaining = deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                break;
            }
            match self.exchange(msg.kind.opcode(), &payload, remaining) {
                Ok(bytes) => {
                    return RaftResponse::decode(&bytes).map_err(|err| {
                        NetError::from(ProtocolError::FrameDecode {
                            context: "raft_response",
                            details: err.to_string(),
                        })
                    });
                }
                Err(err @ NetError::Io(_)) => {
                    debug!(
                        "event=peer_call_retry peer={} attempt={attempt} error={err}",
                        self.addr
                    );
                    first_error.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(first_error.unwrap_or_else(|| {
            NetError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "peer call deadline elapsed",
            ))
        }))
    }

    /// Drops the cached session; the next call reconnects.
    pub fn disconnect(&self) {
        if let Some(stream) = self.session.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn exchange(
        &self,
        opcode: u8,
        payload: &[u8],
        deadline: Duration,
    ) -> Result<Vec<u8>, NetError> {
        let mut stream = self.take_session(deadline)?;
        stream.set_read_timeout(Some(deadline))?;
        stream.set_write_timeout(Some(deadline))?;
        let result = write_frame(&mut stream, opcode, payload).and_then(|()| read_frame(&mut stream));
        match result {
            Ok(bytes) => {
                *self.session.lock() = Some(stream);
                Ok(bytes)
            }
            Err(err) => {
                let _ = stream.shutdown(Shutdown::Both);
                Err(err)
            }
        }
    }

    fn take_session(&self, deadline: Duration) -> Result<TcpStream, NetError> {
        if let Some(stream) = self.session.lock().take() {
            return Ok(stream);
        }
        self.connect(deadline)
    }

    fn connect(&self, deadline: Duration) -> Result<TcpStream, NetError> {
        let mut last_err = None;
        for addr in self.addr.to_socket_addrs().map_err(NetError::Io)? {
            debug!("event=peer_tcp_attempt peer={addr}");
            match TcpStream::connect_timeout(&addr, deadline) {
                Ok(stream) => {
                    info!("event=peer_tcp_connected peer={addr}");
                    stream.set_nodelay(true).ok();
                    return Ok(stream);
                }
                Err(err) => {
                    debug!("event=peer_tcp_error peer={addr} error={err}");
                    last_err = Some(err);
                }
            }
        }
        Err(NetError::Io(last_err.unwrap_or_else(|| {
            std::io::Error::other("unable to resolve peer address")
        })))
    }
}

pub(crate) fn write_frame(
    stream: &mut impl Write,
    opcode: u8,
    payload: &[u8],
) -> Result<(), NetError> {
    let mut header = [0u8; 5];
    header[0] = opcode;
    header[1..5].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    stream.write_all(&header)?;
    stream.write_all(payload)?;
    Ok(())
}

fn read_frame(stream: &mut impl Read) -> Result<Vec<u8>, NetError> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header)?;
    let status = header[0];
    let len = u32::from_le_bytes(
        header[1..5]
            .try_into()
            .map_err(|_| NetError::from(ProtocolError::FrameLength))?,
    ) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    if status == STATUS_OK {
        Ok(payload)
    } else {
        let message = String::from_utf8(payload).ok();
        Err(NetError::from(ProtocolError::RemoteError { status, message }))
    }
}
