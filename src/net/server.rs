use crate::net::client::write_frame;
use crate::net::{NetError, ProtocolError, STATUS_ERR, STATUS_OK};
use crate::raft::machine::DeliverError;
use crate::raft::rpc::{MessageKind, RaftMessage};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
const STREAM_IDLE_POLL: Duration = Duration::from_millis(250);
const MAX_CONCURRENT_RPC_CONNECTIONS: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Capability the server needs from the role state machine: unpack, submit,
/// wait for the reply. The machine never holds a handle back to the server.
pub trait RaftService: Send + Sync + 'static {
    fn dispatch(&self, msg: RaftMessage) -> Result<crate::raft::rpc::RaftResponse, DeliverError>;
}

pub struct RpcServerConfig {
    pub bind: SocketAddr,
}

struct AcceptLoopState {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl AcceptLoopState {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn mark_stopped(&self) {
        *self.done.lock() = true;
        self.condvar.notify_all();
    }

    fn wait_for_stop(&self, timeout: Duration) -> Result<(), NetError> {
        let mut done = self.done.lock();
        if *done {
            return Ok(());
        }
        self.condvar.wait_for(&mut done, timeout);
        if *done {
            Ok(())
        } else {
            Err(NetError::from(ProtocolError::ShutdownTimeout {
                context: "rpc_server",
            }))
        }
    }
}

#[derive(Default)]
struct ConnectionTracker {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ConnectionTracker {
    fn track(&self, handle: thread::JoinHandle<()>) {
        self.handles.lock().push(handle);
    }

    fn join_all(&self) {
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

pub struct RpcServerHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
    connections: Arc<ConnectionTracker>,
    state: Arc<AcceptLoopState>,
}

impl RpcServerHandle {
    pub fn shutdown(&mut self) {
        if let Err(err) = self.try_shutdown(SHUTDOWN_GRACE) {
            warn!("event=rpc_server_shutdown_error error={err}");
        }
    }

    pub fn try_shutdown(&mut self, timeout: Duration) -> Result<(), NetError> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join.take() {
            self.state.wait_for_stop(timeout)?;
            if handle.join().is_err() {
                warn!("event=rpc_server_accept_loop_panic");
            }
        }
        self.connections.join_all();
        Ok(())
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        let _ = self.try_shutdown(SHUTDOWN_GRACE);
    }
}

/// Binds the peer RPC listener and serves connections until shutdown.
pub fn spawn_rpc_server<S: RaftService>(
    config: RpcServerConfig,
    service: Arc<S>,
) -> Result<RpcServerHandle, NetError> {
    let listener = TcpListener::bind(config.bind)?;
    listener.set_nonblocking(true)?;
    info!("event=rpc_server_listen addr={}", config.bind);

    let shutdown = Arc::new(AtomicBool::new(false));
    let tracker = Arc::new(ConnectionTracker::default());
    let state = Arc::new(AcceptLoopState::new());
    let active = Arc::new(AtomicUsize::new(0));

    let shutdown_flag = shutdown.clone();
    let tracker_clone = tracker.clone();
    let accept_state = state.clone();
    let join = thread::spawn(move || {
        loop {
            if shutdown_flag.load(Ordering::Relaxed) {
                break;
            }
            match listener.accept() {
                Ok((stream, addr)) => {
                    if active.load(Ordering::Relaxed) >= MAX_CONCURRENT_RPC_CONNECTIONS {
                        warn!(
                            "event=rpc_connection_rejected peer={addr} reason=too_many_connections limit={MAX_CONCURRENT_RPC_CONNECTIONS}"
                        );
                        continue;
                    }
                    active.fetch_add(1, Ordering::Relaxed);
                    let service = service.clone();
                    let shutdown_token = shutdown_flag.clone();
                    let active_count = active.clone();
                    let connection = thread::spawn(move || {
                        if let Err(err) = handle_connection(stream, addr, service, shutdown_token) {
                            warn!("event=rpc_connection_error peer={addr} error={err}");
                        }
                        active_count.fetch_sub(1, Ordering::Relaxed);
                    });
                    tracker_clone.track(connection);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_BACKOFF);
                }
                Err(err) => {
                    error!("event=rpc_accept_error error={err}");
                    break;
                }
            }
        }
        accept_state.mark_stopped();
    });

    Ok(RpcServerHandle {
        shutdown,
        join: Some(join),
        connections: tracker,
        state,
    })
}

fn handle_connection<S: RaftService>(
    mut stream: TcpStream,
    addr: SocketAddr,
    service: Arc<S>,
    shutdown: Arc<AtomicBool>,
) -> Result<(), NetError> {
    info!("event=rpc_accept peer={addr}");
    stream.set_read_timeout(Some(STREAM_IDLE_POLL)).ok();
    stream.set_nodelay(true).ok();
    loop {
        let mut header = [0u8; 5];
        match read_exact_with_shutdown(&mut stream, &mut header, &shutdown) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                info!("event=rpc_connection_close peer={addr}");
                return Ok(());
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                info!("event=rpc_connection_shutdown peer={addr}");
                return Ok(());
            }
            Err(err) => return Err(NetError::Io(err)),
        }
        let opcode = header[0];
        let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let mut payload = vec![0u8; len];
        if let Err(err) = read_exact_with_shutdown(&mut stream, &mut payload, &shutdown) {
            return match err.kind() {
                io::ErrorKind::UnexpectedEof => {
                    info!("event=rpc_connection_close peer={addr}");
                    Ok(())
                }
                io::ErrorKind::Interrupted => {
                    info!("event=rpc_connection_shutdown peer={addr}");
                    Ok(())
                }
                _ => Err(NetError::Io(err)),
            };
        }
        match serve_frame(&service, opcode, &payload) {
            Ok(response) => write_frame(&mut stream, STATUS_OK, &response)?,
            Err(message) => {
                warn!("event=rpc_handler_error peer={addr} error={message}");
                write_frame(&mut stream, STATUS_ERR, message.as_bytes())?;
            }
        }
    }
}

fn serve_frame<S: RaftService>(
    service: &Arc<S>,
    opcode: u8,
    payload: &[u8],
) -> Result<Vec<u8>, String> {
    let kind = MessageKind::from_opcode(opcode).ok_or_else(|| format!("unknown opcode {opcode}"))?;
    let msg = RaftMessage::decode(payload).map_err(|err| err.to_string())?;
    if msg.kind != kind {
        return Err(format!(
            "frame opcode {} does not match payload kind {}",
            opcode,
            msg.kind.as_str()
        ));
    }
    debug!("event=rpc_dispatch kind={} from={}", kind.as_str(), msg.meta.from);
    let response = service.dispatch(msg).map_err(|err| err.to_string())?;
    response.encode().map_err(|err| err.to_string())
}

fn read_exact_with_shutdown(
    stream: &mut TcpStream,
    buf: &mut [u8],
    shutdown: &Arc<AtomicBool>,
) -> io::Result<()> {
    let mut read = 0;
    while read < buf.len() {
        if shutdown.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "server shutdown"));
        }
        match stream.read(&mut buf[read..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed connection",
                ));
            }
            Ok(n) => read += n,
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                // Idle poll expiry: loop to re-check the shutdown flag.
                continue;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
