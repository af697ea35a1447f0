//! In-memory network for deterministic tests.
//!
//! A [`SimNet`] is a whole network in one process: every clone shares the
//! same table of listeners, and [`SimNet::host`] derives a handle that dials
//! out under a particular host name. Connections are tokio duplex pipes, so
//! dropping one end shows up as EOF on the other, just like a closed socket.
//!
//! Ephemeral ports are handed out from a single counter in bind/connect call
//! order, which keeps channel ranks reproducible from one test run to the
//! next. Tests that need specific ranks can pin the counter with
//! [`SimNet::set_next_ephemeral`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::network::{Connected, TransportConnector, TransportListener};
use crate::types::SocketEndpoint;

const PIPE_CAPACITY: usize = 256 * 1024;
const EPHEMERAL_BASE: u16 = 40_000;

#[derive(Debug)]
struct SimState {
    listeners: HashMap<SocketEndpoint, mpsc::UnboundedSender<Connected<DuplexStream>>>,
    next_ephemeral: u16,
    connect_latency: Duration,
}

/// Handle onto a shared in-memory network.
#[derive(Debug, Clone)]
pub struct SimNet {
    state: Rc<RefCell<SimState>>,
    local_host: String,
}

impl SimNet {
    /// Create a fresh network. The handle dials out as host `"local"`;
    /// use [`SimNet::host`] for anything more descriptive.
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState {
                listeners: HashMap::new(),
                next_ephemeral: EPHEMERAL_BASE,
                connect_latency: Duration::ZERO,
            })),
            local_host: "local".to_string(),
        }
    }

    /// A handle onto the same network that dials out under `name`.
    pub fn host(&self, name: impl Into<String>) -> SimNet {
        Self {
            state: Rc::clone(&self.state),
            local_host: name.into(),
        }
    }

    /// Delay applied to every subsequent connect, before it resolves.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.state.borrow_mut().connect_latency = latency;
    }

    /// Pin the ephemeral port counter, for tests that script exact ranks.
    pub fn set_next_ephemeral(&self, port: u16) {
        self.state.borrow_mut().next_ephemeral = port;
    }
}

impl Default for SimNet {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TransportConnector for SimNet {
    type Stream = DuplexStream;
    type Listener = SimListener;

    async fn bind(&self, endpoint: &SocketEndpoint) -> io::Result<SimListener> {
        let mut state = self.state.borrow_mut();
        let mut endpoint = endpoint.clone();
        if endpoint.port == 0 {
            endpoint.port = state.next_ephemeral;
            state.next_ephemeral += 1;
        }
        if state.listeners.contains_key(&endpoint) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{endpoint} is already bound"),
            ));
        }
        let (sender, incoming) = mpsc::unbounded_channel();
        state.listeners.insert(endpoint.clone(), sender);
        Ok(SimListener { endpoint, incoming })
    }

    async fn connect(&self, endpoint: &SocketEndpoint) -> io::Result<Connected<DuplexStream>> {
        let (latency, local) = {
            let mut state = self.state.borrow_mut();
            let local = SocketEndpoint::new(self.local_host.clone(), state.next_ephemeral);
            state.next_ephemeral += 1;
            (state.connect_latency, local)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.borrow_mut();
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let accepted = Connected {
            stream: far,
            local: endpoint.clone(),
            remote: local.clone(),
        };
        match state.listeners.get(endpoint) {
            Some(listener) if listener.send(accepted).is_ok() => Ok(Connected {
                stream: near,
                local,
                remote: endpoint.clone(),
            }),
            _ => {
                state.listeners.remove(endpoint);
                Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("no listener at {endpoint}"),
                ))
            }
        }
    }
}

/// Accepting side of a [`SimNet`] endpoint.
#[derive(Debug)]
pub struct SimListener {
    endpoint: SocketEndpoint,
    incoming: mpsc::UnboundedReceiver<Connected<DuplexStream>>,
}

#[async_trait(?Send)]
impl TransportListener for SimListener {
    type Stream = DuplexStream;

    fn local_endpoint(&self) -> io::Result<SocketEndpoint> {
        Ok(self.endpoint.clone())
    }

    async fn accept(&mut self) -> io::Result<Connected<DuplexStream>> {
        self.incoming.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "simulated network torn down")
        })
    }
}
