//! Provider bundle trait for simplified type parameters.
//!
//! Registry code needs four environment hooks: a stream transport, a
//! datagram transport, a clock and a task spawner. Carrying those as four
//! separate type parameters turns every signature into a wall of where
//! clauses, so this module bundles them behind one [`Providers`] parameter.
//!
//! Two bundles are provided: [`TokioProviders`] for production (TCP on both
//! lanes, wall-clock time) and [`SimProviders`] for tests (in-memory
//! network, tokio's pausable clock).

use crate::network::{TcpNet, TransportConnector};
use crate::sim::SimNet;
use crate::task::{TaskProvider, TokioTask};
use crate::time::{TimeProvider, TokioTime};

/// Bundle of environment providers for one runtime flavor.
///
/// The stream and datagram lanes are separate associated types so a bundle
/// can mix carriers, but both must satisfy the same [`TransportConnector`]
/// contract: bind a listener, dial out, hand back byte streams.
pub trait Providers: Clone + 'static {
    /// Transport used for the stream lane.
    type Stream: TransportConnector + 'static;

    /// Transport used for the datagram lane.
    type Datagram: TransportConnector + 'static;

    /// Clock, sleeps and deadlines.
    type Time: TimeProvider + 'static;

    /// Task spawning.
    type Task: TaskProvider + 'static;

    /// Get the stream-lane transport.
    fn stream(&self) -> &Self::Stream;

    /// Get the datagram-lane transport.
    fn datagram(&self) -> &Self::Datagram;

    /// Get the time provider.
    fn time(&self) -> &Self::Time;

    /// Get the task provider.
    fn task(&self) -> &Self::Task;
}

/// Production providers: TCP for both lanes, tokio time and tasks.
#[derive(Clone)]
pub struct TokioProviders {
    stream: TcpNet,
    datagram: TcpNet,
    time: TokioTime,
    task: TokioTask,
}

impl TokioProviders {
    /// Create the production bundle.
    pub fn new() -> Self {
        Self {
            stream: TcpNet,
            datagram: TcpNet,
            time: TokioTime::new(),
            task: TokioTask,
        }
    }
}

impl Default for TokioProviders {
    fn default() -> Self {
        Self::new()
    }
}

impl Providers for TokioProviders {
    type Stream = TcpNet;
    type Datagram = TcpNet;
    type Time = TokioTime;
    type Task = TokioTask;

    fn stream(&self) -> &Self::Stream {
        &self.stream
    }

    fn datagram(&self) -> &Self::Datagram {
        &self.datagram
    }

    fn time(&self) -> &Self::Time {
        &self.time
    }

    fn task(&self) -> &Self::Task {
        &self.task
    }
}

/// Test providers: both lanes share one [`SimNet`] world.
///
/// Stream and datagram listeners live in the same endpoint table, separated
/// by port, which matches how the production bundle separates them.
#[derive(Clone)]
pub struct SimProviders {
    stream: SimNet,
    datagram: SimNet,
    time: TokioTime,
    task: TokioTask,
}

impl SimProviders {
    /// Build a bundle whose lanes dial out as hosts on `net`'s world.
    pub fn new(net: SimNet) -> Self {
        Self {
            stream: net.clone(),
            datagram: net,
            time: TokioTime::new(),
            task: TokioTask,
        }
    }
}

impl Providers for SimProviders {
    type Stream = SimNet;
    type Datagram = SimNet;
    type Time = TokioTime;
    type Task = TokioTask;

    fn stream(&self) -> &Self::Stream {
        &self.stream
    }

    fn datagram(&self) -> &Self::Datagram {
        &self.datagram
    }

    fn time(&self) -> &Self::Time {
        &self.time
    }

    fn task(&self) -> &Self::Task {
        &self.task
    }
}
