pub mod adapters;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod monitor;
pub mod oracle;
pub mod registry;
pub mod scheduler;
pub mod snapshot;

pub use clock::{Clock, ManualClock, SystemClock, now_wallclock_ms};
pub use config::HostConfig;
pub use daemon::{RelayDaemon, RelayParts};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use error::HostError;
pub use identity::IdentifierPolicy;
pub use metrics::{Health, Reporter};
pub use monitor::ConfirmationMonitor;
pub use oracle::{ChainOracle, SimulatedOracle, Verdict};
pub use registry::{PersistOutcome, SessionRegistry, StoreEvent};
pub use scheduler::{RunReport, Scheduler};
