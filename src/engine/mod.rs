//! Purchase engine: the per-item purchase guard, the periodic monitor
//! loops, and the registry that starts and stops them.

pub mod guard;
pub mod monitor;
pub mod registry;

pub use guard::PurchaseGuard;
pub use monitor::{LoopPhase, LoopStats, MonitorLoop, MonitorRecord};
pub use registry::{MonitorRegistry, MonitorStatus, RegistrySettings, StopOutcome};
