//! Deterministic multipath simulation for the MPRTP control core.
//!
//! A seeded scenario describes a set of bottleneck paths. The simulator
//! generates media at the sum of the controller's target bitrates, lets
//! [`SchedulerLoop::select_path`](mprtp_control::SchedulerLoop::select_path)
//! spread it over the paths, models queueing, loss and jitter per path, and
//! feeds receiver reports back through the real wire format. All time comes
//! from a mocked `quanta` clock, so a seed fully determines the result.

pub mod path;
pub mod receiver;
pub mod scenario;
pub mod simulation;

pub use scenario::{PathConfig, ScenarioConfig};
pub use simulation::{run, Simulation, SimulationReport};
