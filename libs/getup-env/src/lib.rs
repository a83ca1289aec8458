//! Get-up environment core for a humanoid lying on flat ground.
//!
//! Batched PD control, stacked observations, grouped rewards, termination,
//! domain randomization and the assistive-force curriculum. Rigid-body
//! dynamics live behind [`PhysicsBackend`].

pub mod config;
pub mod error;
pub mod math;
pub mod physics;
pub mod robot;
pub mod state;

pub mod controller;
pub mod curriculum;
pub mod observation;
pub mod randomization;
pub mod reward;
pub mod termination;

mod env;
pub use env::{EpisodeSummary, LeggedEnv, StepInfo, StepResult};

pub use config::{ControlMode, EnvConfig};
pub use error::{EnvError, Result};
pub use physics::{AssetInfo, PhysicsBackend};
pub use state::SimulationState;
pub use termination::EpisodeStatus;
