//! Boundary to the rigid-body simulator.
//!
//! The core never integrates dynamics itself. A backend owns the bodies and
//! joints of all instances and exchanges batched state with the core through
//! [`PhysicsBackend`].

use nalgebra as na;

use crate::randomization::BodyProperties;
use crate::state::SimulationState;

/// Static description of the robot asset, shared by every instance.
#[derive(Clone, Debug)]
pub struct AssetInfo {
    pub dof_names: Vec<String>,
    pub body_names: Vec<String>,
    pub dof_pos_lower: Vec<f32>,
    pub dof_pos_upper: Vec<f32>,
    pub dof_vel_limits: Vec<f32>,
    pub torque_limits: Vec<f32>,
    pub default_body_masses: Vec<f32>,
}

impl AssetInfo {
    pub fn num_dofs(&self) -> usize {
        self.dof_names.len()
    }

    pub fn num_bodies(&self) -> usize {
        self.body_names.len()
    }
}

pub trait PhysicsBackend {
    fn asset(&self) -> &AssetInfo;

    /// Instances the backend was built for.
    fn num_envs(&self) -> usize;

    /// Bodies simulated per instance.
    fn num_bodies(&self) -> usize;

    /// Spawn-time body properties for one instance. Called once per instance
    /// before the first step.
    fn bake_body_properties(&mut self, instance: usize, props: &BodyProperties);

    /// Advance one physics sub-step under `torques` (N x dofs). `body_forces`
    /// holds one world-frame force per body, laid out `[instance * num_bodies + body]`.
    fn simulate(&mut self, torques: &na::DMatrix<f32>, body_forces: Option<&[na::Vector3<f32>]>);

    /// Copy joint positions and velocities into `state`.
    fn refresh_dof_state(&mut self, state: &mut SimulationState);

    /// Copy root states, body positions and net contact forces into `state`.
    fn refresh_state(&mut self, state: &mut SimulationState);

    /// Overwrite joint state of the listed instances from `state`.
    fn write_dof_state(&mut self, instances: &[usize], state: &SimulationState);

    /// Overwrite root state of the listed instances from `state`.
    fn write_root_state(&mut self, instances: &[usize], state: &SimulationState);
}
