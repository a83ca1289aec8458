//! Batched per-instance simulation state.
//!
//! Every array is indexed by instance first. Per-body arrays are flat and laid
//! out `[instance * num_bodies + body]`, which matches the tensors a physics
//! backend hands back.

use nalgebra as na;

use crate::math::rotate_inverse;

#[derive(Clone, Debug)]
pub struct SimulationState {
    pub num_envs: usize,
    pub num_dofs: usize,
    pub num_bodies: usize,

    pub root_pos: Vec<na::Vector3<f32>>,
    pub root_quat: Vec<na::UnitQuaternion<f32>>,
    /// World frame.
    pub root_lin_vel: Vec<na::Vector3<f32>>,
    /// World frame.
    pub root_ang_vel: Vec<na::Vector3<f32>>,

    pub dof_pos: na::DMatrix<f32>,
    pub dof_vel: na::DMatrix<f32>,
    pub last_dof_vel: na::DMatrix<f32>,
    pub last_dof_pos: na::DMatrix<f32>,
    pub last_last_dof_pos: na::DMatrix<f32>,

    pub body_pos: Vec<na::Vector3<f32>>,
    pub contact_forces: Vec<na::Vector3<f32>>,

    // Derived in `refresh_derived`.
    pub base_lin_vel: Vec<na::Vector3<f32>>,
    pub base_ang_vel: Vec<na::Vector3<f32>>,
    pub projected_gravity: Vec<na::Vector3<f32>>,

    /// Policy steps since the last reset. May start randomized.
    pub episode_length: Vec<u32>,
    /// Policy steps since the last reset. Always starts at zero.
    pub real_episode_length: Vec<u32>,
}

impl SimulationState {
    pub fn new(num_envs: usize, num_dofs: usize, num_bodies: usize) -> Self {
        let v0 = vec![na::Vector3::zeros(); num_envs];
        let dofs = na::DMatrix::zeros(num_envs, num_dofs);
        Self {
            num_envs,
            num_dofs,
            num_bodies,
            root_pos: v0.clone(),
            root_quat: vec![na::UnitQuaternion::identity(); num_envs],
            root_lin_vel: v0.clone(),
            root_ang_vel: v0.clone(),
            dof_pos: dofs.clone(),
            dof_vel: dofs.clone(),
            last_dof_vel: dofs.clone(),
            last_dof_pos: dofs.clone(),
            last_last_dof_pos: dofs,
            body_pos: vec![na::Vector3::zeros(); num_envs * num_bodies],
            contact_forces: vec![na::Vector3::zeros(); num_envs * num_bodies],
            base_lin_vel: v0.clone(),
            base_ang_vel: v0,
            projected_gravity: vec![na::Vector3::new(0.0, 0.0, -1.0); num_envs],
            episode_length: vec![0; num_envs],
            real_episode_length: vec![0; num_envs],
        }
    }

    #[inline]
    pub fn body(&self, env: usize, body: usize) -> &na::Vector3<f32> {
        &self.body_pos[env * self.num_bodies + body]
    }

    #[inline]
    pub fn contact(&self, env: usize, body: usize) -> &na::Vector3<f32> {
        &self.contact_forces[env * self.num_bodies + body]
    }

    /// Base height above the world origin.
    #[inline]
    pub fn base_height(&self, env: usize) -> f32 {
        self.root_pos[env].z
    }

    /// Recompute body-frame velocities and projected gravity from root state.
    pub fn refresh_derived(&mut self, gravity_dir: &na::Vector3<f32>) {
        for env in 0..self.num_envs {
            let q = &self.root_quat[env];
            self.base_lin_vel[env] = rotate_inverse(q, &self.root_lin_vel[env]);
            self.base_ang_vel[env] = rotate_inverse(q, &self.root_ang_vel[env]);
            self.projected_gravity[env] = rotate_inverse(q, gravity_dir);
        }
    }

    /// True once the instance is past its warm-up window.
    #[inline]
    pub fn is_actuated(&self, env: usize, unactuated_steps: f32) -> bool {
        self.real_episode_length[env] as f32 > unactuated_steps
    }

    pub fn advance_counters(&mut self) {
        for env in 0..self.num_envs {
            self.episode_length[env] += 1;
            self.real_episode_length[env] += 1;
        }
    }

    /// Shift joint histories after rewards have consumed them.
    pub fn roll_dof_history(&mut self) {
        self.last_last_dof_pos.copy_from(&self.last_dof_pos);
        self.last_dof_pos.copy_from(&self.dof_pos);
        self.last_dof_vel.copy_from(&self.dof_vel);
    }

    /// Zero histories and counters of the listed instances.
    pub fn clear(&mut self, ids: &[usize]) {
        for &env in ids {
            self.last_dof_vel.row_mut(env).fill(0.0);
            self.last_dof_pos.row_mut(env).fill(0.0);
            self.last_last_dof_pos.row_mut(env).fill(0.0);
            self.episode_length[env] = 0;
            self.real_episode_length[env] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_refresh_derived_rotates_into_body_frame() {
        let mut state = SimulationState::new(2, 3, 1);
        state.root_quat[1] = na::UnitQuaternion::from_axis_angle(&na::Vector3::z_axis(), std::f32::consts::FRAC_PI_2);
        state.root_lin_vel[1] = na::Vector3::new(1.0, 0.0, 0.0);
        state.refresh_derived(&na::Vector3::new(0.0, 0.0, -1.0));

        assert_relative_eq!(state.base_lin_vel[1].y, -1.0, epsilon = 1e-5);
        assert_relative_eq!(state.projected_gravity[0].z, -1.0);
        assert_relative_eq!(state.projected_gravity[1].z, -1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_warm_up_gate_is_strict() {
        let mut state = SimulationState::new(1, 1, 1);
        state.real_episode_length[0] = 30;
        assert!(!state.is_actuated(0, 30.0));
        state.real_episode_length[0] = 31;
        assert!(state.is_actuated(0, 30.0));
    }

    #[test]
    fn test_clear_only_touches_listed_rows() {
        let mut state = SimulationState::new(3, 2, 1);
        state.last_dof_vel.fill(1.0);
        state.advance_counters();
        state.clear(&[1]);
        assert_eq!(state.episode_length, vec![1, 0, 1]);
        assert_eq!(state.last_dof_vel.row(1).sum(), 0.0);
        assert_eq!(state.last_dof_vel.row(0).sum(), 2.0);
    }
}
