//! Episode termination.

use crate::robot::RobotModel;
use crate::state::SimulationState;

/// Where an instance stands after the termination check of a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpisodeStatus {
    Running,
    /// Ended by a failure condition.
    Terminated,
    /// Ran out of time without failing.
    TimedOut,
}

/// Thresholds applied by [`TerminationReport::check`].
#[derive(Clone, Debug)]
pub struct TerminationLimits {
    pub contact_force: f32,
    pub max_episode_length: u32,
    pub dof_vel: f32,
    pub base_lin_vel: f32,
    pub unactuated_steps: f32,
}

#[derive(Clone, Debug)]
pub struct TerminationReport {
    pub reset: Vec<bool>,
    pub time_out: Vec<bool>,
}

impl TerminationReport {
    pub fn new(num_envs: usize) -> Self {
        Self {
            reset: vec![false; num_envs],
            time_out: vec![false; num_envs],
        }
    }

    pub fn check(&mut self, state: &SimulationState, robot: &RobotModel, limits: &TerminationLimits) {
        for env in 0..state.num_envs {
            let contact = robot
                .bodies
                .termination_contacts
                .iter()
                .any(|&b| state.contact(env, b).norm() > limits.contact_force);

            let time_out = state.episode_length[env] > limits.max_episode_length;

            let actuated = state.is_actuated(env, limits.unactuated_steps);
            let max_dof_vel = state.dof_vel.row(env).iter().fold(0.0f32, |m, v| m.max(v.abs()));
            let runaway = actuated
                && (max_dof_vel > limits.dof_vel || state.root_lin_vel[env].norm() > limits.base_lin_vel);

            self.time_out[env] = time_out;
            self.reset[env] = contact || time_out || runaway;
        }
    }

    pub fn status(&self, env: usize) -> EpisodeStatus {
        match (self.reset[env], self.time_out[env]) {
            (false, _) => EpisodeStatus::Running,
            (true, true) => EpisodeStatus::TimedOut,
            (true, false) => EpisodeStatus::Terminated,
        }
    }

    pub fn reset_ids(&self) -> Vec<usize> {
        self.reset
            .iter()
            .enumerate()
            .filter_map(|(env, &r)| r.then_some(env))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::physics::testing::kbot_asset;
    use nalgebra as na;

    fn setup(num_envs: usize) -> (SimulationState, RobotModel, TerminationLimits) {
        let mut config = EnvConfig::default();
        config.asset.terminate_after_contacts_on = vec!["torso".into()];
        let robot = RobotModel::resolve(&kbot_asset(), &config).unwrap();
        let state = SimulationState::new(num_envs, robot.num_dofs(), robot.num_bodies);
        let limits = TerminationLimits {
            contact_force: 1.0,
            max_episode_length: 500,
            dof_vel: 300.0,
            base_lin_vel: 20.0,
            unactuated_steps: 30.0,
        };
        (state, robot, limits)
    }

    #[test]
    fn test_contact_termination() {
        let (mut state, robot, limits) = setup(2);
        state.contact_forces[robot.num_bodies] = na::Vector3::new(0.0, 0.0, 1.5);
        let mut report = TerminationReport::new(2);
        report.check(&state, &robot, &limits);
        assert_eq!(report.reset, vec![false, true]);
        assert_eq!(report.status(1), EpisodeStatus::Terminated);
        assert_eq!(report.reset_ids(), vec![1]);
    }

    #[test]
    fn test_time_out_is_flagged_separately() {
        let (mut state, robot, limits) = setup(2);
        state.episode_length = vec![500, 501];
        let mut report = TerminationReport::new(2);
        report.check(&state, &robot, &limits);
        assert_eq!(report.reset, vec![false, true]);
        assert_eq!(report.time_out, vec![false, true]);
        assert_eq!(report.status(1), EpisodeStatus::TimedOut);
        assert_eq!(report.status(0), EpisodeStatus::Running);
    }

    #[test]
    fn test_velocity_limits_only_after_warm_up() {
        let (mut state, robot, limits) = setup(3);
        state.dof_vel[(0, 4)] = -301.0;
        state.dof_vel[(1, 4)] = -301.0;
        state.root_lin_vel[2] = na::Vector3::new(15.0, 15.0, 0.0);
        state.real_episode_length = vec![10, 31, 31];
        let mut report = TerminationReport::new(3);
        report.check(&state, &robot, &limits);
        assert_eq!(report.reset, vec![false, true, true]);
    }
}
