//! Action to torque conversion.
//!
//! Actions are clipped, gated by the warm-up window, scaled by the per-instance
//! rescale, optionally delayed, and turned into torques by a PD, velocity or
//! direct-torque law. Actuator randomization is applied last and the result is
//! clipped to the joint torque limits.

use std::collections::{BTreeMap, VecDeque};

use nalgebra as na;

use crate::config::ControlMode;
use crate::randomization::ActuatorRandomization;
use crate::state::SimulationState;

/// Per-joint proportional and derivative gains.
#[derive(Clone, Debug, PartialEq)]
pub struct PdGains {
    pub p: Vec<f32>,
    pub d: Vec<f32>,
}

impl PdGains {
    /// Resolve gains by joint-name substring. Keys are visited in alphabetical
    /// order, so when several match a joint the alphabetically last one wins.
    /// Unmatched joints get zero gain and, in position or velocity mode, a warning.
    pub fn resolve(
        dof_names: &[String],
        stiffness: &BTreeMap<String, f32>,
        damping: &BTreeMap<String, f32>,
        mode: ControlMode,
    ) -> Self {
        let mut p = vec![0.0; dof_names.len()];
        let mut d = vec![0.0; dof_names.len()];
        for (j, name) in dof_names.iter().enumerate() {
            let mut found = false;
            for (key, &kp) in stiffness {
                if name.contains(key.as_str()) {
                    p[j] = kp;
                    d[j] = damping.get(key).copied().unwrap_or(0.0);
                    found = true;
                }
            }
            if !found && mode != ControlMode::Torque {
                log::warn!("PD gain of joint {} were not defined, setting them to zero", name);
            }
        }
        Self { p, d }
    }
}

/// Fixed-depth FIFO of scaled actions.
///
/// Each physics sub-step pushes the newest action at the back and drops the
/// oldest at the front. Instance `e` reads slot `delay_idx[e]`, so slot
/// `depth - 1` is the freshest and slot 0 the stalest.
#[derive(Clone, Debug)]
pub struct DelayBuffer {
    slots: VecDeque<na::DMatrix<f32>>,
}

impl DelayBuffer {
    pub fn new(depth: usize, num_envs: usize, num_actions: usize) -> Self {
        let depth = depth.max(1);
        Self {
            slots: (0..depth).map(|_| na::DMatrix::zeros(num_envs, num_actions)).collect(),
        }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn push(&mut self, scaled: &na::DMatrix<f32>) {
        if let Some(mut oldest) = self.slots.pop_front() {
            oldest.copy_from(scaled);
            self.slots.push_back(oldest);
        }
    }

    /// Delayed action of `joint` for `env`, read from `slot` (clamped to the depth).
    pub fn read(&self, env: usize, slot: usize, joint: usize) -> f32 {
        let slot = slot.min(self.slots.len() - 1);
        self.slots[slot][(env, joint)]
    }

    pub fn clear(&mut self, ids: &[usize]) {
        for slot in self.slots.iter_mut() {
            for &env in ids {
                slot.row_mut(env).fill(0.0);
            }
        }
    }
}

/// Current and previous actions of every instance.
#[derive(Clone, Debug)]
pub struct ActionHistory {
    pub actions: na::DMatrix<f32>,
    pub last_actions: na::DMatrix<f32>,
    pub last_last_actions: na::DMatrix<f32>,
}

impl ActionHistory {
    pub fn new(num_envs: usize, num_actions: usize) -> Self {
        let zeros = na::DMatrix::zeros(num_envs, num_actions);
        Self {
            actions: zeros.clone(),
            last_actions: zeros.clone(),
            last_last_actions: zeros,
        }
    }

    /// Store clipped actions for this policy step.
    pub fn set(&mut self, actions: &na::DMatrix<f32>, clip: f32) {
        self.actions.zip_apply(actions, |dst, src| *dst = src.clamp(-clip, clip));
    }

    /// Zero the rows of instances still inside their warm-up window.
    pub fn gate(&mut self, state: &SimulationState, unactuated_steps: f32) {
        for env in 0..state.num_envs {
            if !state.is_actuated(env, unactuated_steps) {
                self.actions.row_mut(env).fill(0.0);
            }
        }
    }

    pub fn roll(&mut self) {
        self.last_last_actions.copy_from(&self.last_actions);
        self.last_actions.copy_from(&self.actions);
    }

    pub fn clear(&mut self, ids: &[usize]) {
        for &env in ids {
            self.actions.row_mut(env).fill(0.0);
            self.last_actions.row_mut(env).fill(0.0);
            self.last_last_actions.row_mut(env).fill(0.0);
        }
    }
}

pub struct PdController {
    mode: ControlMode,
    gains: PdGains,
    torque_limits: Vec<f32>,
    sim_dt: f32,
    delay: Option<DelayBuffer>,
    scaled: na::DMatrix<f32>,
    pub history: ActionHistory,
    pub joint_pos_target: na::DMatrix<f32>,
    pub torques: na::DMatrix<f32>,
}

impl PdController {
    pub fn new(
        mode: ControlMode,
        gains: PdGains,
        torque_limits: Vec<f32>,
        sim_dt: f32,
        num_envs: usize,
        max_delay: Option<usize>,
    ) -> Self {
        let dofs = torque_limits.len();
        Self {
            mode,
            gains,
            torque_limits,
            sim_dt,
            delay: max_delay.map(|depth| DelayBuffer::new(depth, num_envs, dofs)),
            scaled: na::DMatrix::zeros(num_envs, dofs),
            history: ActionHistory::new(num_envs, dofs),
            joint_pos_target: na::DMatrix::zeros(num_envs, dofs),
            torques: na::DMatrix::zeros(num_envs, dofs),
        }
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    pub fn gains(&self) -> &PdGains {
        &self.gains
    }

    pub fn delay(&self) -> Option<&DelayBuffer> {
        self.delay.as_ref()
    }

    /// One physics sub-step worth of torques from the current (gated) actions.
    pub fn compute_torques(
        &mut self,
        state: &SimulationState,
        rescale: &[f32],
        act: &ActuatorRandomization,
    ) -> &na::DMatrix<f32> {
        let dofs = self.torque_limits.len();
        for env in 0..state.num_envs {
            for j in 0..dofs {
                self.scaled[(env, j)] = self.history.actions[(env, j)] * rescale[env];
            }
        }

        if let Some(buffer) = self.delay.as_mut() {
            buffer.push(&self.scaled);
            for env in 0..state.num_envs {
                for j in 0..dofs {
                    let delayed = buffer.read(env, act.delay_idx[env], j);
                    self.joint_pos_target[(env, j)] = state.dof_pos[(env, j)] + delayed;
                }
            }
        } else {
            self.joint_pos_target.copy_from(&state.dof_pos);
            self.joint_pos_target += &self.scaled;
        }

        for env in 0..state.num_envs {
            for j in 0..dofs {
                let pos = state.dof_pos[(env, j)];
                let vel = state.dof_vel[(env, j)];
                let raw = match self.mode {
                    ControlMode::Position => {
                        self.gains.p[j] * act.kp_factors[(env, j)] * (self.joint_pos_target[(env, j)] - pos)
                            - self.gains.d[j] * act.kd_factors[(env, j)] * vel
                    }
                    ControlMode::Velocity => {
                        self.gains.p[j] * (self.scaled[(env, j)] - vel)
                            - self.gains.d[j] * (vel - state.last_dof_vel[(env, j)]) / self.sim_dt
                    }
                    ControlMode::Torque => self.scaled[(env, j)],
                };
                let limit = self.torque_limits[j];
                let tau = act.motor_strength[(env, j)] * raw + act.actuation_offset[(env, j)];
                self.torques[(env, j)] = tau.clamp(-limit, limit);
            }
        }
        &self.torques
    }

    /// Clear action history and delay rows of the listed instances.
    pub fn reset(&mut self, ids: &[usize]) {
        self.history.clear(ids);
        if let Some(buffer) = self.delay.as_mut() {
            buffer.clear(ids);
        }
    }
}
