//! Environment configuration.
//!
//! Every numeric constant the core reads lives here. `Default` reproduces the
//! K-Bot ground get-up setup; any field can be overridden from JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use crate::error::{EnvError, Result};

/// Inclusive `[low, high]` sampling interval.
pub type Range = [f32; 2];

/// How actions are turned into torques.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ControlMode {
    /// `P`: actions are joint-position deltas tracked by a PD law.
    Position,
    /// `V`: actions are joint-velocity targets.
    Velocity,
    /// `T`: actions are scaled torques.
    Torque,
}

impl FromStr for ControlMode {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "P" => Ok(ControlMode::Position),
            "V" => Ok(ControlMode::Velocity),
            "T" => Ok(ControlMode::Torque),
            other => Err(EnvError::UnknownControlMode(other.to_string())),
        }
    }
}

impl TryFrom<String> for ControlMode {
    type Error = EnvError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ControlMode> for String {
    fn from(mode: ControlMode) -> Self {
        match mode {
            ControlMode::Position => "P",
            ControlMode::Velocity => "V",
            ControlMode::Torque => "T",
        }
        .to_string()
    }
}

const LEG_JOINTS: [&str; 10] = [
    "dof_left_hip_yaw_03",
    "dof_left_hip_roll_03",
    "dof_left_hip_pitch_04",
    "dof_left_knee_04",
    "dof_left_ankle_02",
    "dof_right_hip_yaw_03",
    "dof_right_hip_roll_03",
    "dof_right_hip_pitch_04",
    "dof_right_knee_04",
    "dof_right_ankle_02",
];

const ARM_JOINTS: [&str; 10] = [
    "dof_left_shoulder_pitch_03",
    "dof_left_shoulder_roll_03",
    "dof_left_shoulder_yaw_02",
    "dof_left_elbow_02",
    "dof_left_wrist_00",
    "dof_right_shoulder_pitch_03",
    "dof_right_shoulder_roll_03",
    "dof_right_shoulder_yaw_02",
    "dof_right_elbow_02",
    "dof_right_wrist_00",
];

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn map(entries: &[(&str, f32)]) -> BTreeMap<String, f32> {
    entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvSection {
    pub num_envs: usize,
    pub num_actions: usize,
    pub num_dofs: usize,
    /// Depth of the stacked observation history.
    pub num_actor_history: usize,
    pub episode_length_s: f32,
    /// Warm-up length, expressed in 0.02 s policy steps.
    pub unactuated_timesteps: u32,
    pub env_spacing: f32,
    pub send_timeouts: bool,
    /// Contact-force norm above which a termination body ends the episode.
    pub termination_contact_force: f32,
}

impl Default for EnvSection {
    fn default() -> Self {
        Self {
            num_envs: 4096,
            num_actions: 20,
            num_dofs: 20,
            num_actor_history: 6,
            episode_length_s: 10.0,
            unactuated_timesteps: 30,
            env_spacing: 3.0,
            send_timeouts: true,
            termination_contact_force: 1.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InitStateSection {
    pub pos: [f32; 3],
    /// Base orientation as `[x, y, z, w]`; normalized on use.
    pub rot: [f32; 4],
    pub lin_vel: [f32; 3],
    pub ang_vel: [f32; 3],
    pub default_joint_angles: BTreeMap<String, f32>,
    pub target_joint_angles: BTreeMap<String, f32>,
}

impl Default for InitStateSection {
    fn default() -> Self {
        let zeros: BTreeMap<String, f32> = LEG_JOINTS
            .iter()
            .chain(ARM_JOINTS.iter())
            .map(|name| (name.to_string(), 0.0))
            .collect();
        Self {
            pos: [0.0, 0.0, 0.5],
            rot: [0.0, -1.0, 0.0, 1.0],
            lin_vel: [0.0; 3],
            ang_vel: [0.0; 3],
            default_joint_angles: zeros.clone(),
            target_joint_angles: zeros,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSection {
    pub control_type: ControlMode,
    /// Stiffness per joint-name substring [N*m/rad].
    pub stiffness: BTreeMap<String, f32>,
    /// Damping per joint-name substring [N*m*s/rad].
    pub damping: BTreeMap<String, f32>,
    /// Initial per-instance action rescale.
    pub action_scale: f32,
    /// Physics sub-steps per policy step.
    pub decimation: u32,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            control_type: ControlMode::Position,
            stiffness: map(&[
                ("hip", 150.0),
                ("knee", 200.0),
                ("ankle", 50.0),
                ("shoulder", 100.0),
                ("elbow", 100.0),
                ("wrist", 100.0),
            ]),
            damping: map(&[
                ("hip", 4.0),
                ("knee", 6.0),
                ("ankle", 2.0),
                ("shoulder", 4.0),
                ("elbow", 4.0),
                ("wrist", 4.0),
            ]),
            action_scale: 1.0,
            decimation: 4,
        }
    }
}

/// Body-name patterns and joint groups resolved against the asset.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetSection {
    pub foot_name: String,
    pub left_foot_name: String,
    pub right_foot_name: String,
    pub left_knee_name: String,
    pub right_knee_name: String,
    pub head_name: String,
    pub base_name: String,
    pub left_ankle_names: Vec<String>,
    pub right_ankle_names: Vec<String>,
    pub penalize_contacts_on: Vec<String>,
    pub terminate_after_contacts_on: Vec<String>,
    pub hip_yaw_joints: Vec<String>,
    pub hip_roll_joints: Vec<String>,
    pub knee_joints: Vec<String>,
    /// Left shoulder roll first, then right.
    pub shoulder_roll_joints: Vec<String>,
    pub waist_joints: Vec<String>,
    pub upper_body_joints: Vec<String>,
}

impl Default for AssetSection {
    fn default() -> Self {
        let mut upper_body = strings(&ARM_JOINTS[5..]);
        upper_body.extend(strings(&ARM_JOINTS[..5]));
        Self {
            foot_name: "FOOT".into(),
            left_foot_name: "KB_D_501L_L_LEG_FOOT".into(),
            right_foot_name: "KB_D_501R_R_LEG_FOOT".into(),
            left_knee_name: "KC_D_401L_L_Shin_Drive".into(),
            right_knee_name: "KC_D_401R_R_Shin_Drive".into(),
            head_name: "keyframe_head".into(),
            base_name: "torso_link".into(),
            left_ankle_names: strings(&["dof_left_ankle_02"]),
            right_ankle_names: strings(&["dof_right_ankle_02"]),
            penalize_contacts_on: strings(&["elbow", "shoulder", "knee", "hip"]),
            terminate_after_contacts_on: Vec::new(),
            hip_yaw_joints: strings(&["dof_left_hip_yaw_03", "dof_right_hip_yaw_03"]),
            hip_roll_joints: strings(&["dof_left_hip_roll_03", "dof_right_hip_roll_03"]),
            knee_joints: strings(&["dof_left_knee_04", "dof_right_knee_04"]),
            shoulder_roll_joints: strings(&[
                "dof_left_shoulder_roll_03",
                "dof_right_shoulder_roll_03",
            ]),
            waist_joints: Vec::new(),
            upper_body_joints: upper_body,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardsSection {
    pub soft_dof_pos_limit: f32,
    pub soft_dof_vel_limit: f32,
    pub soft_torque_limit: f32,
    pub base_height_target: f32,
    /// Kept for config compatibility. The multiplicative task group is never clipped.
    pub only_positive_rewards: bool,
    pub is_gaussian: bool,
    pub target_head_height: f32,
    pub target_head_margin: f32,
    pub target_base_height_phase1: f32,
    pub target_base_height_phase3: f32,
    pub orientation_threshold: f32,
    pub left_foot_displacement_sigma: f32,
    pub right_foot_displacement_sigma: f32,
    pub target_dof_pos_sigma: f32,
    pub reward_groups: Vec<String>,
    pub reward_group_weights: Vec<f32>,
    /// Multiplicative task terms. Not time-scaled.
    pub scales: BTreeMap<String, f32>,
}

impl Default for RewardsSection {
    fn default() -> Self {
        Self {
            soft_dof_pos_limit: 0.9,
            soft_dof_vel_limit: 0.9,
            soft_torque_limit: 1.0,
            base_height_target: 0.75,
            only_positive_rewards: false,
            is_gaussian: true,
            target_head_height: 1.0,
            target_head_margin: 1.0,
            target_base_height_phase1: 0.45,
            target_base_height_phase3: 0.65,
            orientation_threshold: 0.99,
            left_foot_displacement_sigma: -2.0,
            right_foot_displacement_sigma: -2.0,
            target_dof_pos_sigma: -0.1,
            reward_groups: strings(&["task", "regu", "style", "target"]),
            reward_group_weights: vec![2.5, 0.1, 1.0, 1.0],
            scales: map(&[("task_orientation", 1.0), ("task_head_height", 1.0)]),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintsSection {
    /// Floor a constraint group at zero after each of its terms is added.
    pub only_positive_rewards: bool,
    /// Once stood up, saturate the shank/ground style terms at 1.
    pub post_task: bool,
    /// Additive terms keyed `<group>_<term>`. Multiplied by the policy dt.
    pub scales: BTreeMap<String, f32>,
}

impl Default for ConstraintsSection {
    fn default() -> Self {
        Self {
            only_positive_rewards: false,
            post_task: false,
            scales: map(&[
                ("regu_dof_acc", -2.5e-7),
                ("regu_action_rate", -0.01),
                ("regu_smoothness", -0.01),
                ("regu_torques", -2.5e-6),
                ("regu_joint_power", -2.5e-5),
                ("regu_dof_vel", -1e-3),
                ("regu_joint_tracking_error", -0.00025),
                ("regu_dof_pos_limits", -100.0),
                ("regu_dof_vel_limits", -1.0),
                ("style_waist_deviation", -10.0),
                ("style_hip_yaw_deviation", -10.0),
                ("style_hip_roll_deviation", -10.0),
                ("style_shoulder_roll_deviation", -2.5),
                ("style_left_foot_displacement", 2.5),
                ("style_right_foot_displacement", 2.5),
                ("style_knee_deviation", -0.25),
                ("style_shank_orientation", 10.0),
                ("style_ground_parallel", 20.0),
                ("style_feet_distance", -10.0),
                ("style_style_ang_vel_xy", 1.0),
                ("target_ang_vel_xy", 10.0),
                ("target_lin_vel_xy", 10.0),
                ("target_feet_height_var", 2.5),
                ("target_target_upper_dof_pos", 10.0),
                ("target_target_orientation", 10.0),
                ("target_target_base_height", 10.0),
            ]),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainRandSection {
    pub randomize_actuation_offset: bool,
    /// Fraction of each joint's torque limit.
    pub actuation_offset_range: Range,
    pub randomize_motor_strength: bool,
    pub motor_strength_range: Range,
    pub randomize_payload_mass: bool,
    pub payload_mass_range: Range,
    pub randomize_com_displacement: bool,
    pub com_displacement_range: Range,
    pub randomize_link_mass: bool,
    pub link_mass_range: Range,
    pub randomize_friction: bool,
    pub friction_range: Range,
    pub randomize_restitution: bool,
    pub restitution_range: Range,
    pub randomize_kp: bool,
    pub kp_range: Range,
    pub randomize_kd: bool,
    pub kd_range: Range,
    pub randomize_initial_joint_pos: bool,
    pub initial_joint_pos_scale: Range,
    pub initial_joint_pos_offset: Range,
    /// Extra `U(-1, 1)` pose noise when initial-pose randomization is off.
    pub random_pose: bool,
    pub push_robots: bool,
    pub push_interval_s: f32,
    pub max_push_vel_xy: f32,
    pub delay: bool,
    pub max_delay_timesteps: usize,
}

impl Default for DomainRandSection {
    fn default() -> Self {
        Self {
            randomize_actuation_offset: true,
            actuation_offset_range: [-0.05, 0.05],
            randomize_motor_strength: true,
            motor_strength_range: [0.9, 1.1],
            randomize_payload_mass: true,
            payload_mass_range: [-2.0, 5.0],
            randomize_com_displacement: true,
            com_displacement_range: [-0.03, 0.03],
            randomize_link_mass: true,
            link_mass_range: [0.8, 1.2],
            randomize_friction: true,
            friction_range: [0.1, 1.0],
            randomize_restitution: true,
            restitution_range: [0.0, 1.0],
            randomize_kp: true,
            kp_range: [0.85, 1.15],
            randomize_kd: true,
            kd_range: [0.85, 1.15],
            randomize_initial_joint_pos: true,
            initial_joint_pos_scale: [0.9, 1.1],
            initial_joint_pos_offset: [-0.1, 0.1],
            random_pose: false,
            push_robots: false,
            push_interval_s: 10.0,
            max_push_vel_xy: 0.5,
            delay: true,
            max_delay_timesteps: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CurriculumSection {
    /// Apply the assistive vertical force on the base bodies.
    pub pull_force: bool,
    /// Initial assistive force [N].
    pub force: f32,
    pub force_step: f32,
    pub action_scale_step: f32,
    pub min_action_scale: f32,
    pub dof_vel_limit: f32,
    pub base_vel_limit: f32,
    /// Head height an episode must finish above to advance.
    pub threshold_height: f32,
    /// Apply the pull force regardless of base orientation.
    pub no_orientation: bool,
}

impl Default for CurriculumSection {
    fn default() -> Self {
        Self {
            pull_force: true,
            force: 100.0,
            force_step: 20.0,
            action_scale_step: 0.02,
            min_action_scale: 0.25,
            dof_vel_limit: 300.0,
            base_vel_limit: 20.0,
            threshold_height: 0.9,
            no_orientation: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseScales {
    pub dof_pos: f32,
    pub dof_vel: f32,
    pub ang_vel: f32,
    pub gravity: f32,
}

impl Default for NoiseScales {
    fn default() -> Self {
        Self {
            dof_pos: 0.01,
            dof_vel: 1.5,
            ang_vel: 0.2,
            gravity: 0.05,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseSection {
    pub add_noise: bool,
    pub noise_level: f32,
    pub noise_scales: NoiseScales,
}

impl Default for NoiseSection {
    fn default() -> Self {
        Self {
            add_noise: true,
            noise_level: 1.0,
            noise_scales: NoiseScales::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ObsScales {
    pub ang_vel: f32,
    pub dof_pos: f32,
    pub dof_vel: f32,
}

impl Default for ObsScales {
    fn default() -> Self {
        Self {
            ang_vel: 0.25,
            dof_pos: 1.0,
            dof_vel: 0.05,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationSection {
    pub obs_scales: ObsScales,
    pub clip_observations: f32,
    pub clip_actions: f32,
}

impl Default for NormalizationSection {
    fn default() -> Self {
        Self {
            obs_scales: ObsScales::default(),
            clip_observations: 100.0,
            clip_actions: 100.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimSection {
    /// Physics sub-step [s].
    pub dt: f32,
    pub gravity: [f32; 3],
}

impl Default for SimSection {
    fn default() -> Self {
        Self {
            dt: 0.005,
            gravity: [0.0, 0.0, -9.81],
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub seed: u64,
    pub env: EnvSection,
    pub init_state: InitStateSection,
    pub control: ControlSection,
    pub asset: AssetSection,
    pub rewards: RewardsSection,
    pub constraints: ConstraintsSection,
    pub domain_rand: DomainRandSection,
    pub curriculum: CurriculumSection,
    pub noise: NoiseSection,
    pub normalization: NormalizationSection,
    pub sim: SimSection,
}

impl EnvConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EnvConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Policy step length [s].
    pub fn dt(&self) -> f32 {
        self.control.decimation as f32 * self.sim.dt
    }

    /// Episode length in policy steps.
    pub fn max_episode_length(&self) -> u32 {
        (self.env.episode_length_s / self.dt()).ceil() as u32
    }

    /// Warm-up window in policy steps; `unactuated_timesteps` is counted at 50 Hz.
    pub fn unactuated_steps(&self) -> f32 {
        self.env.unactuated_timesteps as f32 * 0.02 / self.dt()
    }

    pub fn push_interval(&self) -> u32 {
        (self.domain_rand.push_interval_s / self.dt()).ceil() as u32
    }

    /// Width of one observation step: ang vel, gravity, dof pos, dof vel, action, rescale.
    pub fn num_one_step_obs(&self) -> usize {
        3 + 3 + 2 * self.env.num_dofs + self.env.num_actions + 1
    }

    pub fn num_observations(&self) -> usize {
        self.env.num_actor_history * self.num_one_step_obs()
    }

    pub fn validate(&self) -> Result<()> {
        if !self.rewards.is_gaussian {
            return Err(EnvError::UnsupportedRewardMode);
        }
        if self.env.num_envs == 0 {
            return Err(invalid("env.num_envs", "must be positive"));
        }
        if self.env.num_actions != self.env.num_dofs {
            return Err(invalid(
                "env.num_actions",
                format!("{} actions for {} dofs", self.env.num_actions, self.env.num_dofs),
            ));
        }
        if self.env.num_actor_history == 0 {
            return Err(invalid("env.num_actor_history", "must be positive"));
        }
        if self.control.decimation == 0 {
            return Err(invalid("control.decimation", "must be positive"));
        }
        if !(self.sim.dt > 0.0) {
            return Err(invalid("sim.dt", "must be positive"));
        }
        if self.domain_rand.delay && self.domain_rand.max_delay_timesteps == 0 {
            return Err(invalid("domain_rand.max_delay_timesteps", "must be positive when delay is on"));
        }
        if !self.rewards.reward_groups.iter().any(|g| g == "task") {
            return Err(invalid("rewards.reward_groups", "must contain `task`"));
        }
        if self.rewards.reward_group_weights.len() != self.rewards.reward_groups.len() {
            return Err(invalid("rewards.reward_group_weights", "one weight per group"));
        }

        let dr = &self.domain_rand;
        let ranges: [(&'static str, Range); 11] = [
            ("actuation_offset", dr.actuation_offset_range),
            ("motor_strength", dr.motor_strength_range),
            ("payload_mass", dr.payload_mass_range),
            ("com_displacement", dr.com_displacement_range),
            ("link_mass", dr.link_mass_range),
            ("friction", dr.friction_range),
            ("restitution", dr.restitution_range),
            ("kp", dr.kp_range),
            ("kd", dr.kd_range),
            ("initial_joint_pos_scale", dr.initial_joint_pos_scale),
            ("initial_joint_pos_offset", dr.initial_joint_pos_offset),
        ];
        for (channel, [low, high]) in ranges {
            if !(low.is_finite() && high.is_finite() && low <= high) {
                return Err(EnvError::InvalidRange { channel, low, high });
            }
        }
        Ok(())
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> EnvError {
    EnvError::InvalidConfig {
        field,
        message: message.into(),
    }
}
