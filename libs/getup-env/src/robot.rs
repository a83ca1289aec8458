//! Robot description resolved against the physics asset.
//!
//! Body patterns are substring matches over the asset's body names; joint
//! groups are exact dof names. Resolution happens once at construction.

use crate::config::EnvConfig;
use crate::error::{EnvError, Result};
use crate::physics::AssetInfo;

/// Body index sets used by rewards, termination and the pull force.
#[derive(Clone, Debug, Default)]
pub struct BodyIndices {
    pub base: Vec<usize>,
    pub head: Vec<usize>,
    pub feet: Vec<usize>,
    pub left_foot: Vec<usize>,
    pub right_foot: Vec<usize>,
    pub left_knee: Vec<usize>,
    pub right_knee: Vec<usize>,
    pub left_ankle: Vec<usize>,
    pub right_ankle: Vec<usize>,
    pub penalized_contacts: Vec<usize>,
    pub termination_contacts: Vec<usize>,
}

/// Dof index sets used by style terms.
#[derive(Clone, Debug, Default)]
pub struct JointGroups {
    pub hip_yaw: Vec<usize>,
    pub hip_roll: Vec<usize>,
    pub knee: Vec<usize>,
    pub shoulder_roll: Vec<usize>,
    pub waist: Vec<usize>,
    pub upper_body: Vec<usize>,
}

/// Hard joint limits from the asset, plus the soft position window.
#[derive(Clone, Debug)]
pub struct DofLimits {
    pub pos_lower: Vec<f32>,
    pub pos_upper: Vec<f32>,
    pub soft_pos_lower: Vec<f32>,
    pub soft_pos_upper: Vec<f32>,
    pub vel: Vec<f32>,
    pub torque: Vec<f32>,
}

impl DofLimits {
    /// Soft window: the hard range shrunk about its midpoint by `soft_fraction`.
    pub fn new(asset: &AssetInfo, soft_fraction: f32) -> Self {
        let (soft_pos_lower, soft_pos_upper) = asset
            .dof_pos_lower
            .iter()
            .zip(&asset.dof_pos_upper)
            .map(|(&lo, &hi)| {
                let mid = 0.5 * (lo + hi);
                let half = 0.5 * (hi - lo) * soft_fraction;
                (mid - half, mid + half)
            })
            .unzip();
        Self {
            pos_lower: asset.dof_pos_lower.clone(),
            pos_upper: asset.dof_pos_upper.clone(),
            soft_pos_lower,
            soft_pos_upper,
            vel: asset.dof_vel_limits.clone(),
            torque: asset.torque_limits.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RobotModel {
    pub dof_names: Vec<String>,
    pub num_bodies: usize,
    pub bodies: BodyIndices,
    pub joints: JointGroups,
    pub limits: DofLimits,
    pub default_dof_pos: Vec<f32>,
    pub target_dof_pos: Vec<f32>,
    pub default_body_masses: Vec<f32>,
}

impl RobotModel {
    pub fn resolve(asset: &AssetInfo, config: &EnvConfig) -> Result<Self> {
        let dofs = asset.num_dofs();
        if dofs != config.env.num_dofs {
            return Err(EnvError::ShapeMismatch {
                what: "num_dofs",
                expected: config.env.num_dofs,
                actual: dofs,
            });
        }
        for (what, len) in [
            ("dof_pos_lower", asset.dof_pos_lower.len()),
            ("dof_pos_upper", asset.dof_pos_upper.len()),
            ("dof_vel_limits", asset.dof_vel_limits.len()),
            ("torque_limits", asset.torque_limits.len()),
        ] {
            if len != dofs {
                return Err(EnvError::ShapeMismatch { what, expected: dofs, actual: len });
            }
        }
        if asset.default_body_masses.len() != asset.num_bodies() {
            return Err(EnvError::ShapeMismatch {
                what: "default_body_masses",
                expected: asset.num_bodies(),
                actual: asset.default_body_masses.len(),
            });
        }

        let a = &config.asset;
        let names = &asset.body_names;
        let bodies = BodyIndices {
            base: required(names, &a.base_name, &[])?,
            head: required(names, &a.head_name, &[])?,
            feet: required(names, &a.foot_name, &["auxiliary"])?,
            left_foot: required(names, &a.left_foot_name, &["keyframe", "auxiliary"])?,
            right_foot: required(names, &a.right_foot_name, &["keyframe", "auxiliary"])?,
            left_knee: required(names, &a.left_knee_name, &["keyframe"])?,
            right_knee: required(names, &a.right_knee_name, &["keyframe"])?,
            left_ankle: matching_any(names, &a.left_ankle_names, &["keyframe"]),
            right_ankle: matching_any(names, &a.right_ankle_names, &["keyframe"]),
            penalized_contacts: matching_any(names, &a.penalize_contacts_on, &[]),
            termination_contacts: matching_any(names, &a.terminate_after_contacts_on, &[]),
        };

        let joints = JointGroups {
            hip_yaw: joint_indices(&asset.dof_names, &a.hip_yaw_joints)?,
            hip_roll: joint_indices(&asset.dof_names, &a.hip_roll_joints)?,
            knee: joint_indices(&asset.dof_names, &a.knee_joints)?,
            shoulder_roll: joint_indices(&asset.dof_names, &a.shoulder_roll_joints)?,
            waist: joint_indices(&asset.dof_names, &a.waist_joints)?,
            upper_body: joint_indices(&asset.dof_names, &a.upper_body_joints)?,
        };

        let angles = |map: &std::collections::BTreeMap<String, f32>| -> Vec<f32> {
            asset
                .dof_names
                .iter()
                .map(|name| map.get(name).copied().unwrap_or(0.0))
                .collect()
        };

        log::info!(
            "Resolved robot: {} dofs, {} bodies, {} feet, {} termination bodies",
            dofs,
            asset.num_bodies(),
            bodies.feet.len(),
            bodies.termination_contacts.len()
        );

        Ok(Self {
            dof_names: asset.dof_names.clone(),
            num_bodies: asset.num_bodies(),
            bodies,
            joints,
            limits: DofLimits::new(asset, config.rewards.soft_dof_pos_limit),
            default_dof_pos: angles(&config.init_state.default_joint_angles),
            target_dof_pos: angles(&config.init_state.target_joint_angles),
            default_body_masses: asset.default_body_masses.clone(),
        })
    }

    pub fn num_dofs(&self) -> usize {
        self.dof_names.len()
    }
}

fn matching(names: &[String], pattern: &str, exclude: &[&str]) -> Vec<usize> {
    names
        .iter()
        .enumerate()
        .filter(|(_, name)| name.contains(pattern) && !exclude.iter().any(|x| name.contains(x)))
        .map(|(i, _)| i)
        .collect()
}

fn matching_any(names: &[String], patterns: &[String], exclude: &[&str]) -> Vec<usize> {
    patterns
        .iter()
        .flat_map(|p| matching(names, p, exclude))
        .collect()
}

fn required(names: &[String], pattern: &str, exclude: &[&str]) -> Result<Vec<usize>> {
    let found = matching(names, pattern, exclude);
    if found.is_empty() {
        return Err(EnvError::MissingBody(pattern.to_string()));
    }
    Ok(found)
}

fn joint_indices(dof_names: &[String], joints: &[String]) -> Result<Vec<usize>> {
    joints
        .iter()
        .map(|joint| {
            dof_names
                .iter()
                .position(|n| n == joint)
                .ok_or_else(|| EnvError::MissingJoint(joint.clone()))
        })
        .collect()
}
