//! Domain randomization.
//!
//! Actuator channels (gain factors, motor strength, torque offset, action
//! delay) are resampled for each instance on reset. Body channels (payload,
//! centre-of-mass shift, link masses, friction, restitution) are drawn once at
//! spawn and baked into the physics backend.

use nalgebra as na;
use rand::Rng;

use crate::config::{DomainRandSection, Range};
use crate::error::{EnvError, Result};

/// Inclusive uniform interval, validated on construction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UniformRange {
    pub low: f32,
    pub high: f32,
}

impl UniformRange {
    pub fn new(channel: &'static str, range: Range) -> Result<Self> {
        let [low, high] = range;
        if !(low.is_finite() && high.is_finite() && low <= high) {
            return Err(EnvError::InvalidRange { channel, low, high });
        }
        Ok(Self { low, high })
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f32 {
        if self.low == self.high {
            return self.low;
        }
        rng.random_range(self.low..=self.high)
    }
}

/// Builds the range only when its channel is switched on.
fn channel(enabled: bool, name: &'static str, range: Range) -> Result<Option<UniformRange>> {
    enabled.then(|| UniformRange::new(name, range)).transpose()
}

/// Spawn-time body properties of one instance.
///
/// The mass of body `b` is `default_mass[b] * link_mass_scale[b]`, plus
/// `payload_mass` on the base body. `None` leaves the asset's own value.
#[derive(Clone, Debug, PartialEq)]
pub struct BodyProperties {
    pub payload_mass: f32,
    /// Base centre-of-mass shift [m].
    pub com_displacement: na::Vector3<f32>,
    pub link_mass_scale: Vec<f32>,
    pub friction: Option<f32>,
    pub restitution: Option<f32>,
}

impl BodyProperties {
    pub fn nominal(num_bodies: usize) -> Self {
        Self {
            payload_mass: 0.0,
            com_displacement: na::Vector3::zeros(),
            link_mass_scale: vec![1.0; num_bodies],
            friction: None,
            restitution: None,
        }
    }

    pub fn body_mass(&self, body: usize, default_masses: &[f32], base_bodies: &[usize]) -> f32 {
        let scaled = default_masses[body] * self.link_mass_scale[body];
        if base_bodies.contains(&body) {
            scaled + self.payload_mass
        } else {
            scaled
        }
    }
}

/// Per-instance actuator parameters, N x dofs except `delay_idx`.
#[derive(Clone, Debug)]
pub struct ActuatorRandomization {
    pub kp_factors: na::DMatrix<f32>,
    pub kd_factors: na::DMatrix<f32>,
    pub motor_strength: na::DMatrix<f32>,
    /// Absolute torque offset [N*m].
    pub actuation_offset: na::DMatrix<f32>,
    /// Row of the delay buffer each instance reads.
    pub delay_idx: Vec<usize>,
}

impl ActuatorRandomization {
    pub fn nominal(num_envs: usize, num_dofs: usize) -> Self {
        Self {
            kp_factors: na::DMatrix::from_element(num_envs, num_dofs, 1.0),
            kd_factors: na::DMatrix::from_element(num_envs, num_dofs, 1.0),
            motor_strength: na::DMatrix::from_element(num_envs, num_dofs, 1.0),
            actuation_offset: na::DMatrix::zeros(num_envs, num_dofs),
            delay_idx: vec![0; num_envs],
        }
    }
}

#[derive(Clone, Debug)]
pub struct DomainRandomizer {
    kp: Option<UniformRange>,
    kd: Option<UniformRange>,
    motor_strength: Option<UniformRange>,
    actuation_offset: Option<UniformRange>,
    payload_mass: Option<UniformRange>,
    com_displacement: Option<UniformRange>,
    link_mass: Option<UniformRange>,
    friction: Option<UniformRange>,
    restitution: Option<UniformRange>,
    initial_scale: Option<UniformRange>,
    initial_offset: Option<UniformRange>,
    random_pose: bool,
    max_delay: Option<usize>,
    max_push_vel_xy: f32,
}

impl DomainRandomizer {
    pub fn new(cfg: &DomainRandSection) -> Result<Self> {
        Ok(Self {
            kp: channel(cfg.randomize_kp, "kp", cfg.kp_range)?,
            kd: channel(cfg.randomize_kd, "kd", cfg.kd_range)?,
            motor_strength: channel(cfg.randomize_motor_strength, "motor_strength", cfg.motor_strength_range)?,
            actuation_offset: channel(
                cfg.randomize_actuation_offset,
                "actuation_offset",
                cfg.actuation_offset_range,
            )?,
            payload_mass: channel(cfg.randomize_payload_mass, "payload_mass", cfg.payload_mass_range)?,
            com_displacement: channel(
                cfg.randomize_com_displacement,
                "com_displacement",
                cfg.com_displacement_range,
            )?,
            link_mass: channel(cfg.randomize_link_mass, "link_mass", cfg.link_mass_range)?,
            friction: channel(cfg.randomize_friction, "friction", cfg.friction_range)?,
            restitution: channel(cfg.randomize_restitution, "restitution", cfg.restitution_range)?,
            initial_scale: channel(
                cfg.randomize_initial_joint_pos,
                "initial_joint_pos_scale",
                cfg.initial_joint_pos_scale,
            )?,
            initial_offset: channel(
                cfg.randomize_initial_joint_pos,
                "initial_joint_pos_offset",
                cfg.initial_joint_pos_offset,
            )?,
            random_pose: cfg.random_pose,
            max_delay: cfg.delay.then_some(cfg.max_delay_timesteps),
            max_push_vel_xy: cfg.max_push_vel_xy,
        })
    }

    /// Draw spawn-time body properties for one instance.
    pub fn sample_body<R: Rng + ?Sized>(&self, num_bodies: usize, rng: &mut R) -> BodyProperties {
        let mut props = BodyProperties::nominal(num_bodies);
        if let Some(range) = &self.payload_mass {
            props.payload_mass = range.sample(rng);
        }
        if let Some(range) = &self.com_displacement {
            // Wider shift in the horizontal plane than vertically.
            props.com_displacement = na::Vector3::new(
                range.sample(rng) * 4.0,
                range.sample(rng) * 4.0,
                range.sample(rng) * 2.0,
            );
        }
        if let Some(range) = &self.link_mass {
            for scale in props.link_mass_scale.iter_mut() {
                *scale = range.sample(rng);
            }
        }
        props.friction = self.friction.map(|r| r.sample(rng));
        props.restitution = self.restitution.map(|r| r.sample(rng));
        props
    }

    /// Resample every enabled actuator channel for the listed instances.
    pub fn resample_actuators<R: Rng + ?Sized>(
        &self,
        act: &mut ActuatorRandomization,
        ids: &[usize],
        torque_limits: &[f32],
        rng: &mut R,
    ) {
        let dofs = act.kp_factors.ncols();
        for &env in ids {
            for j in 0..dofs {
                if let Some(r) = &self.kp {
                    act.kp_factors[(env, j)] = r.sample(rng);
                }
                if let Some(r) = &self.kd {
                    act.kd_factors[(env, j)] = r.sample(rng);
                }
                if let Some(r) = &self.actuation_offset {
                    act.actuation_offset[(env, j)] = r.sample(rng) * torque_limits[j];
                }
                if let Some(r) = &self.motor_strength {
                    act.motor_strength[(env, j)] = r.sample(rng);
                }
            }
            if let Some(max_delay) = self.max_delay {
                act.delay_idx[env] = rng.random_range(0..max_delay);
            }
        }
    }

    /// Initial joint pose for one instance, clipped to `[lower, upper]`.
    pub fn initial_dof_pos<R: Rng + ?Sized>(
        &self,
        default_pos: &[f32],
        lower: &[f32],
        upper: &[f32],
        rng: &mut R,
    ) -> Vec<f32> {
        default_pos
            .iter()
            .enumerate()
            .map(|(j, &default)| {
                let pos = match (&self.initial_scale, &self.initial_offset) {
                    (Some(scale), Some(offset)) => default * scale.sample(rng) + offset.sample(rng),
                    _ => {
                        let mut pos = default * rng.random_range(0.5..=1.5);
                        if self.random_pose {
                            pos += rng.random_range(-1.0..=1.0);
                        }
                        pos
                    }
                };
                pos.clamp(lower[j], upper[j])
            })
            .collect()
    }

    /// Random horizontal root velocity for a push.
    pub fn push_velocity<R: Rng + ?Sized>(&self, rng: &mut R) -> (f32, f32) {
        let v = self.max_push_vel_xy;
        if v <= 0.0 {
            return (0.0, 0.0);
        }
        (rng.random_range(-v..=v), rng.random_range(-v..=v))
    }

    pub fn delay_enabled(&self) -> bool {
        self.max_delay.is_some()
    }

    pub fn max_delay(&self) -> usize {
        self.max_delay.unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_uniform_range_validation() {
        assert!(UniformRange::new("kp", [0.8, 1.2]).is_ok());
        assert!(matches!(
            UniformRange::new("kp", [1.2, 0.8]),
            Err(EnvError::InvalidRange { channel: "kp", .. })
        ));
        assert!(UniformRange::new("kp", [f32::NAN, 1.0]).is_err());
    }

    #[test]
    fn test_degenerate_range_returns_bound() {
        let mut rng = StdRng::seed_from_u64(0);
        let range = UniformRange::new("friction", [0.4, 0.4]).unwrap();
        assert_eq!(range.sample(&mut rng), 0.4);
    }

    #[test]
    fn test_resample_touches_only_listed_instances() {
        let randomizer = DomainRandomizer::new(&DomainRandSection::default()).unwrap();
        let mut act = ActuatorRandomization::nominal(4, 3);
        let mut rng = StdRng::seed_from_u64(1);
        randomizer.resample_actuators(&mut act, &[1, 3], &[10.0, 10.0, 10.0], &mut rng);

        for j in 0..3 {
            assert_eq!(act.kp_factors[(0, j)], 1.0);
            assert_eq!(act.actuation_offset[(2, j)], 0.0);
            let kp = act.kp_factors[(1, j)];
            assert!((0.85..=1.15).contains(&kp));
            let offset = act.actuation_offset[(3, j)];
            assert!(offset.abs() <= 0.5 + 1e-6);
        }
        assert!(act.delay_idx.iter().all(|&d| d < 5));
    }

    #[test]
    fn test_disabled_channels_stay_nominal() {
        let mut cfg = DomainRandSection::default();
        cfg.randomize_kp = false;
        cfg.randomize_motor_strength = false;
        cfg.delay = false;
        let randomizer = DomainRandomizer::new(&cfg).unwrap();
        let mut act = ActuatorRandomization::nominal(2, 2);
        act.delay_idx[0] = 3;
        let mut rng = StdRng::seed_from_u64(2);
        randomizer.resample_actuators(&mut act, &[0, 1], &[1.0, 1.0], &mut rng);
        assert!(act.kp_factors.iter().all(|&v| v == 1.0));
        assert!(act.motor_strength.iter().all(|&v| v == 1.0));
        assert_eq!(act.delay_idx[0], 3);
        assert!(!randomizer.delay_enabled());
    }

    #[test]
    fn test_body_sample_ranges() {
        let randomizer = DomainRandomizer::new(&DomainRandSection::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let props = randomizer.sample_body(5, &mut rng);
            assert!((-2.0..=5.0).contains(&props.payload_mass));
            assert!(props.com_displacement.x.abs() <= 0.12 + 1e-6);
            assert!(props.com_displacement.z.abs() <= 0.06 + 1e-6);
            assert!(props.link_mass_scale.iter().all(|s| (0.8..=1.2).contains(s)));
            assert!(props.friction.is_some_and(|f| (0.1..=1.0).contains(&f)));
        }
    }

    #[test]
    fn test_body_mass_adds_payload_to_base_only() {
        let mut props = BodyProperties::nominal(2);
        props.payload_mass = 3.0;
        props.link_mass_scale = vec![1.1, 0.9];
        let masses = [10.0, 2.0];
        assert!((props.body_mass(0, &masses, &[0]) - 14.0).abs() < 1e-5);
        assert!((props.body_mass(1, &masses, &[0]) - 1.8).abs() < 1e-5);
    }

    #[test]
    fn test_initial_pose_within_limits() {
        let randomizer = DomainRandomizer::new(&DomainRandSection::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let default = [0.0, 1.4, -1.4];
        let lower = [-1.35; 3];
        let upper = [1.35; 3];
        for _ in 0..100 {
            let pose = randomizer.initial_dof_pos(&default, &lower, &upper, &mut rng);
            assert!(pose.iter().all(|p| (-1.35..=1.35).contains(p)));
            assert!(pose[0].abs() <= 0.1 + 1e-6);
        }
    }
}
