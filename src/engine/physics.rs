// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! Minimal kinematic integrator

use serde::{Deserialize, Serialize};

use crate::model::PhysicsConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhysicsState {
    pub position: f64,
    pub velocity: f64,
}

/// Moves a position/velocity pair toward an optional target
pub struct PhysicsEngine;

impl PhysicsEngine {
    pub fn update(state: PhysicsState, config: &PhysicsConfig, dt: f64) -> PhysicsState {
        let PhysicsState { mut position, mut velocity } = state;
        let acceleration = config.acceleration.unwrap_or(0.0);

        if let Some(target) = config.target_position {
            if position < target {
                velocity += acceleration * dt;
            } else if position > target {
                velocity -= acceleration * dt;
            }
        }

        if let Some(max) = config.max_velocity.map(f64::abs) {
            velocity = velocity.clamp(-max, max);
        }

        position += velocity * dt;
        PhysicsState { position, velocity }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accelerates_toward_target_with_clamp() {
        let config = PhysicsConfig {
            acceleration: Some(2.0),
            max_velocity: Some(3.0),
            target_position: Some(100.0),
            ..Default::default()
        };

        let mut state = PhysicsState::default();
        state = PhysicsEngine::update(state, &config, 1.0);
        assert_eq!(state, PhysicsState { position: 2.0, velocity: 2.0 });

        state = PhysicsEngine::update(state, &config, 1.0);
        assert_eq!(state.velocity, 3.0);
        assert_eq!(state.position, 5.0);
    }

    #[test]
    fn test_decelerates_past_target() {
        let config = PhysicsConfig {
            acceleration: Some(1.0),
            target_position: Some(0.0),
            ..Default::default()
        };
        let state = PhysicsEngine::update(PhysicsState { position: 10.0, velocity: 0.0 }, &config, 0.5);
        assert_eq!(state.velocity, -0.5);
        assert_eq!(state.position, 9.75);
    }

    #[test]
    fn test_without_target_keeps_coasting() {
        let config = PhysicsConfig { max_velocity: Some(1.0), ..Default::default() };
        let state = PhysicsEngine::update(PhysicsState { position: 0.0, velocity: 4.0 }, &config, 1.0);
        assert_eq!(state, PhysicsState { position: 1.0, velocity: 1.0 });
    }
}
