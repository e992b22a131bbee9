//! Seven-ray vision service for bots.
//!
//! Each ray reports the nearest positive-distance hit among containment
//! wall segments, circular obstacles and the other cars, capped at the
//! configured range. Ray order: forward, 30° right, 60° right, 90° right,
//! 60° left, 30° left, 90° left.

use crate::physics::Vec2;
use crate::track::Track;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

pub const RAY_COUNT: usize = 7;

/// Ray directions relative to the car heading, radians. Negative is to the
/// right of the car.
pub const RAY_ANGLES: [f64; RAY_COUNT] = [
    0.0,
    -PI / 6.0,
    -PI / 3.0,
    -PI / 2.0,
    PI / 3.0,
    PI / 6.0,
    PI / 2.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitKind {
    Boundary,
    Obstacle,
    Car,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RaycastResult {
    /// Distance to the hit, or the max range when nothing was hit.
    pub distance: f64,
    pub hit_kind: Option<HitKind>,
    pub hit_position: Option<Vec2>,
}

impl RaycastResult {
    fn miss(max_range: f64) -> Self {
        Self {
            distance: max_range,
            hit_kind: None,
            hit_position: None,
        }
    }
}

/// A car as seen by the raycaster: identity plus position.
#[derive(Debug, Clone, Copy)]
pub struct RayTarget<'a> {
    pub id: &'a str,
    pub position: Vec2,
}

#[derive(Debug, Clone)]
pub struct RaycastSystem {
    max_range: f64,
    car_radius: f64,
}

impl RaycastSystem {
    pub fn new(max_range: f64, car_radius: f64) -> Self {
        Self {
            max_range,
            car_radius,
        }
    }

    /// Cast all seven rays from `origin` facing `heading`. The source car
    /// is excluded from `other_cars` by id before calling.
    pub fn cast_all_rays(
        &self,
        origin: Vec2,
        heading: f64,
        track: &Track,
        other_cars: &[RayTarget<'_>],
    ) -> [RaycastResult; RAY_COUNT] {
        RAY_ANGLES.map(|offset| {
            let angle = heading + offset;
            let direction = Vec2::new(angle.cos(), angle.sin());
            self.cast_ray(origin, direction, track, other_cars)
        })
    }

    fn cast_ray(
        &self,
        origin: Vec2,
        direction: Vec2,
        track: &Track,
        other_cars: &[RayTarget<'_>],
    ) -> RaycastResult {
        let mut closest = RaycastResult::miss(self.max_range);

        if let Some(containment) = &track.containment {
            for (p1, p2) in containment.wall_segments() {
                if let Some((point, distance)) = self.ray_segment(origin, direction, p1, p2) {
                    if distance < closest.distance {
                        closest = RaycastResult {
                            distance,
                            hit_kind: Some(HitKind::Boundary),
                            hit_position: Some(point),
                        };
                    }
                }
            }
        }

        for obstacle in &track.obstacles {
            if let Some((point, distance)) =
                self.ray_circle(origin, direction, obstacle.position, obstacle.radius)
            {
                if distance < closest.distance {
                    closest = RaycastResult {
                        distance,
                        hit_kind: Some(HitKind::Obstacle),
                        hit_position: Some(point),
                    };
                }
            }
        }

        for car in other_cars {
            if let Some((point, distance)) =
                self.ray_circle(origin, direction, car.position, self.car_radius)
            {
                if distance < closest.distance {
                    closest = RaycastResult {
                        distance,
                        hit_kind: Some(HitKind::Car),
                        hit_position: Some(point),
                    };
                }
            }
        }

        closest
    }

    /// Parametric ray-segment intersection; parallel rays are rejected.
    fn ray_segment(
        &self,
        origin: Vec2,
        direction: Vec2,
        p1: Vec2,
        p2: Vec2,
    ) -> Option<(Vec2, f64)> {
        let seg_dir = p2 - p1;
        let diff = p1 - origin;

        let cross_ray_seg = direction.x * seg_dir.y - direction.y * seg_dir.x;
        if cross_ray_seg.abs() < 1e-10 {
            return None;
        }

        let t = (diff.x * seg_dir.y - diff.y * seg_dir.x) / cross_ray_seg;
        let s = (diff.x * direction.y - diff.y * direction.x) / cross_ray_seg;

        if t >= 0.0 && (0.0..=1.0).contains(&s) && t <= self.max_range {
            Some((origin + direction * t, t))
        } else {
            None
        }
    }

    /// Ray-circle intersection via projection and half-chord length.
    fn ray_circle(
        &self,
        origin: Vec2,
        direction: Vec2,
        center: Vec2,
        radius: f64,
    ) -> Option<(Vec2, f64)> {
        let to_center = center - origin;
        let proj = to_center.dot(direction);
        if proj < 0.0 {
            return None;
        }

        let closest_point = origin + direction * proj;
        let dist_to_ray = (center - closest_point).magnitude();
        if dist_to_ray > radius {
            return None;
        }

        let half_chord = (radius * radius - dist_to_ray * dist_to_ray).sqrt();
        let hit_distance = proj - half_chord;
        if hit_distance < 0.0 || hit_distance > self.max_range {
            return None;
        }

        Some((origin + direction * hit_distance, hit_distance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{straight_track, Containment, Obstacle, ObstacleKind, Track};
    use proptest::prelude::*;

    fn system() -> RaycastSystem {
        RaycastSystem::new(200.0, 10.0)
    }

    fn empty_track() -> Track {
        straight_track(1000.0, 100.0, &[1000.0])
    }

    #[test]
    fn test_all_rays_miss_on_empty_track() {
        let results = system().cast_all_rays(Vec2::ZERO, 0.0, &empty_track(), &[]);
        for result in results {
            assert_eq!(result.distance, 200.0);
            assert!(result.hit_kind.is_none());
        }
    }

    #[test]
    fn test_forward_ray_hits_obstacle() {
        let mut track = empty_track();
        track.obstacles.push(Obstacle {
            position: Vec2::new(100.0, 0.0),
            radius: 10.0,
            kind: ObstacleKind::Rock,
        });

        let results = system().cast_all_rays(Vec2::ZERO, 0.0, &track, &[]);
        assert_eq!(results[0].hit_kind, Some(HitKind::Obstacle));
        assert!((results[0].distance - 90.0).abs() < 1e-6);
        // Perpendicular rays miss it.
        assert!(results[3].hit_kind.is_none());
        assert!(results[6].hit_kind.is_none());
    }

    #[test]
    fn test_ray_hits_other_car() {
        let track = empty_track();
        let cars = [RayTarget {
            id: "p2",
            position: Vec2::new(50.0, 0.0),
        }];

        let results = system().cast_all_rays(Vec2::ZERO, 0.0, &track, &cars);
        assert_eq!(results[0].hit_kind, Some(HitKind::Car));
        assert!((results[0].distance - 40.0).abs() < 1e-6);
    }

    #[test]
    fn test_ray_hits_boundary_wall() {
        let mut track = empty_track();
        track.containment = Some(Containment {
            left_points: vec![Vec2::new(-100.0, 80.0), Vec2::new(1000.0, 80.0)],
            right_points: vec![Vec2::new(-100.0, -80.0), Vec2::new(1000.0, -80.0)],
        });

        // 90° left ray (index 6) points at +y and should strike the left wall.
        let results = system().cast_all_rays(Vec2::ZERO, 0.0, &track, &[]);
        assert_eq!(results[6].hit_kind, Some(HitKind::Boundary));
        assert!((results[6].distance - 80.0).abs() < 1e-6);
    }

    #[test]
    fn test_nearest_hit_wins() {
        let mut track = empty_track();
        track.obstacles.push(Obstacle {
            position: Vec2::new(150.0, 0.0),
            radius: 10.0,
            kind: ObstacleKind::Tree,
        });
        let cars = [RayTarget {
            id: "p2",
            position: Vec2::new(60.0, 0.0),
        }];

        let results = system().cast_all_rays(Vec2::ZERO, 0.0, &track, &cars);
        assert_eq!(results[0].hit_kind, Some(HitKind::Car));
    }

    #[test]
    fn test_object_behind_ray_is_ignored() {
        let mut track = empty_track();
        track.obstacles.push(Obstacle {
            position: Vec2::new(-50.0, 0.0),
            radius: 10.0,
            kind: ObstacleKind::Rock,
        });

        let results = system().cast_all_rays(Vec2::ZERO, 0.0, &track, &[]);
        assert!(results[0].hit_kind.is_none());
    }

    #[test]
    fn test_parallel_ray_rejected() {
        let sys = system();
        // Segment parallel to the ray direction.
        let hit = sys.ray_segment(
            Vec2::ZERO,
            Vec2::new(1.0, 0.0),
            Vec2::new(10.0, 5.0),
            Vec2::new(100.0, 5.0),
        );
        assert!(hit.is_none());
    }

    #[test]
    fn test_out_of_range_hit_is_miss() {
        let mut track = empty_track();
        track.obstacles.push(Obstacle {
            position: Vec2::new(500.0, 0.0),
            radius: 10.0,
            kind: ObstacleKind::Rock,
        });

        let results = system().cast_all_rays(Vec2::ZERO, 0.0, &track, &[]);
        assert!(results[0].hit_kind.is_none());
        assert_eq!(results[0].distance, 200.0);
    }

    proptest! {
        #[test]
        fn prop_distance_never_exceeds_range(
            ox in -500.0f64..500.0,
            oy in -500.0f64..500.0,
            heading in -3.14f64..3.14,
            cx in -500.0f64..500.0,
            cy in -500.0f64..500.0,
        ) {
            let mut track = empty_track();
            track.obstacles.push(Obstacle {
                position: Vec2::new(cx, cy),
                radius: 15.0,
                kind: ObstacleKind::Rock,
            });
            let results = system().cast_all_rays(Vec2::new(ox, oy), heading, &track, &[]);
            for r in results {
                prop_assert!(r.distance >= 0.0);
                prop_assert!(r.distance <= 200.0 + 1e-9);
            }
        }
    }
}
