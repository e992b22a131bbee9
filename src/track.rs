//! Track model: point-to-point stages built from straight and cubic-Bézier
//! segments, with checkpoints, optional containment walls and obstacles.
//!
//! Tracks are immutable once built. The engine consumes them through the
//! sampled centerline (off-track tests), the segment endpoints (surface
//! lookup) and the checkpoint list (progress). Generation sits behind the
//! [`TrackFactory`] trait; the built-in [`StageFactory`] is deterministic
//! in its seed.

use crate::physics::Vec2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Samples taken along each segment for the centerline approximation.
const SAMPLES_PER_SEGMENT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceKind {
    Asphalt,
    Wet,
    Gravel,
    Ice,
}

impl Default for SurfaceKind {
    fn default() -> Self {
        SurfaceKind::Asphalt
    }
}

/// A node on the track centerline: segment endpoint with local width and
/// surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrackNode {
    pub position: Vec2,
    pub width: f64,
    pub surface: SurfaceKind,
}

/// One stretch of track between two nodes, straight or cubic Bézier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub start: TrackNode,
    pub end: TrackNode,
    pub control1: Option<Vec2>,
    pub control2: Option<Vec2>,
}

impl Segment {
    pub fn straight(start: TrackNode, end: TrackNode) -> Self {
        Self {
            start,
            end,
            control1: None,
            control2: None,
        }
    }

    pub fn is_straight(&self) -> bool {
        self.control1.is_none() && self.control2.is_none()
    }

    /// Point on the segment at parameter `t` in `[0, 1]`.
    pub fn point_at(&self, t: f64) -> Vec2 {
        match (self.control1, self.control2) {
            (Some(c1), Some(c2)) => bezier_point(self.start.position, c1, c2, self.end.position, t),
            _ => {
                self.start.position + (self.end.position - self.start.position) * t
            }
        }
    }

    /// Arc length approximated by sampling.
    pub fn length(&self) -> f64 {
        if self.is_straight() {
            return self.start.position.distance_to(self.end.position);
        }
        let mut total = 0.0;
        let mut prev = self.start.position;
        for i in 1..=SAMPLES_PER_SEGMENT {
            let p = self.point_at(i as f64 / SAMPLES_PER_SEGMENT as f64);
            total += prev.distance_to(p);
            prev = p;
        }
        total
    }
}

/// Cubic Bézier interpolation.
pub fn bezier_point(p0: Vec2, p1: Vec2, p2: Vec2, p3: Vec2, t: f64) -> Vec2 {
    let mt = 1.0 - t;
    let mt2 = mt * mt;
    let t2 = t * t;
    p0 * (mt2 * mt) + p1 * (3.0 * mt2 * t) + p2 * (3.0 * mt * t2) + p3 * (t2 * t)
}

/// A gate cars must cross, in order. The last checkpoint is the finish.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Checkpoint {
    pub position: Vec2,
    /// Track tangent direction at the gate (radians). Crossings must move
    /// along this direction to count.
    pub angle: f64,
    pub width: f64,
    pub index: usize,
}

impl Checkpoint {
    /// Endpoints of the gate line, perpendicular to the tangent.
    pub fn line(&self) -> (Vec2, Vec2) {
        let half = self.width / 2.0;
        let perp = Vec2::new(-self.angle.sin(), self.angle.cos());
        (self.position + perp * half, self.position + perp * -half)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObstacleKind {
    Rock,
    Tree,
    Building,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Obstacle {
    pub position: Vec2,
    pub radius: f64,
    pub kind: ObstacleKind,
}

/// Two polylines bounding the raceable region; their segments are
/// collidable walls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Containment {
    pub left_points: Vec<Vec2>,
    pub right_points: Vec<Vec2>,
}

impl Containment {
    /// All wall segments from both polylines.
    pub fn wall_segments(&self) -> impl Iterator<Item = (Vec2, Vec2)> + '_ {
        self.left_points
            .windows(2)
            .chain(self.right_points.windows(2))
            .map(|w| (w[0], w[1]))
    }
}

/// Pre-sampled centerline point used for off-track and width lookups.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CenterlineSample {
    pub position: Vec2,
    pub half_width: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub segments: Vec<Segment>,
    pub checkpoints: Vec<Checkpoint>,
    pub start_position: Vec2,
    pub start_heading: f64,
    pub total_length: f64,
    pub containment: Option<Containment>,
    pub obstacles: Vec<Obstacle>,
    centerline: Vec<CenterlineSample>,
}

impl Track {
    pub fn new(
        segments: Vec<Segment>,
        checkpoints: Vec<Checkpoint>,
        start_position: Vec2,
        start_heading: f64,
        containment: Option<Containment>,
        obstacles: Vec<Obstacle>,
    ) -> Self {
        let total_length = segments.iter().map(Segment::length).sum();
        let centerline = sample_centerline(&segments);
        Self {
            segments,
            checkpoints,
            start_position,
            start_heading,
            total_length,
            containment,
            obstacles,
            centerline,
        }
    }

    pub fn centerline(&self) -> &[CenterlineSample] {
        &self.centerline
    }

    /// Surface at a position, looked up by nearest segment start point.
    pub fn surface_at(&self, position: Vec2) -> SurfaceKind {
        let mut best = SurfaceKind::Asphalt;
        let mut min_dist = f64::INFINITY;
        for segment in &self.segments {
            let dist = position.distance_to(segment.start.position);
            if dist < min_dist {
                min_dist = dist;
                best = segment.start.surface;
            }
        }
        best
    }

    /// On-track test against the sampled centerline: within half the local
    /// width of the nearest sample. A heuristic, not exact curve distance.
    pub fn is_on_track(&self, position: Vec2) -> bool {
        self.centerline.iter().any(|sample| {
            position.distance_to(sample.position) <= sample.half_width
        })
    }
}

fn sample_centerline(segments: &[Segment]) -> Vec<CenterlineSample> {
    let mut samples = Vec::with_capacity(segments.len() * SAMPLES_PER_SEGMENT + 1);
    for segment in segments {
        for i in 0..SAMPLES_PER_SEGMENT {
            let t = i as f64 / SAMPLES_PER_SEGMENT as f64;
            let width = segment.start.width + (segment.end.width - segment.start.width) * t;
            samples.push(CenterlineSample {
                position: segment.point_at(t),
                half_width: width / 2.0,
            });
        }
    }
    if let Some(last) = segments.last() {
        samples.push(CenterlineSample {
            position: last.end.position,
            half_width: last.end.width / 2.0,
        });
    }
    samples
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn parse(s: &str) -> Difficulty {
        match s.to_ascii_lowercase().as_str() {
            "easy" => Difficulty::Easy,
            "hard" => Difficulty::Hard,
            _ => Difficulty::Medium,
        }
    }

    fn segment_count(self) -> usize {
        match self {
            Difficulty::Easy => 5,
            Difficulty::Medium => 8,
            Difficulty::Hard => 12,
        }
    }

    fn max_bend(self) -> f64 {
        match self {
            Difficulty::Easy => 0.25,
            Difficulty::Medium => 0.45,
            Difficulty::Hard => 0.7,
        }
    }
}

/// Source of tracks for new sessions. Deterministic in the seed.
pub trait TrackFactory: Send + Sync {
    fn build(&self, difficulty: Difficulty, seed: Option<u64>) -> Track;
}

/// Built-in point-to-point stage generator.
pub struct StageFactory {
    pub base_width: f64,
    pub step_length: f64,
    pub containment_offset: f64,
}

impl Default for StageFactory {
    fn default() -> Self {
        Self {
            base_width: 160.0,
            step_length: 300.0,
            containment_offset: 60.0,
        }
    }
}

impl StageFactory {
    fn choose_surface(&self, rng: &mut StdRng) -> SurfaceKind {
        // Weighted toward asphalt: 0.5 / 0.2 / 0.2 / 0.1.
        let roll: f64 = rng.random();
        if roll < 0.5 {
            SurfaceKind::Asphalt
        } else if roll < 0.7 {
            SurfaceKind::Wet
        } else if roll < 0.9 {
            SurfaceKind::Gravel
        } else {
            SurfaceKind::Ice
        }
    }
}

impl TrackFactory for StageFactory {
    fn build(&self, difficulty: Difficulty, seed: Option<u64>) -> Track {
        let seed = seed.unwrap_or_else(|| rand::rng().random());
        let mut rng = StdRng::seed_from_u64(seed);

        let count = difficulty.segment_count();
        let max_bend = difficulty.max_bend();

        // Meandering chain of nodes starting at the origin heading +x.
        let mut nodes = Vec::with_capacity(count + 1);
        let mut heading = 0.0f64;
        let mut position = Vec2::ZERO;
        for i in 0..=count {
            let width = self.base_width * rng.random_range(0.8..1.2);
            let surface = if i == 0 {
                SurfaceKind::Asphalt
            } else {
                self.choose_surface(&mut rng)
            };
            nodes.push(TrackNode {
                position,
                width,
                surface,
            });

            heading += rng.random_range(-max_bend..max_bend);
            let step = self.step_length * rng.random_range(0.8..1.3);
            position = position + Vec2::new(heading.cos(), heading.sin()) * step;
        }

        // Smooth segments: control points lean along the direction of the
        // neighbouring nodes, as for a Catmull-Rom-style fit.
        let mut segments = Vec::with_capacity(count);
        for i in 0..count {
            let start = nodes[i];
            let end = nodes[i + 1];
            let chord = start.position.distance_to(end.position);

            let prev = if i > 0 { nodes[i - 1] } else { start };
            let next = if i + 2 <= count { nodes[i + 2] } else { end };

            let dir1 = (end.position - prev.position).normalize();
            let dir2 = (start.position - next.position).normalize();

            segments.push(Segment {
                start,
                end,
                control1: Some(start.position + dir1 * (0.3 * chord)),
                control2: Some(end.position + dir2 * (0.3 * chord)),
            });
        }

        // One checkpoint per segment midpoint plus the finish at the end.
        let mut checkpoints = Vec::with_capacity(count + 1);
        for (i, segment) in segments.iter().enumerate() {
            let p1 = segment.point_at(0.49);
            let p2 = segment.point_at(0.51);
            let tangent = (p2 - p1).normalize();
            checkpoints.push(Checkpoint {
                position: segment.point_at(0.5),
                angle: tangent.y.atan2(tangent.x),
                width: segment.start.width,
                index: i,
            });
        }
        let last = segments.last().expect("stage has at least one segment");
        let finish_tangent = (last.point_at(1.0) - last.point_at(0.98)).normalize();
        checkpoints.push(Checkpoint {
            position: last.end.position,
            angle: finish_tangent.y.atan2(finish_tangent.x),
            width: last.end.width,
            index: count,
        });

        // Containment walls: offset polylines either side of the centerline.
        let samples = sample_centerline(&segments);
        let mut left_points = Vec::with_capacity(samples.len());
        let mut right_points = Vec::with_capacity(samples.len());
        for window in samples.windows(2) {
            let dir = (window[1].position - window[0].position).normalize();
            let normal = Vec2::new(-dir.y, dir.x);
            let offset = window[0].half_width + self.containment_offset;
            left_points.push(window[0].position + normal * offset);
            right_points.push(window[0].position + normal * -offset);
        }

        // A few obstacles in the run-off between track edge and wall,
        // offset along the local track normal.
        let mut obstacles = Vec::new();
        for _ in 0..count {
            let idx = rng.random_range(0..samples.len() - 1);
            let sample = samples[idx];
            let dir = (samples[idx + 1].position - sample.position).normalize();
            let normal = Vec2::new(-dir.y, dir.x);
            let side = if rng.random::<bool>() { 1.0 } else { -1.0 };
            let lateral = rng.random_range(
                sample.half_width + 15.0..sample.half_width + self.containment_offset - 5.0,
            );
            obstacles.push(Obstacle {
                position: sample.position + normal * (side * lateral),
                radius: rng.random_range(5.0..20.0),
                kind: match rng.random_range(0..3) {
                    0 => ObstacleKind::Rock,
                    1 => ObstacleKind::Tree,
                    _ => ObstacleKind::Building,
                },
            });
        }

        let start = segments[0].start.position;
        let start_dir = (segments[0].point_at(0.02) - start).normalize();
        let start_heading = start_dir.y.atan2(start_dir.x);

        Track::new(
            segments,
            checkpoints,
            start,
            start_heading,
            Some(Containment {
                left_points,
                right_points,
            }),
            obstacles,
        )
    }
}

/// Hand-built single straight stage, used by tests and demos.
pub fn straight_track(length: f64, width: f64, checkpoint_xs: &[f64]) -> Track {
    let start = TrackNode {
        position: Vec2::ZERO,
        width,
        surface: SurfaceKind::Asphalt,
    };
    let end = TrackNode {
        position: Vec2::new(length, 0.0),
        width,
        surface: SurfaceKind::Asphalt,
    };
    let segment = Segment::straight(start, end);

    let checkpoints = checkpoint_xs
        .iter()
        .enumerate()
        .map(|(index, &x)| Checkpoint {
            position: Vec2::new(x, 0.0),
            angle: 0.0,
            width: width * 0.6,
            index,
        })
        .collect();

    Track::new(vec![segment], checkpoints, Vec2::ZERO, 0.0, None, vec![])
}
