use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const DOT_RADIUS: f64 = 20.0;

/// Synthetic test patterns served by the simulated image PVs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    #[default]
    Noise,
    Gradient,
    Circles,
    MovingDot,
    SineWave,
}

impl FromStr for Pattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "noise" => Ok(Self::Noise),
            "gradient" => Ok(Self::Gradient),
            "circles" => Ok(Self::Circles),
            "moving_dot" => Ok(Self::MovingDot),
            "sine_wave" => Ok(Self::SineWave),
            _ => Err(format!("Unknown pattern {s}")),
        }
    }
}

impl Pattern {
    /// Render the pattern as a 16-bit (height, width) image for frame number `frame`
    pub fn generate<R: Rng>(
        &self,
        width: usize,
        height: usize,
        frame: u64,
        rng: &mut R,
    ) -> Array2<u16> {
        let t = frame as f64;
        match self {
            Self::Noise => Array2::from_shape_fn((height, width), |_| rng.gen::<u16>()),
            Self::Gradient => {
                let offset = 0.3 * (t * 0.1).sin();
                let denom = width.saturating_sub(1).max(1) as f64;
                Array2::from_shape_fn((height, width), |(_, x)| {
                    to_u16((x as f64 / denom + offset) / 1.3)
                })
            }
            Self::Circles => {
                let (cx, cy) = ((width / 2) as f64, (height / 2) as f64);
                let phase = t * 0.2;
                Array2::from_shape_fn((height, width), |(y, x)| {
                    let r = (x as f64 - cx).hypot(y as f64 - cy);
                    to_u16(((r / 20.0 - phase).sin() + 1.0) / 2.0)
                })
            }
            Self::MovingDot => {
                let angle = t * 0.1;
                let cx = (width / 2) as f64 + ((width / 4) as f64 * angle.cos()).trunc();
                let cy = (height / 2) as f64 + ((height / 4) as f64 * angle.sin()).trunc();
                Array2::from_shape_fn((height, width), |(y, x)| {
                    if (x as f64 - cx).hypot(y as f64 - cy) < DOT_RADIUS {
                        u16::MAX
                    } else {
                        0
                    }
                })
            }
            Self::SineWave => {
                let phase = t * 0.2;
                Array2::from_shape_fn((height, width), |(y, x)| {
                    let v = (x as f64 / 30.0 + phase).sin() * (y as f64 / 30.0 + phase * 0.7).sin();
                    to_u16((v + 1.0) / 2.0)
                })
            }
        }
    }
}

fn to_u16(unit: f64) -> u16 {
    (unit.clamp(0.0, 1.0) * u16::MAX as f64) as u16
}

/// A bright gaussian spot on a dark background, used as a position dependent test scene
pub fn gaussian_spot(width: usize, height: usize, cx: f64, cy: f64, sigma: f64) -> Array2<u16> {
    let sigma = sigma.max(f64::EPSILON);
    Array2::from_shape_fn((height, width), |(y, x)| {
        let r2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
        to_u16((-r2 / (2.0 * sigma * sigma)).exp())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_parse() {
        assert_eq!(Pattern::from_str("moving_dot"), Ok(Pattern::MovingDot));
        assert!(Pattern::from_str("stripes").is_err());
    }

    #[test]
    fn test_shapes_and_ranges() {
        let mut rng = StdRng::seed_from_u64(3);
        for pattern in [
            Pattern::Noise,
            Pattern::Gradient,
            Pattern::Circles,
            Pattern::MovingDot,
            Pattern::SineWave,
        ] {
            let img = pattern.generate(64, 32, 5, &mut rng);
            assert_eq!(img.dim(), (32, 64));
        }
        let gradient = Pattern::Gradient.generate(16, 4, 0, &mut rng);
        assert!(gradient[[0, 15]] > gradient[[0, 0]]);
    }

    #[test]
    fn test_moving_dot_has_dot() {
        let mut rng = StdRng::seed_from_u64(3);
        let img = Pattern::MovingDot.generate(128, 128, 0, &mut rng);
        // frame 0: centre at (96, 64)
        assert_eq!(img[[64, 96]], u16::MAX);
        assert_eq!(img[[0, 0]], 0);
    }

    #[test]
    fn test_gaussian_spot_peak() {
        let img = gaussian_spot(20, 10, 5.0, 4.0, 2.0);
        assert_eq!(img[[4, 5]], u16::MAX);
        assert!(img[[0, 19]] < 10);
    }
}
