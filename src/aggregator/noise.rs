//! Truncated Laplace noise for released aggregates

use rand::Rng;

/// Truncation bound for count and histogram noise, in multiples of the scale
pub const TAIL_SCALES: f64 = 5.0;

/// One draw from Laplace(0, scale) by inverse CDF
pub fn laplace<R: Rng + ?Sized>(rng: &mut R, scale: f64) -> f64 {
    let u: f64 = rng.gen_range(-0.5..0.5);
    -scale * u.signum() * (1.0 - 2.0 * u.abs()).ln()
}

/// Laplace draw clamped to `[-bound, bound]`
pub fn truncated_laplace<R: Rng + ?Sized>(rng: &mut R, scale: f64, bound: f64) -> f64 {
    let draw = laplace(rng, scale);
    if draw.is_nan() {
        return 0.0;
    }
    draw.clamp(-bound, bound)
}

/// Noise scale for a statistic with `sensitivity` under budget `epsilon`
pub fn scale(sensitivity: f64, epsilon: f64) -> f64 {
    sensitivity / epsilon
}
