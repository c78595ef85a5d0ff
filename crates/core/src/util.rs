//! Small numeric helpers shared across the selection engine.

/// Squared Euclidean distance between two points, avoiding the sqrt for
/// cutoff comparisons.
#[inline(always)]
pub fn distance_squared(p1: &[f64; 3], p2: &[f64; 3]) -> f64 {
    let dx = p1[0] - p2[0];
    let dy = p1[1] - p2[1];
    let dz = p1[2] - p2[2];
    dx * dx + dy * dy + dz * dz
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_squared() {
        let origin = [0.0, 0.0, 0.0];
        assert!((distance_squared(&origin, &[1.0, 0.0, 0.0]) - 1.0).abs() < 1e-12);
        assert!((distance_squared(&origin, &[1.0, 1.0, 1.0]) - 3.0).abs() < 1e-12);
    }
}
