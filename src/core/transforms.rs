//! Geographic and statistical helpers shared by the processors.
//!
//! Coordinates are WGS84 decimal degrees. Distances are great-circle
//! distances on a spherical Earth, not road-network distances.

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters between two (lat, lon) points.
///
/// # Example
///
/// ```
/// use circuit_pipeline::core::transforms::haversine;
///
/// let d = haversine(48.8566, 2.3522, 48.8566, 2.3522);
/// assert_eq!(d, 0.0);
/// ```
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Axis-aligned extent of a set of points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl BoundingBox {
    /// Bounding box of `(lat, lon)` pairs, `None` when empty.
    pub fn from_points<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        points.into_iter().fold(None, |acc, (lat, lon)| {
            Some(match acc {
                None => BoundingBox {
                    lat_min: lat,
                    lat_max: lat,
                    lon_min: lon,
                    lon_max: lon,
                },
                Some(b) => BoundingBox {
                    lat_min: b.lat_min.min(lat),
                    lat_max: b.lat_max.max(lat),
                    lon_min: b.lon_min.min(lon),
                    lon_max: b.lon_max.max(lon),
                },
            })
        })
    }

    /// Haversine distance between the (min, min) and (max, max) corners.
    pub fn diagonal_m(&self) -> f64 {
        haversine(self.lat_min, self.lon_min, self.lat_max, self.lon_max)
    }
}

/// Arithmetic mean of `(lat, lon)` pairs, `None` when empty.
pub fn centroid<I>(points: I) -> Option<(f64, f64)>
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let (n, sum_lat, sum_lon) = points
        .into_iter()
        .fold((0usize, 0.0, 0.0), |(n, a, b), (lat, lon)| (n + 1, a + lat, b + lon));
    if n == 0 {
        None
    } else {
        Some((sum_lat / n as f64, sum_lon / n as f64))
    }
}

/// Quantile with linear interpolation between closest ranks.
///
/// `sorted` must be ascending. Position is `(n - 1) * q`, the same
/// convention as the usual dataframe and numpy defaults.
pub fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = (sorted.len() - 1) as f64 * q.clamp(0.0, 1.0);
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Median of unsorted values, `None` when empty.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    quantile(&sorted, 0.5)
}

/// Squared Euclidean distance in the (lat, lon) plane.
#[inline]
pub fn squared_distance(a: [f64; 2], b: [f64; 2]) -> f64 {
    let d0 = a[0] - b[0];
    let d1 = a[1] - b[1];
    d0 * d0 + d1 * d1
}
