// Placeholder line geometry.
//
// These loops are NOT shape data. They only give a line something to draw when the
// feed has no shape for it (or when the feed is unavailable altogether).

use std::f64::consts::TAU;

use crate::config::GeoPoint;

const LOOP_POINTS: usize = 20;
const DEFAULT_ROUTE_NUMBER: u32 = 50;

/// An ellipse of `[lon, lat]` points around `center`, sized by the route number so
/// neighbouring lines do not overlap.
pub fn placeholder_loop(center: GeoPoint, route_number: u32) -> Vec<[f64; 2]> {
    let radius = 0.01 + f64::from(route_number % 5) * 0.002;
    (0..LOOP_POINTS)
        .map(|i| {
            let angle = (i as f64 / LOOP_POINTS as f64) * TAU;
            let latitude = center.latitude + radius * 1.5 * angle.sin();
            let longitude = center.longitude + radius * angle.cos();
            [longitude, latitude]
        })
        .collect()
}

/// Numeric suffix after the last `.` of a route id (`"GVB:50.52"` gives 52).
pub fn route_number(route_id: &str) -> u32 {
    route_id
        .rsplit_once('.')
        .and_then(|(_, suffix)| suffix.trim().parse().ok())
        .unwrap_or(DEFAULT_ROUTE_NUMBER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AMSTERDAM_CENTER;

    #[test]
    fn route_number_reads_last_dot_suffix() {
        assert_eq!(route_number("GVB:50.52"), 52);
        assert_eq!(route_number("1.2.53"), 53);
        assert_eq!(route_number("54"), 50);
        assert_eq!(route_number("M.x"), 50);
    }

    #[test]
    fn loop_surrounds_center() {
        let points = placeholder_loop(AMSTERDAM_CENTER, 52);
        assert_eq!(points.len(), 20);
        let radius = 0.014;
        let [lon0, lat0] = points[0];
        assert!((lon0 - (AMSTERDAM_CENTER.longitude + radius)).abs() < 1e-9);
        assert!((lat0 - AMSTERDAM_CENTER.latitude).abs() < 1e-9);
        for [lon, lat] in points {
            assert!((lon - AMSTERDAM_CENTER.longitude).abs() <= radius + 1e-9);
            assert!((lat - AMSTERDAM_CENTER.latitude).abs() <= radius * 1.5 + 1e-9);
        }
    }

    #[test]
    fn different_lines_get_different_sizes() {
        assert_ne!(
            placeholder_loop(AMSTERDAM_CENTER, 50),
            placeholder_loop(AMSTERDAM_CENTER, 51)
        );
    }
}
