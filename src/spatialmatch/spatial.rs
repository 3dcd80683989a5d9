use failure::Error;

use crate::spatialmatch::common::{SpatialmatchError, TileBounds, TilePoint};

pub(crate) const EARTH_CIRCUMFERENCE_MILES: f64 = 24901.0;
const MILES_PER_DEGREE: f64 = EARTH_CIRCUMFERENCE_MILES / 360.0;
const MERCATOR_MAX_LAT: f64 = 85.05112878;
const MAX_PROJECTION_ZOOM: u16 = 30;

fn tile_count(zoom: u16) -> Result<u32, Error> {
    if zoom > MAX_PROJECTION_ZOOM {
        return Err(SpatialmatchError::ProjectionFailure(format!(
            "zoom {} exceeds the projection maximum {}",
            zoom, MAX_PROJECTION_ZOOM
        ))
        .into());
    }
    Ok(1u32 << zoom)
}

fn fractional_xy(lon: f64, lat: f64, zoom: u16) -> Result<(f64, f64), Error> {
    if !lon.is_finite() || !lat.is_finite() || lat < -90.0 || lat > 90.0 {
        return Err(SpatialmatchError::ProjectionFailure(format!(
            "coordinate [{}, {}] is not projectable",
            lon, lat
        ))
        .into());
    }
    let tiles = f64::from(tile_count(zoom)?);
    let lon = lon.max(-180.0).min(180.0);
    let lat = lat.max(-MERCATOR_MAX_LAT).min(MERCATOR_MAX_LAT);
    let lat_rad = lat.to_radians();
    let x = (lon + 180.0) / 360.0 * tiles;
    let y = (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI) / 2.0 * tiles;
    Ok((x, y))
}

/// Project a `[lon, lat]` proximity point to whole tile coordinates at the
/// given zoom.
pub fn proximity_center(proximity: [f64; 2], zoom: u16) -> Result<TilePoint, Error> {
    let (x, y) = fractional_xy(proximity[0], proximity[1], zoom)?;
    let max = tile_count(zoom)? - 1;
    Ok(TilePoint {
        z: zoom,
        x: (x.floor().max(0.0) as u32).min(max),
        y: (y.floor().max(0.0) as u32).min(max),
    })
}

/// The tile ranges a `[w, s, e, n]` bbox covers at the given zoom. Bboxes
/// that cross the antimeridian split into two ranges.
pub fn inside_tile(bbox: [f64; 4], zoom: u16) -> Result<Vec<TileBounds>, Error> {
    let [w, s, e, n] = bbox;
    if !(w.is_finite() && s.is_finite() && e.is_finite() && n.is_finite()) || s > n {
        return Err(SpatialmatchError::InvalidOptions("malformed bbox").into());
    }
    let spans: Vec<[f64; 4]> = if w > e {
        vec![[w, s, 180.0, n], [-180.0, s, e, n]]
    } else {
        vec![[w, s, e, n]]
    };

    let max = tile_count(zoom)? - 1;
    let mut bounds = Vec::with_capacity(spans.len());
    for span in spans {
        let (minx, maxy) = fractional_xy(span[0], span[1], zoom)?;
        let (maxx, miny) = fractional_xy(span[2], span[3], zoom)?;
        bounds.push(TileBounds {
            z: zoom,
            minx: (minx.floor().max(0.0) as u32).min(max),
            miny: (miny.floor().max(0.0) as u32).min(max),
            maxx: (maxx.floor().max(0.0) as u32).min(max),
            maxy: (maxy.floor().max(0.0) as u32).min(max),
        });
    }
    Ok(bounds)
}

pub fn bbox_intersection(a: [f64; 4], b: [f64; 4]) -> Option<[f64; 4]> {
    let w = a[0].max(b[0]);
    let s = a[1].max(b[1]);
    let e = a[2].min(b[2]);
    let n = a[3].min(b[3]);
    if w > e || s > n {
        None
    } else {
        Some([w, s, e, n])
    }
}

/// A flat-approximation buffer of `radius_miles` around a proximity point.
/// The longitude span widens with latitude; the shrink factor is floored so
/// the box stays bounded near the poles.
pub fn partial_number_bbox(proximity: [f64; 2], radius_miles: f64) -> [f64; 4] {
    let [lon, lat] = proximity;
    let dlat = radius_miles / MILES_PER_DEGREE;
    let dlon = radius_miles / (MILES_PER_DEGREE * lat.to_radians().cos().max(0.01));
    [
        (lon - dlon).max(-180.0),
        (lat - dlat).max(-90.0),
        (lon + dlon).min(180.0),
        (lat + dlat).min(90.0),
    ]
}

/// Decode a 3-bit log-scale score code against an index's scorefactor.
pub fn decode_3bit_log_scale(code: f64, factor: f64) -> f64 {
    if code <= 0.0 || factor <= 0.0 {
        return 0.0;
    }
    factor.powf(code / 7.0).round()
}

/// Raw scoredists above the 3-bit ceiling are proximity-derived and decode
/// linearly; anything else is a plain score code.
pub fn decode_scoredist(scoredist: f64, factor: f64) -> f64 {
    if scoredist > 7.0 {
        (factor / 7.0) * scoredist
    } else {
        decode_3bit_log_scale(scoredist, factor)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn proximity_center_origin() {
        assert_eq!(proximity_center([0.0, 0.0], 1).unwrap(), TilePoint { z: 1, x: 1, y: 1 });
        assert_eq!(proximity_center([-180.0, 0.0], 1).unwrap(), TilePoint { z: 1, x: 0, y: 1 });
        assert_eq!(
            proximity_center([0.0, 45.0], 4).unwrap(),
            TilePoint { z: 4, x: 8, y: 5 },
            "northern hemisphere projects above the equator row"
        );
    }

    #[test]
    fn proximity_center_clamps_poles() {
        let north = proximity_center([0.0, 89.9], 4).unwrap();
        assert_eq!(north.y, 0);
        let south = proximity_center([0.0, -89.9], 4).unwrap();
        assert_eq!(south.y, 15);
    }

    #[test]
    fn proximity_center_rejects_nonsense() {
        assert!(proximity_center([f64::NAN, 0.0], 4).is_err());
        assert!(proximity_center([0.0, 91.0], 4).is_err());
    }

    #[test]
    fn inside_tile_world() {
        let bounds = inside_tile([-180.0, -85.0, 180.0, 85.0], 1).unwrap();
        assert_eq!(bounds, vec![TileBounds { z: 1, minx: 0, miny: 0, maxx: 1, maxy: 1 }]);
    }

    #[test]
    fn inside_tile_antimeridian() {
        let bounds = inside_tile([170.0, -10.0, -170.0, 10.0], 2).unwrap();
        assert_eq!(bounds.len(), 2, "a wrapping bbox splits at the antimeridian");
        assert_eq!(bounds[0].minx, 3);
        assert_eq!(bounds[1].minx, 0);
    }

    #[test]
    fn inside_tile_rejects_inverted() {
        assert!(inside_tile([0.0, 10.0, 1.0, -10.0], 2).is_err());
    }

    #[test]
    fn bbox_intersection_cases() {
        assert_eq!(
            bbox_intersection([-10.0, -10.0, 10.0, 10.0], [0.0, 0.0, 20.0, 20.0]),
            Some([0.0, 0.0, 10.0, 10.0])
        );
        assert_eq!(bbox_intersection([-10.0, -10.0, -5.0, -5.0], [0.0, 0.0, 20.0, 20.0]), None);
    }

    #[test]
    fn partial_number_bbox_widens_with_latitude() {
        let equator = partial_number_bbox([0.0, 0.0], 10.0);
        let northern = partial_number_bbox([0.0, 60.0], 10.0);
        let equator_span = equator[2] - equator[0];
        let northern_span = northern[2] - northern[0];
        assert!(
            northern_span > equator_span * 1.9,
            "at 60N a mile covers about twice the longitude it does at the equator"
        );
        assert!((equator[3] - equator[1] - northern[3] + northern[1]).abs() < 1e-9);
    }

    #[test]
    fn decode_3bit_log_scale_monotonic() {
        let factor = 1000.0;
        let decoded: Vec<f64> =
            (0..=7).map(|code| decode_3bit_log_scale(f64::from(code), factor)).collect();
        for pair in decoded.windows(2) {
            assert!(pair[1] > pair[0], "higher codes decode to higher scores: {:?}", decoded);
        }
        assert_eq!(decoded[7], factor, "code 7 decodes to the full scorefactor");
        assert_eq!(decode_3bit_log_scale(0.0, factor), 0.0);
    }

    #[test]
    fn decode_scoredist_branches() {
        let factor = 700.0;
        assert_eq!(decode_scoredist(14.0, factor), 1400.0, "above 7 decodes linearly");
        assert_eq!(decode_scoredist(7.0, factor), 700.0, "at 7 decodes on the log scale");
    }
}
