use crate::error::ValidationError;
use crate::types::{Bounds, Point, Polygon, Team};

const EPSILON: f64 = 1e-9;

pub fn validate_polygon(polygon: &Polygon) -> Result<(), ValidationError> {
    let points = polygon.points();
    if points.len() < 3 {
        return Err(ValidationError::TooFewPoints(points.len()));
    }
    for (index, point) in points.iter().enumerate() {
        let valid = point.lat.is_finite()
            && point.lng.is_finite()
            && (-90.0..=90.0).contains(&point.lat)
            && (-180.0..=180.0).contains(&point.lng);
        if !valid {
            return Err(ValidationError::InvalidCoordinate { index });
        }
    }
    Ok(())
}

pub fn bounds_of(polygon: &Polygon) -> Bounds {
    let mut bounds = Bounds {
        south: f64::INFINITY,
        west: f64::INFINITY,
        north: f64::NEG_INFINITY,
        east: f64::NEG_INFINITY,
    };
    for point in polygon.points() {
        bounds.south = bounds.south.min(point.lat);
        bounds.north = bounds.north.max(point.lat);
        bounds.west = bounds.west.min(point.lng);
        bounds.east = bounds.east.max(point.lng);
    }
    bounds
}

/// Ray casting with the boundary counted as inside, so a zone may share an
/// edge with its sector.
pub fn contains_point(polygon: &Polygon, point: Point) -> bool {
    let points = polygon.points();
    if points.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = points.len() - 1;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[j];
        if on_segment(a, b, point) {
            return true;
        }
        if (a.lat > point.lat) != (b.lat > point.lat) {
            let crossing = (b.lng - a.lng) * (point.lat - a.lat) / (b.lat - a.lat) + a.lng;
            if point.lng < crossing {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Rejects `zone` unless every vertex is inside `sector` and no zone edge
/// properly crosses a sector edge (needed for concave sectors).
pub fn ensure_within(zone: &Polygon, sector: &Polygon, team: Team) -> Result<(), ValidationError> {
    for (index, point) in zone.points().iter().enumerate() {
        if !contains_point(sector, *point) {
            return Err(ValidationError::ZoneOutsideSector { team, index });
        }
    }

    for (index, (a, b)) in edges(zone).enumerate() {
        if edges(sector).any(|(c, d)| segments_cross(a, b, c, d)) {
            return Err(ValidationError::ZoneCrossesSector { team, index });
        }
    }
    Ok(())
}

fn edges(polygon: &Polygon) -> impl Iterator<Item = (Point, Point)> + '_ {
    let points = polygon.points();
    (0..points.len()).map(move |i| (points[i], points[(i + 1) % points.len()]))
}

fn cross(o: Point, a: Point, b: Point) -> f64 {
    (a.lng - o.lng) * (b.lat - o.lat) - (a.lat - o.lat) * (b.lng - o.lng)
}

fn on_segment(a: Point, b: Point, p: Point) -> bool {
    if cross(a, b, p).abs() > EPSILON {
        return false;
    }
    p.lat >= a.lat.min(b.lat) - EPSILON
        && p.lat <= a.lat.max(b.lat) + EPSILON
        && p.lng >= a.lng.min(b.lng) - EPSILON
        && p.lng <= a.lng.max(b.lng) + EPSILON
}

/// Strict crossing only; touching endpoints or collinear overlap do not count.
fn segments_cross(a: Point, b: Point, c: Point, d: Point) -> bool {
    let d1 = cross(c, d, a);
    let d2 = cross(c, d, b);
    let d3 = cross(a, b, c);
    let d4 = cross(a, b, d);
    ((d1 > EPSILON && d2 < -EPSILON) || (d1 < -EPSILON && d2 > EPSILON))
        && ((d3 > EPSILON && d4 < -EPSILON) || (d3 < -EPSILON && d4 > EPSILON))
}
