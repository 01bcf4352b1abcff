use std::{
    collections::{BTreeSet, HashSet},
    path::Path,
};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    constants::{EARTH_RADIUS_KM, KM_PER_DEGREE_LAT},
    models::Coordinates,
    postal::PostalCode,
};

pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Great-circle distance rounded to one decimal, as reported to callers.
pub fn distance_km(a: Coordinates, b: Coordinates) -> f64 {
    (haversine_km(a, b) * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Coordinates>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut bbox = BoundingBox {
            min_lat: first.lat,
            max_lat: first.lat,
            min_lng: first.lng,
            max_lng: first.lng,
        };
        for p in iter {
            bbox.min_lat = bbox.min_lat.min(p.lat);
            bbox.max_lat = bbox.max_lat.max(p.lat);
            bbox.min_lng = bbox.min_lng.min(p.lng);
            bbox.max_lng = bbox.max_lng.max(p.lng);
        }
        Some(bbox)
    }

    /// Approximate box around a search circle (1° latitude ≈ 111 km).
    pub fn around(center: Coordinates, radius_km: f64) -> Self {
        let d_lat = radius_km / KM_PER_DEGREE_LAT;
        let cos_lat = center.lat.to_radians().cos().abs().max(1e-6);
        let d_lng = radius_km / (KM_PER_DEGREE_LAT * cos_lat);
        BoundingBox {
            min_lat: center.lat - d_lat,
            max_lat: center.lat + d_lat,
            min_lng: center.lng - d_lng,
            max_lng: center.lng + d_lng,
        }
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
            && self.min_lng <= other.max_lng
            && self.max_lng >= other.min_lng
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    pub exterior: Vec<Coordinates>,
    pub holes: Vec<Vec<Coordinates>>,
}

impl Polygon {
    pub fn contains(&self, p: Coordinates) -> bool {
        ring_contains(&self.exterior, p) && !self.holes.iter().any(|h| ring_contains(h, p))
    }

    fn rings(&self) -> impl Iterator<Item = &Vec<Coordinates>> {
        std::iter::once(&self.exterior).chain(self.holes.iter())
    }
}

fn ring_contains(ring: &[Coordinates], p: Coordinates) -> bool {
    if ring.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (a, b) = (ring[i], ring[j]);
        if (a.lat > p.lat) != (b.lat > p.lat) {
            let cross_lng = (b.lng - a.lng) * (p.lat - a.lat) / (b.lat - a.lat) + a.lng;
            if p.lng < cross_lng {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Distance in km from `origin` to segment `a`-`b`, on a local flat projection.
fn segment_distance_km(origin: Coordinates, a: Coordinates, b: Coordinates) -> f64 {
    let lng_scale = KM_PER_DEGREE_LAT * origin.lat.to_radians().cos();
    let project = |c: Coordinates| {
        (
            (c.lng - origin.lng) * lng_scale,
            (c.lat - origin.lat) * KM_PER_DEGREE_LAT,
        )
    };
    let (ax, ay) = project(a);
    let (bx, by) = project(b);
    let (dx, dy) = (bx - ax, by - ay);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq == 0.0 {
        0.0
    } else {
        (-(ax * dx + ay * dy) / len_sq).clamp(0.0, 1.0)
    };
    let (px, py) = (ax + t * dx, ay + t * dy);
    (px * px + py * py).sqrt()
}

/// A named area (e.g. a forward sortation area) and its boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaPolygon {
    pub code: String,
    pub polygons: Vec<Polygon>,
    pub bbox: BoundingBox,
}

impl AreaPolygon {
    pub fn new(code: impl Into<String>, polygons: Vec<Polygon>) -> Option<Self> {
        let bbox = BoundingBox::from_points(polygons.iter().flat_map(|p| p.exterior.iter()))?;
        Some(Self {
            code: code.into(),
            polygons,
            bbox,
        })
    }

    pub fn contains(&self, p: Coordinates) -> bool {
        self.polygons.iter().any(|poly| poly.contains(p))
    }

    /// Exact test: the circle's center lies inside, or some edge comes within the radius.
    pub fn intersects_circle(&self, center: Coordinates, radius_km: f64) -> bool {
        if self.contains(center) {
            return true;
        }
        self.polygons.iter().flat_map(Polygon::rings).any(|ring| {
            ring.windows(2)
                .any(|w| segment_distance_km(center, w[0], w[1]) <= radius_km)
                || match (ring.first(), ring.last()) {
                    (Some(first), Some(last)) => {
                        segment_distance_km(center, *last, *first) <= radius_km
                    }
                    _ => false,
                }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostalCodePoint {
    pub code: String,
    pub area_prefix: String,
    pub center: Coordinates,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostalCodeHit {
    pub code: String,
    pub area_prefix: String,
    pub center: Coordinates,
    pub distance_km: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContainmentResult {
    /// Area prefixes relevant to the search circle, sorted.
    pub areas: Vec<String>,
    /// Postal-code points in those areas, nearest first.
    pub postal_codes: Vec<PostalCodeHit>,
    pub used_polygons: bool,
    pub polygons_considered: usize,
    pub polygons_tested_exactly: usize,
}

/// Turns a center and radius into the set of relevant postal areas.
///
/// Area polygons are filtered by bounding box first and only the survivors
/// get the exact polygon/circle test. Areas without polygon data fall back to
/// plain point-radius inclusion of their postal-code centers.
#[derive(Debug, Clone, Default)]
pub struct GeoContainmentFilter {
    areas: Vec<AreaPolygon>,
    points: Vec<PostalCodePoint>,
}

impl GeoContainmentFilter {
    pub fn new(areas: Vec<AreaPolygon>, points: Vec<PostalCodePoint>) -> Self {
        Self { areas, points }
    }

    pub fn has_polygons(&self) -> bool {
        !self.areas.is_empty()
    }

    pub fn area_count(&self) -> usize {
        self.areas.len()
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// Finds the postal-code point with this exact code, if loaded.
    pub fn point(&self, code: &PostalCode) -> Option<&PostalCodePoint> {
        let wanted = code.to_string();
        self.points.iter().find(|p| p.code == wanted)
    }

    pub fn contained(&self, center: Coordinates, radius_km: f64) -> ContainmentResult {
        let circle = BoundingBox::around(center, radius_km);
        let candidates: Vec<&AreaPolygon> = self
            .areas
            .iter()
            .filter(|area| area.bbox.intersects(&circle))
            .collect();
        let tested = candidates.len();
        let polygon_hits: HashSet<&str> = candidates
            .into_iter()
            .filter(|area| area.intersects_circle(center, radius_km))
            .map(|area| area.code.as_str())
            .collect();
        let with_polygon: HashSet<&str> = self.areas.iter().map(|a| a.code.as_str()).collect();

        let mut areas = BTreeSet::new();
        let mut postal_codes = Vec::new();
        for point in &self.points {
            let exact = haversine_km(center, point.center);
            let prefix = point.area_prefix.as_str();
            let included = if with_polygon.contains(prefix) {
                polygon_hits.contains(prefix)
            } else {
                exact <= radius_km
            };
            if !included {
                continue;
            }
            areas.insert(point.area_prefix.clone());
            postal_codes.push(PostalCodeHit {
                code: point.code.clone(),
                area_prefix: point.area_prefix.clone(),
                center: point.center,
                distance_km: (exact * 10.0).round() / 10.0,
            });
        }
        areas.extend(polygon_hits.iter().map(|s| s.to_string()));
        postal_codes.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.code.cmp(&b.code))
        });

        ContainmentResult {
            areas: areas.into_iter().collect(),
            postal_codes,
            used_polygons: self.has_polygons(),
            polygons_considered: self.areas.len(),
            polygons_tested_exactly: tested,
        }
    }

    /// Loads postal-code points and, when given, GeoJSON area polygons.
    pub fn load(areas_path: Option<&Path>, points_path: &Path) -> anyhow::Result<Self> {
        let points = load_postal_points(points_path)?;
        let areas = match areas_path {
            Some(path) => load_area_polygons(path)?,
            None => Vec::new(),
        };
        tracing::info!(
            "loaded {} postal-code points and {} area polygons",
            points.len(),
            areas.len()
        );
        Ok(Self::new(areas, points))
    }
}

fn area_code(raw: &str) -> Option<String> {
    let code: String = raw.trim().chars().take(3).collect();
    (code.len() == 3).then(|| code.to_ascii_uppercase())
}

fn parse_ring(value: &Value) -> Option<Vec<Coordinates>> {
    value
        .as_array()?
        .iter()
        .map(|pos| {
            let pos = pos.as_array()?;
            let lng = pos.first()?.as_f64()?;
            let lat = pos.get(1)?.as_f64()?;
            Some(Coordinates::new(lat, lng))
        })
        .collect()
}

fn parse_polygon(value: &Value) -> Option<Polygon> {
    let mut rings = value.as_array()?.iter().map(parse_ring);
    let exterior = rings.next()??;
    let holes = rings.collect::<Option<Vec<_>>>()?;
    Some(Polygon { exterior, holes })
}

/// Parses a GeoJSON FeatureCollection of `Polygon` / `MultiPolygon` features.
pub fn parse_area_polygons(geojson: &str) -> anyhow::Result<Vec<AreaPolygon>> {
    let v: Value = serde_json::from_str(geojson).context("parse GeoJSON")?;
    let features = v
        .get("features")
        .and_then(|x| x.as_array())
        .ok_or_else(|| anyhow!("GeoJSON has no features array"))?;

    let mut out = Vec::with_capacity(features.len());
    let mut skipped = 0usize;
    for feature in features {
        let props = feature.get("properties");
        let code = ["fsa", "code", "CFSAUID"]
            .iter()
            .find_map(|k| props.and_then(|p| p.get(*k)).and_then(|x| x.as_str()))
            .and_then(area_code);
        let geometry = feature.get("geometry");
        let kind = geometry.and_then(|g| g.get("type")).and_then(|t| t.as_str());
        let coords = geometry.and_then(|g| g.get("coordinates"));

        let polygons = match (kind, coords) {
            (Some("Polygon"), Some(c)) => parse_polygon(c).map(|p| vec![p]),
            (Some("MultiPolygon"), Some(c)) => c
                .as_array()
                .and_then(|polys| polys.iter().map(parse_polygon).collect()),
            _ => None,
        };

        match (code, polygons) {
            (Some(code), Some(polygons)) => match AreaPolygon::new(code, polygons) {
                Some(area) => out.push(area),
                None => skipped += 1,
            },
            _ => skipped += 1,
        }
    }
    if skipped > 0 {
        tracing::warn!("skipped {} GeoJSON features without usable code or geometry", skipped);
    }
    Ok(out)
}

pub fn load_area_polygons(path: &Path) -> anyhow::Result<Vec<AreaPolygon>> {
    let data = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_area_polygons(&data).with_context(|| format!("load areas from {}", path.display()))
}

#[derive(Debug, Deserialize)]
struct PointRow {
    code: String,
    lat: f64,
    lng: f64,
    #[serde(default)]
    fsa: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PointFile {
    #[serde(rename = "postalCodes")]
    postal_codes: Vec<PointRow>,
}

fn rows_to_points(rows: Vec<PointRow>) -> Vec<PostalCodePoint> {
    let total = rows.len();
    let points: Vec<PostalCodePoint> = rows
        .into_iter()
        .filter_map(|row| {
            let code = PostalCode::parse(&row.code)?;
            let center = Coordinates::new(row.lat, row.lng);
            if !center.is_valid() {
                return None;
            }
            let area_prefix = row
                .fsa
                .as_deref()
                .and_then(area_code)
                .unwrap_or_else(|| code.fsa().to_string());
            Some(PostalCodePoint {
                code: code.to_string(),
                area_prefix,
                center,
            })
        })
        .collect();
    if points.len() < total {
        tracing::warn!(
            "skipped {} postal-code rows with invalid code or coordinates",
            total - points.len()
        );
    }
    points
}

pub fn parse_postal_points_json(data: &str) -> anyhow::Result<Vec<PostalCodePoint>> {
    let file: PointFile = serde_json::from_str(data).context("parse postal-code JSON")?;
    Ok(rows_to_points(file.postal_codes))
}

pub fn parse_postal_points_csv<R: std::io::Read>(reader: R) -> anyhow::Result<Vec<PostalCodePoint>> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut rows = Vec::new();
    for (lineno, row) in rdr.deserialize::<PointRow>().enumerate() {
        rows.push(row.with_context(|| format!("postal-code CSV row {}", lineno + 2))?);
    }
    Ok(rows_to_points(rows))
}

pub fn load_postal_points(path: &Path) -> anyhow::Result<Vec<PostalCodePoint>> {
    let is_json = path
        .extension()
        .and_then(|x| x.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        let data =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        parse_postal_points_json(&data)
    } else {
        let file =
            std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
        parse_postal_points_csv(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const CENTER: Coordinates = Coordinates {
        lat: 43.6532,
        lng: -79.3832,
    };

    fn km_north(km: f64) -> Coordinates {
        Coordinates::new(CENTER.lat + km / (EARTH_RADIUS_KM * PI / 180.0), CENTER.lng)
    }

    fn square(code: &str, lat0: f64, lat1: f64, lng0: f64, lng1: f64) -> AreaPolygon {
        let ring = vec![
            Coordinates::new(lat0, lng0),
            Coordinates::new(lat0, lng1),
            Coordinates::new(lat1, lng1),
            Coordinates::new(lat1, lng0),
            Coordinates::new(lat0, lng0),
        ];
        AreaPolygon::new(
            code,
            vec![Polygon {
                exterior: ring,
                holes: Vec::new(),
            }],
        )
        .unwrap()
    }

    fn point(code: &str, at: Coordinates) -> PostalCodePoint {
        let code = PostalCode::parse(code).unwrap();
        PostalCodePoint {
            code: code.to_string(),
            area_prefix: code.fsa().to_string(),
            center: at,
        }
    }

    #[test]
    fn haversine_matches_known_offsets() {
        assert_eq!(distance_km(CENTER, km_north(1.5)), 1.5);
        assert_eq!(distance_km(CENTER, CENTER), 0.0);
        // Toronto to Ottawa is roughly 350 km.
        let ottawa = Coordinates::new(45.4215, -75.6972);
        let d = haversine_km(CENTER, ottawa);
        assert!((340.0..360.0).contains(&d), "{d}");
    }

    #[test]
    fn circle_bbox_widens_longitude_with_latitude() {
        let bbox = BoundingBox::around(CENTER, 2.0);
        let d_lat = bbox.max_lat - CENTER.lat;
        let d_lng = bbox.max_lng - CENTER.lng;
        assert!((d_lat - 2.0 / 111.0).abs() < 1e-12);
        assert!(d_lng > d_lat);
    }

    #[test]
    fn point_radius_fallback_scenario() {
        let filter = GeoContainmentFilter::new(
            Vec::new(),
            vec![point("M5H", km_north(1.5)), point("M5J", km_north(2.3))],
        );
        let result = filter.contained(CENTER, 2.0);
        assert!(!result.used_polygons);
        assert_eq!(result.postal_codes.len(), 1);
        assert_eq!(result.postal_codes[0].code, "M5H");
        assert_eq!(result.postal_codes[0].distance_km, 1.5);
        assert_eq!(result.areas, vec!["M5H".to_string()]);
    }

    #[test]
    fn polygon_inside_outside_and_straddling() {
        let (lat, lng) = (CENTER.lat, CENTER.lng);
        let inside = square("M5H", lat - 0.005, lat + 0.005, lng - 0.005, lng + 0.005);
        let outside = square("M4W", lat + 0.09, lat + 0.11, lng - 0.01, lng + 0.01);
        let straddling = square("M5S", lat + 0.01, lat + 0.03, lng - 0.01, lng + 0.01);
        let enclosing = square("M5C", lat - 0.5, lat + 0.5, lng - 0.5, lng + 0.5);

        assert!(inside.intersects_circle(CENTER, 2.0));
        assert!(!outside.intersects_circle(CENTER, 2.0));
        assert!(straddling.intersects_circle(CENTER, 2.0));
        assert!(enclosing.intersects_circle(CENTER, 2.0));
    }

    #[test]
    fn bbox_overlap_without_intersection_is_excluded() {
        let (lat, lng) = (CENTER.lat, CENTER.lng);
        let corner = square("M4X", lat + 0.0160, lat + 0.0179, lng + 0.0222, lng + 0.0248);
        let circle = BoundingBox::around(CENTER, 2.0);
        assert!(corner.bbox.intersects(&circle));
        assert!(!corner.intersects_circle(CENTER, 2.0));
    }

    #[test]
    fn holes_are_not_part_of_the_area() {
        let (lat, lng) = (CENTER.lat, CENTER.lng);
        let mut donut = square("M5H", lat - 0.5, lat + 0.5, lng - 0.5, lng + 0.5);
        let hole = square("x", lat - 0.2, lat + 0.2, lng - 0.2, lng + 0.2);
        donut.polygons[0].holes.push(hole.polygons[0].exterior.clone());
        assert!(!donut.contains(CENTER));
        assert!(!donut.intersects_circle(CENTER, 2.0));
        assert!(donut.intersects_circle(CENTER, 50.0));
    }

    #[test]
    fn polygon_mode_returns_every_point_of_hit_areas_sorted() {
        let (lat, lng) = (CENTER.lat, CENTER.lng);
        let filter = GeoContainmentFilter::new(
            vec![
                square("M5H", lat - 0.01, lat + 0.01, lng - 0.01, lng + 0.01),
                square("M4W", lat + 0.09, lat + 0.11, lng - 0.01, lng + 0.01),
            ],
            vec![
                point("M5H 2", km_north(0.8)),
                point("M5H 1", km_north(0.2)),
                // Far center, but its area polygon intersects the circle.
                point("M5H 9", km_north(5.0)),
                point("M4W 1", km_north(11.0)),
                // No polygon for this area: point-radius fallback.
                point("L3T", km_north(1.0)),
            ],
        );
        let result = filter.contained(CENTER, 2.0);
        assert!(result.used_polygons);
        assert_eq!(result.polygons_tested_exactly, 1);
        assert_eq!(result.areas, vec!["L3T".to_string(), "M5H".to_string()]);
        let codes: Vec<_> = result.postal_codes.iter().map(|h| h.code.as_str()).collect();
        assert_eq!(codes, vec!["M5H 1", "M5H 2", "L3T", "M5H 9"]);
    }

    #[test]
    fn parses_geojson_features() {
        let geojson = r#"{
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {"fsa": "m5h"},
                 "geometry": {"type": "Polygon", "coordinates": [[[-79.39, 43.64], [-79.37, 43.64], [-79.37, 43.66], [-79.39, 43.64]]]}},
                {"type": "Feature", "properties": {"CFSAUID": "M4W"},
                 "geometry": {"type": "MultiPolygon", "coordinates": [[[[-79.39, 43.68], [-79.37, 43.68], [-79.37, 43.69], [-79.39, 43.68]]]]}},
                {"type": "Feature", "properties": {}, "geometry": null}
            ]
        }"#;
        let areas = parse_area_polygons(geojson).unwrap();
        assert_eq!(areas.len(), 2);
        assert_eq!(areas[0].code, "M5H");
        assert_eq!(areas[0].bbox.min_lng, -79.39);
        assert_eq!(areas[0].bbox.max_lat, 43.66);
        assert_eq!(areas[1].code, "M4W");
    }

    #[test]
    fn parses_postal_points_in_both_formats() {
        let json = r#"{"postalCodes": [
            {"code": "M5H", "lat": 43.65, "lng": -79.38},
            {"code": "M5H 2", "lat": 43.65, "lng": -79.38, "fsa": "M5H"},
            {"code": "bogus", "lat": 43.65, "lng": -79.38}
        ]}"#;
        let points = parse_postal_points_json(json).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].code, "M5H 2");
        assert_eq!(points[1].area_prefix, "M5H");

        let csv = "code,lat,lng\nL3T,43.81,-79.42\nM1B,43.80,-79.19\n";
        let points = parse_postal_points_csv(csv.as_bytes()).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].area_prefix, "L3T");
    }
}
