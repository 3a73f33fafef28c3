//! Well-known-text encoding of geometry columns.
//!
//! Flat ledger files have no native geometry type, so geometry-valued
//! columns are written as WKT and parsed back on load. Only the 2D shapes
//! job ledgers actually carry are supported.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<(f64, f64)> for Coord {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// A 2D geometry value.
#[derive(Clone, Debug, PartialEq)]
pub enum Geometry {
    Point(Coord),
    LineString(Vec<Coord>),
    /// Exterior ring followed by interior rings.
    Polygon(Vec<Vec<Coord>>),
    MultiPolygon(Vec<Vec<Vec<Coord>>>),
}

impl Geometry {
    pub fn point(x: f64, y: f64) -> Self {
        Geometry::Point(Coord::new(x, y))
    }

    /// Axis-aligned rectangle as a closed polygon, as used for spatial
    /// extents of tiled jobs.
    pub fn bbox(west: f64, south: f64, east: f64, north: f64) -> Self {
        Geometry::Polygon(vec![vec![
            Coord::new(west, south),
            Coord::new(east, south),
            Coord::new(east, north),
            Coord::new(west, north),
            Coord::new(west, south),
        ]])
    }

    pub fn geometry_type(&self) -> &'static str {
        match self {
            Geometry::Point(_) => "POINT",
            Geometry::LineString(_) => "LINESTRING",
            Geometry::Polygon(_) => "POLYGON",
            Geometry::MultiPolygon(_) => "MULTIPOLYGON",
        }
    }
}

/// Error raised for text that is not valid WKT.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid WKT at offset {offset}: {message}")]
pub struct WktError {
    pub offset: usize,
    pub message: String,
}

fn write_coords(f: &mut fmt::Formatter<'_>, coords: &[Coord]) -> fmt::Result {
    f.write_str("(")?;
    for (i, c) in coords.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{} {}", c.x, c.y)?;
    }
    f.write_str(")")
}

fn write_rings(f: &mut fmt::Formatter<'_>, rings: &[Vec<Coord>]) -> fmt::Result {
    f.write_str("(")?;
    for (i, ring) in rings.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write_coords(f, ring)?;
    }
    f.write_str(")")
}

impl Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.geometry_type())?;
        match self {
            Geometry::Point(c) => write!(f, "({} {})", c.x, c.y),
            Geometry::LineString(coords) => write_coords(f, coords),
            Geometry::Polygon(rings) => write_rings(f, rings),
            Geometry::MultiPolygon(polygons) => {
                f.write_str("(")?;
                for (i, rings) in polygons.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_rings(f, rings)?;
                }
                f.write_str(")")
            }
        }
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn error(&self, message: impl Into<String>) -> WktError {
        WktError {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace();
        self.rest().chars().next()
    }

    fn expect(&mut self, expected: char) -> Result<(), WktError> {
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += c.len_utf8();
                Ok(())
            }
            Some(c) => Err(self.error(format!("expected '{expected}', found '{c}'"))),
            None => Err(self.error(format!("expected '{expected}', found end of input"))),
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        self.skip_whitespace();
        let rest = self.rest();
        let len = rest.find(|c: char| !pred(c)).unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn keyword(&mut self) -> Result<String, WktError> {
        let word = self.take_while(|c| c.is_ascii_alphabetic());
        if word.is_empty() {
            return Err(self.error("expected geometry type"));
        }
        Ok(word.to_ascii_uppercase())
    }

    fn number(&mut self) -> Result<f64, WktError> {
        let start = self.pos;
        let text = self.take_while(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'));
        text.parse::<f64>().map_err(|_| WktError {
            offset: start,
            message: format!("invalid number {text:?}"),
        })
    }

    fn coord(&mut self) -> Result<Coord, WktError> {
        let x = self.number()?;
        let y = self.number()?;
        Ok(Coord { x, y })
    }

    /// `(x y, x y, ...)`
    fn coord_list(&mut self) -> Result<Vec<Coord>, WktError> {
        self.expect('(')?;
        let mut coords = vec![self.coord()?];
        while self.peek() == Some(',') {
            self.expect(',')?;
            coords.push(self.coord()?);
        }
        self.expect(')')?;
        Ok(coords)
    }

    fn ring(&mut self) -> Result<Vec<Coord>, WktError> {
        let ring = self.coord_list()?;
        if ring.len() < 4 || ring.first() != ring.last() {
            return Err(self.error("polygon ring must be closed and have at least 4 points"));
        }
        Ok(ring)
    }

    /// `((ring), (ring), ...)`
    fn rings(&mut self) -> Result<Vec<Vec<Coord>>, WktError> {
        self.expect('(')?;
        let mut rings = vec![self.ring()?];
        while self.peek() == Some(',') {
            self.expect(',')?;
            rings.push(self.ring()?);
        }
        self.expect(')')?;
        Ok(rings)
    }

    fn geometry(&mut self) -> Result<Geometry, WktError> {
        let kind = self.keyword()?;
        let geometry = match kind.as_str() {
            "POINT" => {
                self.expect('(')?;
                let c = self.coord()?;
                self.expect(')')?;
                Geometry::Point(c)
            }
            "LINESTRING" => {
                let coords = self.coord_list()?;
                if coords.len() < 2 {
                    return Err(self.error("linestring needs at least 2 points"));
                }
                Geometry::LineString(coords)
            }
            "POLYGON" => Geometry::Polygon(self.rings()?),
            "MULTIPOLYGON" => {
                self.expect('(')?;
                let mut polygons = vec![self.rings()?];
                while self.peek() == Some(',') {
                    self.expect(',')?;
                    polygons.push(self.rings()?);
                }
                self.expect(')')?;
                Geometry::MultiPolygon(polygons)
            }
            other => return Err(self.error(format!("unsupported geometry type {other}"))),
        };
        if self.peek().is_some() {
            return Err(self.error("trailing characters"));
        }
        Ok(geometry)
    }
}

impl FromStr for Geometry {
    type Err = WktError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Parser::new(s).geometry()
    }
}

impl Serialize for Geometry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Geometry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_text() {
        let point = Geometry::point(5.5, -12.25);
        assert_eq!(point.to_string(), "POINT (5.5 -12.25)");
        assert_eq!("point(5.5   -12.25)".parse::<Geometry>().unwrap(), point);
    }

    #[test]
    fn test_polygon_roundtrip() {
        let bbox = Geometry::bbox(4.0, 51.0, 4.1, 51.1);
        let text = bbox.to_string();
        assert!(text.starts_with("POLYGON (("));
        assert_eq!(text.parse::<Geometry>().unwrap(), bbox);
    }

    #[test]
    fn test_multipolygon_roundtrip() {
        let text = "MULTIPOLYGON (((0 0, 1 0, 1 1, 0 0)), ((2 2, 3 2, 3 3, 2 2), (2.1 2.1, 2.2 2.1, 2.2 2.2, 2.1 2.1)))";
        let geometry: Geometry = text.parse().unwrap();
        match &geometry {
            Geometry::MultiPolygon(polygons) => {
                assert_eq!(polygons.len(), 2);
                assert_eq!(polygons[1].len(), 2);
            }
            other => panic!("unexpected geometry {other:?}"),
        }
        assert_eq!(geometry.to_string(), text);
    }

    #[test]
    fn test_rejects_malformed_text() {
        assert!("POINT (1)".parse::<Geometry>().is_err());
        assert!("POLYGON ((0 0, 1 0, 1 1, 0 1))".parse::<Geometry>().is_err());
        assert!("CIRCLE (0 0, 1)".parse::<Geometry>().is_err());
        assert!("POINT (1 2) junk".parse::<Geometry>().is_err());
        assert!("".parse::<Geometry>().is_err());
    }

    #[test]
    fn test_serde_as_text() {
        let geometry = Geometry::point(1.0, 2.0);
        let json = serde_json::to_string(&geometry).unwrap();
        assert_eq!(json, "\"POINT (1 2)\"");
        let back: Geometry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, geometry);
    }
}
