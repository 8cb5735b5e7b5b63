//! Precomputed geometry metadata for WKT literals and its random-access
//! sidecar file.
//!
//! The sidecar starts with a 4-byte version word; record `i` lives at byte
//! offset `4 + i * stride` with `stride = size_of::<GeometryInfo>()`. An
//! all-zero record marks a literal whose WKT did not parse; a valid record
//! always has a nonzero geometry type, so the sentinel is unambiguous.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use geo::{BoundingRect, Centroid, ChamberlainDuquetteArea};
use memmap2::Mmap;

use super::{map_file, VocabularyRead};
use crate::{InternalError, Result};

/// Bumped whenever the record layout changes; checked at open.
pub const GEO_INFO_VERSION: u32 = 1;

/// Size in bytes of one sidecar record.
pub const GEO_INFO_STRIDE: usize = size_of::<GeometryInfo>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WktType {
    Point = 1,
    LineString = 2,
    Polygon = 3,
    MultiPoint = 4,
    MultiLineString = 5,
    MultiPolygon = 6,
    GeometryCollection = 7,
}

impl WktType {
    fn from_tag(tag: u32) -> Option<WktType> {
        use WktType::*;
        Some(match tag {
            1 => Point,
            2 => LineString,
            3 => Polygon,
            4 => MultiPoint,
            5 => MultiLineString,
            6 => MultiPolygon,
            7 => GeometryCollection,
            _ => return None,
        })
    }
}

/// Fixed-width geometry metadata, bitcast to and from its on-disk bytes.
/// The field order puts the nonzero type tag first; coordinates follow the
/// geo convention of x = longitude, y = latitude.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C, packed)]
pub struct GeometryInfo {
    wkt_type: u32,
    /// `[west, south, east, north]`
    bounding_box: [f64; 4],
    /// `[lng, lat]`
    centroid: [f64; 2],
    /// Spherical surface area in square meters; zero for non-areal types.
    metric_area: f64,
}

/// What one preprocessing worker hands to the sidecar writer.
#[derive(Debug, Clone, Copy)]
pub struct GeometryOutcome {
    pub info: Option<GeometryInfo>,
    /// The polygon parsed but its computed area was not a finite number.
    pub invalid_area: bool,
}

impl GeometryInfo {
    /// Parses a WKT string and computes its metadata. Returns
    /// `info: None` for anything that is not well-formed WKT.
    pub fn from_wkt(word: &str) -> GeometryOutcome {
        let invalid = GeometryOutcome { info: None, invalid_area: false };
        let Ok(parsed) = wkt::Wkt::<f64>::from_str(word) else {
            return invalid;
        };
        let Ok(geometry) = geo_types::Geometry::<f64>::try_from(parsed) else {
            return invalid;
        };
        let (Some(rect), Some(centroid)) = (geometry.bounding_rect(), geometry.centroid()) else {
            // Empty geometries have no extent; treat them like parse failures.
            return invalid;
        };
        let wkt_type = match &geometry {
            geo_types::Geometry::Point(_) => WktType::Point,
            geo_types::Geometry::Line(_) | geo_types::Geometry::LineString(_) => {
                WktType::LineString
            }
            geo_types::Geometry::Polygon(_) | geo_types::Geometry::Rect(_)
            | geo_types::Geometry::Triangle(_) => WktType::Polygon,
            geo_types::Geometry::MultiPoint(_) => WktType::MultiPoint,
            geo_types::Geometry::MultiLineString(_) => WktType::MultiLineString,
            geo_types::Geometry::MultiPolygon(_) => WktType::MultiPolygon,
            geo_types::Geometry::GeometryCollection(_) => WktType::GeometryCollection,
        };
        let (metric_area, invalid_area) = match &geometry {
            geo_types::Geometry::Polygon(polygon) => {
                checked_area(polygon.chamberlain_duquette_unsigned_area())
            }
            geo_types::Geometry::MultiPolygon(polygons) => {
                checked_area(polygons.chamberlain_duquette_unsigned_area())
            }
            _ => (0.0, false),
        };
        let info = GeometryInfo {
            wkt_type: wkt_type as u32,
            bounding_box: [rect.min().x, rect.min().y, rect.max().x, rect.max().y],
            centroid: [centroid.x(), centroid.y()],
            metric_area,
        };
        debug_assert!(
            bytes_of(&info).iter().any(|&b| b != 0),
            "a valid GeometryInfo must not serialise to the sentinel"
        );
        GeometryOutcome { info: Some(info), invalid_area }
    }

    pub fn wkt_type(&self) -> WktType {
        WktType::from_tag(self.wkt_type).expect("GeometryInfo carries a valid type tag")
    }

    /// `[west, south, east, north]`
    pub fn bounding_box(&self) -> [f64; 4] {
        self.bounding_box
    }

    /// `(lng, lat)`
    pub fn centroid(&self) -> (f64, f64) {
        let [lng, lat] = self.centroid;
        (lng, lat)
    }

    pub fn metric_area(&self) -> f64 {
        self.metric_area
    }
}

fn checked_area(area: f64) -> (f64, bool) {
    if area.is_finite() {
        (area, false)
    } else {
        (0.0, true)
    }
}

/// Sequential writer for the sidecar; records must arrive in index order,
/// which the pipeline's writer thread guarantees.
pub struct GeoSidecarWriter {
    file: BufWriter<File>,
    written: u64,
}

impl GeoSidecarWriter {
    pub fn create(path: &Path) -> io::Result<GeoSidecarWriter> {
        let mut file = BufWriter::new(File::create(path)?);
        file.write_u32::<LittleEndian>(GEO_INFO_VERSION)?;
        Ok(GeoSidecarWriter { file, written: 0 })
    }

    pub fn write_record(&mut self, info: Option<&GeometryInfo>) -> io::Result<()> {
        match info {
            Some(info) => self.file.write_all(bytes_of(info))?,
            None => self.file.write_all(&[0u8; GEO_INFO_STRIDE])?,
        }
        self.written += 1;
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<u64> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(self.written)
    }
}

/// Memory-mapped random access to the sidecar.
#[derive(Debug)]
pub struct GeoSidecar {
    mmap: Option<Mmap>,
    len: u64,
}

impl GeoSidecar {
    pub fn open(path: &Path, expected_len: u64) -> Result<GeoSidecar> {
        let corrupt = |reason: String| InternalError::CorruptIndex {
            path: path.display().to_string(),
            reason,
        };
        let Some(mmap) = map_file(path)? else {
            if expected_len == 0 {
                return Ok(GeoSidecar { mmap: None, len: 0 });
            }
            return Err(corrupt("missing geometry records".to_owned()).into());
        };
        let mut header = &mmap[..];
        let version =
            header.read_u32::<LittleEndian>().map_err(|_| corrupt("truncated header".to_owned()))?;
        if version != GEO_INFO_VERSION {
            return Err(InternalError::GeoInfoVersionMismatch {
                found: version,
                required: GEO_INFO_VERSION,
            }
            .into());
        }
        let body = mmap.len() as u64 - 4;
        if body != expected_len * GEO_INFO_STRIDE as u64 {
            return Err(corrupt(format!(
                "expected {expected_len} geometry records, file holds {} bytes",
                body
            ))
            .into());
        }
        Ok(GeoSidecar { mmap: Some(mmap), len: expected_len })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A pure function of the on-disk bytes: the sentinel decodes to `None`,
    /// anything else is the bitcast of the stride-sized record.
    pub fn get(&self, index: u64) -> Option<GeometryInfo> {
        if index >= self.len {
            return None;
        }
        let mmap = self.mmap.as_ref()?;
        let offset = 4 + index as usize * GEO_INFO_STRIDE;
        let bytes = &mmap[offset..offset + GEO_INFO_STRIDE];
        if bytes.iter().all(|&b| b == 0) {
            None
        } else {
            Some(pod_read_unaligned(bytes))
        }
    }
}

/// A vocabulary with the geometry sidecar alongside: every index answers
/// both `word(i)` and `geo_info(i)`.
pub struct GeoVocabulary<V> {
    inner: V,
    sidecar: GeoSidecar,
}

impl<V: VocabularyRead> GeoVocabulary<V> {
    pub fn open(inner: V, sidecar_path: &Path) -> Result<GeoVocabulary<V>> {
        let sidecar = GeoSidecar::open(sidecar_path, inner.len())?;
        Ok(GeoVocabulary { inner, sidecar })
    }

    pub fn geo_info(&self, index: u64) -> Option<GeometryInfo> {
        self.sidecar.get(index)
    }

    pub fn inner(&self) -> &V {
        &self.inner
    }
}

impl<V: VocabularyRead> VocabularyRead for GeoVocabulary<V> {
    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn word(&self, index: u64) -> Result<std::borrow::Cow<'_, str>> {
        self.inner.word(index)
    }
}

pub(crate) fn sidecar_path(base: &Path) -> PathBuf {
    base.with_extension("geo-info")
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn point_metadata() {
        let outcome = GeometryInfo::from_wkt("POINT(2.2945 48.8584)");
        let info = outcome.info.unwrap();
        assert_eq!(info.wkt_type(), WktType::Point);
        let (lng, lat) = info.centroid();
        assert!((lng - 2.2945).abs() < 1e-9);
        assert!((lat - 48.8584).abs() < 1e-9);
        assert_eq!(info.metric_area(), 0.0);
        assert!(!outcome.invalid_area);
    }

    #[test]
    fn polygon_metadata() {
        let outcome = GeometryInfo::from_wkt("POLYGON((0 0, 1 0, 1 1, 0 1, 0 0))");
        let info = outcome.info.unwrap();
        assert_eq!(info.wkt_type(), WktType::Polygon);
        assert_eq!(info.bounding_box(), [0.0, 0.0, 1.0, 1.0]);
        // Roughly one square degree at the equator.
        assert!(info.metric_area() > 1.0e10);
    }

    #[test]
    fn garbage_is_not_a_geometry() {
        assert!(GeometryInfo::from_wkt("not wkt at all").info.is_none());
        assert!(GeometryInfo::from_wkt("POINT(nope)").info.is_none());
        assert!(GeometryInfo::from_wkt("").info.is_none());
    }

    #[test]
    fn no_valid_record_serialises_to_zeros() {
        for wkt in
            ["POINT(0 0)", "LINESTRING(0 0, 1 1)", "POLYGON((0 0, 1 0, 1 1, 0 0))"]
        {
            let info = GeometryInfo::from_wkt(wkt).info.unwrap();
            assert!(bytes_of(&info).iter().any(|&b| b != 0), "{wkt}");
        }
    }

    #[test]
    fn sidecar_roundtrip_and_version_gate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vocabulary.geo-info");
        let mut writer = GeoSidecarWriter::create(&path).unwrap();
        let info = GeometryInfo::from_wkt("POINT(1 2)").info.unwrap();
        writer.write_record(Some(&info)).unwrap();
        writer.write_record(None).unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        let sidecar = GeoSidecar::open(&path, 2).unwrap();
        assert_eq!(sidecar.get(0), Some(info));
        assert_eq!(sidecar.get(1), None);
        assert_eq!(sidecar.get(2), None);

        // A wrong record count is corruption.
        assert!(GeoSidecar::open(&path, 3).is_err());

        // A wrong version refuses to open with a rebuild instruction.
        std::fs::write(&path, [0xff, 0, 0, 0]).unwrap();
        let err = GeoSidecar::open(&path, 0).unwrap_err();
        assert!(err.to_string().contains("rebuild"));
    }
}
