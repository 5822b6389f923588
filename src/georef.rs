use std::io::{Read, Seek, Write};

use log::{info, warn};
use tiff::decoder::Decoder;
use tiff::encoder::{DirectoryEncoder, TiffKind};
use tiff::tags::Tag;

use crate::error::Result;

// GeoKey IDs
const GT_MODEL_TYPE_GEO_KEY: u16 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;

// GeoKey values
const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;
const USER_DEFINED: u16 = 32767;

/// The GeoKey directory and its parameter tags, kept exactly as read.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoKeys {
    pub directory: Vec<u16>,
    pub double_params: Option<Vec<f64>>,
    pub ascii_params: Option<String>,
}

/// Georeferencing metadata of a raster.
///
/// The GeoTIFF tags are held verbatim so they can be copied unchanged from
/// the source raster to the output raster.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeoReference {
    pub pixel_scale: Option<Vec<f64>>,
    pub tiepoints: Option<Vec<f64>>,
    pub transformation: Option<Vec<f64>>,
    pub geokeys: Option<GeoKeys>,
    pub nodata: Option<String>,
}

impl GeoReference {
    /// Build tags from a GDAL-style geotransform and an optional EPSG code.
    pub fn from_geotransform(geotransform: [f64; 6], epsg: Option<u16>) -> Self {
        let [origin_x, pixel_width, row_rotation, origin_y, col_rotation, pixel_height] =
            geotransform;

        let (pixel_scale, tiepoints, transformation) =
            if row_rotation == 0.0 && col_rotation == 0.0 {
                (
                    Some(vec![pixel_width, -pixel_height, 0.0]),
                    Some(vec![0.0, 0.0, 0.0, origin_x, origin_y, 0.0]),
                    None,
                )
            } else {
                (
                    None,
                    None,
                    Some(vec![
                        pixel_width, row_rotation, 0.0, origin_x,
                        col_rotation, pixel_height, 0.0, origin_y,
                        0.0, 0.0, 0.0, 0.0,
                        0.0, 0.0, 0.0, 1.0,
                    ]),
                )
            };

        Self {
            pixel_scale,
            tiepoints,
            transformation,
            geokeys: epsg.map(build_geokey_directory),
            nodata: None,
        }
    }

    pub fn with_nodata(mut self, nodata: impl Into<String>) -> Self {
        self.nodata = Some(nodata.into());
        self
    }

    /// Affine pixel → world mapping in GDAL order:
    /// `[origin_x, pixel_width, row_rotation, origin_y, col_rotation, pixel_height]`.
    pub fn geotransform(&self) -> Option<[f64; 6]> {
        if let Some(m) = self.transformation.as_deref().filter(|m| m.len() >= 8) {
            return Some([m[3], m[0], m[1], m[7], m[4], m[5]]);
        }

        let scale = self.pixel_scale.as_deref().filter(|s| s.len() >= 2)?;
        let tie = self.tiepoints.as_deref().filter(|t| t.len() >= 6)?;
        let (sx, sy) = (scale[0], scale[1]);
        Some([tie[3] - tie[0] * sx, sx, 0.0, tie[4] + tie[1] * sy, 0.0, -sy])
    }

    pub fn pixel_size(&self) -> Option<(f64, f64)> {
        self.geotransform().map(|gt| (gt[1].abs(), gt[5].abs()))
    }

    pub fn nodata_value(&self) -> Option<f64> {
        self.nodata.as_deref().and_then(|s| s.trim().parse().ok())
    }

    pub fn crs(&self) -> CrsKind {
        match &self.geokeys {
            Some(keys) => detect_crs(&keys.directory),
            None => CrsKind::Unknown,
        }
    }

    /// Capture the georeferencing tags of the decoder's current image.
    pub fn read_from<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Self> {
        let pixel_scale = find_f64_vec(decoder, Tag::ModelPixelScaleTag)?;
        let tiepoints = find_f64_vec(decoder, Tag::ModelTiepointTag)?;
        let transformation = find_f64_vec(decoder, Tag::ModelTransformationTag)?;

        let geokeys = match decoder.find_tag(Tag::GeoKeyDirectoryTag)? {
            Some(value) => Some(GeoKeys {
                directory: value.into_u16_vec()?,
                double_params: find_f64_vec(decoder, Tag::GeoDoubleParamsTag)?,
                ascii_params: decoder
                    .find_tag(Tag::GeoAsciiParamsTag)?
                    .map(|v| v.into_string())
                    .transpose()?,
            }),
            None => None,
        };

        let nodata = decoder
            .find_tag(Tag::GdalNodata)?
            .map(|v| v.into_string())
            .transpose()?;

        Ok(Self {
            pixel_scale,
            tiepoints,
            transformation,
            geokeys,
            nodata,
        })
    }

    /// Write every tag held by this reference into an image directory.
    pub fn write_to<W: Write + Seek, K: TiffKind>(
        &self,
        dir: &mut DirectoryEncoder<W, K>,
    ) -> Result<()> {
        if let Some(scale) = &self.pixel_scale {
            dir.write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
        }
        if let Some(tie) = &self.tiepoints {
            dir.write_tag(Tag::ModelTiepointTag, &tie[..])?;
        }
        if let Some(matrix) = &self.transformation {
            dir.write_tag(Tag::ModelTransformationTag, &matrix[..])?;
        }
        if let Some(keys) = &self.geokeys {
            dir.write_tag(Tag::GeoKeyDirectoryTag, &keys.directory[..])?;
            if let Some(doubles) = &keys.double_params {
                dir.write_tag(Tag::GeoDoubleParamsTag, &doubles[..])?;
            }
            if let Some(ascii) = &keys.ascii_params {
                dir.write_tag(Tag::GeoAsciiParamsTag, ascii.as_str())?;
            }
        }
        if let Some(nodata) = &self.nodata {
            dir.write_tag(Tag::GdalNodata, nodata.as_str())?;
        }
        Ok(())
    }

    /// Log a one-line summary of the reference.
    pub fn log_summary(&self) {
        match self.geotransform() {
            Some(gt) => info!(
                "Origin: ({:.6}, {:.6}), pixel size: {:.6} x {:.6}",
                gt[0],
                gt[3],
                gt[1].abs(),
                gt[5].abs()
            ),
            None => warn!("Input raster has no geotransform; output will not be georeferenced"),
        }
        info!("CRS: {}", self.crs());
        if let Some(nodata) = &self.nodata {
            info!("Nodata value: {}", nodata);
        }
    }
}

fn find_f64_vec<R: Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Result<Option<Vec<f64>>> {
    Ok(decoder
        .find_tag(tag)?
        .map(|v| v.into_f64_vec())
        .transpose()?)
}

fn build_geokey_directory(epsg: u16) -> GeoKeys {
    let geographic = (4000..5000).contains(&epsg);

    let mut directory = vec![
        1, // KeyDirectoryVersion
        1, // KeyRevision
        0, // MinorRevision
        3, // NumberOfKeys
    ];
    directory.extend_from_slice(&[
        GT_MODEL_TYPE_GEO_KEY,
        0,
        1,
        if geographic {
            MODEL_TYPE_GEOGRAPHIC
        } else {
            MODEL_TYPE_PROJECTED
        },
    ]);
    directory.extend_from_slice(&[GT_RASTER_TYPE_GEO_KEY, 0, 1, RASTER_PIXEL_IS_AREA]);
    if geographic {
        directory.extend_from_slice(&[GEOGRAPHIC_TYPE_GEO_KEY, 0, 1, epsg]);
    } else {
        directory.extend_from_slice(&[PROJECTED_CS_TYPE_GEO_KEY, 0, 1, epsg]);
    }

    GeoKeys {
        directory,
        double_params: None,
        ascii_params: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrsKind {
    Projected(Option<u16>),
    Geographic(Option<u16>),
    Unknown,
}

impl CrsKind {
    pub fn epsg(&self) -> Option<u16> {
        match self {
            CrsKind::Projected(code) | CrsKind::Geographic(code) => *code,
            CrsKind::Unknown => None,
        }
    }
}

impl std::fmt::Display for CrsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrsKind::Projected(Some(code)) => write!(f, "projected (EPSG:{})", code),
            CrsKind::Projected(None) => write!(f, "projected (user-defined)"),
            CrsKind::Geographic(Some(code)) => write!(f, "geographic (EPSG:{})", code),
            CrsKind::Geographic(None) => write!(f, "geographic (user-defined)"),
            CrsKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classify a CRS from its GeoKey directory.
pub fn detect_crs(directory: &[u16]) -> CrsKind {
    if directory.len() < 4 {
        warn!("GeoKey directory too short ({} entries), CRS unknown", directory.len());
        return CrsKind::Unknown;
    }

    let mut model_type = None;
    let mut projected = None;
    let mut geographic = None;

    // Header is 4 shorts, then 4 shorts per key; only inline (location 0) values matter here.
    for entry in directory[4..].chunks_exact(4) {
        let (key, location, value) = (entry[0], entry[1], entry[3]);
        if location != 0 {
            continue;
        }
        match key {
            GT_MODEL_TYPE_GEO_KEY => model_type = Some(value),
            PROJECTED_CS_TYPE_GEO_KEY => projected = Some(value),
            GEOGRAPHIC_TYPE_GEO_KEY => geographic = Some(value),
            _ => {}
        }
    }

    let code = |v: Option<u16>| v.filter(|&c| c != USER_DEFINED);

    match model_type {
        Some(MODEL_TYPE_PROJECTED) => CrsKind::Projected(code(projected)),
        Some(MODEL_TYPE_GEOGRAPHIC) => CrsKind::Geographic(code(geographic)),
        _ if projected.is_some() => CrsKind::Projected(code(projected)),
        _ if geographic.is_some() => CrsKind::Geographic(code(geographic)),
        _ => CrsKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geotransform_round_trip_north_up() {
        let gt = [500_000.0, 0.5, 0.0, 5_700_000.0, 0.0, -0.5];
        let georef = GeoReference::from_geotransform(gt, Some(32609));
        assert_eq!(georef.geotransform(), Some(gt));
        assert_eq!(georef.pixel_size(), Some((0.5, 0.5)));
        assert!(georef.transformation.is_none());
    }

    #[test]
    fn test_geotransform_with_rotation_uses_matrix() {
        let gt = [100.0, 2.0, 0.25, 200.0, 0.5, -2.0];
        let georef = GeoReference::from_geotransform(gt, None);
        assert!(georef.pixel_scale.is_none());
        assert_eq!(georef.geotransform(), Some(gt));
    }

    #[test]
    fn test_tiepoint_offset_from_origin() {
        let georef = GeoReference {
            pixel_scale: Some(vec![10.0, 10.0, 0.0]),
            tiepoints: Some(vec![2.0, 3.0, 0.0, 1000.0, 2000.0, 0.0]),
            ..Default::default()
        };
        assert_eq!(
            georef.geotransform(),
            Some([980.0, 10.0, 0.0, 2030.0, 0.0, -10.0])
        );
    }

    #[test]
    fn test_detect_projected_and_geographic() {
        let projected = GeoReference::from_geotransform([0.0, 1.0, 0.0, 0.0, 0.0, -1.0], Some(32610));
        assert_eq!(projected.crs(), CrsKind::Projected(Some(32610)));

        let geographic = GeoReference::from_geotransform([0.0, 1.0, 0.0, 0.0, 0.0, -1.0], Some(4326));
        assert_eq!(geographic.crs(), CrsKind::Geographic(Some(4326)));
        assert_eq!(geographic.crs().epsg(), Some(4326));
    }

    #[test]
    fn test_detect_user_defined_and_unknown() {
        let keys = [1, 1, 0, 1, GT_MODEL_TYPE_GEO_KEY, 0, 1, MODEL_TYPE_PROJECTED];
        assert_eq!(detect_crs(&keys), CrsKind::Projected(None));
        assert_eq!(detect_crs(&[1, 1]), CrsKind::Unknown);
        assert_eq!(GeoReference::default().crs(), CrsKind::Unknown);
    }

    #[test]
    fn test_nodata_parsing() {
        let georef = GeoReference::default().with_nodata("-9999");
        assert_eq!(georef.nodata_value(), Some(-9999.0));
        assert_eq!(GeoReference::default().nodata_value(), None);
    }
}
