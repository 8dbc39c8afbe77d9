//! Reprojection with a selectable resampling kernel.
//!
//! The safe `gdal` wrapper only exposes `reproject()` with a fixed kernel,
//! so this module drops to `gdal_sys::GDALReprojectImage` the same way the
//! crate's own DEM processing wrappers do, passing null CRS arguments so
//! each dataset's embedded projection is used.

use std::ffi::CStr;
use std::ptr;

use gdal::Dataset;
use serde::{Deserialize, Serialize};

use super::{RasterError, RasterResult};

/// Resampling kernels accepted by the warp step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ResamplingKernel {
    Nearest,
    #[default]
    Bilinear,
    Cubic,
    Average,
    Lanczos,
}

impl ResamplingKernel {
    /// Canonical lowercase name, as used in CLI flags and the build plan.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResamplingKernel::Nearest => "nearest",
            ResamplingKernel::Bilinear => "bilinear",
            ResamplingKernel::Cubic => "cubic",
            ResamplingKernel::Average => "average",
            ResamplingKernel::Lanczos => "lanczos",
        }
    }

    fn gdal_alg(self) -> gdal_sys::GDALResampleAlg::Type {
        use gdal_sys::GDALResampleAlg;
        match self {
            ResamplingKernel::Nearest => GDALResampleAlg::GRA_NearestNeighbour,
            ResamplingKernel::Bilinear => GDALResampleAlg::GRA_Bilinear,
            ResamplingKernel::Cubic => GDALResampleAlg::GRA_Cubic,
            ResamplingKernel::Average => GDALResampleAlg::GRA_Average,
            ResamplingKernel::Lanczos => GDALResampleAlg::GRA_Lanczos,
        }
    }
}

impl std::str::FromStr for ResamplingKernel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nearest" => Ok(ResamplingKernel::Nearest),
            "bilinear" => Ok(ResamplingKernel::Bilinear),
            "cubic" => Ok(ResamplingKernel::Cubic),
            "average" => Ok(ResamplingKernel::Average),
            "lanczos" => Ok(ResamplingKernel::Lanczos),
            other => Err(format!(
                "unknown resampling kernel '{other}' (expected nearest|bilinear|cubic|average|lanczos)"
            )),
        }
    }
}

impl std::fmt::Display for ResamplingKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default kernel choice by resampling direction.
///
/// Recorded verbatim in the build plan so a replay sees the same table even
/// if the default changes in a later release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResamplingPolicy {
    /// Source finer than target.
    pub downsample: ResamplingKernel,
    /// Source coarser than target.
    pub upsample: ResamplingKernel,
}

impl Default for ResamplingPolicy {
    fn default() -> Self {
        Self {
            downsample: ResamplingKernel::Bilinear,
            upsample: ResamplingKernel::Cubic,
        }
    }
}

impl ResamplingPolicy {
    /// Pick a kernel for warping from `src_res` to `dst_res` (degrees/pixel).
    pub fn select(&self, src_res: f64, dst_res: f64) -> ResamplingKernel {
        if dst_res >= src_res {
            self.downsample
        } else {
            self.upsample
        }
    }
}

/// Warp `src` into `dst` using each dataset's embedded CRS and geotransform.
///
/// The destination must already have its grid, projection, and nodata value
/// set; pixels the source does not cover are left untouched, so callers
/// initialize the destination to nodata first.
pub fn reproject_into(
    src: &Dataset,
    dst: &Dataset,
    kernel: ResamplingKernel,
    context: &str,
) -> RasterResult<()> {
    let rv = unsafe {
        gdal_sys::GDALReprojectImage(
            src.c_dataset(),
            ptr::null(),
            dst.c_dataset(),
            ptr::null(),
            kernel.gdal_alg(),
            0.0,
            0.125,
            None,
            ptr::null_mut(),
            ptr::null_mut(),
        )
    };
    if rv != gdal_sys::CPLErr::CE_None {
        return Err(RasterError::Warp {
            context: context.to_string(),
            message: last_cpl_message(),
        });
    }
    Ok(())
}

/// Last GDAL error message, for surfacing warp failures.
fn last_cpl_message() -> String {
    unsafe {
        let msg = gdal_sys::CPLGetLastErrorMsg();
        if msg.is_null() {
            String::from("unknown GDAL error")
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}
