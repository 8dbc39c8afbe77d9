//! Cache key derivation.
//!
//! The key is a SHA-256 over a canonical preimage of everything that shapes
//! a normalized tile artifact. Identical inputs must produce identical keys
//! across runs and hosts, so the preimage uses fixed float formatting and
//! the DEM fingerprints in their given (ordered) sequence.

use super::sha256_hex;
use crate::raster::ResamplingKernel;
use crate::tile::Tile;

/// Inputs that shape one tile's normalized artifact.
#[derive(Debug, Clone)]
pub struct CacheKeyInputs {
    /// Ordered DEM fingerprint tokens (`<path>=<fingerprint>`).
    pub dem_tokens: Vec<String>,
    /// Target CRS definition.
    pub target_crs: String,
    /// Target resolution in degrees/pixel.
    pub resolution: f64,
    /// Resampling kernel.
    pub kernel: ResamplingKernel,
    /// Nodata policy descriptor (e.g. `backend:-32768`).
    pub nodata_policy: String,
    /// Fill strategy descriptor.
    pub fill: String,
    /// Stack layer token including AOI fingerprints, when a stack is used.
    pub stack_token: Option<String>,
    /// The tile.
    pub tile: Tile,
}

impl CacheKeyInputs {
    /// Derive the cache key (lowercase hex, 64 chars).
    pub fn derive(&self) -> String {
        sha256_hex(self.preimage().as_bytes())
    }

    fn preimage(&self) -> String {
        // Exponential formatting with fixed precision keeps the resolution
        // token identical across platforms.
        format!(
            "v1\ntile={}\ndems={}\ncrs={}\nres={:.12e}\nkernel={}\nnodata={}\nfill={}\nstack={}\n",
            self.tile,
            self.dem_tokens.join(","),
            self.target_crs.trim(),
            self.resolution,
            self.kernel,
            self.nodata_policy,
            self.fill,
            self.stack_token.as_deref().unwrap_or("-"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn inputs() -> CacheKeyInputs {
        CacheKeyInputs {
            dem_tokens: vec![
                String::from("/dem/a.tif=sha256:aaaa"),
                String::from("/dem/b.tif=sha256:bbbb"),
            ],
            target_crs: String::from("EPSG:4326"),
            resolution: 0.000833333333333,
            kernel: ResamplingKernel::Bilinear,
            nodata_policy: String::from("backend:-32768"),
            fill: String::from("interpolate"),
            stack_token: None,
            tile: Tile::parse("+47+008").unwrap(),
        }
    }

    #[test]
    fn test_identical_inputs_identical_keys() {
        assert_eq!(inputs().derive(), inputs().derive());
    }

    #[test]
    fn test_key_is_hex_sha256() {
        let key = inputs().derive();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_every_field_is_load_bearing() {
        let base = inputs().derive();

        let mut changed = inputs();
        changed.dem_tokens.reverse();
        assert_ne!(changed.derive(), base, "DEM order must change the key");

        let mut changed = inputs();
        changed.resolution = 0.001;
        assert_ne!(changed.derive(), base);

        let mut changed = inputs();
        changed.kernel = ResamplingKernel::Cubic;
        assert_ne!(changed.derive(), base);

        let mut changed = inputs();
        changed.fill = String::from("none");
        assert_ne!(changed.derive(), base);

        let mut changed = inputs();
        changed.stack_token = Some(String::from("layer-token"));
        assert_ne!(changed.derive(), base);

        let mut changed = inputs();
        changed.tile = Tile::parse("+47+009").unwrap();
        assert_ne!(changed.derive(), base);
    }

    proptest! {
        #[test]
        fn prop_key_stable_for_any_resolution(res in 1e-6f64..1.0) {
            let mut a = inputs();
            a.resolution = res;
            let mut b = inputs();
            b.resolution = res;
            prop_assert_eq!(a.derive(), b.derive());
        }
    }
}
