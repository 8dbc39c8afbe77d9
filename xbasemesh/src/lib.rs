//! XBaseMesh - X-Plane 12 base-mesh builds from arbitrary DEM rasters.
//!
//! This library turns heterogeneous elevation rasters into X-Plane 12 DSF
//! base-mesh tiles: it normalizes inputs into canonical per-tile DEM
//! artifacts (mosaic, reproject, tile, fill), drives the external mesh
//! backend per tile with retries and guaranteed config restoration, and
//! validates and enriches the resulting DSFs. Builds are reproducible
//! (content-addressed artifact cache, locked config snapshots) and
//! resumable (per-tile report carried across runs).
//!
//! The crate is a library; the `xbasemesh` binary in the sibling CLI crate
//! wires it to flags and exit codes.

pub mod cache;
pub mod cancel;
pub mod config;
pub mod context;
pub mod crs;
pub mod enrich;
mod error;
pub mod events;
pub mod extract;
pub mod fill;
mod fsio;
pub mod logging;
pub mod normalize;
pub mod patch;
pub mod plan;
pub mod raster;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod stack;
pub mod tile;
pub mod tools;
pub mod validate;

pub use cancel::CancellationToken;
pub use context::BuildContext;
pub use error::{BuildError, BuildResult};
pub use report::{BuildReport, BuildStatus, TileResult, TileStatus};
pub use tile::{Bucket, Tile};
