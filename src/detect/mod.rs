//! Detection adapters.
//!
//! Backends are opaque models behind `DetectorBackend`; `CropService`
//! turns their boxes into crop files for the capture API.

mod backend;
pub mod backends;
pub mod crops;
mod result;

pub use backend::{DetectionCapability, DetectorBackend};
pub use backends::{StubBackend, StubRegion};
pub use crops::CropService;
pub use result::{BoundingBox, Detection};
