//! Shared measurement and analysis components for the mirror bench.
//!
//! Everything here is pure computation or file I/O: aperture geometry, height
//! maps, the Zernike basis, frame registration, modal decomposition, surface
//! persistence and mirror configuration. Hardware access lives in the
//! `hardware` crate.

pub mod aperture;
pub mod mirror_config;
pub mod modal;
pub mod registration;
pub mod surface;
pub mod surface_file;
pub mod zernike;

pub use aperture::{ApertureCircle, ApertureError};
pub use mirror_config::{ConfigStorage, MirrorCatalog, MirrorConfig};
pub use modal::{
    crop_to_annulus, decompose, remove_modes, AnnulusBounds, ModalCoefficients, ModalError,
    ModalProjection,
};
pub use registration::{register_and_average, RegistrationError, DEFAULT_ID_CROP_FACTOR};
pub use surface::{RawFrame, RegisteredSurface, SurfaceMap, SurfaceStats};
pub use zernike::{LiveZernikeCoefficients, ZernikeBasis};
