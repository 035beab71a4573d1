//! Turning saved sessions into figure-error reports.
//!
//! A session folder is registered into one surface, decomposed onto the
//! Zernike basis once, and then reported with each removal preset applied.

use std::path::{Path, PathBuf};

use serde::Serialize;
use shared::mirror_config::MirrorConfig;
use shared::modal::{
    crop_to_annulus, decompose, remove_modes, AnnulusBounds, ModalCoefficients, ModalError,
};
use shared::registration::{register_and_average, RegistrationError, DEFAULT_ID_CROP_FACTOR};
use shared::surface::{RegisteredSurface, SurfaceMap, SurfaceStats};
use shared::surface_file::{load_measurement_folder, SurfaceFileError};
use shared::zernike::{RemovalPreset, ZernikeBasis, ZernikeError, DEFAULT_ORDER, REMOVAL_PRESETS};
use thiserror::Error;
use tracing::info;

use crate::session::{date_folders, pick, sorted_subfolders, SessionError};

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error(transparent)]
    Basis(#[from] ZernikeError),

    #[error(transparent)]
    Load(#[from] SurfaceFileError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Modal(#[from] ModalError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("surfaces {0} and {1} are on different grids")]
    GridMismatch(String, String),

    #[error("history needs at least two dates, got {0}")]
    NotEnoughHistory(usize),
}

/// Knobs for processing a session.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingOptions {
    /// Highest Zernike mode index of the basis
    pub order: usize,
    pub id_crop_factor: f64,
    /// Crop the reported surfaces to this physical annulus
    pub crop: Option<AnnulusBounds>,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            order: DEFAULT_ORDER,
            id_crop_factor: DEFAULT_ID_CROP_FACTOR,
            crop: None,
        }
    }
}

/// Basis matched to a mirror's clear aperture.
pub fn basis_for(config: &MirrorConfig, order: usize) -> Result<ZernikeBasis, ZernikeError> {
    ZernikeBasis::from_clear_aperture(order, config.clear_outer(), config.clear_inner())
}

/// Load every measurement in `folder` and register them into one surface.
pub fn load_session_surface(
    folder: &Path,
    config: &MirrorConfig,
    basis: &ZernikeBasis,
    id_crop_factor: f64,
) -> Result<RegisteredSurface, ProcessingError> {
    let frames = load_measurement_folder(folder)?;
    info!("Loaded {} measurements from {}", frames.len(), folder.display());
    Ok(register_and_average(
        &frames,
        config.clear_outer(),
        config.clear_inner(),
        basis,
        id_crop_factor,
    )?)
}

/// Decompose a surface and strip `modes`, optionally cropping the result.
pub fn prepare_surface(
    surface: &SurfaceMap,
    basis: &ZernikeBasis,
    modes: &[usize],
    crop: Option<(f64, AnnulusBounds)>,
) -> Result<SurfaceMap, ModalError> {
    let (projection, coefficients) = decompose(surface, basis)?;
    let prepared = remove_modes(&projection, &coefficients, basis, modes)?;
    Ok(match crop {
        Some((outer_diameter, bounds)) => crop_to_annulus(&prepared, outer_diameter, bounds),
        None => prepared,
    })
}

/// A surface reported with one removal preset applied.
#[derive(Debug, Clone)]
pub struct PresetSurface {
    pub preset: RemovalPreset,
    pub surface: SurfaceMap,
    pub stats: Option<SurfaceStats>,
}

/// Everything derived from one session folder.
#[derive(Debug, Clone)]
pub struct SessionAnalysis {
    pub folder: PathBuf,
    pub registered: RegisteredSurface,
    pub coefficients: ModalCoefficients,
    pub presets: Vec<PresetSurface>,
}

impl SessionAnalysis {
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            folder: self.folder.clone(),
            frame_count: self.registered.frame_count(),
            coefficients: self.coefficients.values().to_vec(),
            presets: self
                .presets
                .iter()
                .map(|p| PresetSummary {
                    name: p.preset.name.to_string(),
                    stats: p.stats,
                })
                .collect(),
        }
    }
}

/// Serializable digest of a [`SessionAnalysis`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub folder: PathBuf,
    pub frame_count: usize,
    pub coefficients: Vec<f64>,
    pub presets: Vec<PresetSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresetSummary {
    pub name: String,
    pub stats: Option<SurfaceStats>,
}

/// Register a session folder and report it under every removal preset.
pub fn process_session(
    folder: &Path,
    config: &MirrorConfig,
    options: &ProcessingOptions,
) -> Result<SessionAnalysis, ProcessingError> {
    let basis = basis_for(config, options.order)?;
    let registered = load_session_surface(folder, config, &basis, options.id_crop_factor)?;
    let (projection, coefficients) = decompose(registered.surface(), &basis)?;

    let presets = REMOVAL_PRESETS
        .iter()
        .map(|preset| -> Result<PresetSurface, ModalError> {
            let stripped = remove_modes(&projection, &coefficients, &basis, preset.modes)?;
            let surface = match options.crop {
                Some(bounds) => crop_to_annulus(&stripped, config.outer_diameter, bounds),
                None => stripped,
            };
            let stats = surface.stats();
            if let Some(s) = &stats {
                info!(
                    "{}: rms {:.4}, p-v {:.4} over {} pixels",
                    preset.name, s.rms, s.peak_to_valley, s.valid_pixels
                );
            }
            Ok(PresetSurface {
                preset: *preset,
                surface,
                stats,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SessionAnalysis {
        folder: folder.to_path_buf(),
        registered,
        coefficients,
        presets,
    })
}

/// One date's surface in a mirror's history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub date: String,
    pub folder: PathBuf,
    pub surface: SurfaceMap,
}

/// Change between two consecutive dates.
#[derive(Debug, Clone)]
pub struct SurfaceDelta {
    /// `(<later> - <earlier>)`
    pub label: String,
    pub surface: SurfaceMap,
}

/// Date folders of a mirror, oldest first.
pub fn list_dates(mirror_path: &Path) -> Result<Vec<String>, ProcessingError> {
    Ok(date_folders(mirror_path)?)
}

/// Load one instance per date, each registered and stripped of `modes`.
pub fn load_history(
    mirror_path: &Path,
    dates: &[String],
    instance_index: isize,
    config: &MirrorConfig,
    modes: &[usize],
    options: &ProcessingOptions,
) -> Result<Vec<HistoryEntry>, ProcessingError> {
    let basis = basis_for(config, options.order)?;
    let crop = options.crop.map(|bounds| (config.outer_diameter, bounds));

    dates
        .iter()
        .map(|date| -> Result<HistoryEntry, ProcessingError> {
            let date_path = mirror_path.join(date);
            let instances = sorted_subfolders(&date_path)?;
            let instance = pick(&instances, instance_index, &date_path)?;

            let folder = date_path.join(instance);
            let registered = load_session_surface(&folder, config, &basis, options.id_crop_factor)?;
            let surface = prepare_surface(registered.surface(), &basis, modes, crop)?;
            Ok(HistoryEntry {
                date: date.clone(),
                folder,
                surface,
            })
        })
        .collect()
}

/// Differences between consecutive dates, newest pair first.
pub fn history_deltas(entries: &[HistoryEntry]) -> Result<Vec<SurfaceDelta>, ProcessingError> {
    if entries.len() < 2 {
        return Err(ProcessingError::NotEnoughHistory(entries.len()));
    }

    entries
        .windows(2)
        .rev()
        .map(|pair| -> Result<SurfaceDelta, ProcessingError> {
            let (earlier, later) = (&pair[0], &pair[1]);
            let Some(surface) = later.surface.difference(&earlier.surface) else {
                let (later, earlier) = (later.date.clone(), earlier.date.clone());
                return Err(ProcessingError::GridMismatch(later, earlier));
            };
            Ok(SurfaceDelta {
                label: format!("({} - {})", later.date, earlier.date),
                surface,
            })
        })
        .collect()
}
