//! Acquisition requests to the interferometer.
//!
//! The client never retries: a failed call is reported to the caller, which
//! decides whether the step can be skipped.

use std::path::{Path, PathBuf};

use shared::zernike::LiveZernikeCoefficients;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::transport::{Operation, ServiceTransport, WebService4D};

/// Folder where the service writes coefficient files.
pub const DEFAULT_OUTPUT_DIR: &str = "C:/inetpub/wwwroot/output/";

const OUTPUT_MARKER: &str = "output/";
const STRING_END_MARKER: &str = "</string>";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("measurement service unavailable during {operation}: {message}")]
    ServiceUnavailable { operation: Operation, message: String },

    #[error("measurement service rejected {operation}: HTTP {status}")]
    ServiceError { operation: Operation, status: u16 },

    #[error("malformed {operation} response: {message}")]
    MalformedResponse { operation: Operation, message: String },

    #[error("acquisition stopped after {saved} of {requested} frames: {source}")]
    PartialAcquisitionFailure {
        saved: usize,
        requested: usize,
        #[source]
        source: Box<ClientError>,
    },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("coefficient file {path} holds {len} bytes, not a whole number of f64 values")]
    MalformedCoefficientFile { path: PathBuf, len: usize },
}

/// Name of a coefficient file in the service's output folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoefficientFileHandle {
    filename: String,
}

impl CoefficientFileHandle {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }
}

/// Result of a frame acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// One onboard-averaged measurement saved under this name.
    Averaged { file: String },
    /// Individual frames `0..frames` saved in this folder.
    Sequence { folder: PathBuf, frames: usize },
}

/// Extract the coefficient file name from a `GetZernikeCoeff` response.
///
/// The name is the text after the last `output/` and before the first
/// `</string>` that follows it.
pub fn extract_coefficient_filename(response: &str) -> Result<CoefficientFileHandle, ClientError> {
    let malformed = |message: &str| ClientError::MalformedResponse {
        operation: Operation::GetZernikeCoeff,
        message: message.to_string(),
    };

    let start = response
        .rfind(OUTPUT_MARKER)
        .ok_or_else(|| malformed("no output/ marker"))?
        + OUTPUT_MARKER.len();
    let rest = &response[start..];
    let end = rest
        .find(STRING_END_MARKER)
        .ok_or_else(|| malformed("no </string> after output/"))?;

    let filename = &rest[..end];
    if filename.is_empty() {
        return Err(malformed("empty coefficient file name"));
    }
    Ok(CoefficientFileHandle::new(filename))
}

/// Service-side file name for a measurement saved in `folder`.
fn service_path(folder: &Path, name: &str) -> String {
    folder.join(name).to_string_lossy().into_owned()
}

fn timestamp() -> String {
    chrono::Local::now().format("%H%M%S").to_string()
}

/// Client for the interferometer measurement service.
pub struct MeasurementClient<T: ServiceTransport = WebService4D> {
    transport: T,
    output_dir: PathBuf,
}

impl MeasurementClient<WebService4D> {
    /// Client for the service at `base_url` over HTTP.
    pub fn connect(base_url: &str) -> Self {
        Self::new(WebService4D::new(base_url))
    }
}

impl<T: ServiceTransport> MeasurementClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
        }
    }

    /// Override where coefficient files are read from.
    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Acquire `num_frames` frames and save them under `path`.
    ///
    /// With onboard averaging the service averages the frames and saves one
    /// measurement named `savefile` (default: local time `HHMMSS`). Without
    /// it, individual frames are saved by [`Self::acquire_sequence`].
    pub fn acquire_average(
        &mut self,
        path: &Path,
        num_frames: u32,
        use_onboard_averaging: bool,
        savefile: Option<&str>,
    ) -> Result<Acquisition, ClientError> {
        if !use_onboard_averaging {
            return self.acquire_sequence(path, num_frames);
        }

        let file = service_path(path, savefile.unwrap_or(&timestamp()));
        let params = [
            ("analysis", "analyzed".to_string()),
            ("fileName", file.clone()),
            ("count", num_frames.to_string()),
        ];

        self.transport.call(Operation::AverageMeasure, &params)?;
        self.transport.call(Operation::SaveArray, &params)?;

        info!("Saved {}-frame average to {}", num_frames, file);
        Ok(Acquisition::Averaged { file })
    }

    /// Acquire `num_frames` individual frames into a new `<path>/<HHMMSS>/`
    /// folder, saved as `0`, `1`, ...
    pub fn acquire_sequence(
        &mut self,
        path: &Path,
        num_frames: u32,
    ) -> Result<Acquisition, ClientError> {
        let folder = path.join(timestamp());
        std::fs::create_dir_all(&folder).map_err(|source| ClientError::Io {
            path: folder.clone(),
            source,
        })?;

        let requested = num_frames as usize;
        for i in 0..requested {
            let params = [
                ("analysis", "analyzed".to_string()),
                ("fileName", service_path(&folder, &i.to_string())),
            ];
            let result = self
                .transport
                .call(Operation::Measure, &params)
                .and_then(|_| self.transport.call(Operation::SaveArray, &params));

            if let Err(e) = result {
                if i == 0 {
                    return Err(e);
                }
                warn!("Frame sequence in {} stopped at frame {}: {}", folder.display(), i, e);
                return Err(ClientError::PartialAcquisitionFailure {
                    saved: i,
                    requested,
                    source: Box::new(e),
                });
            }
            debug!("Saved frame {} of {}", i + 1, requested);
        }

        info!("Saved {} frames to {}", requested, folder.display());
        Ok(Acquisition::Sequence {
            folder,
            frames: requested,
        })
    }

    /// Have the service average `num_avg` measurements and write their
    /// Zernike residual coefficients to a file.
    pub fn acquire_zernike_coefficients(
        &mut self,
        num_avg: u32,
    ) -> Result<CoefficientFileHandle, ClientError> {
        let params = [
            ("analysis", "zernikeresidual".to_string()),
            ("count", num_avg.to_string()),
            ("useNAN", "false".to_string()),
        ];

        self.transport.call(Operation::AverageMeasure, &params)?;
        let response = self.transport.call(Operation::GetZernikeCoeff, &params)?;
        let handle = extract_coefficient_filename(&response)?;

        debug!("Coefficients written to {}", handle.filename());
        Ok(handle)
    }

    /// Read a coefficient file as native-endian f64 values.
    pub fn read_coefficients(
        &self,
        handle: &CoefficientFileHandle,
    ) -> Result<LiveZernikeCoefficients, ClientError> {
        let path = self.output_dir.join(handle.filename());
        let bytes = std::fs::read(&path).map_err(|source| ClientError::Io {
            path: path.clone(),
            source,
        })?;

        if bytes.len() % std::mem::size_of::<f64>() != 0 {
            return Err(ClientError::MalformedCoefficientFile { path, len: bytes.len() });
        }

        let values: Vec<f64> = bytemuck::pod_collect_to_vec(&bytes);
        Ok(LiveZernikeCoefficients::new(values))
    }

    /// Acquire and read one averaged live coefficient vector.
    pub fn live_coefficients(
        &mut self,
        num_avg: u32,
    ) -> Result<LiveZernikeCoefficients, ClientError> {
        let handle = self.acquire_zernike_coefficients(num_avg)?;
        self.read_coefficients(&handle)
    }
}
