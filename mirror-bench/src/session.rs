//! Measurement sessions: folder layout and the align-then-measure sequence.
//!
//! Sessions live under the mirror's storage path as
//! `<mirror>/<YYYYMMDD>/<instance>/`, with instances numbered from 0 unless
//! an explicit folder name is given.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hardware::interferometer::{Acquisition, MeasurementClient, ServiceTransport};
use hardware::StageInterface;
use thiserror::Error;
use tracing::{info, warn};

use crate::alignment::{AlignmentController, AlignmentError, AlignmentPacing, AlignmentReport};

/// Name format of date folders.
const DATE_FORMAT: &str = "%Y%m%d";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("alignment failed: {0}")]
    Alignment(#[from] AlignmentError),

    #[error("session failed: none of {requested} measurements were saved")]
    SessionFailed {
        requested: usize,
        failures: Vec<FailedMeasurement>,
    },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no session folders in {0}")]
    NoSessions(PathBuf),

    #[error("index {index} out of range for {len} folders in {path}")]
    IndexOutOfRange { path: PathBuf, index: isize, len: usize },
}

/// Which session folder a run works in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSelection {
    /// A new folder under today's date; named `folder`, or the next integer.
    New { folder: Option<String> },
    /// An existing folder, picked by index into the sorted date folders and
    /// then the sorted instance folders. Negative indices count from the end.
    Existing { date_index: isize, instance_index: isize },
}

impl Default for SessionSelection {
    fn default() -> Self {
        SessionSelection::Existing {
            date_index: -1,
            instance_index: -1,
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SessionError + '_ {
    move |source| SessionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Sorted subfolder names; integer names sort by value ahead of the rest.
pub fn sorted_subfolders(path: &Path) -> Result<Vec<String>, SessionError> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(path).map_err(io_error(path))? {
        let entry = entry.map_err(io_error(path))?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort_by_cached_key(|name| {
        let number = name.parse::<u64>().ok();
        (number.is_none(), number.unwrap_or(0), name.clone())
    });
    Ok(names)
}

/// Date folders (`YYYYMMDD`) under a mirror, oldest first.
///
/// Other folders next to the dates, such as history output, are ignored.
pub fn date_folders(mirror_path: &Path) -> Result<Vec<String>, SessionError> {
    let mut dates = sorted_subfolders(mirror_path)?;
    dates.retain(|name| is_date_folder(name));
    Ok(dates)
}

fn is_date_folder(name: &str) -> bool {
    name.len() == 8 && chrono::NaiveDate::parse_from_str(name, DATE_FORMAT).is_ok()
}

/// Index into sorted folder names; negative indices count from the end.
pub(crate) fn pick<'a>(
    names: &'a [String],
    index: isize,
    path: &Path,
) -> Result<&'a str, SessionError> {
    let len = names.len();
    if len == 0 {
        return Err(SessionError::NoSessions(path.to_path_buf()));
    }
    let resolved = if index < 0 {
        len as isize + index
    } else {
        index
    };
    if resolved < 0 || resolved >= len as isize {
        return Err(SessionError::IndexOutOfRange {
            path: path.to_path_buf(),
            index,
            len,
        });
    }
    Ok(&names[resolved as usize])
}

/// Resolve (and for new sessions, create) the session folder for a mirror.
pub fn resolve_session_path(
    mirror_path: &Path,
    selection: &SessionSelection,
) -> Result<PathBuf, SessionError> {
    let today = chrono::Local::now().format(DATE_FORMAT).to_string();
    resolve_session_path_on(mirror_path, selection, &today)
}

/// [`resolve_session_path`] with an explicit `YYYYMMDD` date for new sessions.
pub fn resolve_session_path_on(
    mirror_path: &Path,
    selection: &SessionSelection,
    date: &str,
) -> Result<PathBuf, SessionError> {
    match selection {
        SessionSelection::New { folder } => {
            let date_path = mirror_path.join(date);
            std::fs::create_dir_all(&date_path).map_err(io_error(&date_path))?;

            let instance = match folder {
                Some(name) => name.clone(),
                None => {
                    let next = sorted_subfolders(&date_path)?
                        .iter()
                        .filter_map(|name| name.parse::<u64>().ok())
                        .max()
                        .map_or(0, |n| n + 1);
                    next.to_string()
                }
            };

            let session = date_path.join(instance);
            std::fs::create_dir_all(&session).map_err(io_error(&session))?;
            info!("New session folder {}", session.display());
            Ok(session)
        }
        SessionSelection::Existing {
            date_index,
            instance_index,
        } => {
            let dates = date_folders(mirror_path)?;
            let date_path = mirror_path.join(pick(&dates, *date_index, mirror_path)?);
            let instances = sorted_subfolders(&date_path)?;
            let session = date_path.join(pick(&instances, *instance_index, &date_path)?);
            info!("Using session folder {}", session.display());
            Ok(session)
        }
    }
}

/// What a measurement run does.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementPlan {
    /// Onboard-averaged measurements saved as `0`, `1`, ...
    pub number_measurements: usize,
    /// Frames averaged per measurement and per alignment step
    pub num_avg: u32,
    /// Alignment steps before measuring; zero skips alignment
    pub alignment_iterations: usize,
    pub gain: f64,
}

impl Default for MeasurementPlan {
    fn default() -> Self {
        Self {
            number_measurements: 5,
            num_avg: 20,
            alignment_iterations: 3,
            gain: 1.0,
        }
    }
}

/// One measurement that could not be acquired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedMeasurement {
    pub index: usize,
    pub message: String,
}

/// Outcome of a measurement run.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub session_path: PathBuf,
    pub alignment: Option<AlignmentReport>,
    /// Service-side names of the saved measurements
    pub saved: Vec<String>,
    pub failures: Vec<FailedMeasurement>,
}

/// Owns the interferometer client and the stage for the length of a session.
pub struct SessionOrchestrator<T: ServiceTransport, S: StageInterface> {
    client: MeasurementClient<T>,
    stage: S,
    pacing: AlignmentPacing,
}

impl<T: ServiceTransport, S: StageInterface> SessionOrchestrator<T, S> {
    pub fn new(client: MeasurementClient<T>, stage: S) -> Self {
        Self {
            client,
            stage,
            pacing: AlignmentPacing::default(),
        }
    }

    pub fn with_pacing(mut self, pacing: AlignmentPacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn client(&self) -> &MeasurementClient<T> {
        &self.client
    }

    pub fn stage(&self) -> &S {
        &self.stage
    }

    pub fn into_parts(self) -> (MeasurementClient<T>, S) {
        (self.client, self.stage)
    }

    fn controller(&mut self) -> AlignmentController<'_, T, S> {
        AlignmentController::new(&mut self.client, &mut self.stage).with_pacing(self.pacing)
    }

    pub fn align(
        &mut self,
        iterations: usize,
        num_avg: u32,
        gain: f64,
    ) -> Result<AlignmentReport, AlignmentError> {
        self.controller().start_alignment(iterations, num_avg, gain)
    }

    pub fn hold(
        &mut self,
        duration: Duration,
        num_avg: u32,
        gain: f64,
    ) -> Result<AlignmentReport, AlignmentError> {
        self.controller().hold_alignment(duration, num_avg, gain)
    }

    /// Align, then save `number_measurements` averaged measurements in
    /// `session_path`.
    ///
    /// Individual failed measurements are recorded and skipped; the run fails
    /// only when nothing was saved.
    pub fn run(
        &mut self,
        session_path: &Path,
        plan: &MeasurementPlan,
    ) -> Result<SessionReport, SessionError> {
        let alignment = if plan.alignment_iterations > 0 {
            Some(self.align(plan.alignment_iterations, plan.num_avg, plan.gain)?)
        } else {
            None
        };

        let mut saved = Vec::new();
        let mut failures = Vec::new();
        for index in 0..plan.number_measurements {
            let savefile = index.to_string();
            match self
                .client
                .acquire_average(session_path, plan.num_avg, true, Some(&savefile))
            {
                Ok(Acquisition::Averaged { file }) => saved.push(file),
                Ok(Acquisition::Sequence { folder, .. }) => {
                    saved.push(folder.to_string_lossy().into_owned())
                }
                Err(e) => {
                    warn!("Measurement {} failed: {}", index, e);
                    failures.push(FailedMeasurement {
                        index,
                        message: e.to_string(),
                    });
                }
            }
        }

        if saved.is_empty() && plan.number_measurements > 0 {
            return Err(SessionError::SessionFailed {
                requested: plan.number_measurements,
                failures,
            });
        }

        info!(
            "Session {}: {} of {} measurements saved",
            session_path.display(),
            saved.len(),
            plan.number_measurements
        );
        Ok(SessionReport {
            session_path: session_path.to_path_buf(),
            alignment,
            saved,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_dirs(root: &Path, dirs: &[&str]) {
        for d in dirs {
            std::fs::create_dir_all(root.join(d)).unwrap();
        }
    }

    #[test]
    fn test_new_session_numbers_instances() {
        let dir = TempDir::new().unwrap();
        let selection = SessionSelection::New { folder: None };

        let first = resolve_session_path_on(dir.path(), &selection, "20260101").unwrap();
        let second = resolve_session_path_on(dir.path(), &selection, "20260101").unwrap();

        assert_eq!(first, dir.path().join("20260101").join("0"));
        assert_eq!(second, dir.path().join("20260101").join("1"));
        assert!(second.is_dir());
    }

    #[test]
    fn test_new_session_named_folder() {
        let dir = TempDir::new().unwrap();
        let selection = SessionSelection::New {
            folder: Some("after_coating".to_string()),
        };
        let path = resolve_session_path_on(dir.path(), &selection, "20260102").unwrap();
        assert_eq!(path, dir.path().join("20260102").join("after_coating"));
        assert!(path.is_dir());
    }

    #[test]
    fn test_new_session_skips_named_folders_when_numbering() {
        let dir = TempDir::new().unwrap();
        make_dirs(dir.path(), &["20260101/0", "20260101/9", "20260101/notes"]);
        let selection = SessionSelection::New { folder: None };
        let path = resolve_session_path_on(dir.path(), &selection, "20260101").unwrap();
        assert_eq!(path, dir.path().join("20260101").join("10"));
    }

    #[test]
    fn test_existing_session_negative_indices() {
        let dir = TempDir::new().unwrap();
        make_dirs(
            dir.path(),
            &["20250101/0", "20250101/1", "20250301/0", "20250301/2", "20250301/10"],
        );

        let latest = resolve_session_path(dir.path(), &SessionSelection::default()).unwrap();
        assert_eq!(latest, dir.path().join("20250301").join("10"));

        let first = resolve_session_path(
            dir.path(),
            &SessionSelection::Existing {
                date_index: 0,
                instance_index: -2,
            },
        )
        .unwrap();
        assert_eq!(first, dir.path().join("20250101").join("0"));
    }

    #[test]
    fn test_existing_session_errors() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            resolve_session_path(dir.path(), &SessionSelection::default()),
            Err(SessionError::NoSessions(_))
        ));

        make_dirs(dir.path(), &["20250101/0"]);
        let selection = SessionSelection::Existing {
            date_index: -2,
            instance_index: 0,
        };
        assert!(matches!(
            resolve_session_path(dir.path(), &selection),
            Err(SessionError::IndexOutOfRange { index: -2, len: 1, .. })
        ));
    }

    #[test]
    fn test_stray_folders_are_not_dates() {
        let dir = TempDir::new().unwrap();
        make_dirs(dir.path(), &["20250101/0", "20250102/3", "history", "notes", "20251399"]);

        let dates = date_folders(dir.path()).unwrap();
        assert_eq!(dates, vec!["20250101", "20250102"]);

        let latest = resolve_session_path(dir.path(), &SessionSelection::default()).unwrap();
        assert_eq!(latest, dir.path().join("20250102").join("3"));
    }

    #[test]
    fn test_default_plan() {
        let plan = MeasurementPlan::default();
        assert_eq!(plan.number_measurements, 5);
        assert_eq!(plan.num_avg, 20);
        assert_eq!(plan.alignment_iterations, 3);
    }
}
