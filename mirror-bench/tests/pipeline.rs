//! End-to-end tests of the bench workflows against a simulated interferometer
//! and a recording stage.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use approx::assert_relative_eq;
use hardware::interferometer::{ClientError, MeasurementClient, Operation, ServiceTransport};
use hardware::{StageChannel, StageInterface};
use mirror_bench::processing::{
    history_deltas, list_dates, load_history, process_session, ProcessingOptions,
};
use mirror_bench::session::{
    resolve_session_path_on, MeasurementPlan, SessionOrchestrator, SessionSelection,
};
use mirror_bench::{AlignmentController, AlignmentPacing, SessionError};
use ndarray::Array2;
use shared::aperture::ApertureCircle;
use shared::mirror_config::{MirrorCatalog, MirrorConfig};
use shared::surface_file::{save_surface_map, SURFACE_EXTENSION};
use shared::zernike::{mode_index, ZernikeMode, UNCORRECTED};
use tempfile::TempDir;

const GRID: usize = 64;

/// Frame with `astigmatism` waves of Zernike mode 3 plus a tip offset and
/// piston, NaN outside a centred circle of radius 28 px.
fn synthetic_frame(astigmatism: f64, tip_offset: f64) -> Array2<f64> {
    let circle = ApertureCircle::new(31.5, 31.5, 28.0).unwrap();
    let astig = ZernikeMode::from_index(mode_index::ASTIGMATISM);
    Array2::from_shape_fn((GRID, GRID), |(r, c)| {
        let (rho, theta) = circle.polar(r, c);
        if rho <= 1.0 {
            astigmatism * astig.evaluate(rho, theta) + tip_offset * (c as f64 - 31.5) / 28.0 + 0.2
        } else {
            f64::NAN
        }
    })
}

/// Interferometer stand-in: saves synthetic frames on `SaveArray` and writes
/// scripted coefficient vectors on `GetZernikeCoeff`.
struct SimulatedInterferometer {
    output_dir: PathBuf,
    astigmatism: f64,
    coefficients: VecDeque<Vec<f64>>,
    failing_saves: HashSet<usize>,
    saves: usize,
    calls: Vec<Operation>,
}

impl SimulatedInterferometer {
    fn new(output_dir: &Path, astigmatism: f64) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            astigmatism,
            coefficients: VecDeque::new(),
            failing_saves: HashSet::new(),
            saves: 0,
            calls: Vec::new(),
        }
    }

    fn with_coefficients(mut self, vectors: &[Vec<f64>]) -> Self {
        self.coefficients = vectors.iter().cloned().collect();
        self
    }

    fn failing_saves(mut self, saves: &[usize]) -> Self {
        self.failing_saves = saves.iter().copied().collect();
        self
    }
}

impl ServiceTransport for SimulatedInterferometer {
    fn call(
        &mut self,
        operation: Operation,
        params: &[(&str, String)],
    ) -> Result<String, ClientError> {
        self.calls.push(operation);
        match operation {
            Operation::SaveArray => {
                let index = self.saves;
                self.saves += 1;
                if self.failing_saves.contains(&index) {
                    return Err(ClientError::ServiceError { operation, status: 500 });
                }
                let file = params
                    .iter()
                    .find(|(k, _)| *k == "fileName")
                    .map(|(_, v)| v.clone())
                    .unwrap();
                let frame = synthetic_frame(self.astigmatism, 0.05 * index as f64);
                save_surface_map(frame.view(), format!("{file}.{SURFACE_EXTENSION}")).unwrap();
                Ok(String::new())
            }
            Operation::GetZernikeCoeff => {
                let values = self.coefficients.pop_front().ok_or(ClientError::ServiceUnavailable {
                    operation,
                    message: "no coefficients scripted".to_string(),
                })?;
                let name = format!("zern_{}.bin", self.calls.len());
                let bytes = bytemuck::cast_slice::<f64, u8>(&values);
                std::fs::write(self.output_dir.join(&name), bytes).unwrap();
                Ok(format!("<string>C:/inetpub/wwwroot/output/{name}</string>"))
            }
            Operation::AverageMeasure | Operation::Measure => Ok(String::new()),
        }
    }
}

#[derive(Default)]
struct RecordingStage {
    moves: Vec<(StageChannel, f64)>,
}

impl StageInterface for RecordingStage {
    type Error = String;

    fn move_relative(&mut self, channel: StageChannel, delta: f64) -> Result<(), String> {
        self.moves.push((channel, delta));
        Ok(())
    }
}

fn client(service: SimulatedInterferometer) -> MeasurementClient<SimulatedInterferometer> {
    let output_dir = service.output_dir.clone();
    MeasurementClient::new(service).with_output_dir(output_dir)
}

fn mirror_config(root: &Path) -> MirrorConfig {
    MirrorConfig {
        storage_path: root.join("M10"),
        ..MirrorCatalog::default().mirror("10")
    }
}

#[test]
fn test_coefficient_scenario_moves() {
    let dir = TempDir::new().unwrap();
    let service = SimulatedInterferometer::new(dir.path(), 0.0)
        .with_coefficients(&[vec![0.0, 2.0, 1.0, 0.5]]);
    let mut client = client(service);
    let mut stage = RecordingStage::default();

    AlignmentController::new(&mut client, &mut stage)
        .with_pacing(AlignmentPacing::immediate())
        .start_alignment(1, 20, 1.0)
        .unwrap();

    assert_eq!(stage.moves.len(), 3);
    assert_eq!(stage.moves[0].0, StageChannel::Tilt);
    assert_relative_eq!(stage.moves[0].1, 0.009, epsilon = 1e-15);
    assert_eq!(stage.moves[1].0, StageChannel::Tip);
    assert_relative_eq!(stage.moves[1].1, 0.0175, epsilon = 1e-15);
    assert_eq!(stage.moves[2].0, StageChannel::Power);
    assert_relative_eq!(stage.moves[2].1, -0.243_902_439_024_390_24, epsilon = 1e-15);
}

#[test]
fn test_moves_are_linear_in_gain() {
    let coefficients = vec![0.1, -0.7, 0.35, 1.2, 0.05];
    let mut runs = Vec::new();

    for gain in [1.0, 2.5] {
        let dir = TempDir::new().unwrap();
        let service = SimulatedInterferometer::new(dir.path(), 0.0)
            .with_coefficients(&[coefficients.clone()]);
        let mut client = client(service);
        let mut stage = RecordingStage::default();
        AlignmentController::new(&mut client, &mut stage)
            .with_pacing(AlignmentPacing::immediate())
            .start_alignment(1, 20, gain)
            .unwrap();
        runs.push(stage.moves);
    }

    for ((channel_a, a), (channel_b, b)) in runs[0].iter().zip(&runs[1]) {
        assert_eq!(channel_a, channel_b);
        assert_relative_eq!(*b, 2.5 * a, max_relative = 1e-12);
    }
}

#[test]
fn test_zero_iterations_send_nothing() {
    let dir = TempDir::new().unwrap();
    let mut client = client(SimulatedInterferometer::new(dir.path(), 0.0));
    let mut stage = RecordingStage::default();

    let report = AlignmentController::new(&mut client, &mut stage)
        .with_pacing(AlignmentPacing::immediate())
        .start_alignment(0, 20, 1.0)
        .unwrap();

    assert_eq!(report.steps, 0);
    assert!(stage.moves.is_empty());
    assert!(client.transport().calls.is_empty());
}

#[test]
fn test_zero_hold_performs_no_steps() {
    let dir = TempDir::new().unwrap();
    let mut client = client(SimulatedInterferometer::new(dir.path(), 0.0));
    let mut stage = RecordingStage::default();

    let report = AlignmentController::new(&mut client, &mut stage)
        .with_pacing(AlignmentPacing::immediate())
        .hold_alignment(Duration::ZERO, 20, 1.0)
        .unwrap();

    assert_eq!(report.steps, 0);
    assert!(stage.moves.is_empty());
    assert!(client.transport().calls.is_empty());
}

#[test]
fn test_measure_and_process_session() {
    let dir = TempDir::new().unwrap();
    let config = mirror_config(dir.path());
    let session = resolve_session_path_on(
        &config.storage_path,
        &SessionSelection::New { folder: None },
        "20260101",
    )
    .unwrap();

    let service = SimulatedInterferometer::new(dir.path(), 0.3)
        .with_coefficients(&[vec![0.0, 0.2, -0.1, 0.05], vec![0.0, 0.05, -0.02, 0.01]]);
    let mut orchestrator = SessionOrchestrator::new(client(service), RecordingStage::default())
        .with_pacing(AlignmentPacing::immediate());

    let plan = MeasurementPlan {
        number_measurements: 3,
        num_avg: 10,
        alignment_iterations: 2,
        gain: 1.0,
    };
    let report = orchestrator.run(&session, &plan).unwrap();

    assert_eq!(report.saved.len(), 3);
    assert!(report.failures.is_empty());
    assert_eq!(report.alignment.as_ref().map(|a| a.corrections.len()), Some(2));
    assert_eq!(orchestrator.stage().moves.len(), 6);

    let analysis = process_session(&session, &config, &ProcessingOptions::default()).unwrap();
    assert_eq!(analysis.registered.frame_count(), 3);
    assert_eq!(analysis.presets.len(), 3);

    let rms = |name: &str| {
        analysis
            .presets
            .iter()
            .find(|p| p.preset.name == name)
            .and_then(|p| p.stats)
            .map(|s| s.rms)
            .unwrap()
    };
    // Astigmatism survives the uncorrected and spherical presets only.
    assert!(rms("uncorrected") > 0.05);
    assert!(rms("sph corrected") > 0.05);
    assert!(rms("trefoil corrected") < 1e-6);

    // Registration flipped the frames, so astigmatism changed sign.
    let astig = analysis.coefficients.get(mode_index::ASTIGMATISM).unwrap();
    assert_relative_eq!(astig, -0.3, max_relative = 1e-6);
}

#[test]
fn test_session_survives_single_failed_measurement() {
    let dir = TempDir::new().unwrap();
    let session = dir.path().join("session");
    std::fs::create_dir_all(&session).unwrap();

    let service = SimulatedInterferometer::new(dir.path(), 0.1).failing_saves(&[1]);
    let mut orchestrator = SessionOrchestrator::new(client(service), RecordingStage::default())
        .with_pacing(AlignmentPacing::immediate());
    let plan = MeasurementPlan {
        number_measurements: 3,
        alignment_iterations: 0,
        ..MeasurementPlan::default()
    };

    let report = orchestrator.run(&session, &plan).unwrap();
    assert!(report.alignment.is_none());
    assert_eq!(report.saved.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].index, 1);
}

#[test]
fn test_session_fails_when_nothing_saved() {
    let dir = TempDir::new().unwrap();
    let session = dir.path().join("session");
    std::fs::create_dir_all(&session).unwrap();

    let service = SimulatedInterferometer::new(dir.path(), 0.1).failing_saves(&[0, 1]);
    let mut orchestrator = SessionOrchestrator::new(client(service), RecordingStage::default())
        .with_pacing(AlignmentPacing::immediate());
    let plan = MeasurementPlan {
        number_measurements: 2,
        alignment_iterations: 0,
        ..MeasurementPlan::default()
    };

    match orchestrator.run(&session, &plan) {
        Err(SessionError::SessionFailed { requested, failures }) => {
            assert_eq!(requested, 2);
            assert_eq!(failures.len(), 2);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_alignment_failure_aborts_session() {
    let dir = TempDir::new().unwrap();
    let session = dir.path().join("session");
    std::fs::create_dir_all(&session).unwrap();

    // No coefficients scripted, so the only alignment attempt misses.
    let service = SimulatedInterferometer::new(dir.path(), 0.1);
    let mut orchestrator = SessionOrchestrator::new(client(service), RecordingStage::default())
        .with_pacing(AlignmentPacing::immediate());
    let plan = MeasurementPlan {
        number_measurements: 2,
        alignment_iterations: 1,
        ..MeasurementPlan::default()
    };

    assert!(matches!(orchestrator.run(&session, &plan), Err(SessionError::Alignment(_))));
    let (client, _) = orchestrator.into_parts();
    assert!(!client.transport().calls.contains(&Operation::SaveArray));
}

#[test]
fn test_history_delta_between_dates() {
    let dir = TempDir::new().unwrap();
    let config = mirror_config(dir.path());
    let dates = ["20250101".to_string(), "20250201".to_string()];
    let amplitudes = [0.2, 0.5];

    for (date, amplitude) in dates.iter().zip(amplitudes) {
        let selection = SessionSelection::New { folder: None };
        let session = resolve_session_path_on(&config.storage_path, &selection, date).unwrap();
        let service = SimulatedInterferometer::new(dir.path(), amplitude);
        let mut orchestrator = SessionOrchestrator::new(client(service), RecordingStage::default())
            .with_pacing(AlignmentPacing::immediate());
        let plan = MeasurementPlan {
            number_measurements: 2,
            alignment_iterations: 0,
            ..MeasurementPlan::default()
        };
        orchestrator.run(&session, &plan).unwrap();
    }

    // Earlier history output next to the dates is not a date.
    std::fs::create_dir_all(config.storage_path.join("history")).unwrap();
    assert_eq!(list_dates(&config.storage_path).unwrap(), dates);

    let entries = load_history(
        &config.storage_path,
        &dates,
        0,
        &config,
        UNCORRECTED.modes,
        &ProcessingOptions::default(),
    )
    .unwrap();
    let deltas = history_deltas(&entries).unwrap();
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].label, "(20250201 - 20250101)");

    // The pipeline is linear in the figure, so the change is 1.5x the first date.
    let first = entries[0].surface.heights();
    for (delta, base) in deltas[0].surface.heights().iter().zip(first.iter()) {
        if base.is_nan() {
            assert!(delta.is_nan());
        } else {
            assert_relative_eq!(*delta, 1.5 * base, epsilon = 1e-9);
        }
    }
}
