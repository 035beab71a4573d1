//! Closed-loop tip/tilt/power alignment.
//!
//! Each step reads an averaged live Zernike vector from the interferometer,
//! converts tip, tilt and power into stage moves through a fixed
//! proportional law, and issues one relative move per stage channel.

use std::thread;
use std::time::{Duration, Instant};

use hardware::interferometer::{ClientError, MeasurementClient, ServiceTransport};
use hardware::{StageChannel, StageInterface};
use shared::zernike::LiveZernikeCoefficients;
use thiserror::Error;
use tracing::{info, warn};

/// Stage travel per unit of tilt coefficient, before the gain.
const TILT_SCALE: f64 = 0.18;
/// Stage travel per unit of tip coefficient, before the gain.
const TIP_SCALE: f64 = 0.175;
const TIP_TILT_DIVISOR: f64 = 20.0;
/// Power moves the focus stage against the sign of the coefficient.
const POWER_SCALE: f64 = -2.0;
const POWER_DIVISOR: f64 = 4.1;

#[derive(Error, Debug)]
pub enum AlignmentError {
    #[error("{channel} fault at step {step}: {message} (coefficients {coefficients:?})")]
    ActuatorFault {
        step: usize,
        channel: StageChannel,
        coefficients: Vec<f64>,
        message: String,
    },

    #[error("coefficient acquisition failed at step {step}: {source}")]
    Acquisition {
        step: usize,
        #[source]
        source: ClientError,
    },

    #[error("step {step}: coefficient vector has {len} values, need at least 4")]
    IncompleteCoefficients { step: usize, len: usize },

    #[error("controller is in the failed state after an actuator fault")]
    ControllerFailed,
}

/// Relative stage moves for one correction step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectionDeltas {
    pub tilt: f64,
    pub tip: f64,
    pub power: f64,
}

impl CorrectionDeltas {
    /// Moves in the order they are issued: tilt, tip, power.
    pub fn moves(&self) -> [(StageChannel, f64); 3] {
        [
            (StageChannel::Tilt, self.tilt),
            (StageChannel::Tip, self.tip),
            (StageChannel::Power, self.power),
        ]
    }
}

/// Apply the gain law to a live coefficient vector.
///
/// Returns `None` if the vector is too short to carry power.
pub fn compute_correction(
    coefficients: &LiveZernikeCoefficients,
    gain: f64,
) -> Option<CorrectionDeltas> {
    let tip = coefficients.tip()?;
    let tilt = coefficients.tilt()?;
    let power = coefficients.power()?;

    Some(CorrectionDeltas {
        tilt: gain * TILT_SCALE * tilt / TIP_TILT_DIVISOR,
        tip: gain * TIP_SCALE * tip / TIP_TILT_DIVISOR,
        power: POWER_SCALE * gain * power / POWER_DIVISOR,
    })
}

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentState {
    Idle,
    Correcting { step: usize },
    Failed,
}

/// Sleep intervals between correction steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentPacing {
    /// Pause after each step of a fixed-iteration run
    pub step_interval: Duration,
    /// Pause after each step while holding alignment
    pub hold_interval: Duration,
}

impl Default for AlignmentPacing {
    fn default() -> Self {
        Self {
            step_interval: Duration::from_secs(1),
            hold_interval: Duration::from_secs(10),
        }
    }
}

impl AlignmentPacing {
    /// No pauses at all, for dry runs against simulated equipment.
    pub fn immediate() -> Self {
        Self {
            step_interval: Duration::ZERO,
            hold_interval: Duration::ZERO,
        }
    }
}

/// Summary of one alignment run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlignmentReport {
    /// Steps started, including skipped ones
    pub steps: usize,
    /// Corrections applied, in order
    pub corrections: Vec<CorrectionDeltas>,
    /// Steps skipped because no usable coefficient vector arrived
    pub missed: usize,
    pub last_coefficients: Option<LiveZernikeCoefficients>,
}

/// Tip/tilt/power feedback loop over a borrowed client and stage.
pub struct AlignmentController<'a, T: ServiceTransport, S: StageInterface> {
    client: &'a mut MeasurementClient<T>,
    stage: &'a mut S,
    pacing: AlignmentPacing,
    state: AlignmentState,
}

impl<'a, T: ServiceTransport, S: StageInterface> AlignmentController<'a, T, S> {
    pub fn new(client: &'a mut MeasurementClient<T>, stage: &'a mut S) -> Self {
        Self {
            client,
            stage,
            pacing: AlignmentPacing::default(),
            state: AlignmentState::Idle,
        }
    }

    pub fn with_pacing(mut self, pacing: AlignmentPacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn state(&self) -> AlignmentState {
        self.state
    }

    /// Run exactly `iterations` correction steps.
    pub fn start_alignment(
        &mut self,
        iterations: usize,
        num_avg: u32,
        gain: f64,
    ) -> Result<AlignmentReport, AlignmentError> {
        self.ensure_runnable()?;
        info!("Starting alignment: {} iterations, {} frames, gain {}", iterations, num_avg, gain);

        let mut report = AlignmentReport::default();
        for step in 0..iterations {
            let final_attempt = step + 1 == iterations;
            self.step(step, num_avg, gain, final_attempt, &mut report)?;
            thread::sleep(self.pacing.step_interval);
        }

        self.state = AlignmentState::Idle;
        Ok(report)
    }

    /// Keep correcting until `duration` has elapsed.
    ///
    /// The elapsed time is checked before every step, so a zero duration
    /// performs no steps.
    pub fn hold_alignment(
        &mut self,
        duration: Duration,
        num_avg: u32,
        gain: f64,
    ) -> Result<AlignmentReport, AlignmentError> {
        self.ensure_runnable()?;
        info!("Holding alignment for {:?}: {} frames, gain {}", duration, num_avg, gain);

        let start = Instant::now();
        let mut report = AlignmentReport::default();
        let mut step = 0;
        while start.elapsed() < duration {
            // No further step fits once the pause would run past the deadline.
            let final_attempt = start.elapsed() + self.pacing.hold_interval >= duration;
            self.step(step, num_avg, gain, final_attempt, &mut report)?;
            step += 1;
            thread::sleep(self.pacing.hold_interval);
        }

        self.state = AlignmentState::Idle;
        Ok(report)
    }

    fn ensure_runnable(&self) -> Result<(), AlignmentError> {
        if self.state == AlignmentState::Failed {
            return Err(AlignmentError::ControllerFailed);
        }
        Ok(())
    }

    fn step(
        &mut self,
        step: usize,
        num_avg: u32,
        gain: f64,
        final_attempt: bool,
        report: &mut AlignmentReport,
    ) -> Result<(), AlignmentError> {
        self.state = AlignmentState::Correcting { step };
        report.steps += 1;

        let coefficients = match self.client.live_coefficients(num_avg) {
            Ok(coefficients) => coefficients,
            Err(source) => {
                let error = AlignmentError::Acquisition { step, source };
                return self.miss(report, final_attempt, error);
            }
        };

        let Some(deltas) = compute_correction(&coefficients, gain) else {
            let len = coefficients.len();
            let error = AlignmentError::IncompleteCoefficients { step, len };
            return self.miss(report, final_attempt, error);
        };

        info!(
            "Step {}: tilt {:.4} tip {:.4} power {:.4} -> moves {:+.6} {:+.6} {:+.6}",
            step,
            coefficients.tilt().unwrap_or(f64::NAN),
            coefficients.tip().unwrap_or(f64::NAN),
            coefficients.power().unwrap_or(f64::NAN),
            deltas.tilt,
            deltas.tip,
            deltas.power
        );

        for (channel, delta) in deltas.moves() {
            if let Err(e) = self.stage.move_relative(channel, delta) {
                self.state = AlignmentState::Failed;
                return Err(AlignmentError::ActuatorFault {
                    step,
                    channel,
                    coefficients: coefficients.values().to_vec(),
                    message: e.to_string(),
                });
            }
        }

        report.corrections.push(deltas);
        report.last_coefficients = Some(coefficients);
        Ok(())
    }

    fn miss(
        &mut self,
        report: &mut AlignmentReport,
        final_attempt: bool,
        error: AlignmentError,
    ) -> Result<(), AlignmentError> {
        if final_attempt {
            self.state = AlignmentState::Idle;
            return Err(error);
        }
        warn!("Skipping alignment step: {}", error);
        report.missed += 1;
        Ok(())
    }
}
