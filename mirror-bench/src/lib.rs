//! Measurement and alignment workflows for the mirror test bench.
//!
//! - [`alignment`] - tip/tilt/power feedback loop driving the stage
//! - [`session`] - session folders and the align-then-measure run
//! - [`processing`] - registration, modal reports and history of saved sessions

pub mod alignment;
pub mod processing;
pub mod session;

pub use alignment::{
    compute_correction, AlignmentController, AlignmentError, AlignmentPacing, AlignmentReport,
    AlignmentState, CorrectionDeltas,
};
pub use processing::{process_session, ProcessingError, ProcessingOptions, SessionAnalysis};
pub use session::{
    resolve_session_path, MeasurementPlan, SessionError, SessionOrchestrator, SessionReport,
    SessionSelection,
};
