//! Interferometer measurement service client.
//!
//! The interferometer is driven through the vendor's 4D WebService: each
//! acquisition is a sequence of HTTP GET operations, and measurements or
//! coefficient files are written by the service to disk.

mod client;
mod transport;

pub use client::{
    extract_coefficient_filename, Acquisition, ClientError, CoefficientFileHandle,
    MeasurementClient, DEFAULT_OUTPUT_DIR,
};
pub use transport::{Operation, ServiceTransport, WebService4D, DEFAULT_BASE_URL, DEFAULT_TIMEOUT};
