//! Request/response transport to the interferometer's web service.

use std::fmt;
use std::time::Duration;

use tracing::debug;

use super::client::ClientError;

/// Default endpoint of the 4D WebService on the interferometer host.
pub const DEFAULT_BASE_URL: &str = "http://localhost/WebService4D/WebService4D.asmx";

/// Global timeout for one service call. Averaged measurements take seconds;
/// long averages need a longer timeout, or none.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Service operations used by the bench.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    AverageMeasure,
    Measure,
    SaveArray,
    GetZernikeCoeff,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::AverageMeasure => "AverageMeasure",
            Operation::Measure => "Measure",
            Operation::SaveArray => "SaveArray",
            Operation::GetZernikeCoeff => "GetZernikeCoeff",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One call to the measurement service: operation plus query parameters,
/// answered with the raw response body.
pub trait ServiceTransport {
    fn call(
        &mut self,
        operation: Operation,
        params: &[(&str, String)],
    ) -> Result<String, ClientError>;
}

impl<T: ServiceTransport + ?Sized> ServiceTransport for &mut T {
    fn call(
        &mut self,
        operation: Operation,
        params: &[(&str, String)],
    ) -> Result<String, ClientError> {
        (**self).call(operation, params)
    }
}

/// Blocking HTTP transport to the 4D WebService.
///
/// Each operation is an HTTP GET on `<base_url>/<Operation>` with the
/// parameters in the query string.
pub struct WebService4D {
    base_url: String,
    timeout: Option<Duration>,
    agent: ureq::Agent,
}

impl WebService4D {
    pub fn new(base_url: &str) -> Self {
        Self::with_timeout(base_url, Some(DEFAULT_TIMEOUT))
    }

    /// Transport with a per-call timeout; `None` waits for the service
    /// indefinitely.
    pub fn with_timeout(base_url: &str, timeout: Option<Duration>) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(timeout)
            .build()
            .into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            agent,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl Default for WebService4D {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl ServiceTransport for WebService4D {
    fn call(
        &mut self,
        operation: Operation,
        params: &[(&str, String)],
    ) -> Result<String, ClientError> {
        let url = format!("{}/{}", self.base_url, operation);
        debug!("GET {} {:?}", url, params);

        let mut request = self.agent.get(&url);
        for (key, value) in params {
            request = request.query(*key, value.as_str());
        }

        let mut response = request.call().map_err(|e| match e {
            ureq::Error::StatusCode(status) => ClientError::ServiceError { operation, status },
            other => ClientError::ServiceUnavailable {
                operation,
                message: other.to_string(),
            },
        })?;

        response
            .body_mut()
            .read_to_string()
            .map_err(|e| ClientError::ServiceUnavailable {
                operation,
                message: format!("failed to read response body: {e}"),
            })
    }
}
