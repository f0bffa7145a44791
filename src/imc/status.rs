//! Customization status reporting to the virtualization platform
//!
//! The platform shows these codes to the operator who launched the
//! customization. Reporting is best effort: a failure to report is logged and
//! never changes the outcome of the run.

use super::rpc;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Log file the platform is pointed at for details
pub const CLOUDINIT_LOG_FILE: &str = "/var/log/cloud-init.log";

/// Reply to `EnableNics` when the platform can report connection state
pub const QUERY_NICS_SUPPORTED: &str = "queryNicsSupported";

/// Reply to `QueryNics` once the NICs are connected
pub const NICS_STATUS_CONNECTED: &str = "connected";

const ENABLE_NICS_RETRIES: u32 = 5;
const ENABLE_NICS_WAIT_COUNT: u32 = 5;
const ENABLE_NICS_WAIT: Duration = Duration::from_secs(1);

/// Customization state as understood by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestCustState {
    Running = 4,
    Done = 5,
}

/// Terminal error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestCustError {
    Success = 0,
    ScriptDisabled = 6,
    WrongMetaFormat = 9,
}

/// Progress and failure events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestCustEvent {
    CustomizeFailed = 100,
    NetworkSetupFailed = 101,
    EnableNics = 103,
    QueryNics = 104,
}

/// Second argument of a status update: either an error or an event code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Error(GuestCustError),
    Event(GuestCustEvent),
}

impl StatusCode {
    pub fn code(&self) -> u32 {
        match self {
            Self::Error(e) => *e as u32,
            Self::Event(e) => *e as u32,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(e) => write!(f, "{:?}({})", e, self.code()),
            Self::Event(e) => write!(f, "{:?}({})", e, self.code()),
        }
    }
}

impl From<GuestCustError> for StatusCode {
    fn from(e: GuestCustError) -> Self {
        Self::Error(e)
    }
}

impl From<GuestCustEvent> for StatusCode {
    fn from(e: GuestCustEvent) -> Self {
        Self::Event(e)
    }
}

/// Channel for customization status updates
#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Update the customization state. Returns the platform's reply, if any.
    async fn set_customization_status(
        &self,
        state: GuestCustState,
        code: StatusCode,
        message: Option<&str>,
    ) -> Option<String>;

    /// Publish a free-text guest customization status
    async fn set_gc_status(&self, message: &str);
}

/// Reports through `vmware-rpctool`
#[derive(Debug, Default, Clone)]
pub struct RpcStatusReporter;

impl RpcStatusReporter {
    pub fn new() -> Self {
        Self
    }

    async fn send(&self, request: &str) -> Option<String> {
        match rpc::send_rpc(request).await {
            Ok(out) if out.success() => Some(out.stdout.trim_end().to_string()),
            Ok(out) => {
                debug!(
                    "RPC command '{}' exited with {:?}: {}",
                    request,
                    out.code,
                    out.stderr.trim()
                );
                None
            }
            Err(e) => {
                debug!("Failed to send RPC command: {}", e);
                None
            }
        }
    }
}

/// Build the `deployPkg.update.state` request
pub fn update_state_request(state: GuestCustState, code: StatusCode, message: Option<&str>) -> String {
    let message = match message {
        Some(m) if !m.is_empty() => format!("{}@{}", CLOUDINIT_LOG_FILE, m),
        _ => CLOUDINIT_LOG_FILE.to_string(),
    };
    format!(
        "deployPkg.update.state {} {} {}",
        state as u32,
        code.code(),
        message
    )
}

#[async_trait]
impl StatusReporter for RpcStatusReporter {
    async fn set_customization_status(
        &self,
        state: GuestCustState,
        code: StatusCode,
        message: Option<&str>,
    ) -> Option<String> {
        self.send(&update_state_request(state, code, message)).await
    }

    async fn set_gc_status(&self, message: &str) {
        self.send(&format!("info-set guestinfo.gc.status {}", message))
            .await;
    }
}

/// Ask the platform to connect the NICs listed in `nics.txt` and wait until it
/// reports them connected.
pub async fn enable_nics(reporter: &dyn StatusReporter, nics: Option<&str>) {
    enable_nics_with_wait(reporter, nics, ENABLE_NICS_WAIT).await
}

/// [`enable_nics`] with a custom poll interval
pub async fn enable_nics_with_wait(
    reporter: &dyn StatusReporter,
    nics: Option<&str>,
    wait: Duration,
) {
    let nics = match nics {
        Some(n) if !n.is_empty() => n,
        _ => {
            warn!("No Nics found");
            return;
        }
    };

    for attempt in 0..ENABLE_NICS_RETRIES {
        debug!("Trying to connect interfaces, attempt {}", attempt);
        let reply = reporter
            .set_customization_status(
                GuestCustState::Running,
                GuestCustEvent::EnableNics.into(),
                Some(nics),
            )
            .await;

        let reply = match reply {
            Some(r) if !r.is_empty() => r,
            _ => {
                tokio::time::sleep(wait * ENABLE_NICS_WAIT_COUNT).await;
                continue;
            }
        };

        if reply != QUERY_NICS_SUPPORTED {
            warn!("NICS connection status query is not supported");
            return;
        }

        for count in 0..ENABLE_NICS_WAIT_COUNT {
            let status = reporter
                .set_customization_status(
                    GuestCustState::Running,
                    GuestCustEvent::QueryNics.into(),
                    Some(nics),
                )
                .await;
            if status.as_deref() == Some(NICS_STATUS_CONNECTED) {
                info!("NICS are connected on {} second", count);
                return;
            }
            tokio::time::sleep(wait).await;
        }
    }

    warn!(
        "Can't connect network interfaces after {} attempts",
        ENABLE_NICS_RETRIES
    );
}
