//! Bus access: the raw full-duplex exchange and the transfer-ready line.
//!
//! Every exchange is preceded by a wait for the ready line. The transport
//! decides which level to wait for; the bus only reports whether the line got
//! there in time.

mod linux;
#[cfg(test)]
pub mod simulated;

pub use linux::LinuxBus;

use std::future::Future;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("timed out waiting for the transfer ready line")]
    Timeout,

    #[error("firmware is not available")]
    NotAvailable,

    #[error("bus I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("spi ioctl failed: {0}")]
    Spi(#[from] nix::errno::Errno),
}

impl BusError {
    /// Errors that mean the peer stopped answering rather than a local fault.
    pub fn is_link_loss(&self) -> bool {
        matches!(self, Self::Timeout | Self::NotAvailable)
    }
}

pub trait Bus: Send {
    /// Wait until the ready line reads `level`.
    fn wait_ready(
        &mut self,
        level: bool,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Clock out `tx` while clocking in the same number of bytes into `rx`.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError>;
}
