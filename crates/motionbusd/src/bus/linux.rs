//! spidev + sysfs GPIO backend.

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use static_assertions::assert_eq_size;

use motionbus_core::config::BusConfig;

use super::{Bus, BusError};

const SPI_IOC_MAGIC: u8 = b'k';
const SPI_MODE_0: u8 = 0;
const BITS_PER_WORD: u8 = 8;

/// Interval between two reads of the ready line.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// `struct spi_ioc_transfer` from linux/spi/spidev.h.
#[derive(Debug, Default)]
#[repr(C)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

assert_eq_size!(SpiIocTransfer, [u8; 32]);

nix::ioctl_write_ptr!(spi_write_mode, SPI_IOC_MAGIC, 1, u8);
nix::ioctl_write_ptr!(spi_write_bits_per_word, SPI_IOC_MAGIC, 3, u8);
nix::ioctl_write_ptr!(spi_write_max_speed_hz, SPI_IOC_MAGIC, 4, u32);
nix::ioctl_write_buf!(spi_message, SPI_IOC_MAGIC, 0, SpiIocTransfer);

pub struct LinuxBus {
    spi: File,
    speed_hz: u32,
    ready: GpioInput,
}

impl LinuxBus {
    pub fn open(config: &BusConfig) -> Result<Self, BusError> {
        let spi = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.spi_device)?;
        let fd = spi.as_raw_fd();
        // SAFETY: fd is an open spidev descriptor and every argument points
        // at a live value of the type the request expects.
        unsafe {
            spi_write_mode(fd, &SPI_MODE_0)?;
            spi_write_bits_per_word(fd, &BITS_PER_WORD)?;
            spi_write_max_speed_hz(fd, &config.spi_speed_hz)?;
        }

        let ready = GpioInput::open(config.transfer_ready_pin)?;
        tracing::info!(
            device = %config.spi_device.display(),
            speed_hz = config.spi_speed_hz,
            ready_pin = config.transfer_ready_pin,
            "spi bus opened"
        );
        Ok(Self {
            spi,
            speed_hz: config.spi_speed_hz,
            ready,
        })
    }
}

impl Bus for LinuxBus {
    fn wait_ready(
        &mut self,
        level: bool,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), BusError>> + Send {
        async move {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if self.ready.read()? == level {
                    return Ok(());
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(BusError::Timeout);
                }
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        }
    }

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        if tx.len() != rx.len() {
            return Err(BusError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tx and rx lengths differ",
            )));
        }
        let transfer = SpiIocTransfer {
            tx_buf: tx.as_ptr() as u64,
            rx_buf: rx.as_mut_ptr() as u64,
            len: tx.len() as u32,
            speed_hz: self.speed_hz,
            bits_per_word: BITS_PER_WORD,
            ..Default::default()
        };
        // SAFETY: both buffers outlive the ioctl and are `len` bytes long.
        unsafe { spi_message(self.spi.as_raw_fd(), &[transfer]) }?;
        Ok(())
    }
}

// ── Ready line ────────────────────────────────────────────────────────────────

/// A GPIO input read through sysfs.
struct GpioInput {
    value: File,
}

impl GpioInput {
    fn open(pin: u32) -> std::io::Result<Self> {
        let dir = PathBuf::from(format!("/sys/class/gpio/gpio{pin}"));
        if !dir.exists() {
            std::fs::write("/sys/class/gpio/export", pin.to_string())?;
        }
        write_attribute(&dir, "direction", "in")?;
        let value = File::open(dir.join("value"))?;
        Ok(Self { value })
    }

    fn read(&self) -> std::io::Result<bool> {
        let mut level = [0u8; 1];
        self.value.read_at(&mut level, 0)?;
        Ok(level[0] == b'1')
    }
}

fn write_attribute(dir: &Path, name: &str, value: &str) -> std::io::Result<()> {
    std::fs::write(dir.join(name), value)
}
