use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

use crate::error::{HalError, HalResult};

pub const VCIO_PATH: &str = "/dev/vcio";

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;
const MAJOR_NUM: u32 = 100;

/// `_IOWR(MAJOR_NUM, 0, char *)`
const IOCTL_MBOX_PROPERTY: u32 = ((IOC_READ | IOC_WRITE) << 30)
    | ((std::mem::size_of::<*mut libc::c_char>() as u32) << 16)
    | (MAJOR_NUM << 8);

/// One blocking property round-trip to the firmware.
pub trait MailboxTransport: Send {
    /// Sends `buffer` and overwrites it with the response.
    fn property_call(&mut self, buffer: &mut [u32]) -> io::Result<()>;
}

/// The `/dev/vcio` character device.
#[derive(Debug)]
pub struct VcioDevice {
    file: File,
}

impl VcioDevice {
    pub fn open() -> HalResult<Self> {
        Self::open_path(VCIO_PATH)
    }

    pub fn open_path(path: impl AsRef<Path>) -> HalResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| HalError::DeviceOpen {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self { file })
    }
}

impl MailboxTransport for VcioDevice {
    fn property_call(&mut self, buffer: &mut [u32]) -> io::Result<()> {
        // SAFETY: the driver reads the buffer size from word 0 and never touches more than that;
        // `buffer` is a live, exclusively borrowed slice of exactly that size.
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                IOCTL_MBOX_PROPERTY as _,
                buffer.as_mut_ptr(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_number_matches_iowr() {
        let expected = if cfg!(target_pointer_width = "64") {
            0xC008_6400
        } else {
            0xC004_6400
        };
        assert_eq!(IOCTL_MBOX_PROPERTY, expected);
    }

    #[test]
    fn missing_device_is_a_fatal_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = VcioDevice::open_path(dir.path().join("vcio")).unwrap_err();
        assert!(matches!(err, HalError::DeviceOpen { .. }));
        assert!(err.is_fatal());
    }
}
