//! Device handle management.
//!
//! A [`Device`] wraps one open driver handle. It is cheap to clone; all
//! clones share the handle, the per-device call lock, and the metadata
//! fetched at open. The handle is closed when the last clone is dropped or
//! on an explicit [`Device::close`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use daq_core::{
    ConnectionType, DeviceCapabilities, DeviceHandle, DeviceModel, DriverError, DriverErrorKind,
    HandleInfo, VendorDriver,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ErrorContext, Result, StreamError};

struct DeviceInner {
    driver: Arc<dyn VendorDriver>,
    handle: DeviceHandle,
    info: HandleInfo,
    capabilities: DeviceCapabilities,
    /// Serializes driver calls for this handle
    ffi_lock: Mutex<()>,
    /// Held by the one stream session that owns the device
    claimed: AtomicBool,
    closed: AtomicBool,
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = self.ffi_lock.lock();
        match self.driver.close(self.handle) {
            Ok(()) => debug!(handle = %self.handle, "Closed device"),
            Err(e) => warn!(handle = %self.handle, error = %e, "Failed to close device"),
        }
    }
}

/// An open data-acquisition device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("driver", &self.inner.driver.name())
            .field("handle", &self.inner.handle)
            .field("model", &self.inner.info.model)
            .field("serial_number", &self.inner.info.serial_number)
            .finish()
    }
}

impl Device {
    /// Open a device through `driver` and cache its metadata.
    ///
    /// # Arguments
    ///
    /// * `model` - Hardware model, or `Any` for the first found
    /// * `connection` - Transport, or `Any` for the fastest
    /// * `identifier` - Serial number, IP address, name, or `"ANY"`
    pub fn open(
        driver: Arc<dyn VendorDriver>,
        model: DeviceModel,
        connection: ConnectionType,
        identifier: &str,
    ) -> Result<Self> {
        let handle = driver
            .open(model, connection, identifier)
            .map_err(|e| StreamError::from_driver(e, ErrorContext::new("open")))?;

        let metadata = driver.handle_info(handle).and_then(|info| {
            driver
                .capabilities(handle)
                .map(|capabilities| (info, capabilities))
        });
        let (info, capabilities) = match metadata {
            Ok(metadata) => metadata,
            Err(e) => {
                if let Err(close_err) = driver.close(handle) {
                    warn!(%handle, error = %close_err, "Failed to close handle after open error");
                }
                return Err(StreamError::from_driver(
                    e,
                    ErrorContext::new("open").handle(handle),
                ));
            }
        };

        info!(
            driver = driver.name(),
            %handle,
            model = %info.model,
            connection = %info.connection,
            serial = info.serial_number,
            channels = capabilities.channels.len(),
            "Opened device"
        );

        Ok(Self {
            inner: Arc::new(DeviceInner {
                driver,
                handle,
                info,
                capabilities,
                ffi_lock: Mutex::new(()),
                claimed: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Driver handle.
    pub fn handle(&self) -> DeviceHandle {
        self.inner.handle
    }

    /// Metadata reported by the device at open.
    pub fn info(&self) -> &HandleInfo {
        &self.inner.info
    }

    /// Declared capabilities, fetched once at open.
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.inner.capabilities
    }

    /// Name of the backing driver.
    pub fn driver_name(&self) -> &str {
        self.inner.driver.name()
    }

    /// True once the handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Execute a driver call with the per-device lock held.
    pub(crate) fn with_driver<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&dyn VendorDriver, DeviceHandle) -> std::result::Result<R, DriverError>,
    ) -> Result<R> {
        if self.is_closed() {
            return Err(StreamError::Transport {
                context: ErrorContext::new(operation).handle(self.inner.handle),
                source: DriverError::new(
                    self.driver_name(),
                    DriverErrorKind::Disconnected,
                    "device handle is closed",
                ),
            });
        }
        let _guard = self.inner.ffi_lock.lock();
        f(self.inner.driver.as_ref(), self.inner.handle).map_err(|e| {
            StreamError::from_driver(e, ErrorContext::new(operation).handle(self.inner.handle))
        })
    }

    /// Take exclusive ownership for one stream session.
    ///
    /// A second claim while the first is alive fails with a `Busy`
    /// transport error.
    pub(crate) fn claim(&self) -> Result<SessionClaim> {
        if self
            .inner
            .claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StreamError::Transport {
                context: ErrorContext::new("claim").handle(self.inner.handle),
                source: DriverError::new(
                    self.driver_name(),
                    DriverErrorKind::Busy,
                    "device already owned by another stream session",
                ),
            });
        }
        debug!(handle = %self.inner.handle, "Claimed device");
        Ok(SessionClaim {
            device: self.clone(),
        })
    }

    /// True while a coordinator owns the device.
    pub fn is_claimed(&self) -> bool {
        self.inner.claimed.load(Ordering::SeqCst)
    }

    /// Close the driver handle. Further driver calls fail.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.inner.ffi_lock.lock();
        self.inner
            .driver
            .close(self.inner.handle)
            .map_err(|e| StreamError::from_driver(e, ErrorContext::new("close").handle(self.inner.handle)))?;
        info!(handle = %self.inner.handle, "Closed device");
        Ok(())
    }
}

/// Exclusive ownership of a [`Device`]; released on drop.
#[derive(Debug)]
pub(crate) struct SessionClaim {
    device: Device,
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        self.device.inner.claimed.store(false, Ordering::SeqCst);
        debug!(handle = %self.device.inner.handle, "Released device");
    }
}
