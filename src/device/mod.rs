//! Compute device selection and release.
//!
//! The [`DeviceManager`] owns the lifetime of any loaded local model: a
//! retiring provider is handed back to [`DeviceManager::release`], which
//! drops its weights and synchronizes the device before a successor is
//! allowed to load. Only one local provider occupies the device at a time.

use candle_core::Device;

/// Which class of device is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// CUDA or Metal accelerator.
    Accelerator,
    /// General-purpose processor.
    Cpu,
}

/// Caller preference when acquiring a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Use an accelerator when one is available.
    #[default]
    Auto,
    /// Force CPU inference.
    Cpu,
}

/// Tracks the active compute device and tears down retired model state.
#[derive(Debug, Default)]
pub struct DeviceManager {
    active: Option<Device>,
}

impl DeviceManager {
    /// Creates a manager with no active device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects a device, preferring an accelerator unless told otherwise.
    ///
    /// Falls back to CPU when no accelerator is compiled in or present.
    pub fn acquire(&mut self, preferred: DevicePreference) -> Device {
        let device = match preferred {
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Auto => Self::best_available(),
        };
        tracing::debug!(kind = ?Self::kind_of(&device), "acquired compute device");
        self.active = Some(device.clone());
        device
    }

    /// Drops a retired resource (typically a local provider) and waits for
    /// the device to finish freeing its memory.
    ///
    /// Must complete before a new provider claims the device.
    pub fn release<T>(&mut self, held: T) {
        drop(held);
        if let Some(device) = self.active.take() {
            if let Err(error) = device.synchronize() {
                tracing::warn!(%error, "device synchronize failed during release");
            }
            tracing::debug!(kind = ?Self::kind_of(&device), "released compute device");
        }
    }

    /// Returns the active device, if any.
    pub fn active(&self) -> Option<&Device> {
        self.active.as_ref()
    }

    /// Returns the kind of the active device, if any.
    pub fn active_kind(&self) -> Option<DeviceKind> {
        self.active.as_ref().map(Self::kind_of)
    }

    fn kind_of(device: &Device) -> DeviceKind {
        match device {
            Device::Cpu => DeviceKind::Cpu,
            _ => DeviceKind::Accelerator,
        }
    }

    fn best_available() -> Device {
        #[cfg(feature = "metal")]
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
        Device::cuda_if_available(0).unwrap_or(Device::Cpu)
    }
}
