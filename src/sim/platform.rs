use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use tracing::debug;
use triomphe::Arc;

use super::nic::{Nic, NicSpec};
use crate::errors::Status;
use crate::gpu::Gpu;

/// PCI bus address, `[domain:]bus:device.function` in hex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl FromStr for PciAddress {
    type Err = Status;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let (domain, bus, devfn) = match parts.as_slice() {
            [bus, devfn] => ("0", *bus, *devfn),
            [domain, bus, devfn] => (*domain, *bus, *devfn),
            _ => return Err(Status::InvalidValue),
        };
        let (device, function) = devfn.split_once('.').ok_or(Status::InvalidValue)?;

        let domain = u16::from_str_radix(domain, 16).map_err(|_| Status::InvalidValue)?;
        let bus = u8::from_str_radix(bus, 16).map_err(|_| Status::InvalidValue)?;
        let device = u8::from_str_radix(device, 16).map_err(|_| Status::InvalidValue)?;
        let function = u8::from_str_radix(function, 16).map_err(|_| Status::InvalidValue)?;
        if device > 0x1f || function > 0x7 {
            return Err(Status::InvalidValue);
        }
        Ok(Self {
            domain,
            bus,
            device,
            function,
        })
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuSpec {
    pub vram_bytes: usize,
}

impl Default for GpuSpec {
    fn default() -> Self {
        Self {
            vram_bytes: 16 << 30,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum DeviceKind {
    Nic,
    Gpu,
}

struct NicSlot {
    nic: Nic,
    claimed: bool,
}

struct GpuSlot {
    spec: GpuSpec,
    claimed: bool,
}

#[derive(Default)]
struct Registry {
    nics: HashMap<PciAddress, NicSlot>,
    gpus: HashMap<PciAddress, GpuSlot>,
}

/// The machine's set of devices. Cheap to clone; clones share the registry.
///
/// A device may be opened by at most one owner at a time.
#[derive(Clone, Default)]
pub struct Platform {
    registry: Arc<Mutex<Registry>>,
}

impl Platform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plugs a NIC into the machine and returns its wire-side handle.
    pub fn add_nic(&self, address: &str, spec: NicSpec) -> Result<Nic, Status> {
        let pci: PciAddress = address.parse()?;
        let mut registry = self.registry.lock();
        if registry.nics.contains_key(&pci) || registry.gpus.contains_key(&pci) {
            return Err(Status::InUse);
        }
        let nic = Nic::new(pci, spec);
        registry.nics.insert(
            pci,
            NicSlot {
                nic: nic.clone(),
                claimed: false,
            },
        );
        Ok(nic)
    }

    pub fn add_gpu(&self, address: &str, spec: GpuSpec) -> Result<(), Status> {
        let pci: PciAddress = address.parse()?;
        let mut registry = self.registry.lock();
        if registry.nics.contains_key(&pci) || registry.gpus.contains_key(&pci) {
            return Err(Status::InUse);
        }
        registry.gpus.insert(
            pci,
            GpuSlot {
                spec,
                claimed: false,
            },
        );
        Ok(())
    }

    /// Wire-side handle of a plugged NIC, for injecting traffic.
    pub fn nic(&self, address: PciAddress) -> Option<Nic> {
        self.registry.lock().nics.get(&address).map(|s| s.nic.clone())
    }

    pub(crate) fn open_nic(&self, address: PciAddress) -> Result<(Nic, Claim), Status> {
        let mut registry = self.registry.lock();
        let slot = registry.nics.get_mut(&address).ok_or(Status::NotFound)?;
        if slot.claimed {
            return Err(Status::InUse);
        }
        slot.claimed = true;
        debug!(%address, "nic opened");
        Ok((slot.nic.clone(), self.claim(DeviceKind::Nic, address)))
    }

    /// Opens a GPU. Each open starts with a fresh memory account.
    pub(crate) fn open_gpu(&self, address: PciAddress) -> Result<(Gpu, Claim), Status> {
        let mut registry = self.registry.lock();
        let slot = registry.gpus.get_mut(&address).ok_or(Status::NotFound)?;
        if slot.claimed {
            return Err(Status::InUse);
        }
        slot.claimed = true;
        debug!(%address, "gpu opened");
        let gpu = Gpu::new(address, slot.spec.vram_bytes);
        Ok((gpu, self.claim(DeviceKind::Gpu, address)))
    }

    pub fn is_open(&self, address: PciAddress) -> bool {
        let registry = self.registry.lock();
        registry.nics.get(&address).is_some_and(|s| s.claimed)
            || registry.gpus.get(&address).is_some_and(|s| s.claimed)
    }

    fn claim(&self, kind: DeviceKind, address: PciAddress) -> Claim {
        Claim {
            registry: self.registry.clone(),
            kind,
            address,
        }
    }
}

/// Exclusive ownership of an opened device; closes it on drop.
pub struct Claim {
    registry: Arc<Mutex<Registry>>,
    kind: DeviceKind,
    address: PciAddress,
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut registry = self.registry.lock();
        let claimed = match self.kind {
            DeviceKind::Nic => registry.nics.get_mut(&self.address).map(|s| &mut s.claimed),
            DeviceKind::Gpu => registry.gpus.get_mut(&self.address).map(|s| &mut s.claimed),
        };
        if let Some(claimed) = claimed {
            *claimed = false;
        }
        debug!(address = %self.address, kind = ?self.kind, "device closed");
    }
}
