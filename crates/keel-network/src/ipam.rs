//! Bitmap-backed IP address management.
//!
//! Every subnet owns one bitmap, stored as a string of `'0'`/`'1'`
//! characters keyed by the canonical subnet CIDR in a single JSON file.
//! Offset `i` of a bitmap maps to host address `network + 1 + i`, so
//! offset 0 is the gateway and is reserved as soon as the bitmap exists.
//!
//! Every read-modify-write holds an exclusive `flock` on a sidecar lock
//! file and replaces the pool file atomically.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ipnetwork::Ipv4Network;
use keel_common::{KeelError, KeelResult};

/// Persisted subnet bitmaps, keyed by canonical CIDR.
type SubnetPools = BTreeMap<String, String>;

const FREE: u8 = b'0';
const TAKEN: u8 = b'1';

/// IP allocator persisted at a fixed path.
#[derive(Debug, Clone)]
pub struct Ipam {
    path: PathBuf,
}

impl Ipam {
    /// Create an allocator backed by the given file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the pool file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ensure a bitmap exists for `subnet` and return its gateway address.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::SubnetExhausted`] if the subnet has no usable
    /// host addresses, or an I/O error if the pool cannot be persisted.
    pub fn reserve_gateway(&self, subnet: &Ipv4Network) -> KeelResult<Ipv4Addr> {
        let subnet = canonical(subnet);
        if capacity(&subnet) == 0 {
            return Err(KeelError::SubnetExhausted {
                subnet: subnet.to_string(),
            });
        }

        self.with_pools(|pools| {
            pools
                .entry(subnet.to_string())
                .or_insert_with(|| new_bitmap(&subnet));
            Ok(())
        })?;

        Ok(address_at(&subnet, 0))
    }

    /// Allocate the lowest free address in `subnet`.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::SubnetExhausted`] when every address is taken.
    pub fn allocate(&self, subnet: &Ipv4Network) -> KeelResult<Ipv4Addr> {
        let subnet = canonical(subnet);
        let key = subnet.to_string();

        let offset = self.with_pools(|pools| {
            let bitmap = pools
                .entry(key.clone())
                .or_insert_with(|| new_bitmap(&subnet));

            let mut bits = bitmap.as_bytes().to_vec();
            let Some(offset) = bits.iter().position(|&b| b == FREE) else {
                return Err(KeelError::SubnetExhausted {
                    subnet: key.clone(),
                });
            };
            bits[offset] = TAKEN;
            *bitmap = to_bitmap(&bits);
            Ok(offset)
        })?;

        let ip = address_at(&subnet, offset);
        tracing::debug!(subnet = %key, %ip, offset, "Allocated address");
        Ok(ip)
    }

    /// Release `ip` back to `subnet`.
    ///
    /// Returns `false` without touching the pool when the address lies
    /// outside the subnet, is the gateway, or is already free.
    ///
    /// # Errors
    ///
    /// Returns an error only if the pool cannot be read or written.
    pub fn release(&self, subnet: &Ipv4Network, ip: Ipv4Addr) -> KeelResult<bool> {
        let subnet = canonical(subnet);
        let key = subnet.to_string();

        let Some(offset) = offset_of(&subnet, ip) else {
            tracing::warn!(subnet = %key, %ip, "Address is not a host address of subnet");
            return Ok(false);
        };
        if offset == 0 {
            tracing::debug!(subnet = %key, %ip, "Gateway address is never released");
            return Ok(false);
        }

        let released = self.with_pools(|pools| {
            let Some(bitmap) = pools.get_mut(&key) else {
                return Ok(false);
            };
            let mut bits = bitmap.as_bytes().to_vec();
            match bits.get(offset) {
                Some(&TAKEN) => {
                    bits[offset] = FREE;
                    *bitmap = to_bitmap(&bits);
                    Ok(true)
                }
                _ => Ok(false),
            }
        })?;

        if released {
            tracing::debug!(subnet = %key, %ip, "Released address");
        } else {
            tracing::debug!(subnet = %key, %ip, "Address already free");
        }
        Ok(released)
    }

    /// Drop the whole bitmap of `subnet`, gateway included.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be read or written.
    pub fn release_subnet(&self, subnet: &Ipv4Network) -> KeelResult<()> {
        let key = canonical(subnet).to_string();
        self.with_pools(|pools| Ok(pools.remove(&key).is_some()))?;
        tracing::debug!(subnet = %key, "Dropped subnet pool");
        Ok(())
    }

    /// Current bitmap of `subnet`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool file exists but cannot be parsed.
    pub fn bitmap(&self, subnet: &Ipv4Network) -> KeelResult<Option<String>> {
        let key = canonical(subnet).to_string();
        Ok(self.load()?.remove(&key))
    }

    /// Run `f` against the pools while holding the lock, then save them.
    fn with_pools<T>(&self, f: impl FnOnce(&mut SubnetPools) -> KeelResult<T>) -> KeelResult<T> {
        let _lock = self.lock()?;
        let mut pools = self.load()?;
        let result = f(&mut pools)?;
        self.save(&pools)?;
        Ok(result)
    }

    fn lock(&self) -> KeelResult<File> {
        let dir = self.parent_dir();
        std::fs::create_dir_all(dir)?;

        let lock_path = self.path.with_extension("lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        rustix::fs::flock(&file, rustix::fs::FlockOperation::LockExclusive)
            .map_err(|e| KeelError::Io(e.into()))?;
        Ok(file)
    }

    fn load(&self) -> KeelResult<SubnetPools> {
        match std::fs::read_to_string(&self.path) {
            Ok(json) if json.trim().is_empty() => Ok(SubnetPools::new()),
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SubnetPools::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, pools: &SubnetPools) -> KeelResult<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(self.parent_dir())?;
        tmp.write_all(serde_json::to_string(pools)?.as_bytes())?;
        tmp.persist(&self.path).map_err(|e| KeelError::Io(e.error))?;
        Ok(())
    }

    fn parent_dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }
}

/// Normalize `subnet` to its network address, e.g. `10.0.0.1/24` to `10.0.0.0/24`.
fn canonical(subnet: &Ipv4Network) -> Ipv4Network {
    Ipv4Network::new(subnet.network(), subnet.prefix()).unwrap_or(*subnet)
}

/// Number of allocatable host addresses, excluding network and broadcast.
fn capacity(subnet: &Ipv4Network) -> usize {
    let host_bits = 32 - u32::from(subnet.prefix());
    let total = 1u64 << host_bits;
    usize::try_from(total.saturating_sub(2)).unwrap_or(usize::MAX)
}

fn new_bitmap(subnet: &Ipv4Network) -> String {
    let mut bits = vec![FREE; capacity(subnet)];
    if let Some(gateway) = bits.first_mut() {
        *gateway = TAKEN;
    }
    to_bitmap(&bits)
}

fn to_bitmap(bits: &[u8]) -> String {
    bits.iter().map(|&b| char::from(b)).collect()
}

fn address_at(subnet: &Ipv4Network, offset: usize) -> Ipv4Addr {
    let base = u32::from(subnet.network());
    let offset = u32::try_from(offset).unwrap_or(u32::MAX);
    Ipv4Addr::from(base.saturating_add(1).saturating_add(offset))
}

fn offset_of(subnet: &Ipv4Network, ip: Ipv4Addr) -> Option<usize> {
    if !subnet.contains(ip) {
        return None;
    }
    let delta = u32::from(ip).checked_sub(u32::from(subnet.network()))?;
    let offset = usize::try_from(delta.checked_sub(1)?).ok()?;
    (offset < capacity(subnet)).then_some(offset)
}
