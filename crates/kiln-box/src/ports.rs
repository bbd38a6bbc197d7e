use kiln_core::{KilnError, Result};
use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Ports currently held by live service sandboxes.
pub type PortTable = Arc<Mutex<HashSet<u16>>>;

/// Candidates tried per acquisition, whether drawn from the range or the OS.
const MAX_PROBES: usize = 64;

/// Hands out local TCP ports that no other live service holds.
///
/// Clones share the same table, so one allocator per process (or per test)
/// is enough to keep every handed-out port distinct. The table lock is only
/// held for set lookups, never across a bind check.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    table: PortTable,
    range: Option<RangeInclusive<u16>>,
    cursor: Arc<AtomicUsize>,
}

impl PortAllocator {
    pub fn new(table: PortTable, range: Option<RangeInclusive<u16>>) -> Self {
        Self {
            table,
            range,
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Allocator with a fresh table, drawing ports from the OS.
    pub fn ephemeral() -> Self {
        Self::new(PortTable::default(), None)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<u16>> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserves a port until [`release`](Self::release). Blocks on bind
    /// checks, so async callers go through [`lease`](Self::lease).
    pub fn acquire(&self) -> Result<u16> {
        for _ in 0..MAX_PROBES {
            let candidate = match &self.range {
                Some(range) => match self.next_in_range(range) {
                    Some(port) if bindable(port) => port,
                    Some(_) => continue,
                    None => break,
                },
                None => match os_port() {
                    Some(port) => port,
                    None => continue,
                },
            };

            let mut in_use = self.lock();
            if in_use.insert(candidate) {
                debug!(port = candidate, held = in_use.len(), "port acquired");
                return Ok(candidate);
            }
        }

        Err(KilnError::PortExhausted(match &self.range {
            Some(range) => format!("no free port in {}-{}", range.start(), range.end()),
            None => "the OS kept returning ports already in use".to_string(),
        }))
    }

    /// [`acquire`](Self::acquire) off the async worker threads, returning a
    /// lease that gives the port back when dropped.
    pub async fn lease(&self) -> Result<PortLease> {
        let ports = self.clone();
        let port = tokio::task::spawn_blocking(move || ports.acquire())
            .await
            .map_err(|e| KilnError::Unknown(format!("port allocation task failed: {}", e)))??;
        Ok(PortLease {
            port,
            ports: self.clone(),
        })
    }

    pub fn release(&self, port: u16) {
        if self.lock().remove(&port) {
            debug!(port, "port released");
        }
    }

    pub fn in_use(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.lock().iter().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Next range slot after the cursor that nobody holds.
    fn next_in_range(&self, range: &RangeInclusive<u16>) -> Option<u16> {
        let start = *range.start() as usize;
        let len = (*range.end() as usize + 1).checked_sub(start)?;
        let in_use = self.lock();
        let offset = self.cursor.load(Ordering::Relaxed);

        let slot = (0..len)
            .map(|step| (offset + step) % len)
            .find(|slot| !in_use.contains(&((start + slot) as u16)))?;
        self.cursor.store(slot + 1, Ordering::Relaxed);
        Some((start + slot) as u16)
    }
}

/// A port held until the lease is dropped.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    ports: PortAllocator,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.ports.release(self.port);
    }
}

fn os_port() -> Option<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).ok()?;
    listener.local_addr().ok().map(|addr| addr.port())
}

fn bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
