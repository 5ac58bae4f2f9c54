//! Register bundling and caching
//!
//! Descriptors that sit close to each other are read together. A [`Bundle`] is
//! one contiguous address span of a single function code; the first request for
//! any member refreshes the whole span in one wire read, and later requests are
//! served from the cache until the bundle goes stale.
//!
//! ```text
//! descriptors   0x10 0x12 0x14(u32)             0x30
//!               |----- bundle A: 0x10 x6 ----|  |- bundle B: 0x30 x1 -|
//! ```

use log::{debug, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::catalog::RegisterDescriptor;
use crate::error::{PollerError, PollerResult};
use crate::protocol::{ModbusFunction, RequestFrame, UnitId};
use crate::transport::ModbusTransport;
use crate::utils::format;

/// Largest address gap merged into one bundle
pub const DEFAULT_MAX_GAP: u16 = 9;

/// Age after which a bundle must be re-read
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// Contiguous span of registers read in one request
#[derive(Debug, Clone)]
pub struct Bundle {
    pub start_address: u16,
    /// Words, including the furthest member's own width
    pub length: u16,
    pub function: ModbusFunction,
    cache: HashMap<u16, u16>,
    last_fill: Option<Instant>,
    /// Refresh failed during the current sweep
    failed: bool,
}

impl Bundle {
    fn new(function: ModbusFunction, start_address: u16) -> Self {
        Self {
            start_address,
            length: 0,
            function,
            cache: HashMap::new(),
            last_fill: None,
            failed: false,
        }
    }

    /// One past the last address of the span
    pub fn end_address(&self) -> u32 {
        self.start_address as u32 + self.length as u32
    }

    /// Check whether `address` lies within the span
    pub fn contains(&self, function: ModbusFunction, address: u16) -> bool {
        self.function == function
            && address >= self.start_address
            && (address as u32) < self.end_address()
    }

    /// Check whether the whole of `[address, address + words)` lies within the span
    pub fn covers(&self, function: ModbusFunction, address: u16, words: u16) -> bool {
        self.contains(function, address) && address as u32 + words as u32 <= self.end_address()
    }

    /// Never filled, or last filled at least `ttl` before `now`
    pub fn is_stale_at(&self, now: Instant, ttl: Duration) -> bool {
        match self.last_fill {
            None => true,
            Some(filled) => now.saturating_duration_since(filled) >= ttl,
        }
    }

    /// Reset the staleness timer
    pub fn mark_fresh(&mut self, now: Instant) {
        self.last_fill = Some(now);
    }

    /// Store words read from the start of the span
    fn fill(&mut self, words: &[u16]) {
        for (offset, &word) in words.iter().enumerate() {
            self.cache.insert(self.start_address.wrapping_add(offset as u16), word);
        }
    }

    /// Cached words for `count` addresses starting at `address`
    fn cached(&self, address: u16, count: u16) -> Option<Vec<u16>> {
        (0..count)
            .map(|offset| self.cache.get(&address.wrapping_add(offset)).copied())
            .collect()
    }
}

/// Bundles of one session, built once from its descriptor catalog
#[derive(Debug, Clone)]
pub struct BundleCache {
    bundles: Vec<Bundle>,
    ttl: Duration,
}

impl BundleCache {
    /// Partition `descriptors` into bundles
    ///
    /// Per function code, addresses are scanned in ascending order; a gap larger
    /// than `max_gap`, or a span that would exceed the function's per-request
    /// limit, starts a new bundle. Each bundle covers through the furthest end
    /// (`address + word_len`) of its members.
    pub fn build(descriptors: &[RegisterDescriptor], max_gap: u16, ttl: Duration) -> Self {
        let mut members: Vec<(ModbusFunction, u16, u32)> = descriptors
            .iter()
            .map(|d| (d.function, d.address, d.end_address()))
            .collect();
        members.sort_by_key(|&(function, address, _)| (function, address));

        let mut bundles: Vec<Bundle> = Vec::new();
        let mut previous: Option<(ModbusFunction, u16)> = None;

        for (function, address, end) in members {
            let extend = match (previous, bundles.last()) {
                (Some((prev_function, prev_address)), Some(current)) => {
                    prev_function == function
                        && address - prev_address <= max_gap
                        && end.max(current.end_address()) - current.start_address as u32
                            <= function.max_quantity() as u32
                }
                _ => false,
            };

            if !extend {
                bundles.push(Bundle::new(function, address));
            }
            if let Some(current) = bundles.last_mut() {
                let span = end.max(current.end_address()) - current.start_address as u32;
                current.length = span.min(u16::MAX as u32) as u16;
            }
            previous = Some((function, address));
        }

        debug!("Built {} bundle(s) from {} descriptor(s)", bundles.len(), descriptors.len());
        Self { bundles, ttl }
    }

    pub fn bundles(&self) -> &[Bundle] {
        &self.bundles
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Forget refresh failures of the previous sweep
    pub fn begin_sweep(&mut self) {
        for bundle in &mut self.bundles {
            bundle.failed = false;
        }
    }

    /// Index of the bundle holding the full value of `descriptor`
    fn locate(&self, descriptor: &RegisterDescriptor) -> PollerResult<usize> {
        let words = descriptor.word_len();
        self.bundles
            .iter()
            .position(|b| b.covers(descriptor.function, descriptor.address, words))
            .ok_or_else(|| {
                PollerError::address_not_bundled(descriptor.address, descriptor.function.to_u8())
            })
    }

    /// Words of `descriptor`, refreshing its bundle first when stale
    ///
    /// A stale bundle is refreshed with exactly one read of its whole span. A
    /// read returning fewer words than the span leaves the bundle stale and
    /// fails with `InsufficientData`. Once a refresh has failed, other members
    /// of the bundle fail without touching the wire until [`begin_sweep`].
    ///
    /// [`begin_sweep`]: BundleCache::begin_sweep
    ///
    /// # Errors
    ///
    /// - `AddressNotBundled` when no bundle covers the descriptor
    /// - `InsufficientData` for short reads or cache misses
    /// - any transport error, unchanged
    pub async fn get_data<T>(
        &mut self,
        transport: &mut T,
        unit_id: UnitId,
        descriptor: &RegisterDescriptor,
    ) -> PollerResult<Vec<u16>>
    where
        T: ModbusTransport + ?Sized,
    {
        let index = self.locate(descriptor)?;
        let ttl = self.ttl;
        let bundle = &mut self.bundles[index];

        if bundle.is_stale_at(Instant::now(), ttl) {
            if bundle.failed {
                debug!(
                    "Bundle {:#06X} already failed this sweep, skipping {:#06X}",
                    bundle.start_address, descriptor.address
                );
                return Err(PollerError::insufficient_data(
                    descriptor.address,
                    descriptor.word_len() as usize,
                    0,
                ));
            }

            let request = RequestFrame::new(unit_id, bundle.function, bundle.start_address, bundle.length);
            let words = match transport.send_receive(&request).await {
                Ok(response) => response.words(),
                Err(e) => {
                    bundle.failed = true;
                    return Err(e);
                }
            };
            if words.len() < bundle.length as usize {
                bundle.failed = true;
                warn!(
                    "Bundle {:#06X} x{} answered with {} word(s)",
                    bundle.start_address,
                    bundle.length,
                    words.len()
                );
                return Err(PollerError::insufficient_data(
                    bundle.start_address,
                    bundle.length as usize,
                    words.len(),
                ));
            }
            // Coil replies are padded to whole bytes; keep only the span.
            let span = &words[..bundle.length as usize];
            debug!(
                "Bundle {:#06X} x{} filled: {}",
                bundle.start_address,
                bundle.length,
                format::registers_to_hex(span)
            );
            bundle.fill(span);
            bundle.mark_fresh(Instant::now());
        }

        let count = descriptor.word_len();
        bundle.cached(descriptor.address, count).ok_or_else(|| {
            PollerError::insufficient_data(descriptor.address, count as usize, 0)
        })
    }
}
