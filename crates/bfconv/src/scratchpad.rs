//! One pre-sized temporary allocation per primitive, split into named regions.
//!
//! Creation books regions through a [`Registrar`]; the resulting [`ScratchpadRegistry`] is
//! frozen and shared by every [`Scratchpad`] allocated for that primitive. Execution turns a
//! scratchpad into a [`ScratchpadGrant`] that hands out each region at most once, so regions
//! are disjoint borrows of the same allocation.

use std::fmt;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use smallvec::SmallVec;

use crate::error::{ConvError, ConvResult};

/// Alignment of every booked region, in bytes.
pub const SCRATCHPAD_ALIGN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScratchpadKey {
    /// Bias copied into a buffer of whole channel blocks.
    ConvPaddedBias,
    /// Per-thread staged copy of the source.
    ConvTrSrc,
    /// Per-thread partial sums of a split reduction.
    ConvPartialSums,
}

impl ScratchpadKey {
    /// Stable lowercase name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            ScratchpadKey::ConvPaddedBias => "conv_padded_bias",
            ScratchpadKey::ConvTrSrc => "conv_tr_src",
            ScratchpadKey::ConvPartialSums => "conv_partial_sums",
        }
    }
}

impl fmt::Display for ScratchpadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchpadEntry {
    pub key: ScratchpadKey,
    pub offset: usize,
    pub size: usize,
    pub align: usize,
}

impl ScratchpadEntry {
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScratchpadRegistry {
    entries: SmallVec<[ScratchpadEntry; 4]>,
    size: usize,
}

impl ScratchpadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the registry for booking.
    pub fn registrar(&mut self) -> Registrar<'_> {
        Registrar { registry: self }
    }

    /// Total bytes, including alignment gaps.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ScratchpadEntry] {
        &self.entries
    }

    /// Booking for `key`, if any.
    pub fn entry(&self, key: ScratchpadKey) -> Option<&ScratchpadEntry> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    pub fn contains(&self, key: ScratchpadKey) -> bool {
        self.entry(key).is_some()
    }
}

/// Creation-time booking handle.
pub struct Registrar<'a> {
    registry: &'a mut ScratchpadRegistry,
}

impl Registrar<'_> {
    /// Books `size` bytes under `key`. Zero-sized bookings are dropped; alignment is always at
    /// least [`SCRATCHPAD_ALIGN`] and may not exceed it. A total past `usize::MAX` is
    /// [`ConvError::OutOfMemory`] and leaves the registry unchanged.
    pub fn book(&mut self, key: ScratchpadKey, size: usize, align: usize) -> ConvResult<()> {
        if size == 0 {
            return Ok(());
        }
        debug_assert!(
            align.is_power_of_two() && align <= SCRATCHPAD_ALIGN,
            "scratchpad alignment {align} not supported"
        );
        debug_assert!(
            !self.registry.contains(key),
            "scratchpad key {key} booked twice"
        );
        let offset = self.registry.size.checked_next_multiple_of(SCRATCHPAD_ALIGN);
        let end = offset.and_then(|offset| offset.checked_add(size));
        let (Some(offset), Some(end)) = (offset, end) else {
            return Err(ConvError::OutOfMemory { bytes: usize::MAX });
        };
        self.registry.entries.push(ScratchpadEntry {
            key,
            offset,
            size,
            align: SCRATCHPAD_ALIGN,
        });
        self.registry.size = end;
        Ok(())
    }
}

#[derive(Clone, Copy, Zeroable, Pod)]
#[repr(C, align(64))]
struct CacheLine([u8; SCRATCHPAD_ALIGN]);

/// Memory backing one [`ScratchpadRegistry`].
pub struct Scratchpad {
    registry: Arc<ScratchpadRegistry>,
    storage: Vec<CacheLine>,
}

impl Scratchpad {
    /// Allocates zeroed, cache-line aligned memory for every region of `registry`.
    pub fn new(registry: Arc<ScratchpadRegistry>) -> ConvResult<Self> {
        let bytes = registry.size();
        let lines = bytes.div_ceil(SCRATCHPAD_ALIGN);
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(lines)
            .map_err(|_| ConvError::OutOfMemory { bytes })?;
        storage.resize(lines, CacheLine::zeroed());
        Ok(Self { registry, storage })
    }

    pub fn size(&self) -> usize {
        self.registry.size()
    }

    /// Registry this memory was sized for.
    pub fn registry(&self) -> &Arc<ScratchpadRegistry> {
        &self.registry
    }

    /// Splits the allocation into its booked regions.
    pub fn grant(&mut self) -> ScratchpadGrant<'_> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.storage);
        let mut regions = SmallVec::new();
        let mut rest = bytes;
        let mut cursor = 0;
        for entry in self.registry.entries() {
            let tail = std::mem::take(&mut rest);
            let (_, tail) = tail.split_at_mut(entry.offset - cursor);
            let (region, tail) = tail.split_at_mut(entry.size);
            regions.push((entry.key, Some(region)));
            rest = tail;
            cursor = entry.end();
        }
        ScratchpadGrant { regions }
    }
}

impl fmt::Debug for Scratchpad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scratchpad")
            .field("size", &self.size())
            .field("entries", &self.registry.entries())
            .finish()
    }
}

/// Execution-time view of a scratchpad; each region can be taken once.
#[derive(Default)]
pub struct ScratchpadGrant<'a> {
    regions: SmallVec<[(ScratchpadKey, Option<&'a mut [u8]>); 4]>,
}

impl<'a> ScratchpadGrant<'a> {
    /// Grant with no regions, for primitives that booked nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: ScratchpadKey) -> bool {
        self.regions.iter().any(|(k, _)| *k == key)
    }

    /// Typed region for `key`.
    pub fn take<T: Pod>(&mut self, key: ScratchpadKey) -> ConvResult<&'a mut [T]> {
        let (_, slot) = self
            .regions
            .iter_mut()
            .find(|(k, _)| *k == key)
            .ok_or_else(|| {
                ConvError::execution(format!("scratchpad region {key} was not booked"))
            })?;
        let bytes = slot.take().ok_or_else(|| {
            ConvError::execution(format!("scratchpad region {key} already taken"))
        })?;
        bytemuck::try_cast_slice_mut(bytes).map_err(|err| {
            ConvError::execution(format!(
                "scratchpad region {key} cannot be viewed as {}: {err}",
                std::any::type_name::<T>()
            ))
        })
    }
}

impl fmt::Debug for ScratchpadGrant<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let regions = self
            .regions
            .iter()
            .map(|(key, region)| (key, region.as_ref().map(|r| r.len())));
        f.debug_list().entries(regions).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_are_disjoint_and_typed() {
        let mut registry = ScratchpadRegistry::new();
        let mut registrar = registry.registrar();
        registrar.book(ScratchpadKey::ConvPaddedBias, 32 * 4, 64).unwrap();
        registrar.book(ScratchpadKey::ConvPartialSums, 10 * 4, 64).unwrap();

        let mut pad = Scratchpad::new(Arc::new(registry)).unwrap();
        let mut grant = pad.grant();
        let bias: &mut [f32] = grant.take(ScratchpadKey::ConvPaddedBias).unwrap();
        let sums: &mut [f32] = grant.take(ScratchpadKey::ConvPartialSums).unwrap();
        bias.fill(1.0);
        sums.fill(2.0);
        assert_eq!(bias.len(), 32);
        assert_eq!(sums.len(), 10);
        assert!(bias.iter().all(|&v| v == 1.0));

        let again = grant.take::<f32>(ScratchpadKey::ConvPaddedBias);
        assert!(matches!(again, Err(ConvError::Execution(_))));
        let missing = grant.take::<f32>(ScratchpadKey::ConvTrSrc);
        assert!(matches!(missing, Err(ConvError::Execution(_))));
    }
}
