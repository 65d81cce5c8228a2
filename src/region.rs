// CLASSIFICATION: COMMUNITY
// Filename: region.rs v0.1
// Author: Lukas Bower
// Date Modified: 2027-09-02

//! Memory region planner.
//!
//! Turns a parsed segment table into the physical window that must host the
//! image, the address-sorted segment list, and a validated entry point.

use log::{error, info, warn};

use crate::config::ReservedRegion;
use crate::error::PilError;
use crate::image::{ImageDescriptor, SegmentDescriptor};
use crate::memory::PhysRange;

pub const SZ_4K: u64 = 0x1000;
pub const SZ_1M: u64 = 0x10_0000;
pub const SZ_4M: u64 = 0x40_0000;

fn align_up(value: u64, align: u64) -> Option<u64> {
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Size rounded to the alignment tier of the lowest relocatable segment.
pub fn tier_aligned_size(size: u64, align: u64) -> Option<u64> {
    let tier = if align >= SZ_4M {
        SZ_4M
    } else if align >= SZ_1M {
        SZ_1M
    } else {
        SZ_4K
    };
    align_up(size, tier)
}

/// One planned unit of memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub paddr: u64,
    pub size: u64,
    pub file_size: u64,
    /// Program header index, used to name the `.bNN` blob.
    pub num: usize,
    pub relocated: bool,
}

impl Segment {
    pub fn end(&self) -> u64 {
        self.paddr + self.size
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.paddr && addr < self.end()
    }

    pub fn range(&self) -> PhysRange {
        PhysRange::new(self.paddr, self.size)
    }
}

/// The contiguous window `[start, end)` hosting every segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionPlan {
    pub start: u64,
    pub end: u64,
    /// Lowest relocatable address before relocation.
    pub base_addr: u64,
    /// Tier-aligned size reserved for the window.
    pub aligned_size: u64,
    /// Set when the window came from platform-reserved memory.
    pub allocated: bool,
}

impl RegionPlan {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn range(&self) -> PhysRange {
        PhysRange::new(self.start, self.size())
    }

    /// Translate an image address into the allocated window.
    pub fn reloc(&self, addr: u64) -> u64 {
        addr.wrapping_sub(self.base_addr).wrapping_add(self.start)
    }
}

/// Result of planning one image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryLayout {
    pub region: RegionPlan,
    pub segments: Vec<Segment>,
    pub entry: u64,
}

#[derive(Clone, Copy)]
struct Extent {
    min: u64,
    max: u64,
}

impl Extent {
    fn new() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
        }
    }

    fn take(&mut self, start: u64, end: u64) {
        self.min = self.min.min(start);
        self.max = self.max.max(end);
    }
}

fn segment_end(seg: &SegmentDescriptor) -> Result<u64, PilError> {
    seg.paddr.checked_add(seg.mem_size).ok_or_else(|| {
        PilError::malformed(format!("segment {} wraps the address space", seg.index))
    })
}

/// Compute the region for `image`.
///
/// `current` is the instance's plan from a previous boot. An allocated window
/// is reused as-is and must be large enough for the new image.
pub fn plan_region(
    name: &str,
    image: &ImageDescriptor,
    current: &RegionPlan,
    reserved: Option<ReservedRegion>,
) -> Result<RegionPlan, PilError> {
    let mut fixed = Extent::new();
    let mut reloc = Extent::new();
    let mut align = 0;
    let mut relocatable = false;

    for seg in image.loadable() {
        let end = segment_end(seg)?;
        if seg.is_relocatable() {
            reloc.take(seg.paddr, end);
            if reloc.min == seg.paddr {
                align = seg.align;
            }
            relocatable = true;
        } else {
            fixed.take(seg.paddr, end);
        }
    }

    let overflow = || PilError::malformed("image extends past the address space");
    // XPUs and IOMMUs protect in 4K chunks.
    fixed.max = align_up(fixed.max, SZ_4K).ok_or_else(overflow)?;
    reloc.max = align_up(reloc.max, SZ_4K).ok_or_else(overflow)?;

    if !relocatable {
        if fixed.min > fixed.max {
            return Err(PilError::malformed("no loadable segments"));
        }
        return Ok(RegionPlan {
            start: fixed.min,
            end: fixed.max,
            base_addr: fixed.min,
            aligned_size: fixed.max - fixed.min,
            allocated: false,
        });
    }

    let size = reloc.max - reloc.min;
    if current.allocated {
        if current.size() < size {
            warn!("{name}: can't reuse memory region, too small");
            return Err(PilError::RegionTooSmall {
                have: current.size(),
                need: size,
            });
        }
        return Ok(RegionPlan {
            base_addr: reloc.min,
            ..*current
        });
    }

    let aligned_size = tier_aligned_size(size, align).ok_or_else(overflow)?;
    let reserved = reserved.ok_or_else(|| {
        error!("{name}: no memory-region associated");
        PilError::NoMemoryRegion
    })?;
    if reserved.size < aligned_size {
        error!(
            "{name}: reserved region {:#x} bytes, image needs {aligned_size:#x}",
            reserved.size
        );
        return Err(PilError::RegionTooSmall {
            have: reserved.size,
            need: aligned_size,
        });
    }
    Ok(RegionPlan {
        start: reserved.base,
        end: reserved.base + size,
        base_addr: reloc.min,
        aligned_size,
        allocated: true,
    })
}

/// Build the address-sorted segment list for a planned region.
pub fn build_segments(
    name: &str,
    image: &ImageDescriptor,
    region: &RegionPlan,
) -> Result<Vec<Segment>, PilError> {
    let mut segments = Vec::new();
    for seg in image.loadable() {
        if seg.file_size > seg.mem_size {
            error!(
                "{name}: segment {}: file size ({:#x}) is greater than mem size ({:#x})",
                seg.index, seg.file_size, seg.mem_size
            );
            return Err(PilError::malformed(format!(
                "segment {} file size exceeds memory size",
                seg.index
            )));
        }
        let relocated = seg.is_relocatable();
        let paddr = if relocated {
            region.reloc(seg.paddr)
        } else {
            seg.paddr
        };
        if paddr.checked_add(seg.mem_size).is_none() {
            return Err(PilError::malformed(format!(
                "segment {} relocated past the address space",
                seg.index
            )));
        }
        segments.push(Segment {
            paddr,
            size: seg.mem_size,
            file_size: seg.file_size,
            num: seg.index,
            relocated,
        });
    }
    // Stable: equal addresses keep table order.
    segments.sort_by_key(|s| s.paddr);
    Ok(segments)
}

pub fn log_segments(name: &str, segments: &[Segment]) {
    for seg in segments {
        info!("{name}: {}: {:#x} {:#x}", seg.num, seg.paddr, seg.end());
    }
}

/// Relocate the entry point and check it lands inside a segment.
///
/// When the whole image was relocated the containing segment must be a
/// relocated one.
pub fn check_entry(
    name: &str,
    entry: u64,
    region: &RegionPlan,
    segments: &[Segment],
    skip_check: bool,
) -> Result<u64, PilError> {
    let image_relocated = region.allocated;
    let entry = if image_relocated {
        region.reloc(entry)
    } else {
        entry
    };
    if skip_check {
        return Ok(entry);
    }
    let ok = segments
        .iter()
        .any(|s| s.contains(entry) && (!image_relocated || s.relocated));
    if ok {
        return Ok(entry);
    }
    error!("{name}: entry address {entry:#x} not within range");
    log_segments(name, segments);
    Err(PilError::EntryOutOfRange(entry))
}

/// Plan the region, segments and entry point for one image.
pub fn plan(
    name: &str,
    image: &ImageDescriptor,
    current: &RegionPlan,
    reserved: Option<ReservedRegion>,
    skip_entry_check: bool,
) -> Result<MemoryLayout, PilError> {
    let region = plan_region(name, image, current, reserved)?;
    let segments = build_segments(name, image, &region)?;
    let entry = check_entry(name, image.entry, &region, &segments, skip_entry_check)?;
    Ok(MemoryLayout {
        region,
        segments,
        entry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MdtBuilder, PhdrSpec};

    fn parse(builder: MdtBuilder) -> ImageDescriptor {
        ImageDescriptor::parse(&builder.build()).unwrap()
    }

    #[test]
    fn fixed_image_uses_segment_bounds() {
        let image = parse(
            MdtBuilder::new(0x8610_0000)
                .segment(PhdrSpec::load(0x8620_0000, 0x100, 0x1800))
                .segment(PhdrSpec::load(0x8610_0000, 0x200, 0x400)),
        );
        let layout = plan("wcnss", &image, &RegionPlan::default(), None, false).unwrap();
        assert_eq!(layout.region.start, 0x8610_0000);
        assert_eq!(layout.region.end, 0x8620_2000);
        assert!(!layout.region.allocated);
        assert_eq!(layout.segments[0].num, 1);
        assert_eq!(layout.segments[1].num, 0);
        assert_eq!(layout.entry, 0x8610_0000);
    }

    #[test]
    fn relocatable_image_moves_into_reserved_window() {
        let image = parse(
            MdtBuilder::new(0x40)
                .segment(PhdrSpec::load(0x0, 0x80, 0x1000).relocatable().align(SZ_1M))
                .segment(PhdrSpec::load(0x3000, 0x10, 0x20).relocatable()),
        );
        let reserved = ReservedRegion {
            base: 0x9000_0000,
            size: SZ_1M,
        };
        let layout = plan("adsp", &image, &RegionPlan::default(), Some(reserved), false).unwrap();
        assert_eq!(layout.region.start, 0x9000_0000);
        assert_eq!(layout.region.end, 0x9000_4000);
        assert_eq!(layout.region.aligned_size, SZ_1M);
        assert!(layout.region.allocated);
        assert_eq!(layout.segments[1].paddr, 0x9000_3000);
        assert!(layout.segments.iter().all(|s| s.relocated));
        assert_eq!(layout.entry, 0x9000_0040);
    }

    #[test]
    fn tiers() {
        assert_eq!(tier_aligned_size(0x1001, 0), Some(0x2000));
        assert_eq!(tier_aligned_size(0x1001, SZ_1M), Some(SZ_1M));
        assert_eq!(tier_aligned_size(0x1001, 0x80_0000), Some(SZ_4M));
        assert_eq!(tier_aligned_size(SZ_4M + 1, SZ_4M), Some(2 * SZ_4M));
    }

    #[test]
    fn alignment_comes_from_lowest_relocatable_segment() {
        let image = parse(
            MdtBuilder::new(0x1_0000)
                .segment(PhdrSpec::load(0x2_0000, 0x10, 0x10).relocatable().align(SZ_4M))
                .segment(PhdrSpec::load(0x1_0000, 0x10, 0x10).relocatable().align(SZ_4K)),
        );
        let reserved = ReservedRegion {
            base: 0x8000_0000,
            size: SZ_4M,
        };
        let region = plan_region("cdsp", &image, &RegionPlan::default(), Some(reserved)).unwrap();
        assert_eq!(region.aligned_size, 0x1_1000);
    }

    #[test]
    fn reserved_window_too_small() {
        let image = parse(
            MdtBuilder::new(0)
                .segment(PhdrSpec::load(0, 0x10, 0x20_0000).relocatable().align(SZ_1M)),
        );
        let reserved = ReservedRegion {
            base: 0x8000_0000,
            size: SZ_1M,
        };
        let err = plan_region("cdsp", &image, &RegionPlan::default(), Some(reserved)).unwrap_err();
        assert!(matches!(err, PilError::RegionTooSmall { .. }));
        let err = plan_region("cdsp", &image, &RegionPlan::default(), None).unwrap_err();
        assert!(matches!(err, PilError::NoMemoryRegion));
    }

    #[test]
    fn region_reuse() {
        let image = parse(
            MdtBuilder::new(0x100)
                .segment(PhdrSpec::load(0, 0x100, 0x8000).relocatable()),
        );
        let reserved = ReservedRegion {
            base: 0x8800_0000,
            size: SZ_4M,
        };
        let first = plan("slpi", &image, &RegionPlan::default(), Some(reserved), false).unwrap();
        // A different reserved window must not be consulted on reuse.
        let other = ReservedRegion {
            base: 0x1000_0000,
            size: SZ_4M,
        };
        let second = plan("slpi", &image, &first.region, Some(other), false).unwrap();
        assert_eq!(first.region, second.region);

        let bigger = parse(
            MdtBuilder::new(0x100)
                .segment(PhdrSpec::load(0, 0x100, 0x9000).relocatable()),
        );
        let err = plan("slpi", &bigger, &second.region, Some(reserved), false).unwrap_err();
        assert!(matches!(
            err,
            PilError::RegionTooSmall {
                have: 0x8000,
                need: 0x9000
            }
        ));
    }

    #[test]
    fn filesz_over_memsz_rejected() {
        let image = parse(MdtBuilder::new(0x1000).segment(PhdrSpec::load(0x1000, 0x20, 0x10)));
        let err = plan("mba", &image, &RegionPlan::default(), None, false).unwrap_err();
        assert!(matches!(err, PilError::MalformedImage(_)));
    }

    #[test]
    fn entry_checks() {
        let image = parse(MdtBuilder::new(0x5000).segment(PhdrSpec::load(0x1000, 0x10, 0x1000)));
        let err = plan("mba", &image, &RegionPlan::default(), None, false).unwrap_err();
        assert!(matches!(err, PilError::EntryOutOfRange(0x5000)));
        let layout = plan("mba", &image, &RegionPlan::default(), None, true).unwrap();
        assert_eq!(layout.entry, 0x5000);

        let inside = parse(MdtBuilder::new(0x1fff).segment(PhdrSpec::load(0x1000, 0x10, 0x1000)));
        assert!(plan("mba", &inside, &RegionPlan::default(), None, false).is_ok());
    }

    #[test]
    fn relocated_entry_must_hit_relocated_segment() {
        let image = parse(
            MdtBuilder::new(0x1000)
                .segment(PhdrSpec::load(0x7000_1000, 0x10, 0x1000))
                .segment(PhdrSpec::load(0x0, 0x10, 0x1000).relocatable()),
        );
        let reserved = ReservedRegion {
            base: 0x7000_0000,
            size: SZ_1M,
        };
        // 0x1000 relocates to 0x7000_1000, inside the fixed segment only.
        let err = plan("venus", &image, &RegionPlan::default(), Some(reserved), false).unwrap_err();
        assert!(matches!(err, PilError::EntryOutOfRange(0x7000_1000)));
    }

    #[test]
    fn equal_addresses_keep_table_order() {
        let image = parse(
            MdtBuilder::new(0x1000)
                .segment(PhdrSpec::load(0x2000, 0, 0x10))
                .segment(PhdrSpec::load(0x1000, 0, 0x10))
                .segment(PhdrSpec::load(0x2000, 0, 0x20)),
        );
        let segs = build_segments("x", &image, &RegionPlan::default()).unwrap();
        let order: Vec<usize> = segs.iter().map(|s| s.num).collect();
        assert_eq!(order, vec![1, 0, 2]);
    }
}
