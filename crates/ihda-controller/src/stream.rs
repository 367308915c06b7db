use std::collections::BTreeMap;

use ihda_registers::{
    sd_ctl_with_tag, sd_reg, Gcap, SD_REG_BDPL, SD_REG_BDPU, SD_REG_CTL,
};

use crate::dma::DmaRegion;
use crate::error::{HdaError, Result};
use crate::mmio::RegisterIo;

/// Entries in each stream's buffer descriptor list.
pub const BDL_ENTRIES: usize = 32;

/// Bytes of BDL memory reserved per stream engine (16-byte entries).
pub const BDL_BYTES_PER_STREAM: usize = BDL_ENTRIES * 16;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamType {
    /// Parked in a free pool, not configured for any direction.
    Invalid,
    Input,
    Output,
    Bidir,
}

/// One hardware DMA stream engine slot.
///
/// A context's hardware direction is fixed when the pool is populated; the
/// configured direction and tag cycle with each checkout. Contexts live for
/// the controller's whole lifetime, moving between the free pools and their
/// current owner.
#[derive(Debug)]
pub struct StreamContext {
    index: u8,
    fixed_type: StreamType,
    configured_type: StreamType,
    tag: u8,
    bdl_phys: u64,
}

impl StreamContext {
    fn new(index: u8, fixed_type: StreamType, bdl_phys: u64) -> Self {
        Self {
            index,
            fixed_type,
            configured_type: StreamType::Invalid,
            tag: 0,
            bdl_phys,
        }
    }

    /// Hardware stream descriptor index (SDn).
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Direction the context was checked out as; `Invalid` while parked.
    pub fn configured_type(&self) -> StreamType {
        self.configured_type
    }

    /// The engine's fixed hardware direction.
    pub fn fixed_type(&self) -> StreamType {
        self.fixed_type
    }

    /// Assigned stream tag, 1..=15; 0 while parked.
    pub fn tag(&self) -> u8 {
        self.tag
    }

    /// Physical base of this stream's buffer descriptor list.
    pub fn bdl_phys(&self) -> u64 {
        self.bdl_phys
    }

    fn configure(&mut self, ty: StreamType, tag: u8) {
        self.configured_type = ty;
        self.tag = tag;
    }

    /// Program the stream tag and BDL base into this engine's descriptor
    /// registers. Callers own format and buffer-length programming.
    pub fn program_registers(&self, regs: &dyn RegisterIo) -> Result<()> {
        debug_assert_ne!(self.tag, 0);
        let ctl = regs.read32(sd_reg(self.index, SD_REG_CTL))? & 0x00FF_FFFF;
        regs.write32(sd_reg(self.index, SD_REG_CTL), sd_ctl_with_tag(ctl, self.tag))?;
        regs.write32(sd_reg(self.index, SD_REG_BDPL), self.bdl_phys as u32)?;
        regs.write32(sd_reg(self.index, SD_REG_BDPU), (self.bdl_phys >> 32) as u32)
    }
}

/// The controller's free stream contexts and tag bitmaps.
///
/// Callers hold this behind one mutex; every mutation happens under it.
#[derive(Debug)]
pub struct StreamPool {
    free_input: BTreeMap<u8, StreamContext>,
    free_output: BTreeMap<u8, StreamContext>,
    free_bidir: BTreeMap<u8, StreamContext>,

    // Bit N set = tag N free. Bit 0 stays clear; tag 0 means "no tag".
    free_input_tags: u16,
    free_output_tags: u16,
}

const ALL_TAGS_FREE: u16 = 0xFFFE;

impl StreamPool {
    /// Pre-populate the pools from the hardware capability register.
    ///
    /// Stream indices follow descriptor order: input engines first, then
    /// output, then bidirectional. Each engine is assigned its slice of the
    /// buffer descriptor list region.
    pub fn from_caps(caps: Gcap, bdl_mem: &DmaRegion) -> Self {
        let mut free_input = BTreeMap::new();
        let mut free_output = BTreeMap::new();
        let mut free_bidir = BTreeMap::new();

        let mut index = 0u8;
        let mut populate = |count: u8, ty: StreamType, dst: &mut BTreeMap<u8, StreamContext>| {
            for _ in 0..count {
                let bdl_phys =
                    bdl_mem.phys_addr() + u64::from(index) * BDL_BYTES_PER_STREAM as u64;
                dst.insert(index, StreamContext::new(index, ty, bdl_phys));
                index += 1;
            }
        };

        populate(caps.iss(), StreamType::Input, &mut free_input);
        populate(caps.oss(), StreamType::Output, &mut free_output);
        populate(caps.bss(), StreamType::Bidir, &mut free_bidir);

        Self {
            free_input,
            free_output,
            free_bidir,
            free_input_tags: ALL_TAGS_FREE,
            free_output_tags: ALL_TAGS_FREE,
        }
    }

    pub fn free_counts(&self) -> (usize, usize, usize) {
        (
            self.free_input.len(),
            self.free_output.len(),
            self.free_bidir.len(),
        )
    }

    /// Check out a stream engine for `ty`.
    ///
    /// Only `Input` and `Output` may be requested; bidirectional engines are
    /// what callers end up with when the direction-specific pool is empty,
    /// never what they ask for. Fails with `Unavailable` when both pools are
    /// empty or when every tag for the direction is outstanding.
    pub fn allocate(&mut self, ty: StreamType) -> Result<StreamContext> {
        let direction_empty = match ty {
            StreamType::Input => self.free_input.is_empty(),
            StreamType::Output => self.free_output.is_empty(),
            _ => {
                debug_assert!(false, "directly requesting a {ty:?} stream");
                return Err(HdaError::InvalidArgs("stream type"));
            }
        };
        if direction_empty && self.free_bidir.is_empty() {
            return Err(HdaError::Unavailable);
        }

        // Tag exhaustion fails the allocation even though an engine is free.
        let Some(tag) = Self::allocate_tag(self.tag_pool_mut(ty)) else {
            return Err(HdaError::Unavailable);
        };

        let src = if direction_empty {
            &mut self.free_bidir
        } else if ty == StreamType::Input {
            &mut self.free_input
        } else {
            &mut self.free_output
        };
        let (_, mut ctx) = src.pop_first().expect("checked non-empty");
        ctx.configure(ty, tag);
        Ok(ctx)
    }

    /// Return a checked-out engine to the pool matching its fixed direction.
    pub fn release(&mut self, mut ctx: StreamContext) {
        let configured = ctx.configured_type;
        assert!(
            matches!(configured, StreamType::Input | StreamType::Output),
            "returning a stream that was never configured"
        );
        Self::release_tag(self.tag_pool_mut(configured), ctx.tag);

        ctx.configure(StreamType::Invalid, 0);
        let dst = match ctx.fixed_type {
            StreamType::Input => &mut self.free_input,
            StreamType::Output => &mut self.free_output,
            StreamType::Bidir => &mut self.free_bidir,
            StreamType::Invalid => unreachable!("context with no fixed direction"),
        };
        let evicted = dst.insert(ctx.index, ctx);
        assert!(evicted.is_none(), "stream context returned twice");
    }

    fn tag_pool_mut(&mut self, ty: StreamType) -> &mut u16 {
        match ty {
            StreamType::Input => &mut self.free_input_tags,
            _ => &mut self.free_output_tags,
        }
    }

    // Lowest free tag in [1, 15] wins; 0 is never a valid tag.
    fn allocate_tag(tag_pool: &mut u16) -> Option<u8> {
        for tag in 1..16u8 {
            if *tag_pool & (1 << tag) != 0 {
                *tag_pool &= !(1 << tag);
                return Some(tag);
            }
        }
        None
    }

    fn release_tag(tag_pool: &mut u16, tag: u8) {
        assert!((1..=15).contains(&tag));
        assert_eq!(*tag_pool & (1 << tag), 0, "tag {tag} freed twice");
        *tag_pool |= 1 << tag;
    }
}
