use ihda_registers::{
    largest_ring_size, CodecCommand, CodecResponse, CorbCtl, RirbCtl, CORBRP_RST, HDA_CORBCTL,
    HDA_CORBLBASE, HDA_CORBRP, HDA_CORBSIZE, HDA_CORBUBASE, HDA_CORBWP, HDA_RINTCNT,
    HDA_RIRBCTL, HDA_RIRBLBASE, HDA_RIRBSIZE, HDA_RIRBUBASE, HDA_RIRBWP, RIRBWP_RST,
};

use crate::dma::DmaRegion;
use crate::error::{HdaError, Result};
use crate::mmio::{poll16, RegisterIo};

const RING_SETUP_SPINS: u32 = 10_000;

/// Response ring slots held back from the command budget so unsolicited
/// responses arriving between drains can never overrun the RIRB.
pub const RIRB_RESERVED_RESPONSE_SLOTS: u16 = 8;

/// Driver side of the Command Output Ring Buffer.
///
/// Software produces entries and owns the write pointer; hardware consumes
/// them and advances the read pointer register.
#[derive(Debug)]
pub struct CommandRing {
    buf: DmaRegion,
    entries: u16,
    wp: u16,
    in_flight: u16,
    max_in_flight: u16,
}

impl CommandRing {
    /// Read the size capability bits and pick the largest supported ring,
    /// returning `(size selection, entry count)`.
    pub fn probe(regs: &dyn RegisterIo) -> Result<(u8, u16)> {
        Ok(largest_ring_size(regs.read8(HDA_CORBSIZE)?))
    }

    /// Program and start the CORB DMA engine over `buf`.
    ///
    /// Sequence per the HDA spec: stop the engine, program the base and
    /// size, run the read-pointer reset handshake, zero the write pointer,
    /// then run. `rirb_entries` bounds the in-flight command budget.
    pub fn setup(
        regs: &dyn RegisterIo,
        buf: DmaRegion,
        size_sel: u8,
        entries: u16,
        rirb_entries: u16,
    ) -> Result<Self> {
        debug_assert!(buf.len() >= usize::from(entries) * 4);
        debug_assert_eq!(buf.phys_addr() & 0x7F, 0);

        regs.write8(HDA_CORBCTL, 0)?;

        let base = buf.phys_addr();
        regs.write32(HDA_CORBLBASE, base as u32)?;
        regs.write32(HDA_CORBUBASE, (base >> 32) as u32)?;
        regs.write8(HDA_CORBSIZE, size_sel)?;

        // Read-pointer reset handshake: request, wait for the latch, clear
        // the request, wait for the clear.
        regs.write16(HDA_CORBRP, CORBRP_RST)?;
        if !poll16(regs, HDA_CORBRP, CORBRP_RST, CORBRP_RST, RING_SETUP_SPINS)? {
            return Err(HdaError::Timeout("CORB read pointer reset assert"));
        }
        regs.write16(HDA_CORBRP, 0)?;
        if !poll16(regs, HDA_CORBRP, CORBRP_RST, 0, RING_SETUP_SPINS)? {
            return Err(HdaError::Timeout("CORB read pointer reset deassert"));
        }

        regs.write16(HDA_CORBWP, 0)?;
        regs.write8(HDA_CORBCTL, CorbCtl::RUN.bits())?;

        let max_in_flight = rirb_entries
            .saturating_sub(RIRB_RESERVED_RESPONSE_SLOTS)
            .min(entries - 1)
            .max(1);
        Ok(Self {
            buf,
            entries,
            wp: 0,
            in_flight: 0,
            max_in_flight,
        })
    }

    pub fn entries(&self) -> u16 {
        self.entries
    }

    /// Commands queued but not yet answered.
    pub fn in_flight(&self) -> u16 {
        self.in_flight
    }

    /// Write one verb command into the next CORB slot and publish it via the
    /// write pointer register. `Unavailable` when the ring is full or the
    /// in-flight budget is spent; the caller may retry after responses drain.
    pub fn queue(&mut self, regs: &dyn RegisterIo, cmd: CodecCommand) -> Result<()> {
        if self.in_flight >= self.max_in_flight {
            return Err(HdaError::Unavailable);
        }

        let rp = regs.read16(HDA_CORBRP)? % self.entries;
        let next = (self.wp + 1) % self.entries;
        if next == rp {
            return Err(HdaError::Unavailable);
        }

        self.buf.write_u32(usize::from(next) * 4, cmd.encode());
        self.wp = next;
        self.in_flight += 1;
        regs.write16(HDA_CORBWP, self.wp)
    }

    /// One solicited response arrived; return its slot to the budget.
    pub fn complete(&mut self) {
        debug_assert!(self.in_flight > 0, "response with no command in flight");
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn stop(&self, regs: &dyn RegisterIo) -> Result<()> {
        regs.write8(HDA_CORBCTL, 0)
    }
}

/// Driver side of the Response Input Ring Buffer.
///
/// Hardware produces entries and owns the write pointer register; the read
/// cursor exists only in software, so it lives here.
#[derive(Debug)]
pub struct ResponseRing {
    buf: DmaRegion,
    entries: u16,
    rp: u16,
}

impl ResponseRing {
    pub fn probe(regs: &dyn RegisterIo) -> Result<(u8, u16)> {
        Ok(largest_ring_size(regs.read8(HDA_RIRBSIZE)?))
    }

    /// Program and start the RIRB DMA engine over `buf`, interrupting after
    /// every response.
    pub fn setup(
        regs: &dyn RegisterIo,
        buf: DmaRegion,
        size_sel: u8,
        entries: u16,
    ) -> Result<Self> {
        debug_assert!(buf.len() >= usize::from(entries) * 8);
        debug_assert_eq!(buf.phys_addr() & 0x7F, 0);

        regs.write8(HDA_RIRBCTL, 0)?;

        let base = buf.phys_addr();
        regs.write32(HDA_RIRBLBASE, base as u32)?;
        regs.write32(HDA_RIRBUBASE, (base >> 32) as u32)?;
        regs.write8(HDA_RIRBSIZE, size_sel)?;

        // The RIRB write pointer reset bit is write-only; no handshake.
        regs.write16(HDA_RIRBWP, RIRBWP_RST)?;
        regs.write16(HDA_RINTCNT, 1)?;
        regs.write8(HDA_RIRBCTL, (RirbCtl::RINTCTL | RirbCtl::RUN).bits())?;

        Ok(Self {
            buf,
            entries,
            rp: 0,
        })
    }

    pub fn entries(&self) -> u16 {
        self.entries
    }

    /// Consume every response published since the last drain, in FIFO order
    /// up to the hardware write pointer. Finding nothing is not an error;
    /// the write pointer simply has not advanced yet.
    pub fn drain(&mut self, regs: &dyn RegisterIo) -> Result<Vec<CodecResponse>> {
        let wp = regs.read16(HDA_RIRBWP)? % self.entries;
        let mut out = Vec::new();
        while self.rp != wp {
            self.rp = (self.rp + 1) % self.entries;
            let offset = usize::from(self.rp) * 8;
            out.push(CodecResponse::from_raw(
                self.buf.read_u32(offset),
                self.buf.read_u32(offset + 4),
            ));
        }
        Ok(out)
    }

    pub fn stop(&self, regs: &dyn RegisterIo) -> Result<()> {
        regs.write8(HDA_RIRBCTL, 0)
    }
}
