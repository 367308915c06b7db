//! In-memory stand-ins for the hardware and framework sides of the driver.
//!
//! [`FakeHda`] models the register file, DMA plumbing, and interrupt line of
//! a controller plus the parent-device/PCI handles the framework would
//! supply; [`FakeChannel`] models one client channel. Both are used by the
//! unit tests in this crate and by the integration tests under `tests/`.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use ihda_registers::{
    gcap_with_streams, register_window_bytes, ring_entries, sd_reg, stream_int_bit,
    CodecCommand, CodecResponse, Gcap, Gctl, RirbSts, SdSts, CORBRP_RST, HDA_CORBRP,
    HDA_CORBSIZE, HDA_CORBWP, HDA_GCAP, HDA_GCTL, HDA_RIRBLBASE, HDA_RIRBSIZE, HDA_RIRBSTS,
    HDA_RIRBUBASE, HDA_RIRBWP, HDA_STATESTS, HDA_VMAJ, HDA_VMIN, INTSTS_CIS, INTSTS_GIS,
    RING_SIZE_CAP_16, RING_SIZE_CAP_2, RING_SIZE_CAP_256, RIRBWP_RST, SD_REG_STS,
    HDA_CORBLBASE, HDA_CORBUBASE, HDA_INTSTS,
};

use crate::ddk::{Channel, InterruptSource, ParentDevice, PciDeviceInfo, PciProtocol, Wake};
use crate::dma::DmaRegion;
use crate::error::{HdaError, Result};
use crate::mmio::RegisterIo;

#[derive(Debug, Copy, Clone)]
pub struct FakeHdaConfig {
    pub input_streams: u8,
    pub output_streams: u8,
    pub bidir_streams: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision_id: u8,
    pub vmaj: u8,
    pub vmin: u8,
    /// Make every contiguous-DMA allocation fail.
    pub fail_dma: bool,
}

impl Default for FakeHdaConfig {
    fn default() -> Self {
        Self {
            input_streams: 4,
            output_streams: 4,
            bidir_streams: 2,
            vendor_id: 0x8086,
            device_id: 0x2668,
            revision_id: 0x01,
            vmaj: 1,
            vmin: 0,
            fail_dma: false,
        }
    }
}

#[derive(Debug)]
struct Inner {
    regs: Vec<u8>,
    allocations: Vec<DmaRegion>,
    next_phys: u64,
    failed: HashSet<u32>,
    stuck_crst: bool,
    stuck_corb_rp: bool,
    auto_respond: bool,
    wakes: VecDeque<Wake>,
}

/// A fake controller: register file + DMA + interrupt line on one side,
/// PCI protocol + parent device on the other. Clones share state.
#[derive(Debug, Clone)]
pub struct FakeHda {
    inner: Arc<(Mutex<Inner>, Condvar)>,
    config: FakeHdaConfig,
}

impl FakeHda {
    pub fn new(config: FakeHdaConfig) -> Self {
        let total = config.input_streams + config.output_streams + config.bidir_streams;
        let mut regs = vec![0u8; register_window_bytes(total)];

        let gcap = gcap_with_streams(
            config.input_streams,
            config.output_streams,
            config.bidir_streams,
            1,
        );
        regs[HDA_GCAP as usize..HDA_GCAP as usize + 2].copy_from_slice(&gcap.to_le_bytes());
        regs[HDA_VMAJ as usize] = config.vmaj;
        regs[HDA_VMIN as usize] = config.vmin;

        let ring_caps = RING_SIZE_CAP_2 | RING_SIZE_CAP_16 | RING_SIZE_CAP_256;
        regs[HDA_CORBSIZE as usize] = ring_caps;
        regs[HDA_RIRBSIZE as usize] = ring_caps;

        Self {
            inner: Arc::new((
                Mutex::new(Inner {
                    regs,
                    allocations: Vec::new(),
                    next_phys: 0x10_0000,
                    failed: HashSet::new(),
                    stuck_crst: false,
                    stuck_corb_rp: false,
                    auto_respond: false,
                    wakes: VecDeque::new(),
                }),
                Condvar::new(),
            )),
            config,
        }
    }

    pub fn gcap(&self) -> Gcap {
        Gcap::new(self.reg16(HDA_GCAP))
    }

    /// Allocate DMA memory the way the driver would, panicking on failure.
    pub fn allocate(&self, bytes: usize) -> DmaRegion {
        self.allocate_contiguous(bytes).unwrap()
    }

    pub fn reg8(&self, offset: u32) -> u8 {
        self.inner.0.lock().unwrap().regs[offset as usize]
    }

    pub fn reg16(&self, offset: u32) -> u16 {
        let inner = self.inner.0.lock().unwrap();
        u16::from_le_bytes([inner.regs[offset as usize], inner.regs[offset as usize + 1]])
    }

    pub fn reg32(&self, offset: u32) -> u32 {
        let inner = self.inner.0.lock().unwrap();
        let off = offset as usize;
        u32::from_le_bytes([
            inner.regs[off],
            inner.regs[off + 1],
            inner.regs[off + 2],
            inner.regs[off + 3],
        ])
    }

    pub fn set_reg16(&self, offset: u32, value: u16) {
        let mut inner = self.inner.0.lock().unwrap();
        let off = offset as usize;
        inner.regs[off..off + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// All subsequent accesses to `offset` fault.
    pub fn fail_register(&self, offset: u32) {
        self.inner.0.lock().unwrap().failed.insert(offset);
    }

    /// CRST never reads back as set; link reset exit will time out.
    pub fn stick_crst(&self) {
        self.inner.0.lock().unwrap().stuck_crst = true;
    }

    /// The CORB read-pointer reset bit never latches.
    pub fn stick_corb_rp_reset(&self) {
        self.inner.0.lock().unwrap().stuck_corb_rp = true;
    }

    /// Answer every queued command with a response echoing its verb.
    pub fn enable_auto_respond(&self) {
        self.inner.0.lock().unwrap().auto_respond = true;
    }

    /// Assert the interrupt line once.
    pub fn raise_interrupt(&self) {
        let mut inner = self.inner.0.lock().unwrap();
        inner.wakes.push_back(Wake::Interrupt);
        self.inner.1.notify_all();
    }

    /// Flag a stream's buffer-completion status and interrupt.
    pub fn complete_stream(&self, index: u8) {
        {
            let mut inner = self.inner.0.lock().unwrap();
            let sts_off = sd_reg(index, SD_REG_STS) as usize;
            inner.regs[sts_off] |= SdSts::BCIS.bits();
            set_intsts_bits(&mut inner, stream_int_bit(index));
        }
        self.raise_interrupt();
    }

    /// Flag a codec presence change on SDIN line `addr` and interrupt.
    pub fn plug_codec(&self, addr: u8) {
        {
            let mut inner = self.inner.0.lock().unwrap();
            let statests = read16(&inner.regs, HDA_STATESTS) | (1 << addr);
            write16_raw(&mut inner.regs, HDA_STATESTS, statests);
        }
        self.raise_interrupt();
    }

    /// Hardware-side publish of one RIRB entry, with interrupt.
    pub fn publish_response(&self, resp: CodecResponse) {
        {
            let mut inner = self.inner.0.lock().unwrap();
            push_rirb_entry(&mut inner, resp);
        }
        self.raise_interrupt();
    }
}

fn read16(regs: &[u8], offset: u32) -> u16 {
    let off = offset as usize;
    u16::from_le_bytes([regs[off], regs[off + 1]])
}

fn read32(regs: &[u8], offset: u32) -> u32 {
    let off = offset as usize;
    u32::from_le_bytes([regs[off], regs[off + 1], regs[off + 2], regs[off + 3]])
}

fn write16_raw(regs: &mut [u8], offset: u32, value: u16) {
    let off = offset as usize;
    regs[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

fn write32_raw(regs: &mut [u8], offset: u32, value: u32) {
    let off = offset as usize;
    regs[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn set_intsts_bits(inner: &mut Inner, bits: u32) {
    let intsts = read32(&inner.regs, HDA_INTSTS) | bits | INTSTS_GIS;
    write32_raw(&mut inner.regs, HDA_INTSTS, intsts);
}

fn recalc_gis(inner: &mut Inner) {
    let mut intsts = read32(&inner.regs, HDA_INTSTS);
    if intsts & !INTSTS_GIS == 0 {
        intsts &= !INTSTS_GIS;
    } else {
        intsts |= INTSTS_GIS;
    }
    write32_raw(&mut inner.regs, HDA_INTSTS, intsts);
}

fn region_at(inner: &Inner, phys: u64) -> Option<DmaRegion> {
    inner
        .allocations
        .iter()
        .find(|region| region.phys_addr() == phys)
        .cloned()
}

fn push_rirb_entry(inner: &mut Inner, resp: CodecResponse) {
    let base = (u64::from(read32(&inner.regs, HDA_RIRBUBASE)) << 32)
        | u64::from(read32(&inner.regs, HDA_RIRBLBASE));
    let entries = ring_entries(inner.regs[HDA_RIRBSIZE as usize]);
    let Some(rirb) = region_at(inner, base) else {
        return;
    };

    let wp = (read16(&inner.regs, HDA_RIRBWP) + 1) % entries;
    rirb.write_u32(usize::from(wp) * 8, resp.data);
    rirb.write_u32(usize::from(wp) * 8 + 4, resp.ext());
    write16_raw(&mut inner.regs, HDA_RIRBWP, wp);

    inner.regs[HDA_RIRBSTS as usize] |= RirbSts::RINTFL.bits();
    set_intsts_bits(inner, INTSTS_CIS);
}

// Consume CORB entries the driver just published and answer each one with a
// response echoing the verb.
fn auto_respond(inner: &mut Inner, new_wp: u16) {
    let base = (u64::from(read32(&inner.regs, HDA_CORBUBASE)) << 32)
        | u64::from(read32(&inner.regs, HDA_CORBLBASE));
    let entries = ring_entries(inner.regs[HDA_CORBSIZE as usize]);
    let Some(corb) = region_at(inner, base) else {
        return;
    };

    let mut rp = read16(&inner.regs, HDA_CORBRP) % entries;
    let wp = new_wp % entries;
    while rp != wp {
        rp = (rp + 1) % entries;
        let cmd = CodecCommand::decode(corb.read_u32(usize::from(rp) * 4));
        push_rirb_entry(
            inner,
            CodecResponse {
                data: cmd.verb,
                codec_addr: cmd.codec_addr,
                unsolicited: false,
            },
        );
    }
    write16_raw(&mut inner.regs, HDA_CORBRP, rp);
}

impl RegisterIo for FakeHda {
    fn read8(&self, offset: u32) -> Result<u8> {
        let inner = self.inner.0.lock().unwrap();
        check_access(&inner, offset, 1)?;
        Ok(inner.regs[offset as usize])
    }

    fn read16(&self, offset: u32) -> Result<u16> {
        let inner = self.inner.0.lock().unwrap();
        check_access(&inner, offset, 2)?;
        Ok(read16(&inner.regs, offset))
    }

    fn read32(&self, offset: u32) -> Result<u32> {
        let inner = self.inner.0.lock().unwrap();
        check_access(&inner, offset, 4)?;
        Ok(read32(&inner.regs, offset))
    }

    fn write8(&self, offset: u32, value: u8) -> Result<()> {
        let mut inner = self.inner.0.lock().unwrap();
        check_access(&inner, offset, 1)?;

        let off = offset as usize;
        let is_sd_sts = offset >= sd_reg(0, 0)
            && (offset - sd_reg(0, 0)) % 0x20 == SD_REG_STS;
        if offset == HDA_RIRBSTS {
            // W1C; a cleared response interrupt drops the controller cause.
            inner.regs[off] &= !value;
            if inner.regs[off] & RirbSts::RINTFL.bits() == 0 {
                let intsts = read32(&inner.regs, HDA_INTSTS) & !INTSTS_CIS;
                write32_raw(&mut inner.regs, HDA_INTSTS, intsts);
                recalc_gis(&mut inner);
            }
        } else if is_sd_sts {
            let index = ((offset - sd_reg(0, 0)) / 0x20) as u8;
            inner.regs[off] &= !value;
            if inner.regs[off] & SdSts::BCIS.bits() == 0 {
                let intsts = read32(&inner.regs, HDA_INTSTS) & !stream_int_bit(index);
                write32_raw(&mut inner.regs, HDA_INTSTS, intsts);
                recalc_gis(&mut inner);
            }
        } else {
            inner.regs[off] = value;
        }
        Ok(())
    }

    fn write16(&self, offset: u32, value: u16) -> Result<()> {
        let mut inner = self.inner.0.lock().unwrap();
        check_access(&inner, offset, 2)?;

        match offset {
            HDA_STATESTS => {
                let cleared = read16(&inner.regs, offset) & !value;
                write16_raw(&mut inner.regs, offset, cleared);
            }
            HDA_CORBRP => {
                if inner.stuck_corb_rp {
                    write16_raw(&mut inner.regs, offset, 0);
                } else if value & CORBRP_RST != 0 {
                    write16_raw(&mut inner.regs, offset, CORBRP_RST);
                } else {
                    write16_raw(&mut inner.regs, offset, 0);
                }
            }
            HDA_RIRBWP => {
                if value & RIRBWP_RST != 0 {
                    write16_raw(&mut inner.regs, offset, 0);
                }
            }
            HDA_CORBWP => {
                write16_raw(&mut inner.regs, offset, value);
                if inner.auto_respond {
                    auto_respond(&mut inner, value);
                    inner.wakes.push_back(Wake::Interrupt);
                    self.inner.1.notify_all();
                }
            }
            _ => write16_raw(&mut inner.regs, offset, value),
        }
        Ok(())
    }

    fn write32(&self, offset: u32, value: u32) -> Result<()> {
        let mut inner = self.inner.0.lock().unwrap();
        check_access(&inner, offset, 4)?;

        if offset == HDA_GCTL && inner.stuck_crst {
            write32_raw(&mut inner.regs, offset, value & !Gctl::CRST.bits());
        } else {
            write32_raw(&mut inner.regs, offset, value);
        }
        Ok(())
    }
}

fn check_access(inner: &Inner, offset: u32, width: usize) -> Result<()> {
    if inner.failed.contains(&offset) {
        return Err(HdaError::Io("injected register fault"));
    }
    if offset as usize + width > inner.regs.len() {
        return Err(HdaError::Io("register offset out of range"));
    }
    Ok(())
}

impl PciProtocol for FakeHda {
    fn device_info(&self) -> PciDeviceInfo {
        PciDeviceInfo {
            vendor_id: self.config.vendor_id,
            device_id: self.config.device_id,
            revision_id: self.config.revision_id,
        }
    }

    fn map_registers(&self) -> Result<Arc<dyn RegisterIo>> {
        Ok(Arc::new(self.clone()))
    }

    fn map_interrupt(&self) -> Result<Arc<dyn InterruptSource>> {
        Ok(Arc::new(self.clone()))
    }

    fn allocate_contiguous(&self, bytes: usize) -> Result<DmaRegion> {
        let mut inner = self.inner.0.lock().unwrap();
        if self.config.fail_dma {
            return Err(HdaError::NoMemory);
        }
        // Ring base registers reserve bits 6:0; keep everything 128-aligned.
        inner.next_phys = (inner.next_phys + 127) & !127;
        let region = DmaRegion::new(inner.next_phys, bytes);
        inner.next_phys += bytes as u64;
        inner.allocations.push(region.clone());
        Ok(region)
    }
}

impl InterruptSource for FakeHda {
    fn wait(&self) -> Result<Wake> {
        let (lock, cvar) = &*self.inner;
        let mut inner = lock.lock().unwrap();
        loop {
            if let Some(wake) = inner.wakes.pop_front() {
                return Ok(wake);
            }
            inner = cvar.wait(inner).unwrap();
        }
    }

    fn trigger_shutdown(&self) {
        let mut inner = self.inner.0.lock().unwrap();
        inner.wakes.push_back(Wake::Shutdown);
        self.inner.1.notify_all();
    }
}

impl ParentDevice for FakeHda {
    fn pci_protocol(&self) -> Result<Arc<dyn PciProtocol>> {
        Ok(Arc::new(self.clone()))
    }
}

/// One client channel: a queue of inbound requests and a log of replies.
#[derive(Debug, Default)]
pub struct FakeChannel {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    replies: Mutex<Vec<Vec<u8>>>,
    deactivated: AtomicBool,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_request(&self, bytes: &[u8]) {
        self.inbound.lock().unwrap().push_back(bytes.to_vec());
    }

    pub fn take_replies(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.replies.lock().unwrap())
    }

    pub fn is_deactivated(&self) -> bool {
        self.deactivated.load(Ordering::Acquire)
    }
}

impl Channel for FakeChannel {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.is_deactivated() {
            return Err(HdaError::BadState("channel deactivated"));
        }
        let Some(msg) = self.inbound.lock().unwrap().pop_front() else {
            return Err(HdaError::PeerClosed);
        };
        if msg.len() > buf.len() {
            return Err(HdaError::InvalidArgs("request exceeds read buffer"));
        }
        buf[..msg.len()].copy_from_slice(&msg);
        Ok(msg.len())
    }

    fn write(&self, buf: &[u8]) -> Result<()> {
        if self.is_deactivated() {
            return Err(HdaError::BadState("channel deactivated"));
        }
        self.replies.lock().unwrap().push(buf.to_vec());
        Ok(())
    }

    fn deactivate(&self) {
        self.deactivated.store(true, Ordering::Release);
    }
}
