use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use ihda_registers::{
    register_window_bytes, sd_reg, stream_int_bit, CodecCommand, CodecResponse, Gcap, Gctl,
    SdSts, HDA_GCAP, HDA_GCTL, HDA_INTCTL, HDA_INTSTS, HDA_RIRBSTS, HDA_STATESTS, HDA_VMAJ,
    HDA_VMIN, HDA_WAKEEN, INTCTL_CIE, INTCTL_GIE, INTSTS_CIS, SD_REG_STS,
};
use tracing::{debug, warn};

use crate::ddk::{Channel, InterruptSource, ParentDevice, PciDeviceInfo, PciProtocol, Wake};
use crate::dispatch::{self, ControllerIds};
use crate::dma::DmaRegion;
use crate::error::{HdaError, Result};
use crate::mmio::{poll32, update32, RegisterIo};
use crate::ring::{CommandRing, ResponseRing};
use crate::stream::{StreamContext, StreamPool, StreamType, BDL_BYTES_PER_STREAM};
use crate::worker;

// Process-wide controller id generator; ids are never recycled.
static CONTROLLER_ID_GEN: AtomicU32 = AtomicU32::new(0);

const RESET_POLL_SPINS: u32 = 10_000;

// INTSTS stream bits occupy [29:0].
const MAX_STREAMS: u8 = 30;

/// Controller lifecycle states. Transitions are one-directional and no
/// state is re-enterable.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum State {
    Starting = 0,
    Operating = 1,
    ShuttingDown = 2,
    ShutDown = 3,
}

impl State {
    fn from_u32(raw: u32) -> Self {
        match raw {
            0 => State::Starting,
            1 => State::Operating,
            2 => State::ShuttingDown,
            _ => State::ShutDown,
        }
    }
}

pub type CodecResponseHandler = Box<dyn Fn(CodecResponse) + Send + Sync>;
pub type StreamCompletionHandler = Box<dyn Fn(u8, SdSts) + Send + Sync>;
pub type CodecWakeHandler = Box<dyn Fn(u16) + Send + Sync>;

/// One Intel HD Audio controller instance.
///
/// Exactly two execution contexts touch this state: the framework caller
/// thread (bind/unbind/client dispatch, serialized by the framework) and the
/// dedicated interrupt worker. The stream pool and the client list each have
/// their own lock; register access is not separately locked because the
/// worker only performs idempotent status reads/acks while multi-register
/// sequences happen during single-threaded bind/unbind.
pub struct HdaController {
    id: u32,
    state: AtomicU32,

    pci: Arc<dyn PciProtocol>,
    dev_info: PciDeviceInfo,
    regs: Arc<dyn RegisterIo>,
    irq: Arc<dyn InterruptSource>,
    caps: Gcap,

    cmd_ring: Mutex<CommandRing>,
    resp_ring: Mutex<ResponseRing>,
    bdl_mem: DmaRegion,

    streams: Mutex<StreamPool>,
    clients: Mutex<Vec<Arc<HdaClient>>>,
    irq_worker: Mutex<Option<JoinHandle<()>>>,

    response_handler: Mutex<Option<CodecResponseHandler>>,
    completion_handlers: Mutex<BTreeMap<u8, StreamCompletionHandler>>,
    wake_handler: Mutex<Option<CodecWakeHandler>>,
}

impl HdaController {
    #[allow(clippy::too_many_arguments)]
    fn new(
        pci: Arc<dyn PciProtocol>,
        regs: Arc<dyn RegisterIo>,
        irq: Arc<dyn InterruptSource>,
        caps: Gcap,
        cmd_ring: CommandRing,
        resp_ring: ResponseRing,
        bdl_mem: DmaRegion,
    ) -> Arc<Self> {
        let dev_info = pci.device_info();
        let bdl_for_pool = bdl_mem.clone();
        Arc::new(Self {
            id: CONTROLLER_ID_GEN.fetch_add(1, Ordering::Relaxed),
            state: AtomicU32::new(State::Starting as u32),
            pci,
            dev_info,
            regs,
            irq,
            caps,
            cmd_ring: Mutex::new(cmd_ring),
            resp_ring: Mutex::new(resp_ring),
            bdl_mem,
            streams: Mutex::new(StreamPool::from_caps(caps, &bdl_for_pool)),
            clients: Mutex::new(Vec::new()),
            irq_worker: Mutex::new(None),
            response_handler: Mutex::new(None),
            completion_handlers: Mutex::new(BTreeMap::new()),
            wake_handler: Mutex::new(None),
        })
    }

    /// The bind hook. Claims the PCI device, brings the link out of reset,
    /// sets up DMA rings and the stream pools, starts the interrupt worker,
    /// and hands the framework its strong reference. Fails fast: the first
    /// error aborts the sequence and propagates unchanged.
    pub fn bind(parent: &dyn ParentDevice) -> Result<DeviceCookie> {
        let pci = parent.pci_protocol()?;
        let regs = pci.map_registers()?;
        let irq = pci.map_interrupt()?;

        reset_link(regs.as_ref())?;

        let caps = Gcap::new(regs.read16(HDA_GCAP)?);
        let total = caps.total_streams();
        if total == 0 || total > MAX_STREAMS {
            return Err(HdaError::Io("implausible GCAP stream topology"));
        }

        let (corb_sel, corb_entries) = CommandRing::probe(regs.as_ref())?;
        let (rirb_sel, rirb_entries) = ResponseRing::probe(regs.as_ref())?;
        let corb_mem = pci.allocate_contiguous(usize::from(corb_entries) * 4)?;
        let rirb_mem = pci.allocate_contiguous(usize::from(rirb_entries) * 8)?;
        let bdl_mem =
            pci.allocate_contiguous(usize::from(total) * BDL_BYTES_PER_STREAM)?;

        let cmd_ring =
            CommandRing::setup(regs.as_ref(), corb_mem, corb_sel, corb_entries, rirb_entries)?;
        let resp_ring = ResponseRing::setup(regs.as_ref(), rirb_mem, rirb_sel, rirb_entries)?;

        let controller = Self::new(pci, regs, irq, caps, cmd_ring, resp_ring, bdl_mem);
        controller.start()?;
        debug!(id = controller.id, "controller operating");
        Ok(DeviceCookie { controller })
    }

    fn start(self: &Arc<Self>) -> Result<()> {
        let for_worker = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("ihda-irq-{}", self.id))
            .spawn(move || worker::irq_thread_main(for_worker))
            .map_err(|_| HdaError::NoMemory)?;
        *self.irq_worker.lock().unwrap() = Some(handle);

        if let Err(err) = self.enable_interrupts() {
            warn!(id = self.id, %err, "interrupt enable failed, stopping worker");
            self.shutdown_worker();
            return Err(err);
        }

        self.set_state(State::Operating);
        Ok(())
    }

    fn enable_interrupts(&self) -> Result<()> {
        // Accept unsolicited responses from codecs.
        update32(self.regs.as_ref(), HDA_GCTL, 0, Gctl::UNSOL.bits())?;

        let stream_bits = (1u32 << self.caps.total_streams()) - 1;
        self.regs
            .write32(HDA_INTCTL, INTCTL_GIE | INTCTL_CIE | stream_bits)?;
        // Wake on state change of any SDIN line.
        self.regs.write16(HDA_WAKEEN, 0x7FFF)
    }

    /// The unbind hook: no further client requests are accepted, in-flight
    /// dispatch is synchronized-with via channel deactivation, then the
    /// interrupt worker is signalled and joined.
    pub fn device_shutdown(&self) {
        if matches!(self.state(), State::Starting | State::Operating) {
            self.set_state(State::ShuttingDown);
        }

        let clients: Vec<_> = self.clients.lock().unwrap().drain(..).collect();
        for client in clients {
            client.closing.store(true, Ordering::Release);
            client.channel.deactivate();
        }

        self.shutdown_worker();
    }

    fn shutdown_worker(&self) {
        let handle = self.irq_worker.lock().unwrap().take();
        if let Some(handle) = handle {
            self.irq.trigger_shutdown();
            let _ = handle.join();
            assert_eq!(self.state(), State::ShutDown);
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u32(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u32, Ordering::SeqCst);
    }

    pub fn capabilities(&self) -> Gcap {
        self.caps
    }

    /// The buffer-descriptor-list region; each stream context owns a
    /// `BDL_BYTES_PER_STREAM` slice of it, identified by `bdl_phys`.
    pub fn bdl_region(&self) -> &DmaRegion {
        &self.bdl_mem
    }

    /// Check a stream engine out of the pool. `ty` must be `Input` or
    /// `Output`; bidirectional engines are only handed out as overflow.
    pub fn allocate_stream(&self, ty: StreamType) -> Result<StreamContext> {
        self.streams.lock().unwrap().allocate(ty)
    }

    /// Return a stream engine to the pool it came from and drop any
    /// registered completion handler for it.
    pub fn return_stream(&self, ctx: StreamContext) {
        self.completion_handlers.lock().unwrap().remove(&ctx.index());
        self.streams.lock().unwrap().release(ctx);
    }

    /// Queue one verb command to a codec via the command ring.
    pub fn send_codec_command(&self, codec_addr: u8, nid: u16, verb: u32) -> Result<()> {
        let cmd = CodecCommand {
            codec_addr,
            nid,
            verb,
        };
        self.cmd_ring
            .lock()
            .unwrap()
            .queue(self.regs.as_ref(), cmd)
    }

    /// Install the sink for codec verb responses (solicited and
    /// unsolicited). Handlers run on the interrupt worker and must not
    /// install handlers themselves.
    pub fn set_response_handler(&self, handler: CodecResponseHandler) {
        *self.response_handler.lock().unwrap() = Some(handler);
    }

    /// Install the completion handler for one checked-out stream engine.
    pub fn set_stream_completion_handler(&self, index: u8, handler: StreamCompletionHandler) {
        self.completion_handlers.lock().unwrap().insert(index, handler);
    }

    /// Install the codec hot-plug (STATESTS wake) sink.
    pub fn set_codec_wake_handler(&self, handler: CodecWakeHandler) {
        *self.wake_handler.lock().unwrap() = Some(handler);
    }

    /// Register a new client connection.
    pub fn open_client(
        self: &Arc<Self>,
        channel: Arc<dyn Channel>,
    ) -> Result<Arc<HdaClient>> {
        if self.state() != State::Operating {
            return Err(HdaError::BadState("controller is not operating"));
        }
        let client = Arc::new(HdaClient {
            controller: Arc::clone(self),
            channel,
            closing: AtomicBool::new(false),
        });
        self.clients.lock().unwrap().push(Arc::clone(&client));
        Ok(client)
    }

    pub(crate) fn read_ids(&self) -> Result<ControllerIds> {
        Ok(ControllerIds {
            vendor_id: self.dev_info.vendor_id,
            device_id: self.dev_info.device_id,
            hw_major_version: self.regs.read8(HDA_VMAJ)?,
            hw_minor_version: self.regs.read8(HDA_VMIN)?,
            revision_id: self.dev_info.revision_id,
            stepping_id: 0,
        })
    }

    /// Copy the live register block for diagnostics.
    pub fn snapshot_registers(&self) -> Result<Vec<u8>> {
        let bytes = register_window_bytes(self.caps.total_streams());
        let mut out = Vec::with_capacity(bytes);
        for offset in (0..bytes).step_by(4) {
            out.extend_from_slice(&self.regs.read32(offset as u32)?.to_le_bytes());
        }
        Ok(out)
    }

    pub(crate) fn wait_for_wake(&self) -> Result<Wake> {
        self.irq.wait()
    }

    /// Terminal transition; called exactly once, by the exiting worker.
    pub(crate) fn note_worker_exit(&self) {
        self.set_state(State::ShutDown);
    }

    /// Drain all pending hardware events. Runs on the interrupt worker; any
    /// register fault propagates out and kills the thread.
    pub(crate) fn handle_irq(&self) -> Result<()> {
        let intsts = self.regs.read32(HDA_INTSTS)?;

        if intsts & INTSTS_CIS != 0 {
            let rirbsts = self.regs.read8(HDA_RIRBSTS)?;
            self.regs.write8(HDA_RIRBSTS, rirbsts)?;

            let responses = self.resp_ring.lock().unwrap().drain(self.regs.as_ref())?;
            for resp in responses {
                if !resp.unsolicited {
                    self.cmd_ring.lock().unwrap().complete();
                }
                if let Some(handler) = self.response_handler.lock().unwrap().as_ref() {
                    handler(resp);
                }
            }
        }

        for index in 0..self.caps.total_streams() {
            if intsts & stream_int_bit(index) == 0 {
                continue;
            }
            let sts = self.regs.read8(sd_reg(index, SD_REG_STS))?;
            self.regs.write8(sd_reg(index, SD_REG_STS), sts)?;
            if let Some(handler) = self.completion_handlers.lock().unwrap().get(&index) {
                handler(index, SdSts::from_bits_truncate(sts));
            }
        }

        let statests = self.regs.read16(HDA_STATESTS)?;
        if statests != 0 {
            self.regs.write16(HDA_STATESTS, statests)?;
            if let Some(handler) = self.wake_handler.lock().unwrap().as_ref() {
                handler(statests);
            }
        }

        Ok(())
    }
}

impl Drop for HdaController {
    fn drop(&mut self) {
        let state = self.state();
        assert!(
            matches!(state, State::Starting | State::ShutDown),
            "controller {} dropped in state {state:?}",
            self.id
        );
    }
}

impl std::fmt::Debug for HdaController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HdaController")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("dev_info", &self.dev_info)
            .finish_non_exhaustive()
    }
}

/// The framework's single strong reference to a bound controller.
///
/// `bind` creates it, the framework stores it opaquely, and `unbind`
/// consumes it: the whole leak/reclaim dance of a raw cookie pointer is a
/// single ownership transfer.
#[derive(Debug)]
pub struct DeviceCookie {
    controller: Arc<HdaController>,
}

impl DeviceCookie {
    pub fn controller(&self) -> &Arc<HdaController> {
        &self.controller
    }

    /// The unbind + release hooks: quiesce clients, join the worker, then
    /// give the framework's reference back. If this was the last reference
    /// the controller destructor runs here, asserting it reached `ShutDown`.
    pub fn unbind(self) {
        self.controller.device_shutdown();
    }
}

/// The framework's init hook. Calls to init/bind/release are assumed to be
/// serialized by the device manager.
pub fn driver_init() -> Result<()> {
    Ok(())
}

/// One open client connection (a codec sub-device or a control channel).
pub struct HdaClient {
    controller: Arc<HdaController>,
    channel: Arc<dyn Channel>,
    closing: AtomicBool,
}

impl HdaClient {
    pub fn controller(&self) -> &Arc<HdaController> {
        &self.controller
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Handle one inbound request; called by the framework when the
    /// client's channel becomes readable.
    pub fn process_request(&self) -> Result<()> {
        if self.is_closing() {
            return Err(HdaError::BadState("client marked for closing"));
        }
        dispatch::process_client_request(&self.controller, self.channel.as_ref())
    }

    /// Tear down this client: mark it closing, deactivate its channel, and
    /// drop it from the controller's client list.
    pub fn close(self: &Arc<Self>) {
        self.closing.store(true, Ordering::Release);
        self.channel.deactivate();
        self.controller
            .clients
            .lock()
            .unwrap()
            .retain(|other| !Arc::ptr_eq(other, self));
    }
}

impl std::fmt::Debug for HdaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HdaClient")
            .field("controller", &self.controller.id)
            .field("closing", &self.is_closing())
            .finish_non_exhaustive()
    }
}

/// Bring the link out of reset: enter reset (CRST low), then leave it and
/// wait for the controller to report ready. Both waits are bounded.
fn reset_link(regs: &dyn RegisterIo) -> Result<()> {
    update32(regs, HDA_GCTL, Gctl::CRST.bits(), 0)?;
    if !poll32(regs, HDA_GCTL, Gctl::CRST.bits(), 0, RESET_POLL_SPINS)? {
        return Err(HdaError::Timeout("controller reset entry"));
    }

    update32(regs, HDA_GCTL, 0, Gctl::CRST.bits())?;
    if !poll32(
        regs,
        HDA_GCTL,
        Gctl::CRST.bits(),
        Gctl::CRST.bits(),
        RESET_POLL_SPINS,
    )? {
        return Err(HdaError::Timeout("controller reset exit"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHda, FakeHdaConfig};

    fn fake_parts(hw: &FakeHda) -> (Arc<dyn PciProtocol>, Arc<dyn RegisterIo>, Arc<dyn InterruptSource>) {
        (
            Arc::new(hw.clone()),
            Arc::new(hw.clone()),
            Arc::new(hw.clone()),
        )
    }

    // A controller that was constructed but never started must be
    // destructible straight from Starting.
    #[test]
    fn never_started_controller_drops_cleanly() {
        let hw = FakeHda::new(FakeHdaConfig::default());
        let (pci, regs, irq) = fake_parts(&hw);

        let caps = Gcap::new(hw.reg16(HDA_GCAP));
        let corb = hw.allocate(256 * 4);
        let rirb = hw.allocate(256 * 8);
        let bdl = hw.allocate(usize::from(caps.total_streams()) * BDL_BYTES_PER_STREAM);
        let cmd_ring = CommandRing::setup(regs.as_ref(), corb, 2, 256, 256).unwrap();
        let resp_ring = ResponseRing::setup(regs.as_ref(), rirb, 2, 256).unwrap();

        let controller = HdaController::new(pci, regs, irq, caps, cmd_ring, resp_ring, bdl);
        assert_eq!(controller.state(), State::Starting);
        drop(controller);
    }

    #[test]
    fn controller_ids_are_unique_and_monotonic() {
        let first = HdaController::bind(&FakeHda::new(FakeHdaConfig::default())).unwrap();
        let second = HdaController::bind(&FakeHda::new(FakeHdaConfig::default())).unwrap();
        assert!(second.controller().id() > first.controller().id());
        first.unbind();
        second.unbind();
    }

    #[test]
    fn reset_link_times_out_on_stuck_crst() {
        let hw = FakeHda::new(FakeHdaConfig::default());
        hw.stick_crst();
        assert!(matches!(
            reset_link(&hw),
            Err(HdaError::Timeout("controller reset exit"))
        ));
    }
}
