//! End-to-end driver behaviour against the fake hardware: bind/unbind
//! lifecycle, worker-thread event draining, and client dispatch.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ihda_controller::dispatch::{CMD_GET_IDS, CMD_SNAPSHOT_REGS, GET_IDS_RESP_SIZE, HDR_SIZE};
use ihda_controller::stream::StreamType;
use ihda_controller::testing::{FakeChannel, FakeHda, FakeHdaConfig};
use ihda_controller::{HdaController, HdaError, State};
use ihda_registers::{
    register_window_bytes, sd_reg, CodecResponse, HDA_GCAP, HDA_INTSTS, SD_REG_BDPL, SD_REG_CTL,
};

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn bind_reaches_operating_and_unbind_joins_the_worker() {
    let hw = FakeHda::new(FakeHdaConfig::default());
    let cookie = HdaController::bind(&hw).unwrap();
    let controller = Arc::clone(cookie.controller());
    assert_eq!(controller.state(), State::Operating);

    cookie.unbind();
    // The worker performed the terminal transition before unbind returned.
    assert_eq!(controller.state(), State::ShutDown);
}

#[test]
fn bind_propagates_the_first_failure_unchanged() {
    let stuck = FakeHda::new(FakeHdaConfig::default());
    stuck.stick_crst();
    assert!(matches!(
        HdaController::bind(&stuck),
        Err(HdaError::Timeout(_))
    ));

    let no_dma = FakeHda::new(FakeHdaConfig {
        fail_dma: true,
        ..FakeHdaConfig::default()
    });
    assert!(matches!(
        HdaController::bind(&no_dma),
        Err(HdaError::NoMemory)
    ));

    let faulted = FakeHda::new(FakeHdaConfig::default());
    faulted.fail_register(ihda_registers::HDA_GCTL);
    assert!(matches!(HdaController::bind(&faulted), Err(HdaError::Io(_))));
}

#[test]
fn get_ids_reply_echoes_header_and_reads_live_registers() {
    let config = FakeHdaConfig {
        vendor_id: 0x1AF4,
        device_id: 0x9A55,
        revision_id: 0x03,
        ..FakeHdaConfig::default()
    };
    let hw = FakeHda::new(config);
    let cookie = HdaController::bind(&hw).unwrap();

    let channel = Arc::new(FakeChannel::new());
    let client = cookie
        .controller()
        .open_client(Arc::clone(&channel) as _)
        .unwrap();

    channel.push_request(&CMD_GET_IDS.to_le_bytes());
    client.process_request().unwrap();

    let replies = channel.take_replies();
    assert_eq!(replies.len(), 1);
    let reply = &replies[0];
    assert_eq!(reply.len(), GET_IDS_RESP_SIZE);
    assert_eq!(&reply[..HDR_SIZE], &CMD_GET_IDS.to_le_bytes());
    assert_eq!(u16::from_le_bytes([reply[4], reply[5]]), 0x1AF4);
    assert_eq!(u16::from_le_bytes([reply[6], reply[7]]), 0x9A55);
    assert_eq!(reply[8], 1); // VMAJ, read live
    assert_eq!(reply[9], 0); // VMIN
    assert_eq!(reply[10], 0x03);

    cookie.unbind();
}

#[test]
fn get_ids_with_wrong_size_is_rejected_without_a_reply() {
    let hw = FakeHda::new(FakeHdaConfig::default());
    let cookie = HdaController::bind(&hw).unwrap();

    let channel = Arc::new(FakeChannel::new());
    let client = cookie
        .controller()
        .open_client(Arc::clone(&channel) as _)
        .unwrap();

    let mut oversized = CMD_GET_IDS.to_le_bytes().to_vec();
    oversized.push(0xFF);
    channel.push_request(&oversized);
    assert!(matches!(
        client.process_request(),
        Err(HdaError::InvalidArgs(_))
    ));
    assert!(channel.take_replies().is_empty());

    // The connection stays usable for the next, well-formed request.
    channel.push_request(&CMD_GET_IDS.to_le_bytes());
    client.process_request().unwrap();
    assert_eq!(channel.take_replies().len(), 1);

    cookie.unbind();
}

#[test]
fn snapshot_regs_returns_a_copy_of_the_register_block() {
    let hw = FakeHda::new(FakeHdaConfig::default());
    let cookie = HdaController::bind(&hw).unwrap();

    let channel = Arc::new(FakeChannel::new());
    let client = cookie
        .controller()
        .open_client(Arc::clone(&channel) as _)
        .unwrap();

    channel.push_request(&CMD_SNAPSHOT_REGS.to_le_bytes());
    client.process_request().unwrap();

    let replies = channel.take_replies();
    let reply = &replies[0];
    let window = register_window_bytes(hw.gcap().total_streams());
    assert_eq!(reply.len(), HDR_SIZE + 4 + window);
    assert_eq!(&reply[..HDR_SIZE], &CMD_SNAPSHOT_REGS.to_le_bytes());
    // Status word, then the raw block; GCAP sits at block offset 0.
    assert_eq!(&reply[4..8], &0i32.to_le_bytes());
    let gcap = u16::from_le_bytes([reply[8 + HDA_GCAP as usize], reply[9 + HDA_GCAP as usize]]);
    assert_eq!(gcap, hw.gcap().raw());

    cookie.unbind();
}

#[test]
fn worker_drains_codec_responses_to_the_registered_sink() {
    let hw = FakeHda::new(FakeHdaConfig::default());
    hw.enable_auto_respond();
    let cookie = HdaController::bind(&hw).unwrap();

    let seen: Arc<Mutex<Vec<CodecResponse>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    cookie
        .controller()
        .set_response_handler(Box::new(move |resp| {
            sink.lock().unwrap().push(resp);
        }));

    let verb = 0xF00 << 8;
    cookie.controller().send_codec_command(0, 0x20, verb).unwrap();
    wait_for("codec response", || !seen.lock().unwrap().is_empty());

    let responses = seen.lock().unwrap().clone();
    assert_eq!(responses[0].data, verb);
    assert!(!responses[0].unsolicited);

    cookie.unbind();
}

#[test]
fn unsolicited_responses_are_flagged_for_the_sink() {
    let hw = FakeHda::new(FakeHdaConfig::default());
    let cookie = HdaController::bind(&hw).unwrap();

    let seen: Arc<Mutex<Vec<CodecResponse>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    cookie
        .controller()
        .set_response_handler(Box::new(move |resp| {
            sink.lock().unwrap().push(resp);
        }));

    hw.publish_response(CodecResponse {
        data: 0x8000_0001,
        codec_addr: 2,
        unsolicited: true,
    });
    wait_for("unsolicited response", || !seen.lock().unwrap().is_empty());

    let responses = seen.lock().unwrap().clone();
    assert!(responses[0].unsolicited);
    assert_eq!(responses[0].codec_addr, 2);

    cookie.unbind();
}

#[test]
fn stream_completion_reaches_the_streams_handler() {
    let hw = FakeHda::new(FakeHdaConfig::default());
    let cookie = HdaController::bind(&hw).unwrap();
    let controller = cookie.controller();

    let ctx = controller.allocate_stream(StreamType::Output).unwrap();
    assert!(ctx.bdl_phys() >= controller.bdl_region().phys_addr());
    ctx.program_registers(&hw).unwrap();
    // Tag and BDL base landed in the stream's descriptor registers.
    let ctl = hw.reg32(sd_reg(ctx.index(), SD_REG_CTL));
    assert_eq!((ctl >> 20) & 0xF, u32::from(ctx.tag()));
    assert_eq!(hw.reg32(sd_reg(ctx.index(), SD_REG_BDPL)), ctx.bdl_phys() as u32);

    let fired: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fired);
    controller.set_stream_completion_handler(
        ctx.index(),
        Box::new(move |index, _sts| {
            sink.lock().unwrap().push(index);
        }),
    );

    hw.complete_stream(ctx.index());
    wait_for("stream completion", || !fired.lock().unwrap().is_empty());
    assert_eq!(fired.lock().unwrap()[0], ctx.index());

    controller.return_stream(ctx);
    cookie.unbind();
}

#[test]
fn codec_hotplug_dispatches_wake_bits() {
    let hw = FakeHda::new(FakeHdaConfig::default());
    let cookie = HdaController::bind(&hw).unwrap();

    let seen: Arc<Mutex<Vec<u16>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    cookie
        .controller()
        .set_codec_wake_handler(Box::new(move |statests| {
            sink.lock().unwrap().push(statests);
        }));

    hw.plug_codec(1);
    wait_for("codec wake", || !seen.lock().unwrap().is_empty());
    assert_eq!(seen.lock().unwrap()[0], 1 << 1);

    cookie.unbind();
}

#[test]
fn unbind_deactivates_clients_before_joining_the_worker() {
    let hw = FakeHda::new(FakeHdaConfig::default());
    let cookie = HdaController::bind(&hw).unwrap();
    let controller = Arc::clone(cookie.controller());

    let channel = Arc::new(FakeChannel::new());
    let client = controller.open_client(Arc::clone(&channel) as _).unwrap();

    cookie.unbind();

    assert!(channel.is_deactivated());
    assert!(client.is_closing());
    assert!(matches!(
        client.process_request(),
        Err(HdaError::BadState(_))
    ));
    // New connections are refused once the controller has shut down.
    assert!(matches!(
        controller.open_client(Arc::new(FakeChannel::new()) as _),
        Err(HdaError::BadState(_))
    ));
}

#[test]
fn client_close_detaches_the_connection() {
    let hw = FakeHda::new(FakeHdaConfig::default());
    let cookie = HdaController::bind(&hw).unwrap();

    let channel = Arc::new(FakeChannel::new());
    let client = cookie
        .controller()
        .open_client(Arc::clone(&channel) as _)
        .unwrap();

    client.close();
    assert!(channel.is_deactivated());
    assert!(matches!(
        client.process_request(),
        Err(HdaError::BadState(_))
    ));

    // Unbind after an explicit close must not trip over the gone client.
    cookie.unbind();
}

#[test]
fn worker_register_fault_is_fatal_but_leaves_the_controller_joinable() {
    let hw = FakeHda::new(FakeHdaConfig::default());
    let cookie = HdaController::bind(&hw).unwrap();
    let controller = Arc::clone(cookie.controller());

    hw.fail_register(HDA_INTSTS);
    hw.raise_interrupt();
    wait_for("worker exit", || controller.state() == State::ShutDown);

    // Unbind after the fatal fault still joins cleanly and does not assert.
    cookie.unbind();
}

#[test]
fn stream_exhaustion_is_reported_not_blocking() {
    let hw = FakeHda::new(FakeHdaConfig {
        input_streams: 1,
        output_streams: 1,
        bidir_streams: 1,
        ..FakeHdaConfig::default()
    });
    let cookie = HdaController::bind(&hw).unwrap();
    let controller = cookie.controller();

    let a = controller.allocate_stream(StreamType::Input).unwrap();
    let b = controller.allocate_stream(StreamType::Input).unwrap();
    assert!(matches!(
        controller.allocate_stream(StreamType::Input),
        Err(HdaError::Unavailable)
    ));

    controller.return_stream(a);
    controller.return_stream(b);
    cookie.unbind();
}
