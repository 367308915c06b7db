use std::sync::Arc;

use tracing::{debug, error};

use crate::controller::HdaController;
use crate::ddk::Wake;

/// Main loop of the dedicated interrupt thread.
///
/// Parks on the controller's interrupt object and drains hardware events on
/// every wakeup. Register faults are fatal to the thread: the controller is
/// left unrecoverable but safely joinable. On exit, by any path, this
/// thread performs the terminal lifecycle transition; nothing else writes
/// `ShutDown`.
pub(crate) fn irq_thread_main(controller: Arc<HdaController>) {
    debug!(id = controller.id(), "interrupt worker parked");
    loop {
        match controller.wait_for_wake() {
            Ok(Wake::Interrupt) => {
                if let Err(err) = controller.handle_irq() {
                    error!(
                        id = controller.id(),
                        %err,
                        "register fault while draining interrupts, worker exiting"
                    );
                    break;
                }
            }
            Ok(Wake::Shutdown) => break,
            Err(err) => {
                error!(id = controller.id(), %err, "interrupt wait failed, worker exiting");
                break;
            }
        }
    }
    controller.note_worker_exit();
    debug!(id = controller.id(), "interrupt worker exited");
}
