use crate::error::Result;

/// Access to the controller's mapped register window.
///
/// All accessors are fallible: a fault on the register window is a
/// hardware/transport failure and is reported to the caller rather than
/// panicking. Offsets are byte offsets from the start of BAR0.
///
/// Implementations must be safe to call concurrently from the bind/unbind
/// caller thread and the interrupt worker; the driver only relies on
/// single-register atomicity, never on cross-register ordering.
pub trait RegisterIo: Send + Sync {
    fn read8(&self, offset: u32) -> Result<u8>;
    fn read16(&self, offset: u32) -> Result<u16>;
    fn read32(&self, offset: u32) -> Result<u32>;

    fn write8(&self, offset: u32, value: u8) -> Result<()>;
    fn write16(&self, offset: u32, value: u16) -> Result<()>;
    fn write32(&self, offset: u32, value: u32) -> Result<()>;
}

/// Read-modify-write of a 32-bit register.
pub fn update32(
    regs: &dyn RegisterIo,
    offset: u32,
    clear: u32,
    set: u32,
) -> Result<()> {
    let value = regs.read32(offset)?;
    regs.write32(offset, (value & !clear) | set)
}

/// Spin on a 32-bit register until `(value & mask) == expected`, bounded by
/// `spins` iterations. Returns whether the condition was observed.
pub fn poll32(
    regs: &dyn RegisterIo,
    offset: u32,
    mask: u32,
    expected: u32,
    spins: u32,
) -> Result<bool> {
    for _ in 0..spins {
        if regs.read32(offset)? & mask == expected {
            return Ok(true);
        }
        std::thread::yield_now();
    }
    Ok(false)
}

/// 16-bit variant of [`poll32`], used for the ring pointer handshakes.
pub fn poll16(
    regs: &dyn RegisterIo,
    offset: u32,
    mask: u16,
    expected: u16,
    spins: u32,
) -> Result<bool> {
    for _ in 0..spins {
        if regs.read16(offset)? & mask == expected {
            return Ok(true);
        }
        std::thread::yield_now();
    }
    Ok(false)
}
