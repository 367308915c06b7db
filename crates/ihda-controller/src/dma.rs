use std::sync::{Arc, Mutex};

/// A physically-contiguous, DMA-capable memory region.
///
/// The region is pinned for the controller's lifetime and shared coherently
/// with the DMA engine: clones refer to the same backing storage, which is
/// how test fakes stand in for hardware on the far side of the bus. All
/// accessors are little-endian, matching the wire format of the ring buffers
/// and buffer descriptor lists.
#[derive(Debug, Clone)]
pub struct DmaRegion {
    mem: Arc<Mutex<Vec<u8>>>,
    phys: u64,
}

impl DmaRegion {
    pub fn new(phys: u64, len: usize) -> Self {
        Self {
            mem: Arc::new(Mutex::new(vec![0; len])),
            phys,
        }
    }

    /// Physical base address programmed into hardware base registers.
    pub fn phys_addr(&self) -> u64 {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.mem.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let mem = self.mem.lock().unwrap();
        let bytes = <[u8; 4]>::try_from(&mem[offset..offset + 4]).unwrap();
        u32::from_le_bytes(bytes)
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        let mut mem = self.mem.lock().unwrap();
        mem[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        let mem = self.mem.lock().unwrap();
        let bytes = <[u8; 8]>::try_from(&mem[offset..offset + 8]).unwrap();
        u64::from_le_bytes(bytes)
    }

    pub fn write_u64(&self, offset: usize, value: u64) {
        let mut mem = self.mem.lock().unwrap();
        mem[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub fn fill(&self, value: u8) {
        self.mem.lock().unwrap().fill(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_backing_storage() {
        let region = DmaRegion::new(0x1000, 64);
        let hw_side = region.clone();

        region.write_u32(8, 0xA5A5_0001);
        assert_eq!(hw_side.read_u32(8), 0xA5A5_0001);
        assert_eq!(hw_side.phys_addr(), 0x1000);
    }

    #[test]
    fn accessors_are_little_endian() {
        let region = DmaRegion::new(0, 16);
        region.write_u64(0, 0x0102_0304_0506_0708);
        assert_eq!(region.read_u32(0), 0x0506_0708);
        assert_eq!(region.read_u32(4), 0x0102_0304);
    }
}
