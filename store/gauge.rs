use std::sync::atomic::{AtomicUsize, Ordering};

/// Bytes of slice data currently held in memory, and the high-water mark.
#[derive(Debug, Default)]
pub struct ResidentGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ResidentGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `bytes` as resident until the returned guard is dropped.
    pub fn acquire(&self, bytes: usize) -> GaugeGuard<'_> {
        let now = self.current.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard { gauge: self, bytes }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct GaugeGuard<'a> {
    gauge: &'a ResidentGauge,
    bytes: usize,
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}
