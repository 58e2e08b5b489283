use ringbuffer::{AllocRingBuffer, RingBuffer};

use crate::types::Candle;

/// Rolling window of sealed candles fed to the decision model.
#[derive(Debug)]
pub struct CandleWindow {
    len: usize,
    candles: AllocRingBuffer<Candle>,
    last_bucket: Option<i64>,
}

impl CandleWindow {
    pub fn new(len: usize) -> Self {
        let capacity = len.next_power_of_two().max(2);
        Self {
            len,
            candles: AllocRingBuffer::with_capacity(capacity),
            last_bucket: None,
        }
    }

    /// Appends a sealed candle. Open, duplicate or out-of-order candles are
    /// ignored.
    pub fn push(&mut self, candle: Candle) -> bool {
        if !candle.closed {
            return false;
        }
        let bucket = candle.bucket();
        if self.last_bucket.is_some_and(|last| bucket <= last) {
            return false;
        }
        self.candles.push(candle);
        // AllocRingBuffer rounds capacity up; trim to the configured length.
        while self.candles.len() > self.len {
            let _ = self.candles.dequeue();
        }
        self.last_bucket = Some(bucket);
        true
    }

    /// Replaces the window with history. Only sealed bars are kept.
    pub fn seed(&mut self, candles: &[Candle]) {
        self.clear();
        for candle in candles {
            self.push(*candle);
        }
    }

    pub fn clear(&mut self) {
        self.candles.clear();
        self.last_bucket = None;
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Candle> {
        self.candles.iter().copied().collect()
    }
}
