use crate::error::BufferError;
use crate::models::Candle;
use std::collections::VecDeque;
use std::sync::Arc;

/// Immutable, ordered view of the buffer at one point in time
///
/// Cheap to clone; later appends never change an existing snapshot.
#[derive(Debug, Clone, Default)]
pub struct CandleWindow {
    candles: Arc<[Candle]>,
    capacity: usize,
}

impl CandleWindow {
    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Capacity of the buffer the snapshot came from
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True when the window holds `capacity` candles
    pub fn is_full(&self) -> bool {
        self.capacity > 0 && self.candles.len() == self.capacity
    }

    pub fn latest(&self) -> Option<&Candle> {
        self.candles.last()
    }
}

/// Rolling window of the most recent closed candles for one instrument
///
/// Single writer: owned by the detection loop. Sorted by timestamp,
/// never longer than `capacity`; the oldest candle is evicted first.
#[derive(Debug)]
pub struct CandleBuffer {
    data: VecDeque<Candle>,
    capacity: usize,
    view: CandleWindow,
}

impl CandleBuffer {
    /// Create a new candle buffer
    ///
    /// # Arguments
    /// * `capacity` - Lookback depth (number of candles kept)
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity + 1),
            capacity,
            view: CandleWindow {
                candles: Arc::from(Vec::new()),
                capacity,
            },
        }
    }

    /// Add a closed candle
    ///
    /// Rejects candles whose timestamp is not strictly after the last one;
    /// the buffer is left untouched in that case.
    pub fn append(&mut self, candle: Candle) -> Result<(), BufferError> {
        if let Some(last) = self.data.back() {
            if candle.timestamp <= last.timestamp {
                return Err(BufferError::OutOfOrder {
                    last: last.timestamp,
                    received: candle.timestamp,
                });
            }
        }

        self.data.push_back(candle);

        while self.data.len() > self.capacity {
            self.data.pop_front();
        }

        self.view = CandleWindow {
            candles: self.data.iter().copied().collect(),
            capacity: self.capacity,
        };

        Ok(())
    }

    /// Current contents; O(1)
    pub fn snapshot(&self) -> CandleWindow {
        self.view.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.data.back().map(|c| c.timestamp)
    }
}
