//! Time-bucketed counter history.
//!
//! Counters recorded over a time range are distributed across fixed-width
//! buckets proportionally to overlap, using remainder-preserving integer
//! math so the distributed total always equals the input exactly.

use std::io::{Read, Write};
use std::ops::AddAssign;

use crate::wire;
use crate::{Error, Result};

/// Counter tuple moved during one recorded range or summed over a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub rx_bytes: i64,
    pub rx_packets: i64,
    pub tx_bytes: i64,
    pub tx_packets: i64,
    pub operations: i64,
}

impl Counters {
    pub fn total_bytes(&self) -> i64 {
        self.rx_bytes + self.tx_bytes
    }
}

impl AddAssign for Counters {
    fn add_assign(&mut self, other: Counters) {
        self.rx_bytes += other.rx_bytes;
        self.rx_packets += other.rx_packets;
        self.tx_bytes += other.tx_bytes;
        self.tx_packets += other.tx_packets;
        self.operations += other.operations;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bucket {
    pub start_millis: i64,
    pub active_millis: i64,
    pub rx_bytes: i64,
    pub rx_packets: i64,
    pub tx_bytes: i64,
    pub tx_packets: i64,
    pub operations: i64,
}

/// Bucketed history for a single key. Buckets are aligned to multiples of
/// the bucket duration and kept sorted by start time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct History {
    bucket_duration: i64,
    buckets: Vec<Bucket>,
}

impl History {
    pub fn new(bucket_duration: i64) -> Self {
        Self {
            bucket_duration,
            buckets: Vec::new(),
        }
    }

    pub fn bucket_duration(&self) -> i64 {
        self.bucket_duration
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Start of the earliest bucket, or `i64::MAX` when empty.
    pub fn start_millis(&self) -> i64 {
        self.buckets
            .first()
            .map_or(i64::MAX, |bucket| bucket.start_millis)
    }

    /// End of the latest bucket, or `i64::MIN` when empty.
    pub fn end_millis(&self) -> i64 {
        self.buckets
            .last()
            .map_or(i64::MIN, |bucket| bucket.start_millis + self.bucket_duration)
    }

    pub fn total_bytes(&self) -> i64 {
        self.buckets
            .iter()
            .map(|bucket| bucket.rx_bytes + bucket.tx_bytes)
            .sum()
    }

    /// Distribute `counters` across the buckets overlapping
    /// `[start_millis, end_millis)`. Zero-length ranges are widened to
    /// one millisecond so the data still lands somewhere.
    pub fn record(&mut self, start_millis: i64, end_millis: i64, counters: Counters) {
        let start = start_millis;
        let end = if end_millis <= start { start + 1 } else { end_millis };

        self.ensure_buckets(start, end);

        let mut remaining = end - start;
        let mut rx_bytes = counters.rx_bytes;
        let mut rx_packets = counters.rx_packets;
        let mut tx_bytes = counters.tx_bytes;
        let mut tx_packets = counters.tx_packets;
        let mut operations = counters.operations;

        // walk newest to oldest, each bucket taking its proportional share
        // of whatever is left
        for bucket in self.buckets.iter_mut().rev() {
            let cur_start = bucket.start_millis;
            let cur_end = cur_start + self.bucket_duration;

            if cur_end < start {
                break;
            }
            if cur_start > end {
                continue;
            }

            let overlap = cur_end.min(end) - cur_start.max(start);
            if overlap <= 0 {
                continue;
            }

            let frac_rx_bytes = rx_bytes * overlap / remaining;
            let frac_rx_packets = rx_packets * overlap / remaining;
            let frac_tx_bytes = tx_bytes * overlap / remaining;
            let frac_tx_packets = tx_packets * overlap / remaining;
            let frac_operations = operations * overlap / remaining;

            bucket.active_millis += overlap;
            bucket.rx_bytes += frac_rx_bytes;
            bucket.rx_packets += frac_rx_packets;
            bucket.tx_bytes += frac_tx_bytes;
            bucket.tx_packets += frac_tx_packets;
            bucket.operations += frac_operations;

            rx_bytes -= frac_rx_bytes;
            rx_packets -= frac_rx_packets;
            tx_bytes -= frac_tx_bytes;
            tx_packets -= frac_tx_packets;
            operations -= frac_operations;
            remaining -= overlap;
        }
    }

    /// Fold another history into this one, redistributing its buckets
    /// through [`History::record`] so differing bucket durations combine
    /// correctly.
    pub fn record_history(&mut self, other: &History) {
        for bucket in &other.buckets {
            self.record(
                bucket.start_millis,
                bucket.start_millis + other.bucket_duration,
                Counters {
                    rx_bytes: bucket.rx_bytes,
                    rx_packets: bucket.rx_packets,
                    tx_bytes: bucket.tx_bytes,
                    tx_packets: bucket.tx_packets,
                    operations: bucket.operations,
                },
            );
        }
    }

    /// Sum counters over `[from_millis, to_millis]`, including edge
    /// buckets proportionally to their overlap.
    pub fn summarize(&self, from_millis: i64, to_millis: i64) -> Counters {
        let mut totals = Counters::default();

        for bucket in &self.buckets {
            let cur_start = bucket.start_millis;
            let cur_end = cur_start + self.bucket_duration;

            let overlap = cur_end.min(to_millis) - cur_start.max(from_millis);
            if overlap <= 0 {
                continue;
            }

            if overlap >= self.bucket_duration {
                totals += Counters {
                    rx_bytes: bucket.rx_bytes,
                    rx_packets: bucket.rx_packets,
                    tx_bytes: bucket.tx_bytes,
                    tx_packets: bucket.tx_packets,
                    operations: bucket.operations,
                };
            } else {
                totals += Counters {
                    rx_bytes: bucket.rx_bytes * overlap / self.bucket_duration,
                    rx_packets: bucket.rx_packets * overlap / self.bucket_duration,
                    tx_bytes: bucket.tx_bytes * overlap / self.bucket_duration,
                    tx_packets: bucket.tx_packets * overlap / self.bucket_duration,
                    operations: bucket.operations * overlap / self.bucket_duration,
                };
            }
        }

        totals
    }

    fn ensure_buckets(&mut self, start_millis: i64, end_millis: i64) {
        let mut cur = start_millis - start_millis.rem_euclid(self.bucket_duration);
        while cur < end_millis {
            if let Err(index) = self
                .buckets
                .binary_search_by_key(&cur, |bucket| bucket.start_millis)
            {
                self.buckets.insert(
                    index,
                    Bucket {
                        start_millis: cur,
                        ..Bucket::default()
                    },
                );
            }
            cur += self.bucket_duration;
        }
    }

    pub(crate) fn write(&self, dst: &mut dyn Write) -> Result<()> {
        wire::write_i64(dst, self.bucket_duration)?;
        wire::write_u32(dst, self.buckets.len() as u32)?;
        for bucket in &self.buckets {
            wire::write_i64(dst, bucket.start_millis)?;
            wire::write_i64(dst, bucket.active_millis)?;
            wire::write_i64(dst, bucket.rx_bytes)?;
            wire::write_i64(dst, bucket.rx_packets)?;
            wire::write_i64(dst, bucket.tx_bytes)?;
            wire::write_i64(dst, bucket.tx_packets)?;
            wire::write_i64(dst, bucket.operations)?;
        }
        Ok(())
    }

    pub(crate) fn read(src: &mut dyn Read) -> Result<History> {
        let bucket_duration = wire::read_i64(src)?;
        if bucket_duration <= 0 {
            return Err(Error::Corrupt("history bucket duration not positive"));
        }

        let count = wire::read_u32(src)?;
        let mut buckets: Vec<Bucket> = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let bucket = Bucket {
                start_millis: wire::read_i64(src)?,
                active_millis: wire::read_i64(src)?,
                rx_bytes: wire::read_i64(src)?,
                rx_packets: wire::read_i64(src)?,
                tx_bytes: wire::read_i64(src)?,
                tx_packets: wire::read_i64(src)?,
                operations: wire::read_i64(src)?,
            };
            if let Some(last) = buckets.last() {
                if bucket.start_millis <= last.start_millis {
                    return Err(Error::Corrupt("history buckets out of order"));
                }
            }
            buckets.push(bucket);
        }

        Ok(History {
            bucket_duration,
            buckets,
        })
    }
}
