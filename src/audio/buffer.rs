//! Lock-free sample queue between the player and the audio callback
//!
//! The output device pushes converted samples from the player's thread; the cpal
//! callback pops them on the real-time thread. A shared counter records every
//! sample the callback actually played, which is how the device learns that a
//! submitted buffer has finished.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};

/// Producer half (owned by the output device)
pub struct PcmProducer {
    producer: ringbuf::HeapProd<f32>,
}

impl PcmProducer {
    /// Push samples, returning how many fit
    #[inline]
    pub fn push_slice(&mut self, samples: &[f32]) -> usize {
        self.producer.push_slice(samples)
    }

    pub fn vacant(&self) -> usize {
        self.producer.vacant_len()
    }
}

/// Consumer half (owned by the audio callback)
pub struct PcmConsumer {
    consumer: ringbuf::HeapCons<f32>,
    played: Arc<AtomicU64>,
}

impl PcmConsumer {
    /// Fill `out` from the queue, padding with silence on underrun
    ///
    /// Returns the number of queued samples consumed.
    #[inline]
    pub fn drain_into(&mut self, out: &mut [f32]) -> usize {
        let popped = self.consumer.pop_slice(out);
        out[popped..].fill(0.0);
        self.played.fetch_add(popped as u64, Ordering::Relaxed);
        popped
    }

    /// Drop everything queued and restart the played counter
    pub fn clear(&mut self) {
        self.consumer.clear();
        self.played.store(0, Ordering::Relaxed);
    }

    pub fn queued(&self) -> usize {
        self.consumer.occupied_len()
    }
}

/// Create a queue holding up to `capacity` samples.
///
/// The returned counter tracks samples consumed since the last [`PcmConsumer::clear`].
pub fn pcm_queue(capacity: usize) -> (PcmProducer, PcmConsumer, Arc<AtomicU64>) {
    let rb = HeapRb::<f32>::new(capacity.max(1));
    let (producer, consumer) = rb.split();
    let played = Arc::new(AtomicU64::new(0));

    (
        PcmProducer { producer },
        PcmConsumer {
            consumer,
            played: Arc::clone(&played),
        },
        played,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_counts_played() {
        let (mut prod, mut cons, played) = pcm_queue(8);

        assert_eq!(prod.push_slice(&[0.5; 6]), 6);
        let mut out = [1.0f32; 4];
        assert_eq!(cons.drain_into(&mut out), 4);
        assert_eq!(out, [0.5; 4]);
        assert_eq!(played.load(Ordering::Relaxed), 4);
        assert_eq!(cons.queued(), 2);
    }

    #[test]
    fn test_underrun_pads_silence() {
        let (mut prod, mut cons, played) = pcm_queue(8);

        prod.push_slice(&[0.25, 0.25]);
        let mut out = [1.0f32; 5];
        assert_eq!(cons.drain_into(&mut out), 2);
        assert_eq!(out, [0.25, 0.25, 0.0, 0.0, 0.0]);
        assert_eq!(played.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_overflow_is_reported() {
        let (mut prod, _cons, _) = pcm_queue(4);

        assert_eq!(prod.push_slice(&[0.1; 6]), 4);
        assert_eq!(prod.vacant(), 0);
    }

    #[test]
    fn test_clear_resets() {
        let (mut prod, mut cons, played) = pcm_queue(8);

        prod.push_slice(&[0.1; 8]);
        let mut out = [0.0f32; 3];
        cons.drain_into(&mut out);
        cons.clear();

        assert_eq!(cons.queued(), 0);
        assert_eq!(played.load(Ordering::Relaxed), 0);
        assert_eq!(prod.vacant(), 8);
    }
}
