use crossbeam_channel as cb;
use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Single-producer / single-consumer ring buffer of stereo i16 frames.
///
/// The APU is the producer; the host's audio path is the consumer. Neither
/// side ever blocks. When the ring is full, new frames are dropped and
/// counted.
///
/// Both handles are `Send` but not `Sync`: each end belongs to exactly one
/// thread at a time.
pub struct AudioConsumer {
    inner: Arc<Inner>,
    _unsync: PhantomData<Cell<()>>,
}

pub struct AudioProducer {
    inner: Arc<Inner>,
    _unsync: PhantomData<Cell<()>>,
}

struct Inner {
    // One spare slot so head == tail always means empty.
    buf: Box<[UnsafeCell<MaybeUninit<[i16; 2]>>]>,
    cap: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    dropped: AtomicU64,
}

// Only the producer writes `buf[head]` and only the consumer reads
// `buf[tail]`; ownership of each slot is handed over through the atomics.
// The handles are `!Sync`, so at most one thread drives each end.
unsafe impl Sync for Inner {}

impl Inner {
    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head >= tail {
            head - tail
        } else {
            (self.cap - tail) + head
        }
    }

    #[inline]
    fn next_index(&self, idx: usize) -> usize {
        let next = idx + 1;
        if next == self.cap { 0 } else { next }
    }
}

pub fn audio_queue(capacity_frames: usize) -> (AudioProducer, AudioConsumer) {
    let cap = capacity_frames.saturating_add(1).max(2);
    let buf = (0..cap)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let inner = Arc::new(Inner {
        buf,
        cap,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
        dropped: AtomicU64::new(0),
    });

    (
        AudioProducer {
            inner: Arc::clone(&inner),
            _unsync: PhantomData,
        },
        AudioConsumer {
            inner,
            _unsync: PhantomData,
        },
    )
}

impl AudioProducer {
    #[inline]
    pub fn push_stereo(&self, left: i16, right: i16) -> bool {
        let head = self.inner.head.load(Ordering::Relaxed);
        let next = self.inner.next_index(head);
        let tail = self.inner.tail.load(Ordering::Acquire);
        if next == tail {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        unsafe {
            (*self.inner.buf[head].get()).write([left, right]);
        }
        self.inner.head.store(next, Ordering::Release);
        true
    }

    /// Pushes as many frames as fit and returns how many were accepted.
    pub fn push_samples(&self, frames: &[[i16; 2]]) -> usize {
        let mut accepted = 0;
        for &[l, r] in frames {
            if !self.push_stereo(l, r) {
                let rest = (frames.len() - accepted - 1) as u64;
                self.inner.dropped.fetch_add(rest, Ordering::Relaxed);
                break;
            }
            accepted += 1;
        }
        accepted
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity_frames(&self) -> usize {
        self.inner.cap - 1
    }

    /// Frames rejected because the ring was full.
    pub fn dropped_frames(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl AudioConsumer {
    #[inline]
    pub fn pop_stereo(&self) -> Option<(i16, i16)> {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }

        let sample = unsafe { (*self.inner.buf[tail].get()).assume_init_read() };
        let next = self.inner.next_index(tail);
        self.inner.tail.store(next, Ordering::Release);
        Some((sample[0], sample[1]))
    }

    /// Moves every frame currently queued into `sink`. Returns the frame count.
    pub fn drain_into<S: AudioSink + ?Sized>(&self, sink: &mut S) -> usize {
        let mut chunk = [[0i16; 2]; 256];
        let mut total = 0;
        loop {
            let mut n = 0;
            while n < chunk.len() {
                match self.pop_stereo() {
                    Some((l, r)) => {
                        chunk[n] = [l, r];
                        n += 1;
                    }
                    None => break,
                }
            }
            if n == 0 {
                break;
            }
            sink.write_frames(&chunk[..n]);
            total += n;
            if n < chunk.len() {
                break;
            }
        }
        total
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity_frames(&self) -> usize {
        self.inner.cap - 1
    }
}

/// Destination for finished stereo frames (an audio device, a file, a test buffer).
pub trait AudioSink: Send {
    fn write_frames(&mut self, frames: &[[i16; 2]]);
}

impl AudioSink for Vec<[i16; 2]> {
    fn write_frames(&mut self, frames: &[[i16; 2]]) {
        self.extend_from_slice(frames);
    }
}

/// Background task that drains an [`AudioConsumer`] into a sink at a fixed
/// cadence, independent of emulation speed.
pub struct AudioPump<S: AudioSink + 'static> {
    shutdown: Option<cb::Sender<()>>,
    handle: Option<JoinHandle<S>>,
}

impl<S: AudioSink + 'static> AudioPump<S> {
    pub fn spawn(consumer: AudioConsumer, mut sink: S, cadence: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = cb::bounded::<()>(1);
        let ticker = cb::tick(cadence);

        let handle = thread::spawn(move || {
            loop {
                cb::select! {
                    recv(ticker) -> _ => {
                        consumer.drain_into(&mut sink);
                    }
                    recv(shutdown_rx) -> _ => break,
                }
            }
            consumer.drain_into(&mut sink);
            sink
        });

        Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Stops the task after a final drain and hands the sink back.
    pub fn stop(mut self) -> Option<S> {
        self.shutdown_and_join()
    }

    fn shutdown_and_join(&mut self) -> Option<S> {
        // Dropping the sender disconnects the channel and wakes the select.
        self.shutdown.take();
        self.handle.take().and_then(|h| h.join().ok())
    }
}

impl<S: AudioSink + 'static> Drop for AudioPump<S> {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
