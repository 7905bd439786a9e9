//! Per-stream atomic coordination between senders and closers.
//!
//! A single atomic word, split into two fields:
//!
//! ```text
//! bit 31..24          bit 23..0
//! closer multiplicity sender count
//! (0..=3, scaled by   (threads currently inside send)
//!  CLOSING_UNIT)
//! ```
//!
//! Senders increment the low field for the duration of the send and back
//! out if any closer is present. Closers add one `CLOSING_UNIT`; the first
//! closer waits until the sender count drains to zero before the stream is
//! torn down. At most three closers can race on one stream: the receive
//! thread handling a peer close, the session drain path, and a user
//! `close()`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

const SENDER_BITS: u32 = 24;
const CLOSING_UNIT: u32 = 1 << SENDER_BITS;
const SENDER_MASK: u32 = CLOSING_UNIT - 1;
const CLOSER_MASK: u32 = 3 * CLOSING_UNIT;
const MAX_CLOSERS: u32 = 3;
const SPIN_LIMIT: u32 = 128;

pub(crate) struct SendStatus {
    word: AtomicU32,
    idle: Mutex<()>,
    idle_cv: Condvar,
}

impl SendStatus {
    pub(crate) fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
            idle: Mutex::new(()),
            idle_cv: Condvar::new(),
        }
    }

    /// Register as an in-flight sender. Returns false (after backing the
    /// registration out) when a closer holds the stream; the caller must
    /// drop the frame instead of sending.
    pub(crate) fn try_begin_send(&self) -> bool {
        let observed = self.word.fetch_add(1, Ordering::AcqRel) + 1;
        if observed & CLOSER_MASK != 0 {
            self.end_send();
            return false;
        }
        true
    }

    /// Deregister an in-flight sender.
    pub(crate) fn end_send(&self) {
        let after = self.word.fetch_sub(1, Ordering::AcqRel) - 1;
        if after & CLOSER_MASK != 0 && after & SENDER_MASK == 0 {
            // Last sender out while a closer waits.
            let _guard = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            self.idle_cv.notify_all();
        }
    }

    /// Claim a closing slot. The first closer waits for in-flight senders
    /// to drain and gets `true`; later closers (and callers beyond the
    /// three-slot cap) return `false` immediately, the close already being
    /// underway.
    pub(crate) fn begin_close(&self) -> bool {
        let mut current = self.word.load(Ordering::Acquire);
        let first = loop {
            let closers = (current & CLOSER_MASK) / CLOSING_UNIT;
            if closers >= MAX_CLOSERS {
                // Slot cap reached; join the close already underway.
                break false;
            }
            match self.word.compare_exchange_weak(
                current,
                current + CLOSING_UNIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break closers == 0,
                Err(observed) => current = observed,
            }
        };
        if !first {
            return false;
        }

        let mut spins = 0u32;
        while self.word.load(Ordering::Acquire) & SENDER_MASK != 0 {
            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
                continue;
            }
            let guard = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            if self.word.load(Ordering::Acquire) & SENDER_MASK == 0 {
                break;
            }
            // Timed wait covers the window between the mask check and the
            // sender's notify.
            let _ = self
                .idle_cv
                .wait_timeout(guard, Duration::from_millis(1))
                .unwrap_or_else(|e| e.into_inner());
        }
        true
    }

    /// Whether any closer holds the stream.
    pub(crate) fn is_closing(&self) -> bool {
        self.word.load(Ordering::Acquire) & CLOSER_MASK != 0
    }

    #[cfg(test)]
    fn raw(&self) -> u32 {
        self.word.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn senders_alone_return_word_to_zero() {
        let status = Arc::new(SendStatus::new());
        let mut handles = Vec::new();
        for _ in 0..2 {
            let status = Arc::clone(&status);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    assert!(status.try_begin_send());
                    status.end_send();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(status.raw(), 0);
    }

    #[test]
    fn close_blocks_subsequent_sends() {
        let status = SendStatus::new();
        assert!(status.try_begin_send());
        status.end_send();

        assert!(status.begin_close());
        assert!(status.is_closing());
        assert!(!status.try_begin_send());
        // Rejected send leaves no residue in the sender field.
        assert_eq!(status.raw() & SENDER_MASK, 0);
    }

    #[test]
    fn only_first_closer_wins() {
        let status = SendStatus::new();
        assert!(status.begin_close());
        assert!(!status.begin_close());
        assert!(!status.begin_close());
        // Fourth closer joins the cap without growing the field.
        assert!(!status.begin_close());
        assert_eq!(status.raw(), CLOSER_MASK);
    }

    #[test]
    fn closer_waits_for_inflight_sender() {
        let status = Arc::new(SendStatus::new());
        assert!(status.try_begin_send());

        let observed_mid_send = Arc::new(AtomicUsize::new(0));
        let closer = {
            let status = Arc::clone(&status);
            let observed = Arc::clone(&observed_mid_send);
            thread::spawn(move || {
                assert!(status.begin_close());
                // By the time the close slot is held, the sender is out.
                observed.store(status.raw() as usize & SENDER_MASK as usize, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(20));
        status.end_send();
        closer.join().unwrap();
        assert_eq!(observed_mid_send.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn no_send_succeeds_after_close_under_contention() {
        let status = Arc::new(SendStatus::new());
        let sent_after_close = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        let mut senders = Vec::new();
        for _ in 0..2 {
            let status = Arc::clone(&status);
            let sent_after_close = Arc::clone(&sent_after_close);
            let closed = Arc::clone(&closed);
            senders.push(thread::spawn(move || {
                for _ in 0..50_000 {
                    if status.try_begin_send() {
                        if closed.load(Ordering::SeqCst) == 1 {
                            sent_after_close.fetch_add(1, Ordering::SeqCst);
                        }
                        status.end_send();
                    }
                }
            }));
        }

        let closer = {
            let status = Arc::clone(&status);
            let closed = Arc::clone(&closed);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                status.begin_close();
                closed.store(1, Ordering::SeqCst);
            })
        };

        for handle in senders {
            handle.join().unwrap();
        }
        closer.join().unwrap();

        // Once the closer took the slot (closed == 1 is stored only after
        // begin_close returns, which requires the sender field drained and
        // the closing bit visible), no try_begin_send may succeed.
        assert_eq!(sent_after_close.load(Ordering::SeqCst), 0);
        assert_eq!(status.raw() & SENDER_MASK, 0);
    }
}
