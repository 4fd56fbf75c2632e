//! Striped Allocator
//!
//! Hands out block addresses round-robin across the `F` stripes, so that write contention is
//! amortized over `F` independent per-stripe mutexes (see `stripe.rs`) while the address space
//! stays flat and allocation is `O(1)` with no free-list.
//!
//! The dispenser is a single background thread cycling `0..F` and feeding a bounded channel;
//! callers pull their next stripe index from it. An atomic counter modulo `F` would be an
//! equally valid way to do this, but the channel form composes more simply with the rest of
//! this crate's `crossbeam` usage.
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use log::trace;

use crate::{address, error::Error, stripe::StripeSet};

/// Dispenses stripe indices round-robin and allocates addresses from them.
pub struct Allocator {
    stripes: Arc<StripeSet>,
    dispenser: Receiver<u16>,
    // Keeping the Sender alive for the lifetime of the Allocator keeps the feeder thread's send
    // from ever failing; it is never read from directly.
    _feeder: Sender<u16>,
}

impl Allocator {
    /// Build an allocator over `stripes`, spawning the round-robin dispenser thread.
    pub fn new(stripes: Arc<StripeSet>) -> Self {
        let f = stripes.count();
        let (tx, rx) = channel::bounded(1);
        let feeder = tx.clone();
        std::thread::spawn(move || {
            let mut idx: u16 = 0;
            loop {
                if feeder.send(idx).is_err() {
                    return;
                }
                idx += 1;
                if idx == f {
                    idx = 0;
                }
            }
        });

        Allocator {
            stripes,
            dispenser: rx,
            _feeder: tx,
        }
    }

    /// Allocate and return the next block address, round-robin across stripes.
    pub fn allocate_block(&self) -> Result<address::Address, Error> {
        let s = self.dispenser.recv().expect("dispenser thread exited");
        trace!("dispensed stripe {}", s);
        let off = self.stripes.allocate(s)?;
        Ok(address::make(s, off))
    }
}
