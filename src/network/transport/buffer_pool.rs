/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Bounded pool of fixed-size receive buffers.
//!
//! Each QUIC stream task takes one buffer for the lifetime of its exchange.
//! The buffer returns to the pool when the [`PooledBuffer`] guard is dropped,
//! so every exit path (including an unwinding task) releases it. When the pool
//! is empty a fresh buffer is allocated; when it is full a released buffer is
//! simply freed.

use crossbeam_queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct BufferPool {
    free: ArrayQueue<Vec<u8>>,
    buf_size: usize,
    /// Buffers allocated because the free list was empty
    allocated: AtomicUsize,
}

impl BufferPool {
    /// Create a pool keeping at most `capacity` idle buffers of `buf_size` bytes
    pub fn new(capacity: usize, buf_size: usize) -> Arc<Self> {
        Arc::new(Self {
            free: ArrayQueue::new(capacity.max(1)),
            buf_size,
            allocated: AtomicUsize::new(0),
        })
    }

    /// Take a zeroed buffer of `buf_size` bytes
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = match self.free.pop() {
            Some(buf) => buf,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.buf_size]
            }
        };
        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Number of idle buffers currently held
    pub fn idle(&self) -> usize {
        self.free.len()
    }

    /// Total fresh allocations since creation
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    fn release(&self, mut buf: Vec<u8>) {
        // A holder may have shrunk or grown the vec; restore the fixed shape
        buf.clear();
        buf.resize(self.buf_size, 0);
        let _ = self.free.push(buf);
    }
}

/// Exclusive handle on one pooled buffer
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}
