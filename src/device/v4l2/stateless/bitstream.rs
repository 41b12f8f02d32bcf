// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Assembly of the slices of a picture into one Annex-B bitstream buffer.

use log::debug;

use crate::decoder::stateless::DecodePhase;
use crate::decoder::stateless::StatelessBackendError;
use crate::decoder::stateless::StatelessBackendResult;
use crate::pool::BufferPool;
use crate::pool::PoolError;
use crate::pool::PooledBuffer;

const START_CODE: [u8; 3] = [0, 0, 1];

/// Bitstream buffers are plain memory blocks of fixed size.
pub type BitstreamPool = BufferPool<Vec<u8>>;

/// The complete bitstream of one picture, ready to be attached to a request.
pub struct SealedBitstream {
    buffer: PooledBuffer<Vec<u8>>,
    length: usize,
}

impl SealedBitstream {
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.length]
    }
}

struct BitstreamWriter {
    buffer: PooledBuffer<Vec<u8>>,
    length: usize,
}

/// Accumulates the slice NAL units of the current picture.
#[derive(Default)]
pub struct BitstreamAssembler {
    current: Option<BitstreamWriter>,
}

impl BitstreamAssembler {
    pub fn new() -> Self {
        Default::default()
    }

    /// Takes a buffer from `pool` for a new picture. Any unfinished picture is dropped.
    pub fn start_picture(&mut self, pool: &BitstreamPool) -> StatelessBackendResult<()> {
        self.current = None;

        let buffer = pool.try_acquire().map_err(|e| match e {
            PoolError::Flushing => StatelessBackendError::Flushing,
            e => StatelessBackendError::fatal(DecodePhase::Allocation, e),
        })?;

        self.current = Some(BitstreamWriter { buffer, length: 0 });
        Ok(())
    }

    /// Appends a start code and `nalu` to the current picture.
    ///
    /// Fails without writing anything if the buffer cannot hold both.
    pub fn decode_slice(&mut self, nalu: &[u8]) -> StatelessBackendResult<()> {
        let writer = self
            .current
            .as_mut()
            .ok_or(StatelessBackendError::InvalidState("no picture started"))?;

        let capacity = writer.buffer.len();
        let needed = writer.length + START_CODE.len() + nalu.len();
        if needed > capacity {
            return Err(StatelessBackendError::BitstreamCapacity { needed, capacity });
        }

        let start = writer.length;
        let data_start = start + START_CODE.len();
        writer.buffer[start..data_start].copy_from_slice(&START_CODE);
        writer.buffer[data_start..needed].copy_from_slice(nalu);
        writer.length = needed;

        Ok(())
    }

    /// Finishes the current picture and hands its bitstream over. The assembler is left without a
    /// picture whatever the outcome.
    pub fn end_picture(&mut self) -> StatelessBackendResult<SealedBitstream> {
        let writer = self
            .current
            .take()
            .ok_or(StatelessBackendError::InvalidState("no picture started"))?;

        debug!("{:<20} {} bytes", "sealed bitstream", writer.length);
        Ok(SealedBitstream { buffer: writer.buffer, length: writer.length })
    }

    /// Drops the picture being assembled, if any.
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Number of bytes written for the current picture.
    pub fn len(&self) -> usize {
        self.current.as_ref().map_or(0, |w| w.length)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_started(&self) -> bool {
        self.current.is_some()
    }
}
