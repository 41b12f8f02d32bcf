// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateless decoders.
//!
//! Stateless here refers to the backend API targeted by these decoders. The parser and the
//! reference bookkeeping hold the decoding state and drive a backend through the per-codec
//! lifecycle interface, e.g. [`h264::StatelessH264DecoderBackend`].

pub mod h264;

use std::fmt;

use thiserror::Error;

/// Step of the decoding of a picture at which a fatal error occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodePhase {
    Allocation,
    Controls,
    Queuing,
    Polling,
    Negotiation,
    Flush,
}

impl fmt::Display for DecodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DecodePhase::Allocation => "allocation",
            DecodePhase::Controls => "controls",
            DecodePhase::Queuing => "queuing",
            DecodePhase::Polling => "polling",
            DecodePhase::Negotiation => "negotiation",
            DecodePhase::Flush => "flush",
        };
        f.write_str(name)
    }
}

/// Error returned by stateless backend methods.
#[derive(Error, Debug)]
pub enum StatelessBackendError {
    /// The decoder is being flushed. The operation has been abandoned and no error should be
    /// reported.
    #[error("operation aborted by flush")]
    Flushing,
    #[error("slice data needs {needed} bytes but the bitstream buffer holds {capacity}")]
    BitstreamCapacity { needed: usize, capacity: usize },
    #[error("{phase} failed: {error:#}")]
    Fatal { phase: DecodePhase, error: anyhow::Error },
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl StatelessBackendError {
    pub fn fatal(phase: DecodePhase, error: impl Into<anyhow::Error>) -> Self {
        Self::Fatal { phase, error: error.into() }
    }

    /// Whether this is the benign result of a flush rather than an actual failure.
    pub fn is_flushing(&self) -> bool {
        matches!(self, Self::Flushing)
    }

    /// The phase that failed, for fatal errors.
    pub fn phase(&self) -> Option<DecodePhase> {
        match self {
            Self::Fatal { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

/// Result type returned by stateless backend methods.
pub type StatelessBackendResult<T> = Result<T, StatelessBackendError>;
