// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Building blocks of a stateless (request API) decoder: control blocks, requests, bitstream
//! assembly and completion handling.

pub mod bitstream;
pub mod completion;
pub mod controls;
pub mod device;
#[cfg(feature = "v4l2")]
pub mod queue;
pub mod request;
#[cfg(feature = "v4l2")]
pub mod v4l2_device;
