// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared code for codec backends.
//!
//! A backend is a provider of hardware-accelerated decoding. This module contains the generic
//! stateless V4L2 backend, which drives any [`StatelessDevice`], and a dummy device to test it in
//! isolation.
//!
//! [`StatelessDevice`]: crate::device::v4l2::stateless::device::StatelessDevice

pub mod dummy;
pub mod v4l2;
