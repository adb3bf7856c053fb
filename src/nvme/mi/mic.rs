// SPDX-License-Identifier: GPL-3.0-only
/*
 * Copyright (c) 2025 Code Construct
 */
use crc::{CRC_32_ISCSI, Crc};

const ISCSI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Message integrity check over a framed message: CRC-32C across the header
/// and payload, seeded with all-ones and bit-inverted on completion. The
/// value is carried on the wire in little-endian.
pub(crate) fn message_integrity_check(hdr: &[u8], data: &[u8]) -> u32 {
    let mut digest = ISCSI.digest();
    digest.update(hdr);
    digest.update(data);
    digest.finalize()
}
