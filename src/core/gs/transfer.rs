// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Local-memory transfer engine
//!
//! Transfers are armed by BITBLTBUF/TRXPOS/TRXREG and started by TRXDIR.
//! Host-to-local data then streams in through the HWREG port one qword at
//! a time, packed at the destination format's transfer width (24-bit
//! pixels occupy 3 bytes on the wire, 4-bit indices half a byte). The
//! engine maintains a raster cursor over the destination rectangle and a
//! bit accumulator for formats that straddle word boundaries.
//!
//! Local-to-host and local-to-local transfers complete immediately when
//! started; the caller handles cache coherence around them.

use crate::core::vmem::format::{PixelRect, Psm};
use crate::core::vmem::LocalMemory;

use super::registers::{BitBltBuf, TransferDir, TrxPos, TrxReg};

/// Bits one pixel occupies in the HWREG stream
fn transfer_bits(psm: Psm) -> u32 {
    match psm {
        Psm::Ct32 | Psm::Z32 => 32,
        Psm::Ct24 | Psm::Z24 => 24,
        Psm::Ct16 | Psm::Ct16s | Psm::Z16 | Psm::Z16s => 16,
        Psm::T8 | Psm::T8h => 8,
        Psm::T4 | Psm::T4hl | Psm::T4hh => 4,
    }
}

/// Completed-transfer summary handed to the cache layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRect {
    /// Destination base pointer in blocks
    pub base: u32,
    /// Destination buffer width in units of 64 pixels
    pub buffer_width: u32,
    /// Destination format
    pub psm: Psm,
    /// Destination rectangle
    pub rect: PixelRect,
}

/// State of the in-flight transfer, if any
#[derive(Debug, Default)]
pub struct TransferState {
    active: Option<HostTransfer>,
}

/// Serializable image of an in-flight host transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransferSnapshot {
    /// Destination base pointer in blocks
    pub base: u32,
    /// Destination buffer width in units of 64 pixels
    pub buffer_width: u32,
    /// Destination format bits
    pub psm: u8,
    /// Destination rectangle edges (x0, y0, x1, y1)
    pub rect: (u32, u32, u32, u32),
    /// Raster cursor relative to the rectangle origin
    pub cursor: (u32, u32),
    /// Bit accumulator contents
    pub acc: u128,
    /// Bits pending in the accumulator
    pub acc_bits: u32,
}

#[derive(Debug)]
struct HostTransfer {
    base: u32,
    buffer_width: u32,
    psm: Psm,
    rect: PixelRect,
    /// Raster cursor, relative to the rectangle origin
    x: u32,
    y: u32,
    /// Bit accumulator for pixels straddling input words
    acc: u128,
    acc_bits: u32,
}

impl TransferState {
    /// Create with no transfer in flight
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a host-to-local transfer is consuming HWREG data
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Abort any in-flight transfer (reset path)
    pub fn reset(&mut self) {
        self.active = None;
    }

    /// Arm a host-to-local transfer
    ///
    /// Returns the destination footprint so the caller can invalidate the
    /// cache over it, or `None` when the registers describe nothing (zero
    /// size or an undefined format).
    pub fn begin_host_to_local(
        &mut self,
        blt: &BitBltBuf,
        pos: &TrxPos,
        reg: &TrxReg,
    ) -> Option<TransferRect> {
        let psm = Psm::from_bits(blt.dpsm)?;
        if reg.rrw == 0 || reg.rrh == 0 {
            return None;
        }
        let rect = PixelRect::from_size(pos.dsax, pos.dsay, reg.rrw, reg.rrh);
        self.active = Some(HostTransfer {
            base: blt.dbp,
            buffer_width: blt.dbw,
            psm,
            rect,
            x: 0,
            y: 0,
            acc: 0,
            acc_bits: 0,
        });
        log::trace!(
            "Host transfer start: {}x{} -> bp={:#x} {:?}",
            reg.rrw,
            reg.rrh,
            blt.dbp,
            psm
        );
        Some(TransferRect {
            base: blt.dbp,
            buffer_width: blt.dbw,
            psm,
            rect,
        })
    }

    /// Feed one qword of HWREG data
    ///
    /// Returns the completed footprint when this qword finishes the
    /// rectangle; surplus data beyond the rectangle is discarded like the
    /// hardware does.
    pub fn write_qword(&mut self, data: u128, mem: &mut LocalMemory) -> Option<TransferRect> {
        // Halves keep the bit accumulator within u128: the leftover is
        // always smaller than one pixel (at most 31 bits), and 31 + 64
        // fits where 31 + 128 would not
        let first = self.write_dword(data as u64, mem);
        let second = self.write_dword((data >> 64) as u64, mem);
        second.or(first)
    }

    /// Feed one 64-bit HWREG register write (the A+D path sends halves)
    pub fn write_dword(&mut self, data: u64, mem: &mut LocalMemory) -> Option<TransferRect> {
        let transfer = self.active.as_mut()?;
        debug_assert!(transfer.acc_bits < 32, "leftover must be under one pixel");
        transfer.acc |= (data as u128) << transfer.acc_bits;
        let mut avail = transfer.acc_bits + 64;
        let bits = transfer_bits(transfer.psm);

        while avail >= bits && transfer.y < transfer.rect.height() {
            let pixel = (transfer.acc & ((1u128 << bits) - 1)) as u32;
            transfer.acc >>= bits;
            avail -= bits;

            mem.write_pixel(
                transfer.base,
                transfer.buffer_width,
                transfer.rect.x0 + transfer.x,
                transfer.rect.y0 + transfer.y,
                transfer.psm,
                pixel,
            );

            transfer.x += 1;
            if transfer.x == transfer.rect.width() {
                transfer.x = 0;
                transfer.y += 1;
            }
        }
        transfer.acc_bits = avail;

        if transfer.y >= transfer.rect.height() {
            let done = TransferRect {
                base: transfer.base,
                buffer_width: transfer.buffer_width,
                psm: transfer.psm,
                rect: transfer.rect,
            };
            log::trace!("Host transfer complete: bp={:#x}", done.base);
            self.active = None;
            Some(done)
        } else {
            None
        }
    }

    /// Snapshot the in-flight transfer for a save state
    pub fn snapshot(&self) -> Option<TransferSnapshot> {
        self.active.as_ref().map(|t| TransferSnapshot {
            base: t.base,
            buffer_width: t.buffer_width,
            psm: t.psm as u8,
            rect: (t.rect.x0, t.rect.y0, t.rect.x1, t.rect.y1),
            cursor: (t.x, t.y),
            acc: t.acc,
            acc_bits: t.acc_bits,
        })
    }

    /// Restore an in-flight transfer from a save state
    pub fn restore(&mut self, snapshot: Option<TransferSnapshot>) {
        self.active = snapshot.and_then(|s| {
            let psm = Psm::from_bits(s.psm)?;
            Some(HostTransfer {
                base: s.base,
                buffer_width: s.buffer_width,
                psm,
                rect: PixelRect::new(s.rect.0, s.rect.1, s.rect.2, s.rect.3),
                x: s.cursor.0,
                y: s.cursor.1,
                acc: s.acc,
                acc_bits: s.acc_bits,
            })
        });
    }

    /// Execute a local-to-host read into `out`, returning the source
    /// footprint
    ///
    /// The whole rectangle is read at once; pixels are packed at the
    /// transfer width in raster order.
    pub fn local_to_host(
        blt: &BitBltBuf,
        pos: &TrxPos,
        reg: &TrxReg,
        mem: &LocalMemory,
        out: &mut Vec<u8>,
    ) -> Option<TransferRect> {
        let psm = Psm::from_bits(blt.spsm)?;
        if reg.rrw == 0 || reg.rrh == 0 {
            return None;
        }
        let rect = PixelRect::from_size(pos.ssax, pos.ssay, reg.rrw, reg.rrh);
        let bits = transfer_bits(psm);

        let mut acc: u128 = 0;
        let mut acc_bits = 0u32;
        for y in rect.y0..rect.y1 {
            for x in rect.x0..rect.x1 {
                let pixel = mem.read_pixel(blt.sbp, blt.sbw, x, y, psm) as u128;
                acc |= pixel << acc_bits;
                acc_bits += bits;
                while acc_bits >= 8 {
                    out.push(acc as u8);
                    acc >>= 8;
                    acc_bits -= 8;
                }
            }
        }
        if acc_bits > 0 {
            out.push(acc as u8);
        }

        Some(TransferRect {
            base: blt.sbp,
            buffer_width: blt.sbw,
            psm,
            rect,
        })
    }

    /// Execute a local-to-local copy, returning the destination footprint
    ///
    /// TRXPOS.DIR selects the corner the copy starts from so overlapping
    /// rectangles copy without reading their own output.
    pub fn local_to_local(
        blt: &BitBltBuf,
        pos: &TrxPos,
        reg: &TrxReg,
        mem: &mut LocalMemory,
    ) -> Option<TransferRect> {
        let spsm = Psm::from_bits(blt.spsm)?;
        let dpsm = Psm::from_bits(blt.dpsm)?;
        if reg.rrw == 0 || reg.rrh == 0 {
            return None;
        }

        let (x_rev, y_rev) = (pos.dir & 1 != 0, pos.dir & 2 != 0);
        for row in 0..reg.rrh {
            let dy = if y_rev { reg.rrh - 1 - row } else { row };
            for col in 0..reg.rrw {
                let dx = if x_rev { reg.rrw - 1 - col } else { col };
                let pixel = mem.read_pixel(blt.sbp, blt.sbw, pos.ssax + dx, pos.ssay + dy, spsm);
                mem.write_pixel(blt.dbp, blt.dbw, pos.dsax + dx, pos.dsay + dy, dpsm, pixel);
            }
        }

        Some(TransferRect {
            base: blt.dbp,
            buffer_width: blt.dbw,
            psm: dpsm,
            rect: PixelRect::from_size(pos.dsax, pos.dsay, reg.rrw, reg.rrh),
        })
    }
}

/// Dispatch a TRXDIR write against armed transfer registers
///
/// Host-to-local arms the streaming state; the other directions execute
/// immediately. `readback` receives local-to-host bytes.
pub fn start_transfer(
    state: &mut TransferState,
    dir: TransferDir,
    blt: &BitBltBuf,
    pos: &TrxPos,
    reg: &TrxReg,
    mem: &mut LocalMemory,
    readback: &mut Vec<u8>,
) -> Option<(TransferDir, TransferRect)> {
    match dir {
        TransferDir::HostToLocal => state
            .begin_host_to_local(blt, pos, reg)
            .map(|r| (dir, r)),
        TransferDir::LocalToHost => {
            TransferState::local_to_host(blt, pos, reg, mem, readback).map(|r| (dir, r))
        }
        TransferDir::LocalToLocal => {
            TransferState::local_to_local(blt, pos, reg, mem).map(|r| (dir, r))
        }
        TransferDir::Off => {
            state.reset();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regs(
        dbp: u32,
        dbw: u32,
        dpsm: u8,
        dsax: u32,
        dsay: u32,
        w: u32,
        h: u32,
    ) -> (BitBltBuf, TrxPos, TrxReg) {
        (
            BitBltBuf {
                sbp: 0,
                sbw: 1,
                spsm: 0,
                dbp,
                dbw,
                dpsm,
            },
            TrxPos {
                ssax: 0,
                ssay: 0,
                dsax,
                dsay,
                dir: 0,
            },
            TrxReg { rrw: w, rrh: h },
        )
    }

    #[test]
    fn test_host_transfer_ct32() {
        let mut mem = LocalMemory::new();
        let mut state = TransferState::new();
        let (blt, pos, reg) = regs(0x40, 1, 0x00, 2, 3, 4, 2);

        let footprint = state.begin_host_to_local(&blt, &pos, &reg).unwrap();
        assert_eq!(footprint.rect, PixelRect::from_size(2, 3, 4, 2));
        assert!(state.is_active());

        // 8 pixels = 2 qwords of 4 x u32
        let q0 = 0x0000_0003_0000_0002_0000_0001_0000_0000u128;
        let q1 = 0x0000_0007_0000_0006_0000_0005_0000_0004u128;
        assert!(state.write_qword(q0, &mut mem).is_none());
        let done = state.write_qword(q1, &mut mem);
        assert!(done.is_some());
        assert!(!state.is_active());

        for i in 0..8u32 {
            let (x, y) = (2 + i % 4, 3 + i / 4);
            assert_eq!(mem.read_pixel(0x40, 1, x, y, Psm::Ct32), i);
        }
    }

    #[test]
    fn test_host_transfer_ct24_straddles_words() {
        let mut mem = LocalMemory::new();
        let mut state = TransferState::new();
        // 8 pixels x 24 bits = 192 bits = 1.5 qwords
        let (blt, pos, reg) = regs(0, 1, 0x01, 0, 0, 8, 1);
        state.begin_host_to_local(&blt, &pos, &reg).unwrap();

        // Pixels 0x000001..0x000008 packed at 3 bytes each
        let mut bytes = [0u8; 32];
        for (i, chunk) in bytes.chunks_exact_mut(3).take(8).enumerate() {
            chunk[0] = (i + 1) as u8;
        }
        let q0 = u128::from_le_bytes(bytes[0..16].try_into().unwrap());
        let q1 = u128::from_le_bytes(bytes[16..32].try_into().unwrap());
        assert!(state.write_qword(q0, &mut mem).is_none());
        assert!(state.write_qword(q1, &mut mem).is_some());

        for x in 0..8u32 {
            assert_eq!(mem.read_pixel(0, 1, x, 0, Psm::Ct24), x + 1);
        }
    }

    #[test]
    fn test_host_transfer_t4_packing() {
        let mut mem = LocalMemory::new();
        let mut state = TransferState::new();
        let (blt, pos, reg) = regs(0, 1, 0x14, 0, 0, 32, 1);
        state.begin_host_to_local(&blt, &pos, &reg).unwrap();

        // 32 nibbles 0,1,2,...,15,0,1,... packed low-nibble first
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let lo = (i * 2) % 16;
            let hi = (i * 2 + 1) % 16;
            *byte = (lo as u8) | ((hi as u8) << 4);
        }
        let done = state.write_qword(u128::from_le_bytes(bytes), &mut mem);
        assert!(done.is_some());
        for x in 0..32u32 {
            assert_eq!(mem.read_pixel(0, 1, x, 0, Psm::T4), x % 16);
        }
    }

    #[test]
    fn test_surplus_data_discarded() {
        let mut mem = LocalMemory::new();
        let mut state = TransferState::new();
        let (blt, pos, reg) = regs(0, 1, 0x00, 0, 0, 1, 1);
        state.begin_host_to_local(&blt, &pos, &reg).unwrap();
        let done = state.write_qword(0xCAFE_0000_0000_0000_0000_0000_DEADu128, &mut mem);
        assert!(done.is_some());
        assert_eq!(mem.read_pixel(0, 1, 0, 0, Psm::Ct32), 0xDEAD);
        // The surplus must not spill into the next pixel
        assert_eq!(mem.read_pixel(0, 1, 1, 0, Psm::Ct32), 0);
    }

    #[test]
    fn test_undefined_format_rejected() {
        let mut state = TransferState::new();
        let (mut blt, pos, reg) = regs(0, 1, 0x00, 0, 0, 4, 4);
        blt.dpsm = 0x3F;
        assert!(state.begin_host_to_local(&blt, &pos, &reg).is_none());
        assert!(!state.is_active());
    }

    #[test]
    fn test_local_to_host_round_trip() {
        let mut mem = LocalMemory::new();
        for x in 0..4u32 {
            mem.write_pixel(0x10, 1, x, 0, Psm::Ct16, 0x1000 + x);
        }
        let blt = BitBltBuf {
            sbp: 0x10,
            sbw: 1,
            spsm: 0x02,
            dbp: 0,
            dbw: 0,
            dpsm: 0,
        };
        let pos = TrxPos::default();
        let reg = TrxReg { rrw: 4, rrh: 1 };
        let mut out = Vec::new();
        let footprint = TransferState::local_to_host(&blt, &pos, &reg, &mem, &mut out).unwrap();
        assert_eq!(footprint.base, 0x10);
        assert_eq!(out.len(), 8);
        assert_eq!(u16::from_le_bytes([out[0], out[1]]), 0x1000);
        assert_eq!(u16::from_le_bytes([out[6], out[7]]), 0x1003);
    }

    #[test]
    fn test_local_to_local_copy() {
        let mut mem = LocalMemory::new();
        for i in 0..16u32 {
            mem.write_pixel(0, 1, i % 4, i / 4, Psm::Ct32, 0xA000 + i);
        }
        let blt = BitBltBuf {
            sbp: 0,
            sbw: 1,
            spsm: 0,
            dbp: 0x100,
            dbw: 1,
            dpsm: 0,
        };
        let pos = TrxPos::default();
        let reg = TrxReg { rrw: 4, rrh: 4 };
        let mut state = TransferState::new();
        let mut sink = Vec::new();
        let done = start_transfer(
            &mut state,
            TransferDir::LocalToLocal,
            &blt,
            &pos,
            &reg,
            &mut mem,
            &mut sink,
        );
        assert!(done.is_some());
        for i in 0..16u32 {
            assert_eq!(
                mem.read_pixel(0x100, 1, i % 4, i / 4, Psm::Ct32),
                0xA000 + i
            );
        }
    }
}
