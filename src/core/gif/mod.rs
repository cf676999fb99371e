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

//! GIF packet decoder
//!
//! The GIF carries register writes and image data to the GS in 16-byte
//! quadwords. A packet starts with a GIFtag describing the transfer mode
//! and register list, followed by NLOOP repetitions of the data:
//!
//! - **PACKED**: one qword per register, with per-register field packing
//! - **REGLIST**: two raw 64-bit register values per qword
//! - **IMAGE**: raw qwords for the HWREG transfer port
//!
//! The decoder is a streaming state machine over qwords; it emits
//! register-write and image-data events through a sink closure so the
//! caller decides what "apply" means. The layouts here are bit-exact wire
//! contracts and must not be altered.

use super::gs::registers::Register;

/// One GIFtag
///
/// ```text
/// Bits 0-14:   NLOOP  Repeat count
/// Bit  15:     EOP    End of packet
/// Bit  46:     PRE    PRIM write enable (PACKED only)
/// Bits 47-57:  PRIM   PRIM register value when PRE is set
/// Bits 58-59:  FLG    Data format (0 PACKED, 1 REGLIST, 2/3 IMAGE)
/// Bits 60-63:  NREG   Register descriptor count (0 means 16)
/// Bits 64-127: REGS   4-bit register descriptors
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GifTag {
    /// Loop count
    pub nloop: u32,
    /// End of packet after this tag's data
    pub eop: bool,
    /// Write PRIM before processing data
    pub pre: bool,
    /// PRIM value for the PRE write
    pub prim: u64,
    /// Data format
    pub flag: GifFlag,
    /// Number of register descriptors (1-16)
    pub nreg: u32,
    /// Packed register descriptors, 4 bits each
    pub regs: u64,
}

/// GIFtag data formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GifFlag {
    /// Per-register field packing, one qword per descriptor
    Packed,
    /// Two raw 64-bit register writes per qword
    RegList,
    /// Raw data for the transfer port
    Image,
}

impl GifTag {
    /// Decode a GIFtag qword
    pub fn from_u128(value: u128) -> Self {
        let lo = value as u64;
        let nreg = ((value >> 124) & 0xF) as u32;
        Self {
            nloop: (lo & 0x7FFF) as u32,
            eop: (lo >> 15) & 1 != 0,
            pre: (lo >> 46) & 1 != 0,
            prim: (lo >> 47) & 0x7FF,
            flag: match (lo >> 58) & 3 {
                0 => GifFlag::Packed,
                1 => GifFlag::RegList,
                // 3 is "disabled" and transfers like IMAGE
                _ => GifFlag::Image,
            },
            nreg: if nreg == 0 { 16 } else { nreg },
            regs: (value >> 64) as u64,
        }
    }

    /// Register descriptor at a cursor position (0-15)
    #[inline(always)]
    pub fn descriptor(&self, index: u32) -> u8 {
        ((self.regs >> (index * 4)) & 0xF) as u8
    }
}

/// Events produced while decoding a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GifEvent {
    /// A register write in GS register format
    Write {
        /// Destination register
        reg: Register,
        /// Raw 64-bit register value
        data: u64,
    },
    /// One qword of image data for the transfer port
    Image {
        /// Raw data, little endian
        data: u128,
    },
}

/// PACKED descriptor values with special field packing
mod packed {
    pub const PRIM: u8 = 0x0;
    pub const RGBAQ: u8 = 0x1;
    pub const ST: u8 = 0x2;
    pub const UV: u8 = 0x3;
    pub const XYZF2: u8 = 0x4;
    pub const XYZ2: u8 = 0x5;
    pub const FOG: u8 = 0xA;
    pub const AD: u8 = 0xE;
    pub const NOP: u8 = 0xF;
}

/// Streaming GIF decoder
///
/// Feed qwords in submission order through [`GifDecoder::push_qword`];
/// events come out through the sink in the same order. The decoder carries
/// the GIF's Q latch: packed ST writes capture Q, and the following packed
/// RGBAQ write merges it into the RGBAQ register value.
#[derive(Debug)]
pub struct GifDecoder {
    /// Tag currently being processed
    tag: Option<GifTag>,
    /// Remaining loops of the current tag
    loops_left: u32,
    /// Descriptor cursor within the current loop (PACKED/REGLIST)
    reg_cursor: u32,
    /// Q captured from the last packed ST write
    q_latch: u32,
}

impl Default for GifDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl GifDecoder {
    /// Create an idle decoder
    pub fn new() -> Self {
        Self {
            tag: None,
            loops_left: 0,
            reg_cursor: 0,
            // Q resets to 1.0
            q_latch: 1.0f32.to_bits(),
        }
    }

    /// Whether the decoder is between packets
    pub fn is_idle(&self) -> bool {
        self.tag.is_none()
    }

    /// Reset to idle, discarding any partial packet
    pub fn reset(&mut self) {
        self.tag = None;
        self.loops_left = 0;
        self.reg_cursor = 0;
        self.q_latch = 1.0f32.to_bits();
    }

    /// Consume one qword, emitting decoded events into `sink`
    pub fn push_qword(&mut self, qword: u128, sink: &mut impl FnMut(GifEvent)) {
        let Some(tag) = self.tag else {
            self.start_tag(qword, sink);
            return;
        };

        match tag.flag {
            GifFlag::Packed => {
                let descriptor = tag.descriptor(self.reg_cursor);
                self.unpack(descriptor, qword, sink);
                self.reg_cursor += 1;
                if self.reg_cursor == tag.nreg {
                    self.reg_cursor = 0;
                    self.loops_left -= 1;
                }
            }
            GifFlag::RegList => {
                for half in 0..2 {
                    if self.loops_left == 0 {
                        // NREG * NLOOP was odd; the upper half is padding
                        break;
                    }
                    let data = (qword >> (half * 64)) as u64;
                    let descriptor = tag.descriptor(self.reg_cursor);
                    // A+D has no meaning in REGLIST and transfers as NOP
                    if descriptor < packed::AD {
                        if let Some(reg) = Register::from_index(descriptor) {
                            sink(GifEvent::Write { reg, data });
                        } else {
                            log::warn!("REGLIST descriptor {descriptor:#x} is undefined");
                        }
                    }
                    self.reg_cursor += 1;
                    if self.reg_cursor == tag.nreg {
                        self.reg_cursor = 0;
                        self.loops_left -= 1;
                    }
                }
            }
            GifFlag::Image => {
                sink(GifEvent::Image { data: qword });
                self.loops_left -= 1;
            }
        }

        if self.loops_left == 0 {
            self.tag = None;
        }
    }

    fn start_tag(&mut self, qword: u128, sink: &mut impl FnMut(GifEvent)) {
        let tag = GifTag::from_u128(qword);
        log::trace!(
            "GIF tag: nloop={} flag={:?} nreg={} eop={}",
            tag.nloop,
            tag.flag,
            tag.nreg,
            tag.eop
        );

        if tag.nloop == 0 {
            // Tag with no data; PRE still applies
            if tag.pre && tag.flag == GifFlag::Packed {
                sink(GifEvent::Write {
                    reg: Register::Prim,
                    data: tag.prim,
                });
            }
            return;
        }

        if tag.pre && tag.flag == GifFlag::Packed {
            sink(GifEvent::Write {
                reg: Register::Prim,
                data: tag.prim,
            });
        }

        self.loops_left = tag.nloop;
        self.reg_cursor = 0;
        self.tag = Some(tag);
    }

    /// Unpack one PACKED-mode qword into a GS register write
    fn unpack(&mut self, descriptor: u8, qw: u128, sink: &mut impl FnMut(GifEvent)) {
        #[inline(always)]
        fn field(qw: u128, lo: u32, count: u32) -> u64 {
            ((qw >> lo) as u64) & ((1u64 << count) - 1)
        }

        let event = match descriptor {
            packed::PRIM => Some((Register::Prim, field(qw, 0, 11))),
            packed::RGBAQ => {
                // R, G, B, A ride in bytes 0, 4, 8, 12; Q comes from the
                // latch captured by the last packed ST
                let data = field(qw, 0, 8)
                    | (field(qw, 32, 8) << 8)
                    | (field(qw, 64, 8) << 16)
                    | (field(qw, 96, 8) << 24)
                    | ((self.q_latch as u64) << 32);
                Some((Register::Rgbaq, data))
            }
            packed::ST => {
                self.q_latch = field(qw, 64, 32) as u32;
                Some((Register::St, field(qw, 0, 64)))
            }
            packed::UV => Some((Register::Uv, field(qw, 0, 14) | (field(qw, 32, 14) << 16))),
            packed::XYZF2 => {
                let data = field(qw, 0, 16)
                    | (field(qw, 32, 16) << 16)
                    | (field(qw, 68, 24) << 32)
                    | (field(qw, 100, 8) << 56);
                let reg = if field(qw, 111, 1) != 0 {
                    Register::Xyzf3
                } else {
                    Register::Xyzf2
                };
                Some((reg, data))
            }
            packed::XYZ2 => {
                let data = field(qw, 0, 16) | (field(qw, 32, 16) << 16) | (field(qw, 64, 32) << 32);
                let reg = if field(qw, 111, 1) != 0 {
                    Register::Xyz3
                } else {
                    Register::Xyz2
                };
                Some((reg, data))
            }
            packed::FOG => Some((Register::Fog, field(qw, 100, 8) << 56)),
            packed::AD => {
                let addr = field(qw, 64, 8) as u8;
                match Register::from_index(addr) {
                    Some(reg) => Some((reg, qw as u64)),
                    None => {
                        log::warn!("A+D write to undefined register {addr:#x}");
                        None
                    }
                }
            }
            packed::NOP => None,
            other => {
                // TEX0, CLAMP, XYZF3/XYZ3 descriptors carry the register
                // value in the low 64 bits
                match Register::from_index(other) {
                    Some(reg) => Some((reg, qw as u64)),
                    None => {
                        log::warn!("PACKED descriptor {other:#x} is undefined");
                        None
                    }
                }
            }
        };

        if let Some((reg, data)) = event {
            sink(GifEvent::Write { reg, data });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(nloop: u32, eop: bool, pre: bool, prim: u64, flag: u64, nreg: u32, regs: u64) -> u128 {
        let lo = (nloop as u64 & 0x7FFF)
            | ((eop as u64) << 15)
            | ((pre as u64) << 46)
            | ((prim & 0x7FF) << 47)
            | (flag << 58)
            | (((nreg as u64) & 0xF) << 60);
        (lo as u128) | ((regs as u128) << 64)
    }

    fn collect(decoder: &mut GifDecoder, qwords: &[u128]) -> Vec<GifEvent> {
        let mut events = Vec::new();
        for &qw in qwords {
            decoder.push_qword(qw, &mut |e| events.push(e));
        }
        events
    }

    #[test]
    fn test_tag_decode() {
        let tag = GifTag::from_u128(tag(5, true, true, 0x156, 0, 3, 0xE51));
        assert_eq!(tag.nloop, 5);
        assert!(tag.eop);
        assert!(tag.pre);
        assert_eq!(tag.prim, 0x156);
        assert_eq!(tag.flag, GifFlag::Packed);
        assert_eq!(tag.nreg, 3);
        assert_eq!(tag.descriptor(0), 0x1);
        assert_eq!(tag.descriptor(1), 0x5);
        assert_eq!(tag.descriptor(2), 0xE);
    }

    #[test]
    fn test_nreg_zero_means_sixteen() {
        let tag = GifTag::from_u128(tag(1, false, false, 0, 0, 0, 0));
        assert_eq!(tag.nreg, 16);
    }

    #[test]
    fn test_pre_emits_prim_write() {
        let mut decoder = GifDecoder::new();
        // PRE with a NOP descriptor loop
        let events = collect(
            &mut decoder,
            &[tag(1, true, true, 0x6, 0, 1, 0xF), 0],
        );
        assert_eq!(
            events,
            vec![GifEvent::Write {
                reg: Register::Prim,
                data: 0x6
            }]
        );
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_packed_ad_write() {
        let mut decoder = GifDecoder::new();
        // A+D: address in bits 64-71, data in the low half
        let qw = 0xDEAD_BEEFu128 | (0x47u128 << 64); // TEST_1
        let events = collect(&mut decoder, &[tag(1, true, false, 0, 0, 1, 0xE), qw]);
        assert_eq!(
            events,
            vec![GifEvent::Write {
                reg: Register::Test1,
                data: 0xDEAD_BEEF
            }]
        );
    }

    #[test]
    fn test_packed_st_latches_q_for_rgbaq() {
        let mut decoder = GifDecoder::new();
        let s = 0.5f32.to_bits() as u128;
        let t = (0.25f32.to_bits() as u128) << 32;
        let q = (2.0f32.to_bits() as u128) << 64;
        let st_qw = s | t | q;
        // RGBAQ packed: R=0x11 G=0x22 B=0x33 A=0x44
        let rgba_qw =
            0x11u128 | (0x22u128 << 32) | (0x33u128 << 64) | (0x44u128 << 96);
        let events = collect(
            &mut decoder,
            &[tag(1, true, false, 0, 0, 2, 0x12), st_qw, rgba_qw],
        );
        assert_eq!(events.len(), 2);
        match events[0] {
            GifEvent::Write { reg, data } => {
                assert_eq!(reg, Register::St);
                assert_eq!(data as u32, 0.5f32.to_bits());
                assert_eq!((data >> 32) as u32, 0.25f32.to_bits());
            }
            _ => panic!("expected ST write"),
        }
        match events[1] {
            GifEvent::Write { reg, data } => {
                assert_eq!(reg, Register::Rgbaq);
                assert_eq!(data & 0xFFFF_FFFF, 0x4433_2211);
                assert_eq!((data >> 32) as u32, 2.0f32.to_bits());
            }
            _ => panic!("expected RGBAQ write"),
        }
    }

    #[test]
    fn test_packed_xyz2_and_adc() {
        let mut decoder = GifDecoder::new();
        let base = 0x64u128 | (0xC8u128 << 32) | (0x1234_5678u128 << 64);
        let kick = base;
        let no_kick = base | (1u128 << 111);
        let events = collect(
            &mut decoder,
            &[tag(2, true, false, 0, 0, 1, 0x5), kick, no_kick],
        );
        assert_eq!(
            events[0],
            GifEvent::Write {
                reg: Register::Xyz2,
                data: 0x64 | (0xC8 << 16) | (0x1234_5678u64 << 32),
            }
        );
        match events[1] {
            GifEvent::Write { reg, .. } => assert_eq!(reg, Register::Xyz3),
            _ => panic!("expected XYZ3 write"),
        }
    }

    #[test]
    fn test_packed_uv() {
        let mut decoder = GifDecoder::new();
        let qw = 0x123u128 | (0x345u128 << 32);
        let events = collect(&mut decoder, &[tag(1, true, false, 0, 0, 1, 0x3), qw]);
        assert_eq!(
            events,
            vec![GifEvent::Write {
                reg: Register::Uv,
                data: 0x123 | (0x345 << 16)
            }]
        );
    }

    #[test]
    fn test_reglist_two_writes_per_qword() {
        let mut decoder = GifDecoder::new();
        // Descriptors: RGBAQ, XYZ2 repeating over 4 writes (2 loops)
        let qw0 = 0x1111u128 | (0x2222u128 << 64);
        let qw1 = 0x3333u128 | (0x4444u128 << 64);
        let events = collect(
            &mut decoder,
            &[tag(2, true, false, 0, 1, 2, 0x51), qw0, qw1],
        );
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0],
            GifEvent::Write {
                reg: Register::Rgbaq,
                data: 0x1111
            }
        );
        assert_eq!(
            events[1],
            GifEvent::Write {
                reg: Register::Xyz2,
                data: 0x2222
            }
        );
        assert_eq!(
            events[3],
            GifEvent::Write {
                reg: Register::Xyz2,
                data: 0x4444
            }
        );
    }

    #[test]
    fn test_reglist_odd_count_discards_padding() {
        let mut decoder = GifDecoder::new();
        // 1 loop x 1 reg: upper half of the qword is padding
        let qw = 0xAAAAu128 | (0xBBBBu128 << 64);
        let events = collect(&mut decoder, &[tag(1, true, false, 0, 1, 1, 0x1), qw]);
        assert_eq!(events.len(), 1);
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_image_mode() {
        let mut decoder = GifDecoder::new();
        let events = collect(
            &mut decoder,
            &[tag(2, true, false, 0, 2, 0, 0), 0xAA, 0xBB],
        );
        assert_eq!(
            events,
            vec![GifEvent::Image { data: 0xAA }, GifEvent::Image { data: 0xBB }]
        );
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_multiple_packets() {
        let mut decoder = GifDecoder::new();
        let packet = [tag(1, false, false, 0, 2, 0, 0), 0x11, tag(1, true, false, 0, 2, 0, 0), 0x22];
        let events = collect(&mut decoder, &packet);
        assert_eq!(events.len(), 2);
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_nloop_zero_is_empty() {
        let mut decoder = GifDecoder::new();
        let events = collect(&mut decoder, &[tag(0, true, false, 0, 0, 1, 0xF)]);
        assert!(events.is_empty());
        assert!(decoder.is_idle());
    }
}
