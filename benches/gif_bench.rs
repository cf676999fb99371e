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

//! GIF decoder benchmarks

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use gsrx::core::gif::GifDecoder;

/// A PACKED packet: tag + NLOOP repetitions of RGBAQ, UV, XYZ2
fn packed_triangle_stream(triangles: u64) -> Vec<u128> {
    let nloop = triangles * 3;
    let lo = (nloop & 0x7FFF)
        | (1 << 15)                // EOP
        | (1 << 46)                // PRE
        | (0x3u64 << 47)           // PRIM: triangle
        | (3u64 << 60); // NREG = 3
    let regs = 0x53_1u64; // RGBAQ, UV, XYZ2... low nibble first: 1, 3, 5
    let tag = (lo as u128) | ((regs as u128) << 64);

    let mut stream = Vec::with_capacity(1 + nloop as usize * 3);
    stream.push(tag);
    for i in 0..nloop {
        // RGBAQ
        stream.push(0x80u128 | (0x80u128 << 32) | (0x80u128 << 64) | (0x80u128 << 96));
        // UV
        stream.push(((i & 0x3FF) as u128) << 4 | (((i / 64) & 0x3FF) as u128) << 36);
        // XYZ2
        stream.push((((i * 16) & 0xFFFF) as u128) | ((((i / 64) * 16) & 0xFFFF) as u128) << 32);
    }
    stream
}

fn bench_packed_decode(c: &mut Criterion) {
    let stream = packed_triangle_stream(1000);
    c.bench_function("gif_packed_3000_vertices", |b| {
        b.iter(|| {
            let mut decoder = GifDecoder::new();
            let mut writes = 0usize;
            for &qw in &stream {
                decoder.push_qword(black_box(qw), &mut |_| writes += 1);
            }
            black_box(writes)
        })
    });
}

fn bench_reglist_decode(c: &mut Criterion) {
    // REGLIST: two raw writes per qword
    let nloop = 2000u64;
    let lo = (nloop & 0x7FFF) | (1 << 15) | (1u64 << 58) | (2u64 << 60);
    let tag = (lo as u128) | (0x51u128 << 64); // RGBAQ, XYZ2
    let mut stream = vec![tag];
    for i in 0..nloop {
        stream.push((i as u128) | ((i as u128) << 64));
    }
    c.bench_function("gif_reglist_4000_writes", |b| {
        b.iter(|| {
            let mut decoder = GifDecoder::new();
            let mut writes = 0usize;
            for &qw in &stream {
                decoder.push_qword(black_box(qw), &mut |_| writes += 1);
            }
            black_box(writes)
        })
    });
}

criterion_group!(benches, bench_packed_decode, bench_reglist_decode);
criterion_main!(benches);
