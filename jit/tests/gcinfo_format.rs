//! GCInfo format tests: a reference decoder consumes the encoder's output
//! bit-for-bit.

use jit::gcinfo::{safepoint_width, zigzag, BitWriter, GcInfoBuilder};

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> bool {
        let bit = (self.data[self.pos / 8] >> (self.pos % 8)) & 1 != 0;
        self.pos += 1;
        bit
    }

    fn read_bits(&mut self, count: u32) -> u32 {
        let mut value = 0;
        for i in 0..count {
            if self.read_bit() {
                value |= 1 << i;
            }
        }
        value
    }

    fn read_varlen(&mut self, base: u32) -> u32 {
        let mut value = 0u32;
        let mut shift = 0;
        loop {
            let chunk = self.read_bits(base + 1);
            value |= (chunk & ((1 << base) - 1)) << shift;
            if chunk & (1 << base) == 0 {
                return value;
            }
            shift += base;
        }
    }

    fn read_varlen_signed(&mut self, base: u32) -> i32 {
        let raw = self.read_varlen(base);
        ((raw >> 1) as i32) ^ -((raw & 1) as i32)
    }
}

struct DecodedGcInfo {
    code_length: u32,
    safepoints: Vec<u32>,
    slots: Vec<(i32, u32)>,
    live_bits: Vec<bool>,
}

fn decode(blob: &[u8]) -> DecodedGcInfo {
    let mut bits = BitReader::new(blob);
    assert!(!bits.read_bit(), "slim bit must be clear");
    assert!(bits.read_bit(), "frame base expected");
    let code_length = bits.read_varlen(8);
    let count = bits.read_varlen(2);
    let width = safepoint_width(code_length);
    let safepoints: Vec<u32> = (0..count).map(|_| bits.read_bits(width)).collect();

    assert!(!bits.read_bit(), "no register slots in this tier");
    let mut slots = Vec::new();
    if bits.read_bit() {
        let slot_count = bits.read_varlen(2);
        assert_eq!(bits.read_varlen(1), 0, "untracked count");
        let mut prev_norm = 0i32;
        let mut prev_flags = 0u32;
        for index in 0..slot_count {
            assert_eq!(bits.read_bits(2), 2, "frame-pointer base tag");
            if index == 0 || prev_flags != 0 {
                let norm = bits.read_varlen_signed(4);
                let flags = bits.read_bits(2);
                slots.push((norm, flags));
                prev_norm = norm;
                prev_flags = flags;
            } else {
                let delta = bits.read_varlen_signed(4);
                let norm = prev_norm + delta;
                slots.push((norm, 0));
                prev_norm = norm;
                prev_flags = 0;
            }
        }
    }

    assert!(!bits.read_bit(), "no indirect liveness table");
    let live_bits = (0..safepoints.len() * slots.len())
        .map(|_| bits.read_bit())
        .collect();

    DecodedGcInfo {
        code_length,
        safepoints,
        slots,
        live_bits,
    }
}

#[test]
fn varlen_round_trips_across_bases() {
    let samples = [
        0u32,
        1,
        2,
        3,
        7,
        8,
        127,
        128,
        255,
        1024,
        65_535,
        1 << 20,
        u32::MAX,
    ];
    for base in 1..=8 {
        for &value in &samples {
            let mut writer = BitWriter::new();
            writer.write_varlen(value, base);
            let bytes = writer.into_bytes();
            let mut reader = BitReader::new(&bytes);
            assert_eq!(reader.read_varlen(base), value, "base {}", base);
        }
    }
}

#[test]
fn zigzag_round_trips() {
    let samples = [0i32, 1, -1, 2, -2, 1000, -1000, i32::MAX, i32::MIN];
    for &value in &samples {
        let mut writer = BitWriter::new();
        writer.write_varlen_signed(value, 4);
        let bytes = writer.into_bytes();
        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_varlen_signed(4), value);
    }
    assert_eq!(zigzag(-1), 1);
}

#[test]
fn two_slots_three_safepoints_decode_exactly() {
    // Two reference-typed local slots at -48 and -56, three safepoints in a
    // 128-byte function, pushed out of order.
    let mut builder = GcInfoBuilder::new();
    builder.push_safepoint(42);
    builder.push_safepoint(17);
    builder.push_safepoint(101);
    builder.push_stack_slot(-48, false, false);
    builder.push_stack_slot(-56, false, false);
    let blob = builder.build(128);

    let decoded = decode(&blob);
    assert_eq!(decoded.code_length, 128);
    assert_eq!(decoded.safepoints, vec![17, 42, 101]);
    assert_eq!(decoded.slots, vec![(-6, 0), (-7, 0)]);
    // Conservative liveness: every slot live at every safepoint.
    assert_eq!(decoded.live_bits.len(), 6);
    assert!(decoded.live_bits.iter().all(|&bit| bit));
}

#[test]
fn safepoints_come_out_sorted_regardless_of_input_order() {
    let mut builder = GcInfoBuilder::new();
    for offset in [90u32, 5, 60, 33, 60, 2] {
        builder.push_safepoint(offset);
    }
    let blob = builder.build(100);
    let decoded = decode(&blob);
    let mut sorted = decoded.safepoints.clone();
    sorted.sort_unstable();
    assert_eq!(decoded.safepoints, sorted);
    assert_eq!(decoded.safepoints.len(), 6);
}

#[test]
fn interior_and_pinned_flags_survive() {
    let mut builder = GcInfoBuilder::new();
    builder.push_safepoint(10);
    builder.push_stack_slot(-104, true, false);
    builder.push_stack_slot(-168, false, true);
    let blob = builder.build(64);
    let decoded = decode(&blob);
    // First slot absolute with the interior flag; the second is absolute
    // again because the previous slot carried flags.
    assert_eq!(decoded.slots[0], (-13, 0b01));
    assert_eq!(decoded.slots[1], (-21, 0b10));
}

#[test]
fn empty_method_encodes_headers_only() {
    let mut builder = GcInfoBuilder::new();
    let blob = builder.build(16);
    let decoded = decode(&blob);
    assert_eq!(decoded.code_length, 16);
    assert!(decoded.safepoints.is_empty());
    assert!(decoded.slots.is_empty());
    assert!(decoded.live_bits.is_empty());
}
