//! Trigger look-up tables for FPGA based analyzers.
//!
//! The trigger unit evaluates 16 inputs in groups of four. For each group a
//! 16-bit table says, for every combination of the four inputs, whether the
//! group condition holds. Transition detectors feed a separate 4-input
//! table (two detectors, each contributing a previous/current bit pair) that
//! combines them with a selectable boolean function.

use byteorder::{ByteOrder, LittleEndian};

/// Number of inputs handled by the LUT trigger.
pub const LUT_INPUTS: usize = 16;

/// Transition detector condition. Bit `a` of a pair is the input's current
/// value, bit `b` its previous value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOp {
    Level,
    Not,
    Rise,
    Fall,
    RiseFall,
    NotRise,
    NotFall,
    NotRiseFall,
}

/// Boolean function combining an operation into an existing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerFunc {
    And,
    Or,
    Xor,
    Nand,
    Nor,
    Nxor,
}

/// Trigger condition as programmed into the LUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardwareTrigger {
    pub simple_value: u16,
    pub simple_mask: u16,
    pub rising_mask: u16,
    pub falling_mask: u16,
}

impl HardwareTrigger {
    pub fn edge_mask(&self) -> u16 {
        self.rising_mask | self.falling_mask
    }

    pub fn num_edges(&self) -> u32 {
        self.edge_mask().count_ones()
    }
}

/// Trailing parameter block sent after the table rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerParams {
    pub selc: u8,
    pub selpresc: u8,
    pub selinc: u8,
    pub selres: u8,
    pub sela: u8,
    pub selb: u8,
    pub cmpb: u16,
    pub cmpa: u16,
}

impl TriggerParams {
    pub fn to_bytes(&self) -> [u8; 6] {
        let word = (self.selc as u16 & 0x3)
            | (self.selpresc as u16 & 0x3f) << 2
            | (self.selinc as u16 & 0x3) << 8
            | (self.selres as u16 & 0x3) << 10
            | (self.sela as u16 & 0x3) << 12
            | (self.selb as u16 & 0x3) << 14;
        let mut out = [0u8; 6];
        LittleEndian::write_u16(&mut out[0..2], word);
        LittleEndian::write_u16(&mut out[2..4], self.cmpb);
        LittleEndian::write_u16(&mut out[4..6], self.cmpa);
        out
    }
}

/// Complete LUT for one trigger configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerLut {
    /// Transition detector 0, per quad.
    pub m0d: [u16; 4],
    /// Transition detector 1, per quad.
    pub m1d: [u16; 4],
    /// Value/mask match, per quad.
    pub m2d: [u16; 4],
    pub m3: u16,
    pub m3s: u16,
    pub m4: u16,
    pub params: TriggerParams,
}

/// Builds one table per quad: bit `j` of quad `i` is cleared when input
/// combination `j` contradicts a masked bit of `value`.
pub fn lut_entry(value: u16, mask: u16) -> [u16; 4] {
    let mut entry = [0xffffu16; 4];
    for (quad, table) in entry.iter_mut().enumerate() {
        for j in 0..16u16 {
            for k in 0..4 {
                let bit = 1u16 << (quad * 4 + k);
                let want = value & bit != 0;
                let have = j & (1 << k) != 0;
                if mask & bit != 0 && want != have {
                    *table &= !(1 << j);
                }
            }
        }
    }
    entry
}

/// Combines `oper` on detector pair `index` (0 or 1) into `mask`.
///
/// With `negate` the operation is evaluated on inverted inputs, so a
/// negated rise becomes a fall.
pub fn add_trigger_function(
    oper: TriggerOp,
    func: TriggerFunc,
    index: usize,
    negate: bool,
    mask: &mut u16,
) {
    // x[b][a]
    let mut x = [[false; 2]; 2];
    match oper {
        TriggerOp::Level => {
            x[0][1] = true;
            x[1][1] = true;
        }
        TriggerOp::Not => {
            x[0][0] = true;
            x[1][0] = true;
        }
        TriggerOp::Rise => x[0][1] = true,
        TriggerOp::Fall => x[1][0] = true,
        TriggerOp::RiseFall => {
            x[0][1] = true;
            x[1][0] = true;
        }
        TriggerOp::NotRise => {
            x[1][1] = true;
            x[0][0] = true;
            x[1][0] = true;
        }
        TriggerOp::NotFall => {
            x[1][1] = true;
            x[0][0] = true;
            x[0][1] = true;
        }
        TriggerOp::NotRiseFall => {
            x[1][1] = true;
            x[0][0] = true;
        }
    }

    if negate {
        let src = x;
        for (b, row) in x.iter_mut().enumerate() {
            for (a, cell) in row.iter_mut().enumerate() {
                *cell = src[1 - b][1 - a];
            }
        }
    }

    for i in 0..16 {
        let a = (i >> (2 * index)) & 1;
        let b = (i >> (2 * index + 1)) & 1;
        let current = (*mask >> i) & 1 == 1;
        let operand = x[b][a];

        let mut result = match func {
            TriggerFunc::And | TriggerFunc::Nand => current & operand,
            TriggerFunc::Or | TriggerFunc::Nor => current | operand,
            TriggerFunc::Xor | TriggerFunc::Nxor => current ^ operand,
        };
        if matches!(func, TriggerFunc::Nand | TriggerFunc::Nor | TriggerFunc::Nxor) {
            result = !result;
        }

        if result {
            *mask |= 1 << i;
        } else {
            *mask &= !(1 << i);
        }
    }
}

impl TriggerLut {
    /// Table for a value/mask trigger plus up to two transitions.
    ///
    /// Edge bits beyond the second are ignored; callers reject such
    /// configurations before building.
    pub fn basic(trigger: &HardwareTrigger) -> Self {
        let mut lut = TriggerLut {
            m4: 0xa000,
            m2d: lut_entry(trigger.simple_value, trigger.simple_mask),
            ..Default::default()
        };

        let mut masks = [0u16; 2];
        let edges = (0..LUT_INPUTS)
            .map(|i| 1u16 << i)
            .filter(|bit| trigger.edge_mask() & bit != 0);
        for (slot, bit) in masks.iter_mut().zip(edges) {
            *slot = bit;
        }

        lut.m0d = lut_entry(masks[0], masks[0]);
        lut.m1d = lut_entry(masks[1], masks[1]);

        if masks[0] != 0 || masks[1] != 0 {
            for (index, edge) in masks.iter().enumerate() {
                if edge & trigger.rising_mask != 0 {
                    add_trigger_function(TriggerOp::Rise, TriggerFunc::Or, index, false, &mut lut.m3);
                }
                if edge & trigger.falling_mask != 0 {
                    add_trigger_function(TriggerOp::Fall, TriggerFunc::Or, index, false, &mut lut.m3);
                }
            }
        } else {
            lut.m3 = 0xffff;
        }

        // event trigger
        lut.params.selres = 3;
        lut
    }

    /// Row `i` as sent to the device: bit `i` of every table, packed.
    pub fn transposed(&self) -> [[u8; 2]; 16] {
        let mut rows = [[0u8; 2]; 16];
        for (i, row) in rows.iter_mut().enumerate() {
            let bit = 1u16 << i;
            let set = |table: u16, flag: u8| if table & bit != 0 { flag } else { 0 };

            row[0] = set(self.m2d[0], 0x01)
                | set(self.m2d[1], 0x02)
                | set(self.m2d[2], 0x04)
                | set(self.m2d[3], 0x08)
                | set(self.m3, 0x10)
                | set(self.m3s, 0x20)
                | set(self.m4, 0x40);

            row[1] = set(self.m0d[0], 0x01)
                | set(self.m0d[1], 0x02)
                | set(self.m0d[2], 0x04)
                | set(self.m0d[3], 0x08)
                | set(self.m1d[0], 0x10)
                | set(self.m1d[1], 0x20)
                | set(self.m1d[2], 0x40)
                | set(self.m1d[3], 0x80);
        }
        rows
    }
}

/// Corrects a stop or trigger address read back from the device.
///
/// The counter runs one ahead, and an address landing on the last slot of
/// a 512-entry row belongs 64 entries earlier.
pub fn fixup_position(position: u32) -> u32 {
    let position = position.wrapping_sub(1);
    if position & 0x1ff == 0x1ff {
        position.wrapping_sub(64)
    } else {
        position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lut_entry_single_bit() {
        let entry = lut_entry(1, 1);
        assert_eq!(entry[0], 0xaaaa);
        assert_eq!(&entry[1..], &[0xffff, 0xffff, 0xffff]);

        let entry = lut_entry(0, 1);
        assert_eq!(entry[0], 0x5555);
    }

    #[test]
    fn test_lut_entry_no_mask_accepts_everything() {
        assert_eq!(lut_entry(0x1234, 0), [0xffff; 4]);
    }

    #[test]
    fn test_lut_entry_second_quad() {
        // probe 5 high
        let entry = lut_entry(0x10, 0x10);
        assert_eq!(entry[0], 0xffff);
        assert_eq!(entry[1], 0xaaaa);
    }

    #[test]
    fn test_trigger_function_rise_and_fall() {
        let mut m = 0;
        add_trigger_function(TriggerOp::Rise, TriggerFunc::Or, 0, false, &mut m);
        assert_eq!(m, 0x2222);

        let mut m = 0;
        add_trigger_function(TriggerOp::Fall, TriggerFunc::Or, 0, false, &mut m);
        assert_eq!(m, 0x4444);

        let mut m = 0;
        add_trigger_function(TriggerOp::Rise, TriggerFunc::Or, 0, true, &mut m);
        assert_eq!(m, 0x4444);

        let mut m = 0;
        add_trigger_function(TriggerOp::Rise, TriggerFunc::Or, 1, false, &mut m);
        assert_eq!(m, 0x00f0);
    }

    #[test]
    fn test_trigger_function_inverting() {
        let mut m = 0xffff;
        add_trigger_function(TriggerOp::Rise, TriggerFunc::Nand, 0, false, &mut m);
        assert_eq!(m, !0x2222);

        let mut m = 0x2222;
        add_trigger_function(TriggerOp::Rise, TriggerFunc::Xor, 0, false, &mut m);
        assert_eq!(m, 0);
    }

    #[test]
    fn test_basic_value_only() {
        let lut = TriggerLut::basic(&HardwareTrigger {
            simple_value: 1,
            simple_mask: 1,
            ..Default::default()
        });
        assert_eq!(lut.m3, 0xffff);
        assert_eq!(lut.m4, 0xa000);
        assert_eq!(lut.m2d[0], 0xaaaa);
        assert_eq!(lut.m0d, [0xffff; 4]);
        assert_eq!(lut.params.to_bytes(), [0x00, 0x0c, 0, 0, 0, 0]);
    }

    #[test]
    fn test_basic_two_edges() {
        let lut = TriggerLut::basic(&HardwareTrigger {
            rising_mask: 0b0001,
            falling_mask: 0b0100,
            ..Default::default()
        });
        assert_eq!(lut.m0d[0], 0xaaaa);
        assert_eq!(lut.m1d[0], 0xf0f0);
        // rise on detector 0, fall on detector 1
        assert_eq!(lut.m3, 0x2222 | 0x0f00);
    }

    #[test]
    fn test_transposed_rows() {
        let lut = TriggerLut::basic(&HardwareTrigger::default());
        let rows = lut.transposed();
        // m4 = 0xa000: bits 13 and 15
        assert_eq!(rows[13][0] & 0x40, 0x40);
        assert_eq!(rows[15][0] & 0x40, 0x40);
        assert_eq!(rows[0][0] & 0x40, 0);
        // no mask: every m2d and m3 bit set
        assert_eq!(rows[0][0] & 0x1f, 0x1f);
        assert_eq!(rows[0][1], 0xff);
    }

    #[test]
    fn test_fixup_position() {
        assert_eq!(fixup_position(0x1001), 0x1000);
        assert_eq!(fixup_position(0x200), 0x1ff - 64);
        assert_eq!(fixup_position(0x400), 0x3ff - 64);
        assert_eq!(fixup_position(1), 0);
    }
}
