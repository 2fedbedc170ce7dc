// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Command packet encoding
//!
//! The graphics rings consume PM4 packets (types 0, 2 and 3); the R600
//! async DMA ring has its own packet format.

/// Packet type field
pub const PM4_TYPE_SHIFT: u32 = 30;
pub const PM4_COUNT_SHIFT: u32 = 16;
pub const PM4_COUNT_MASK: u32 = 0x3fff;
/// Type-0 packets write every value to the same register
pub const PM4_ONE_REG_WR: u32 = 1 << 15;
/// Highest register reachable by a type-0 packet
pub const PM4_MAX_REG: u32 = 0x7fff << 2;

/// Type-2 filler
pub const PACKET2: u32 = 0x8000_0000;

/// Type-3 opcodes
pub mod op {
    pub const NOP: u32 = 0x10;
    pub const RNDR_GEN_INDX_PRIM: u32 = 0x23;
    pub const DRAW_VBUF: u32 = 0x28;
    pub const INDIRECT_BUFFER: u32 = 0x32;
    pub const MEM_SEMAPHORE: u32 = 0x39;
    pub const EVENT_WRITE_EOP: u32 = 0x47;
    pub const PAINT_MULTI: u32 = 0x9a;
    pub const BITBLT_MULTI: u32 = 0x9b;
}

/// `MEM_SEMAPHORE` select field
pub const SEM_SEL_SIGNAL: u32 = 0x6 << 29;
pub const SEM_SEL_WAIT: u32 = 0x7 << 29;

/// `EVENT_WRITE_EOP` fields
pub const EOP_EVENT_TS: u32 = 0x14;
pub const EOP_DATA_SEL_32: u32 = 1 << 29;
pub const EOP_INT_SEL_IRQ: u32 = 2 << 24;

/// Type-0 header writing `count` consecutive registers starting at `reg`
pub const fn packet0(reg: u32, count: u32) -> u32 {
    ((count - 1) & PM4_COUNT_MASK) << PM4_COUNT_SHIFT | ((reg >> 2) & 0x7fff)
}

/// Type-0 header writing `count` values to the single register `reg`
pub const fn packet0_one_reg(reg: u32, count: u32) -> u32 {
    packet0(reg, count) | PM4_ONE_REG_WR
}

/// Type-3 header with `count` payload words
pub const fn packet3(opcode: u32, count: u32) -> u32 {
    3 << PM4_TYPE_SHIFT | ((count - 1) & PM4_COUNT_MASK) << PM4_COUNT_SHIFT | (opcode & 0xff) << 8
}

/// Decoded PM4 header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pm4 {
    /// Register write burst
    Type0 { reg: u32, count: u32, one_reg: bool },
    /// Reserved type, never valid
    Type1,
    /// Single-word filler
    Type2,
    /// Opcode packet
    Type3 { opcode: u32, count: u32 },
}

impl Pm4 {
    pub fn decode(header: u32) -> Self {
        let count = ((header >> PM4_COUNT_SHIFT) & PM4_COUNT_MASK) + 1;
        match header >> PM4_TYPE_SHIFT {
            0 => Pm4::Type0 {
                reg: (header & 0x7fff) << 2,
                count,
                one_reg: header & PM4_ONE_REG_WR != 0,
            },
            1 => Pm4::Type1,
            2 => Pm4::Type2,
            _ => Pm4::Type3 {
                opcode: (header >> 8) & 0xff,
                count,
            },
        }
    }

    /// Total packet length in words including the header
    pub fn len(&self) -> usize {
        match *self {
            Pm4::Type0 { count, .. } | Pm4::Type3 { count, .. } => count as usize + 1,
            Pm4::Type1 | Pm4::Type2 => 1,
        }
    }
}

/// R600 async DMA packet commands
pub mod dma {
    pub const WRITE: u32 = 0x2;
    pub const COPY: u32 = 0x3;
    pub const INDIRECT_BUFFER: u32 = 0x4;
    pub const SEMAPHORE: u32 = 0x5;
    pub const FENCE: u32 = 0x6;
    pub const TRAP: u32 = 0x7;
    pub const NOP: u32 = 0xf;

    /// DMA packet header
    pub const fn header(cmd: u32, t: u32, s: u32, n: u32) -> u32 {
        (cmd & 0xf) << 28 | (t & 0x1) << 23 | (s & 0x1) << 22 | (n & 0xffff)
    }

    /// Packet length in words for a header, `None` if the command is unknown
    pub fn len(header: u32) -> Option<usize> {
        let n = (header & 0xffff) as usize;
        match header >> 28 {
            WRITE => Some(3 + n),
            COPY => Some(5),
            INDIRECT_BUFFER => Some(3),
            SEMAPHORE => Some(3),
            FENCE => Some(4),
            TRAP | NOP => Some(1),
            _ => None,
        }
    }
}

/// Low 32 bits of a bus address
pub fn lower_32(addr: u64) -> u32 {
    addr as u32
}

/// Bits 32..40 of a bus address, all the hardware keeps
pub fn upper_8(addr: u64) -> u32 {
    ((addr >> 32) & 0xff) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::r100;

    #[test]
    fn test_packet0_decode() {
        let hdr = packet0(r100::SCRATCH_REG0, 2);
        assert_eq!(
            Pm4::decode(hdr),
            Pm4::Type0 {
                reg: r100::SCRATCH_REG0,
                count: 2,
                one_reg: false
            }
        );
        assert_eq!(Pm4::decode(hdr).len(), 3);

        let hdr = packet0_one_reg(r100::WAIT_UNTIL, 4);
        assert!(matches!(Pm4::decode(hdr), Pm4::Type0 { one_reg: true, count: 4, .. }));
    }

    #[test]
    fn test_packet3_decode() {
        let hdr = packet3(op::EVENT_WRITE_EOP, 4);
        assert_eq!(hdr >> 30, 3);
        assert_eq!(
            Pm4::decode(hdr),
            Pm4::Type3 {
                opcode: op::EVENT_WRITE_EOP,
                count: 4
            }
        );
        assert_eq!(Pm4::decode(PACKET2), Pm4::Type2);
        assert_eq!(Pm4::decode(0x4000_0000), Pm4::Type1);
    }

    #[test]
    fn test_dma_lengths() {
        assert_eq!(dma::len(dma::header(dma::FENCE, 0, 0, 0)), Some(4));
        assert_eq!(dma::len(dma::header(dma::WRITE, 0, 0, 6)), Some(9));
        assert_eq!(dma::len(dma::header(dma::NOP, 0, 0, 0)), Some(1));
        assert_eq!(dma::len(0x0000_0000), None);
    }

    #[test]
    fn test_address_split() {
        let addr = 0x12_3456_789c;
        assert_eq!(lower_32(addr), 0x3456_789c);
        assert_eq!(upper_8(addr), 0x12);
    }
}
