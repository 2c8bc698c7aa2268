//! 内核二进制指令补丁
//!
//! 编译器把 `amd_bfe` 生成为 BFE_INT 指令。在所有寻址/修饰位都为 0 的前提下，
//! 把它的操作码改写为 BFI_INT 即得到 SHA-256 需要的 bit-select，比编译器
//! 给出的等价指令序列快。补丁只改写操作码字段，其余位保持不变。
//!
//! 定位方式: 先找到内核源码末尾的 `_the_end_` 标记，再往后找到第 17 个
//! `ATI CAL` 段标记，从其后第 12 个字节开始就是 8 字节宽的 ALU 指令序列。

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};
use thiserror::Error;

/// 内核源码末尾的标记
pub const END_MARKER: &str = "_the_end_";

/// 段标记
pub const SECTION_MARKER: &str = "ATI CAL";

/// 指令区之前的段标记个数
pub const SECTION_MARKER_COUNT: usize = 17;

/// 最后一个段标记之后 (跳过 1 字节) 到第一条指令的偏移
pub const FIRST_OPCODE_OFFSET: usize = 11;

/// 单条指令字节数
pub const INSTRUCTION_WIDTH: usize = 8;

/// 操作码字段位置 (ALU_WORD1_OP3 的 bit 13..17，即 64 位字的 bit 45..49)
const OPCODE_SHIFT: u32 = 32 + 13;
const OPCODE_MASK: u64 = 0x1f << OPCODE_SHIFT;

/// (名称, 位移, 宽度掩码)。全部为 0 时补丁才安全。
const GUARD_FIELDS: [(&str, u32, u64); 10] = [
    ("clamp", 32 + 31, 0x1),
    ("dest_rel", 32 + 28, 0x1),
    ("src2_neg", 32 + 12, 0x1),
    ("src2_rel", 32 + 9, 0x1),
    ("pred_sel", 29, 0x3),
    ("index_mode", 26, 0x7),
    ("src1_neg", 25, 0x1),
    ("src1_rel", 22, 0x1),
    ("src0_neg", 12, 0x1),
    ("src0_rel", 9, 0x1),
];

/// ALU_WORD1_OP3 操作码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op3Opcode {
    BfeUint = 4,
    BfeInt = 5,
    BfiInt = 6,
    BitAlignInt = 12,
    ByteAlignInt = 13,
}

impl Op3Opcode {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            4 => Some(Self::BfeUint),
            5 => Some(Self::BfeInt),
            6 => Some(Self::BfiInt),
            12 => Some(Self::BitAlignInt),
            13 => Some(Self::ByteAlignInt),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::BfeUint => "BFE_UINT",
            Self::BfeInt => "BFE_INT",
            Self::BfiInt => "BFI_INT",
            Self::BitAlignInt => "BIT_ALIGN_INT",
            Self::ByteAlignInt => "BYTE_ALIGN_INT",
        }
    }
}

/// 一条 8 字节指令字
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionWord(pub u64);

impl InstructionWord {
    pub fn opcode_bits(self) -> u8 {
        ((self.0 & OPCODE_MASK) >> OPCODE_SHIFT) as u8
    }

    pub fn opcode(self) -> Option<Op3Opcode> {
        Op3Opcode::from_raw(self.opcode_bits())
    }

    pub fn guards_clear(self) -> bool {
        GUARD_FIELDS
            .iter()
            .all(|(_, shift, mask)| (self.0 >> shift) & mask == 0)
    }

    /// 返回非零的保护字段名称
    pub fn set_guards(self) -> Vec<&'static str> {
        GUARD_FIELDS
            .iter()
            .filter(|(_, shift, mask)| (self.0 >> shift) & mask != 0)
            .map(|(name, _, _)| *name)
            .collect()
    }

    /// 只替换操作码字段
    pub fn with_opcode(self, opcode: Op3Opcode) -> Self {
        Self((self.0 & !OPCODE_MASK) | ((opcode as u64) << OPCODE_SHIFT))
    }

    /// 保护位全为 0 时才有意义的操作码
    pub fn patchable_opcode(self) -> Option<Op3Opcode> {
        if self.guards_clear() {
            self.opcode()
        } else {
            None
        }
    }
}

/// 扫描预算和期望补丁数范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchBounds {
    /// 假定二进制至少有这么多字节 (实际取与缓冲区长度的较小值)
    pub bytes_to_scan: usize,
    pub expected_min: usize,
    pub expected_max: usize,
}

impl Default for PatchBounds {
    fn default() -> Self {
        // 内核约 140kB，布局不确定，多扫一些。
        // 补丁数上限为 4 (lane) * 2 (哈希) * 64 (轮) * 2 (Ch/Maj)，
        // 常量折叠会去掉开头几轮。
        Self {
            bytes_to_scan: 220_000,
            expected_min: 950,
            expected_max: 1024,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("marker \"{marker}\" not found ({remaining} bytes remaining)")]
    MarkerNotFound {
        marker: &'static str,
        /// 段标记的序号；结束标记为 None
        occurrence: Option<usize>,
        remaining: usize,
    },

    #[error("only {remaining} bytes remaining, need {needed}")]
    Truncated { remaining: usize, needed: usize },

    #[error("patched {patched} instructions, was expecting {min}-{max}")]
    UnexpectedPatchCount {
        patched: usize,
        min: usize,
        max: usize,
    },
}

/// 补丁结果统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PatchReport {
    /// 第一条指令在二进制中的偏移
    pub first_opcode_offset: usize,
    pub instructions_scanned: usize,
    pub bfe_int: usize,
    pub bfe_uint: usize,
    pub byte_align: usize,
    /// 被改写为 BFI_INT 的指令数
    pub patched: usize,
}

fn advance(
    binary: &[u8],
    pos: usize,
    marker: &'static str,
    occurrence: Option<usize>,
) -> Result<usize, PatchError> {
    let needle = marker.as_bytes();
    binary[pos..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|found| pos + found)
        .ok_or(PatchError::MarkerNotFound {
            marker,
            occurrence,
            remaining: binary.len() - pos,
        })
}

/// 找到第一条指令的偏移 (`window` 是扫描窗口)
pub fn locate_first_opcode(window: &[u8]) -> Result<usize, PatchError> {
    let mut pos = advance(window, 0, END_MARKER, None)?;
    for occurrence in 0..SECTION_MARKER_COUNT {
        trace!(
            "At offset {} ({} rem. bytes), searching {} marker {}",
            pos,
            window.len() - pos,
            SECTION_MARKER,
            occurrence
        );
        pos = advance(window, pos, SECTION_MARKER, Some(occurrence))? + 1;
    }
    let remaining = window.len() - pos;
    if remaining < FIRST_OPCODE_OFFSET {
        return Err(PatchError::Truncated {
            remaining,
            needed: FIRST_OPCODE_OFFSET,
        });
    }
    Ok(pos + FIRST_OPCODE_OFFSET)
}

fn scan_window(binary: &[u8], bytes_to_scan: usize) -> &[u8] {
    &binary[..bytes_to_scan.min(binary.len())]
}

/// 统计指令区中的候选操作码，不修改二进制
pub fn scan(binary: &[u8], bytes_to_scan: usize) -> Result<PatchReport, PatchError> {
    let window = scan_window(binary, bytes_to_scan);
    let first = locate_first_opcode(window)?;
    let mut report = PatchReport {
        first_opcode_offset: first,
        ..PatchReport::default()
    };
    for chunk in window[first..].chunks_exact(INSTRUCTION_WIDTH) {
        report.instructions_scanned += 1;
        match InstructionWord(LittleEndian::read_u64(chunk)).patchable_opcode() {
            Some(Op3Opcode::BfeInt) => report.bfe_int += 1,
            Some(Op3Opcode::BfeUint) => report.bfe_uint += 1,
            Some(Op3Opcode::ByteAlignInt) => report.byte_align += 1,
            _ => {}
        }
    }
    Ok(report)
}

/// 把 BFE_INT 改写为 BFI_INT
///
/// 先计数再写入：补丁数不在 `[expected_min, expected_max]` 内时返回错误，
/// 二进制保持原样。
pub fn patch_bfi_int(binary: &mut [u8], bounds: &PatchBounds) -> Result<PatchReport, PatchError> {
    trace!("Patching BFI_INT instructions into the kernel binary...");
    let mut report = scan(binary, bounds.bytes_to_scan)?;
    debug!(
        "Potential OP3 instructions identified: {} BFE_INT, {} BFE_UINT, {} BYTE_ALIGN",
        report.bfe_int,
        report.bfe_uint,
        report.byte_align
    );

    let patched = report.bfe_int;
    if patched < bounds.expected_min || patched > bounds.expected_max {
        return Err(PatchError::UnexpectedPatchCount {
            patched,
            min: bounds.expected_min,
            max: bounds.expected_max,
        });
    }

    let end = bounds.bytes_to_scan.min(binary.len());
    for chunk in binary[report.first_opcode_offset..end].chunks_exact_mut(INSTRUCTION_WIDTH) {
        let word = InstructionWord(LittleEndian::read_u64(chunk));
        if word.patchable_opcode() == Some(Op3Opcode::BfeInt) {
            LittleEndian::write_u64(chunk, word.with_opcode(Op3Opcode::BfiInt).0);
        }
    }
    report.patched = patched;
    debug!("Patched a total of {} BFI_INT instructions", patched);
    Ok(report)
}

/// 指令区的可读列表 (用于 disassemble 模式)
pub fn listing(binary: &[u8], bytes_to_scan: usize) -> Result<String, PatchError> {
    let window = scan_window(binary, bytes_to_scan);
    let first = locate_first_opcode(window)?;
    let mut out = String::new();
    for (i, chunk) in window[first..].chunks_exact(INSTRUCTION_WIDTH).enumerate() {
        let word = InstructionWord(LittleEndian::read_u64(chunk));
        let name = word.opcode().map(Op3Opcode::name).unwrap_or("-");
        let guards = word.set_guards();
        out.push_str(&format!(
            "{:08x}  {}  op3={:<14} {}\n",
            first + i * INSTRUCTION_WIDTH,
            hex::encode(chunk),
            name,
            if guards.is_empty() {
                String::from("guards clear")
            } else {
                guards.join(",")
            }
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op3(opcode: u8) -> InstructionWord {
        InstructionWord((opcode as u64) << OPCODE_SHIFT)
    }

    #[test]
    fn test_opcode_roundtrip_keeps_other_bits() {
        let word = InstructionWord(0x4000_0123_0000_0105 | ((Op3Opcode::BfeInt as u64) << OPCODE_SHIFT));
        assert_eq!(word.opcode(), Some(Op3Opcode::BfeInt));
        let patched = word.with_opcode(Op3Opcode::BfiInt);
        assert_eq!(patched.opcode(), Some(Op3Opcode::BfiInt));
        assert_eq!(patched.0 & !OPCODE_MASK, word.0 & !OPCODE_MASK);
    }

    #[test]
    fn test_patch_mask_matches_hardware_layout() {
        assert_eq!(!OPCODE_MASK, 0xfffc_1fff_ffff_ffff);
    }

    #[test]
    fn test_each_guard_blocks_patch() {
        for (name, shift, _) in GUARD_FIELDS {
            let word = InstructionWord(op3(5).0 | (1u64 << shift));
            assert!(!word.guards_clear(), "{} should block the patch", name);
            assert_eq!(word.set_guards(), vec![name]);
            assert_eq!(word.patchable_opcode(), None);
        }
        assert!(op3(5).guards_clear());
    }

    #[test]
    fn test_locate_requires_end_marker() {
        let err = locate_first_opcode(b"ATI CAL ATI CAL").unwrap_err();
        assert_eq!(
            err,
            PatchError::MarkerNotFound {
                marker: END_MARKER,
                occurrence: None,
                remaining: 15,
            }
        );
    }

    #[test]
    fn test_locate_counts_section_markers() {
        let mut binary = b"_the_end_".to_vec();
        for _ in 0..16 {
            binary.extend_from_slice(b"..ATI CAL");
        }
        let err = locate_first_opcode(&binary).unwrap_err();
        assert!(matches!(
            err,
            PatchError::MarkerNotFound {
                occurrence: Some(16),
                ..
            }
        ));

        binary.extend_from_slice(b"ATI CAL");
        // 第 17 个标记后只剩 6 字节
        assert!(matches!(
            locate_first_opcode(&binary),
            Err(PatchError::Truncated { remaining: 6, .. })
        ));

        binary.extend_from_slice(&[0u8; 5]);
        let first = locate_first_opcode(&binary).unwrap();
        assert_eq!(first, binary.len());
    }
}
