//! 工作单元和候选校验
//!
//! getwork 的 data/midstate 十六进制串按小端读成 32 位字后，正好是 SHA-256
//! 消息字/状态字本身，所以内核可以直接使用，提交时再按小端编码回去。

use std::sync::{Arc, RwLock};

use sha2::digest::generic_array::GenericArray;
use sha2::{Digest, Sha256};

/// data 中 nonce 所在的字 (第二个 64 字节块的第 3 个字)
pub const NONCE_WORD: usize = 16 + 3;

/// 一个工作单元
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    /// 128 字节区块数据 (含第二块的 SHA-256 填充)
    pub data_words: [u32; 32],
    /// 第一个 64 字节块之后的中间哈希状态
    pub midstate: [u32; 8],
    /// 获取工作时的难度目标快照
    pub target: Target,
}

impl WorkItem {
    /// 固定的演示区块，disassemble 模式和测试使用。nonce `0x00d3fb29` 是它的解。
    pub fn synthetic() -> Self {
        let mut data_words = [0u32; 32];
        data_words[16..20].copy_from_slice(&[0x044c_8720, 0x5c82_0c4d, 0x0812_451c, 0x00d3_fb29]);
        data_words[20] = 0x8000_0000;
        data_words[31] = 0x0000_0280;
        Self {
            data_words,
            midstate: [
                0x6058_cb5a, 0xde72_384e, 0xfae3_8d3c, 0xf621_2e39, 0x0cfb_5a2f, 0x20eb_e629,
                0x9ce9_ce77, 0xc2fb_5a3f,
            ],
            target: Target::DIFFICULTY_ONE,
        }
    }

    /// 内核只需要的非零数据字 (第二块的前三个字)
    pub fn tail_words(&self) -> [u32; 3] {
        [self.data_words[16], self.data_words[17], self.data_words[18]]
    }
}

/// 把 nonce 写入 data 的副本
pub fn with_nonce(data_words: &[u32; 32], nonce: u32) -> [u32; 32] {
    let mut out = *data_words;
    out[NONCE_WORD] = nonce;
    out
}

/// 按内存布局 (小端) 编码为 128 字节
pub fn encode_data_words(data_words: &[u32; 32]) -> Vec<u8> {
    data_words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// 从中间状态计算双 SHA-256，与内核的计算完全一致
pub fn sha256d_from_midstate(midstate: &[u32; 8], data_words: &[u32; 32], nonce: u32) -> [u8; 32] {
    let data = with_nonce(data_words, nonce);
    let mut block = [0u8; 64];
    for (chunk, word) in block.chunks_exact_mut(4).zip(&data[16..32]) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    let mut state = *midstate;
    sha2::compress256(&mut state, &[GenericArray::clone_from_slice(&block)]);

    let first: Vec<u8> = state.iter().flat_map(|w| w.to_be_bytes()).collect();
    Sha256::digest(&first).into()
}

/// 80 字节区块头的双 SHA-256 (区块头字节是 data 前 20 个字的大端编码)
pub fn sha256d_header(data_words: &[u32; 32], nonce: u32) -> [u8; 32] {
    let data = with_nonce(data_words, nonce);
    let header: Vec<u8> = data[..20].iter().flat_map(|w| w.to_be_bytes()).collect();
    Sha256::digest(Sha256::digest(&header)).into()
}

/// data 第一个 64 字节块之后的 SHA-256 状态
pub fn first_block_midstate(data_words: &[u32; 32]) -> [u32; 8] {
    let mut block = [0u8; 64];
    for (chunk, word) in block.chunks_exact_mut(4).zip(&data_words[..16]) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    let mut state = SHA256_IV;
    sha2::compress256(&mut state, &[GenericArray::clone_from_slice(&block)]);
    state
}

const SHA256_IV: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

/// 256 位难度目标 (小端字节序，与 getwork 一致)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target(pub [u8; 32]);

impl Target {
    /// 难度 1: 0x00000000ffff...
    pub const DIFFICULTY_ONE: Target = {
        let mut bytes = [0xffu8; 32];
        bytes[28] = 0;
        bytes[29] = 0;
        bytes[30] = 0;
        bytes[31] = 0;
        Target(bytes)
    };

    /// 哈希 (小端数值) 不大于目标
    pub fn is_met_by(&self, hash: &[u8; 32]) -> bool {
        for i in (0..32).rev() {
            if hash[i] != self.0[i] {
                return hash[i] < self.0[i];
            }
        }
        true
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::DIFFICULTY_ONE
    }
}

/// 进程共享的最新目标，很少更新，短时间内读到旧值可以接受
#[derive(Debug, Clone, Default)]
pub struct SharedTarget(Arc<RwLock<Target>>);

impl SharedTarget {
    pub fn new(target: Target) -> Self {
        Self(Arc::new(RwLock::new(target)))
    }

    pub fn get(&self) -> Target {
        match self.0.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set(&self, target: Target) {
        match self.0.write() {
            Ok(mut guard) => *guard = target,
            Err(poisoned) => *poisoned.into_inner() = target,
        }
    }
}
