//! OpenCL 内核源代码加载与模板替换
//!
//! 每个工作单元的数据和中间状态直接写进内核源码，作为编译期常量。

use crate::config::{LANES_PER_THREAD, LaneStatus};
use crate::error::{MinerError, MinerResult};
use crate::work::WorkItem;

const SEARCH_KERNEL_TEMPLATE: &str = include_str!("../kernels/sha256d_search.cl");

/// 内核入口函数名
pub const KERNEL_ENTRY: &str = "search";

/// 编译期参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelParams {
    pub threads_per_group: u32,
    pub iterations: u32,
}

/// 生成针对 `work` 的完整内核源代码
///
/// # Example
/// ```
/// use rust_gpuminer::kernel_loader::{KernelParams, render_kernel_source};
/// use rust_gpuminer::work::WorkItem;
///
/// let params = KernelParams { threads_per_group: 64, iterations: 16 };
/// let source = render_kernel_source(&params, &WorkItem::synthetic()).unwrap();
/// assert!(source.contains("_the_end_"));
/// ```
pub fn render_kernel_source(params: &KernelParams, work: &WorkItem) -> MinerResult<String> {
    let [d0, d1, d2] = work.tail_words();
    let mut substitutions: Vec<(String, String)> = vec![
        ("THREADS_PER_GROUP".into(), params.threads_per_group.to_string()),
        ("ITERATIONS".into(), format!("{}u", params.iterations)),
        ("LANES_PER_THREAD".into(), LANES_PER_THREAD.to_string()),
        ("STATUS_SEARCHING".into(), format!("{}u", LaneStatus::Searching.as_u8())),
        ("STATUS_FOUND".into(), format!("{}u", LaneStatus::CandidateFound.as_u8())),
        ("STATUS_EXHAUSTED".into(), format!("{}u", LaneStatus::Exhausted.as_u8())),
        ("D0".into(), format!("0x{:08x}u", d0)),
        ("D1".into(), format!("0x{:08x}u", d1)),
        ("D2".into(), format!("0x{:08x}u", d2)),
    ];
    for (i, word) in work.midstate.iter().enumerate() {
        substitutions.push((format!("S{i}"), format!("0x{:08x}u", word)));
    }

    let mut source = SEARCH_KERNEL_TEMPLATE.to_string();
    for (name, value) in &substitutions {
        source = source.replace(&format!("{{{{{name}}}}}"), value);
    }

    if let Some(pos) = source.find("{{") {
        let end = source[pos..].find("}}").map_or(source.len(), |e| pos + e + 2);
        return Err(MinerError::Config(format!(
            "unsubstituted kernel template parameter {}",
            &source[pos..end]
        )));
    }
    Ok(source)
}

/// 编译选项：支持补丁的设备用 `amd_bfe` 生成可改写的 BFE_INT
pub fn build_options(supports_bfi_patch: bool) -> &'static str {
    if supports_bfi_patch {
        "-D BFI_PATCH"
    } else {
        ""
    }
}
