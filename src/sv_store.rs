use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Structural variant classes handled by the refinement pipeline
#[derive(
    Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq, Serialize, Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum SvType {
    #[strum(serialize = "DEL")]
    Del,
    #[strum(serialize = "INV")]
    Inv,
    #[strum(serialize = "DUP:TANDEM")]
    DupTandem,
    #[strum(serialize = "DUP:ISP")]
    DupIsp,
    #[strum(serialize = "INS")]
    Ins,
}

/// Which breakpoint of its SV a confidence interval brackets
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum CiSide {
    Left,
    Right,
    Copy,
}

impl CiSide {
    /// Numeric side key used in the votes file format
    pub fn code(&self) -> u8 {
        match self {
            CiSide::Left => 1,
            CiSide::Right => 2,
            CiSide::Copy => 3,
        }
    }
}

/// An imprecise SV call from the upstream caller, immutable after ingestion
#[derive(Clone, Debug)]
pub struct StructuralVariant {
    pub id: String,
    pub chrom: String,
    /// One-based start coordinate (POS)
    pub start: i64,
    /// One-based end coordinate (END)
    pub end: i64,
    pub sv_type: SvType,
    /// Copy-target position, interspersed duplications only (POS2)
    pub copy_pos: Option<i64>,
}

/// A widened breakpoint confidence interval, 1-based inclusive `[head, tail]`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BreakpointCi {
    pub head: i64,
    pub tail: i64,
    pub sv_id: String,
    pub side: CiSide,
}

impl BreakpointCi {
    pub fn contains(&self, pos: i64) -> bool {
        pos >= self.head && pos <= self.tail
    }
}

/// Widen a raw caller CI so that short reads straddling the breakpoint are
/// intercepted by the interval query
///
/// The pad is one fragment length plus slack, or half the SV size when the SV
/// is smaller than a fragment. Both ends are clamped to coordinate 1.
///
pub fn widen_ci(head: i64, tail: i64, segment_size: i64, sv_size: i64) -> (i64, i64) {
    let pad = if sv_size < segment_size {
        sv_size / 2
    } else {
        segment_size + 100
    };
    (
        std::cmp::max(head - pad, 1),
        std::cmp::max(tail + pad, 1),
    )
}

/// Insertion-ordered store of input SVs keyed by caller id
#[derive(Default)]
pub struct SvStore {
    svs: IndexMap<String, StructuralVariant>,
}

impl SvStore {
    pub fn add(&mut self, sv: StructuralVariant) {
        self.svs.insert(sv.id.clone(), sv);
    }

    pub fn get(&self, id: &str) -> Option<&StructuralVariant> {
        self.svs.get(id)
    }

    /// SVs in input VCF order
    pub fn iter(&self) -> impl Iterator<Item = &StructuralVariant> {
        self.svs.values()
    }

    pub fn len(&self) -> usize {
        self.svs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.svs.is_empty()
    }
}

/// All CIs of a run in a contiguous vector, with a per-chromosome position
/// index and per-SV side links
///
/// The vector index of each CI is the globally unique value carried in the
/// `SV` aux tag on every BAM record downstream.
///
#[derive(Default)]
pub struct CiStore {
    ci_list: Vec<BreakpointCi>,
    chrom_map: HashMap<String, Vec<usize>>,
    left_of: HashMap<String, usize>,
    right_of: HashMap<String, usize>,
    copy_of: HashMap<String, usize>,
}

impl CiStore {
    pub fn add(&mut self, chrom: &str, ci: BreakpointCi) -> usize {
        let ci_index = self.ci_list.len();
        let link_map = match ci.side {
            CiSide::Left => &mut self.left_of,
            CiSide::Right => &mut self.right_of,
            CiSide::Copy => &mut self.copy_of,
        };
        link_map.insert(ci.sv_id.clone(), ci_index);
        self.ci_list.push(ci);
        self.chrom_map
            .entry(chrom.to_string())
            .or_default()
            .push(ci_index);
        ci_index
    }

    pub fn get(&self, ci_index: usize) -> &BreakpointCi {
        &self.ci_list[ci_index]
    }

    pub fn try_get(&self, ci_index: usize) -> Option<&BreakpointCi> {
        self.ci_list.get(ci_index)
    }

    pub fn len(&self) -> usize {
        self.ci_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ci_list.is_empty()
    }

    pub fn left_ci(&self, sv_id: &str) -> Option<usize> {
        self.left_of.get(sv_id).copied()
    }

    pub fn right_ci(&self, sv_id: &str) -> Option<usize> {
        self.right_of.get(sv_id).copied()
    }

    pub fn copy_ci(&self, sv_id: &str) -> Option<usize> {
        self.copy_of.get(sv_id).copied()
    }

    /// Indices of all CIs on `chrom` whose widened interval overlaps the
    /// 1-based inclusive range `[start, end]`
    ///
    /// A linear scan over the per-chromosome index; CI counts per chromosome
    /// are modest enough that a tree has not been needed.
    ///
    pub fn find_intersecting(&self, chrom: &str, start: i64, end: i64) -> Vec<usize> {
        let mut result = Vec::new();
        if let Some(chrom_cis) = self.chrom_map.get(chrom) {
            for &ci_index in chrom_cis {
                let ci = &self.ci_list[ci_index];
                if ci.head <= end && ci.tail >= start {
                    result.push(ci_index);
                }
            }
        }
        result
    }
}
