//! Page-break estimation for the continuously reflowing preview.
//!
//! Pages are `page_height` tall and separated by `page_gap`; page `k` spans
//! `[k * stride, k * stride + page_height)` with `stride = page_height + page_gap`.
//! A heading that lands in the last `safety_margin` of a page, or in the gap after it,
//! moves to the top of the next page.

use serde::{Deserialize, Serialize};

use crate::formats::{Section, SectionId};
use crate::outline::levels;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageGeometry {
    pub page_height: f64,
    pub page_gap: f64,
    pub safety_margin: f64,
}

impl Default for PageGeometry {
    fn default() -> Self {
        Self {
            page_height: 1123.0,
            page_gap: 24.0,
            safety_margin: 80.0,
        }
    }
}

impl PageGeometry {
    fn stride(&self) -> f64 {
        self.page_height + self.page_gap
    }

    /// Top of the next page when `y` falls in a safety zone.
    fn push_target(&self, y: f64) -> Option<f64> {
        let stride = self.stride();
        if y < 0.0 || stride <= 0.0 {
            return None;
        }
        let page = (y / stride).floor();
        let zone_start = page * stride + self.page_height - self.safety_margin;
        (y >= zone_start).then_some((page + 1.0) * stride)
    }

    pub fn page_count(&self, content_height: f64) -> usize {
        let pages = ((content_height.max(0.0) + self.page_gap) / self.stride()).ceil();
        (pages as usize).max(1)
    }
}

/// Measured rendering of one section. `sub_headings` are offsets from the block top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionBlock {
    pub id: SectionId,
    pub height: f64,
    #[serde(default)]
    pub margin_top: f64,
    #[serde(default)]
    pub margin_bottom: f64,
    #[serde(default)]
    pub sub_headings: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubHeadingShift {
    pub index: usize,
    pub shift: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockAdjustment {
    pub id: SectionId,
    /// Extra space above the block so its heading starts a page.
    pub extra_top: f64,
    pub sub_shifts: Vec<SubHeadingShift>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageBreak {
    pub offset: f64,
    pub page_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub adjustments: Vec<BlockAdjustment>,
    pub breaks: Vec<PageBreak>,
    pub total_height: f64,
    pub page_count: usize,
}

pub fn paginate(blocks: &[SectionBlock], geometry: &PageGeometry) -> Pagination {
    let mut cursor = 0.0f64;
    let mut adjustments = Vec::with_capacity(blocks.len());

    for block in blocks {
        let mut top = cursor + block.margin_top.max(0.0);
        let mut extra_top = 0.0;
        if let Some(next_page) = geometry.push_target(top) {
            extra_top = next_page - top;
            top = next_page;
        }

        let mut sub_shifts = Vec::new();
        let mut shifted = 0.0;
        if block.height > geometry.page_height {
            let mut offsets: Vec<(usize, f64)> =
                block.sub_headings.iter().copied().enumerate().collect();
            offsets.sort_by(|a, b| a.1.total_cmp(&b.1));
            for (index, offset) in offsets {
                let y = top + offset + shifted;
                if let Some(next_page) = geometry.push_target(y) {
                    let shift = next_page - y;
                    shifted += shift;
                    sub_shifts.push(SubHeadingShift { index, shift });
                }
            }
        }

        cursor = top + block.height.max(0.0) + shifted + block.margin_bottom.max(0.0);
        if extra_top > 0.0 || !sub_shifts.is_empty() {
            tracing::trace!(section_id = %block.id, extra_top, shifts = sub_shifts.len(), "block adjusted");
        }
        adjustments.push(BlockAdjustment {
            id: block.id.clone(),
            extra_top,
            sub_shifts,
        });
    }

    let page_count = geometry.page_count(cursor);
    let breaks = (1..page_count)
        .map(|page_index| PageBreak {
            offset: page_index as f64 * geometry.stride(),
            page_index,
        })
        .collect();

    Pagination {
        adjustments,
        breaks,
        total_height: cursor,
        page_count,
    }
}

/// Rough text metrics for estimating block heights without a renderer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextMetrics {
    pub line_height: f64,
    pub chars_per_line: usize,
    pub heading_height: f64,
    pub block_gap: f64,
}

impl Default for TextMetrics {
    fn default() -> Self {
        Self {
            line_height: 28.0,
            chars_per_line: 40,
            heading_height: 44.0,
            block_gap: 16.0,
        }
    }
}

/// One block per section in document order, with sub-heading offsets taken from
/// `#` lines inside the content.
pub fn estimate_blocks(sections: &[Section], metrics: &TextMetrics) -> Vec<SectionBlock> {
    let levels = levels(sections);
    let per_line = metrics.chars_per_line.max(1);
    sections
        .iter()
        .map(|section| {
            let mut height = metrics.heading_height;
            let mut sub_headings = Vec::new();
            for line in section.content.lines() {
                if line.trim_start().starts_with('#') {
                    sub_headings.push(height);
                    height += metrics.heading_height;
                    continue;
                }
                let chars = line.chars().count();
                let rows = chars.div_ceil(per_line).max(1);
                height += rows as f64 * metrics.line_height;
            }
            let level = levels.get(&section.id).copied().unwrap_or(1);
            SectionBlock {
                id: section.id.clone(),
                height,
                margin_top: if level == 1 { metrics.block_gap * 2.0 } else { metrics.block_gap },
                margin_bottom: 0.0,
                sub_headings,
            }
        })
        .collect()
}

/// Keeps the last measured blocks and recomputes breaks after every change.
#[derive(Debug, Clone)]
pub struct PreviewLayout {
    geometry: PageGeometry,
    blocks: Vec<SectionBlock>,
    current: Pagination,
}

impl PreviewLayout {
    pub fn new(geometry: PageGeometry) -> Self {
        Self {
            geometry,
            blocks: Vec::new(),
            current: paginate(&[], &geometry),
        }
    }

    pub fn pagination(&self) -> &Pagination {
        &self.current
    }

    pub fn set_blocks(&mut self, blocks: Vec<SectionBlock>) -> &Pagination {
        self.blocks = blocks;
        self.recompute()
    }

    /// A block changed height after it was measured, e.g. an image finished loading.
    /// Unknown ids leave the layout untouched.
    pub fn resize_block(&mut self, id: &SectionId, height: f64) -> Option<&Pagination> {
        let block = self.blocks.iter_mut().find(|b| &b.id == id)?;
        block.height = height;
        Some(self.recompute())
    }

    pub fn recompute(&mut self) -> &Pagination {
        self.current = paginate(&self.blocks, &self.geometry);
        &self.current
    }
}
