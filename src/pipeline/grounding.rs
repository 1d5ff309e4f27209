//! Reference/detection tags: parsing, coordinate mapping and text cleanup.
//!
//! A grounded generation wraps each block in
//! `<|ref|>LABEL<|/ref|><|det|>[[x1, y1, x2, y2], …]<|/det|>`, with
//! coordinates normalised to `0..=999` of the crop the model saw. The
//! recogniser maps those boxes back into page space; the assembler uses the
//! same parse to rewrite the text:
//!
//! 1. `image` references become `![](images/{page}_{n}.jpg)` links, one per box
//! 2. all other references are removed
//! 3. `\coloneqq` → `:=` and `\eqqcolon` → `=:`
//! 4. three or more consecutive newlines collapse to two
//!
//! Boxes are parsed with a regex, never evaluated, so malformed model output
//! only loses the box.

use crate::output::{LayoutBox, Rect};
use once_cell::sync::Lazy;
use regex::Regex;

/// Largest normalised coordinate the model emits.
pub const COORD_SCALE: u32 = 999;

/// Label the model uses for figures that should be extracted.
pub const IMAGE_LABEL: &str = "image";

static RE_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<\|ref\|>(.*?)<\|/ref\|><\|det\|>(.*?)<\|/det\|>").unwrap()
});

static RE_BOX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\s*(\d+)\s*,\s*(\d+)\s*,\s*(\d+)\s*,\s*(\d+)\s*\]").unwrap()
});

static RE_EXCESS_NEWLINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// One reference tag found in recognised text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference<'a> {
    /// Byte offset of the tag in the text.
    pub start: usize,
    /// The full tag as it appears in the text.
    pub raw: &'a str,
    pub label: &'a str,
    /// Normalised `[x1, y1, x2, y2]` boxes; unparseable entries are dropped.
    pub boxes: Vec<[u32; 4]>,
}

/// All reference tags in `text`, in order of appearance.
pub fn parse_references(text: &str) -> Vec<Reference<'_>> {
    RE_REFERENCE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(Reference {
                start: whole.start(),
                raw: whole.as_str(),
                label: caps.get(1)?.as_str().trim(),
                boxes: parse_boxes(caps.get(2)?.as_str()),
            })
        })
        .collect()
}

fn parse_boxes(det: &str) -> Vec<[u32; 4]> {
    RE_BOX
        .captures_iter(det)
        .filter_map(|caps| {
            let n = |i: usize| caps.get(i)?.as_str().parse::<u32>().ok();
            Some([n(1)?, n(2)?, n(3)?, n(4)?])
        })
        .collect()
}

/// Map a normalised box inside `region` to page pixels.
///
/// Returns `None` for boxes that are inverted or collapse to nothing.
pub fn to_page_rect(norm: [u32; 4], region: Rect) -> Option<Rect> {
    let scale = |v: u32, extent: u32| -> u32 {
        (v.min(COORD_SCALE) as u64 * extent as u64 / COORD_SCALE as u64) as u32
    };
    let [x1, y1, x2, y2] = norm;
    let rect = Rect::new(
        region.x0 + scale(x1, region.width()),
        region.y0 + scale(y1, region.height()),
        region.x0 + scale(x2, region.width()),
        region.y0 + scale(y2, region.height()),
    );
    (!rect.is_empty()).then_some(rect)
}

/// Parse the tags of merged crop text and map their boxes into page space.
///
/// `segments` gives, for each crop in merge order, the byte offset at which
/// its text starts in `text` and the crop's page region. A reference belongs
/// to the last segment starting at or before it.
pub fn layout_boxes(text: &str, segments: &[(usize, Rect)]) -> Vec<LayoutBox> {
    let mut boxes = Vec::new();
    for (index, reference) in parse_references(text).into_iter().enumerate() {
        let Some(&(_, region)) = segments
            .iter()
            .rev()
            .find(|(offset, _)| *offset <= reference.start)
        else {
            continue;
        };
        for norm in &reference.boxes {
            if let Some(rect) = to_page_rect(*norm, region) {
                boxes.push(LayoutBox {
                    label: reference.label.to_string(),
                    rect,
                    reference: index,
                });
            }
        }
    }
    boxes
}

/// File name of the `n`-th extracted figure on `page`.
pub fn image_file_name(page: usize, n: usize) -> String {
    format!("{page}_{n}.jpg")
}

/// Rewrite grounded text for the clean Markdown artifact.
///
/// `layout` must be the boxes [`layout_boxes`] produced for this same text;
/// figure links are numbered in the same order the assembler extracts them.
pub fn clean_text(text: &str, page: usize, layout: &[LayoutBox]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut figure = 0;

    for (index, reference) in parse_references(text).into_iter().enumerate() {
        out.push_str(&text[last..reference.start]);
        last = reference.start + reference.raw.len();

        if reference.label == IMAGE_LABEL {
            let count = layout
                .iter()
                .filter(|b| b.reference == index && b.label == IMAGE_LABEL)
                .count();
            for _ in 0..count {
                out.push_str(&format!("![](images/{})\n", image_file_name(page, figure)));
                figure += 1;
            }
        }
    }
    out.push_str(&text[last..]);

    let out = out.replace("\\coloneqq", ":=").replace("\\eqqcolon", "=:");
    RE_EXCESS_NEWLINES.replace_all(&out, "\n\n").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "<|ref|>title<|/ref|><|det|>[[10, 20, 500, 80]]<|/det|>\n# Intro\n\n\n\n\
<|ref|>image<|/ref|><|det|>[[0, 100, 999, 600], [0, 650, 499, 999]]<|/det|>\n\
<|ref|>text<|/ref|><|det|>[[10, 620, 990, 990]]<|/det|>\nLet $a \\coloneqq b$.";

    #[test]
    fn parses_labels_and_boxes() {
        let refs = parse_references(SAMPLE);
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].label, "title");
        assert_eq!(refs[0].boxes, vec![[10, 20, 500, 80]]);
        assert_eq!(refs[1].label, "image");
        assert_eq!(refs[1].boxes.len(), 2);
    }

    #[test]
    fn malformed_boxes_are_dropped() {
        let text = "<|ref|>text<|/ref|><|det|>[[1, 2, oops]]<|/det|>";
        let refs = parse_references(text);
        assert_eq!(refs.len(), 1);
        assert!(refs[0].boxes.is_empty());
    }

    #[test]
    fn maps_boxes_into_crop_region() {
        let region = Rect::new(1000, 0, 2000, 999);
        let rect = to_page_rect([0, 0, 999, 999], region).unwrap();
        assert_eq!(rect, region);
        let half = to_page_rect([0, 0, 500, 500], region).unwrap();
        assert_eq!(half.x0, 1000);
        assert!(half.x1 > 1490 && half.x1 < 1510);
        assert!(to_page_rect([500, 10, 400, 20], region).is_none());
    }

    #[test]
    fn references_follow_their_segment() {
        let left = "<|ref|>text<|/ref|><|det|>[[0, 0, 999, 999]]<|/det|>a";
        let right = "<|ref|>text<|/ref|><|det|>[[0, 0, 999, 999]]<|/det|>b";
        let merged = format!("{left}\n{right}");
        let segments = [
            (0, Rect::new(0, 0, 100, 100)),
            (left.len() + 1, Rect::new(100, 0, 200, 100)),
        ];
        let boxes = layout_boxes(&merged, &segments);
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].rect, Rect::new(0, 0, 100, 100));
        assert_eq!(boxes[1].rect, Rect::new(100, 0, 200, 100));
        assert_eq!(boxes[1].reference, 1);
    }

    #[test]
    fn clean_text_links_figures_and_strips_tags() {
        let segments = [(0, Rect::new(0, 0, 1000, 1000))];
        let layout = layout_boxes(SAMPLE, &segments);
        let clean = clean_text(SAMPLE, 4, &layout);

        assert!(!clean.contains("<|ref|>"), "got: {clean}");
        assert!(clean.contains("![](images/4_0.jpg)"));
        assert!(clean.contains("![](images/4_1.jpg)"));
        assert!(clean.contains("$a := b$"));
        assert!(!clean.contains("\n\n\n"));
    }

    #[test]
    fn untagged_text_passes_through() {
        assert_eq!(clean_text("plain text", 0, &[]), "plain text");
    }
}
