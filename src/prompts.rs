//! Prompt text sent with every crop.
//!
//! The job prompt (default [`DEFAULT_PROMPT`]) is the user turn. Grounded
//! prompts ask the model to wrap every block it transcribes in a reference
//! tag followed by its detection boxes; VLM backends that were not trained on
//! that format get [`GROUNDING_SYSTEM_PROMPT`] as the system turn so they
//! produce it anyway.

/// Prompt used when a job supplies none.
pub const DEFAULT_PROMPT: &str = "<image>\n<|grounding|>Convert the document to markdown.";

/// Marker that terminates a well-formed generation.
pub const END_MARKER: &str = "<｜end▁of▁sentence｜>";

/// Marker requesting reference/detection tags in the output.
pub const GROUNDING_MARKER: &str = "<|grounding|>";

/// System turn for general-purpose VLMs asked for grounded output.
pub const GROUNDING_SYSTEM_PROMPT: &str = r#"You are an expert document converter. You transcribe one image region of a document page into Markdown.

Follow these rules precisely:

1. TEXT PRESERVATION
   - Preserve ALL text content completely and accurately, in reading order

2. GROUNDING
   - Before each block, emit <|ref|>LABEL<|/ref|><|det|>[[x1, y1, x2, y2]]<|/det|>
   - LABEL is one of: title, sub_title, text, table, image, image_caption, formula, list, footer, header
   - Coordinates are integers from 0 to 999, relative to the image width and height
   - For figures, photos and charts use the label image and emit no text for them

3. STRUCTURE
   - Use # headings, - lists and GFM tables; render formulas in LaTeX

4. OUTPUT FORMAT
   - Output ONLY the grounded Markdown, with no commentary or code fences"#;

/// Whether `prompt` asks for reference/detection tags.
pub fn is_grounded(prompt: &str) -> bool {
    prompt.contains(GROUNDING_MARKER)
}

/// Strip the image placeholder and grounding marker, leaving the instruction.
pub fn instruction_text(prompt: &str) -> String {
    prompt
        .replace("<image>", "")
        .replace(GROUNDING_MARKER, "")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prompt_is_grounded() {
        assert!(is_grounded(DEFAULT_PROMPT));
        assert!(!is_grounded("<image>\nFree OCR."));
    }

    #[test]
    fn instruction_text_drops_markers() {
        assert_eq!(
            instruction_text(DEFAULT_PROMPT),
            "Convert the document to markdown."
        );
    }
}
