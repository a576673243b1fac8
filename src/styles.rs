use crate::model::{AlignmentStyle, FillStyle, FontStyle, HorizontalAlign, MinimalStyle};
use umya_spreadsheet::structs::{EnumTrait, VerticalAlignmentValues};
use umya_spreadsheet::{Alignment, Fill, Font, Style};

/// `tracing` target for per-cell style diagnostics; enable with
/// `RUST_LOG=spreadsheet_worker::style_debug=trace`.
pub const STYLE_DEBUG_TARGET: &str = "spreadsheet_worker::style_debug";

/// Project a full cell style down to the subset the viewer paints
pub fn minimal_style(style: &Style) -> MinimalStyle {
    let projected = MinimalStyle {
        font: style.get_font().and_then(font_style),
        fill: style.get_fill().and_then(fill_style),
        alignment: style.get_alignment().and_then(alignment_style),
    };
    tracing::trace!(target: STYLE_DEBUG_TARGET, ?projected, "projected cell style");
    projected
}

/// Size umya assigns to every font; reported only when it differs
const DEFAULT_FONT_SIZE: f64 = 11.0;
const DEFAULT_FONT_ARGB: &str = "FF000000";

fn font_style(font: &Font) -> Option<FontStyle> {
    let bold = *font.get_bold();
    let size = Some(*font.get_size()).filter(|s| *s > 0.0 && *s != DEFAULT_FONT_SIZE);
    let color = Some(font.get_color().get_argb())
        .filter(|argb| !argb.is_empty() && !argb.eq_ignore_ascii_case(DEFAULT_FONT_ARGB))
        .map(str::to_string);

    if !bold && size.is_none() && color.is_none() {
        return None;
    }
    Some(FontStyle { bold, size, color })
}

fn fill_style(fill: &Fill) -> Option<FillStyle> {
    let pattern = fill.get_pattern_fill()?;
    if pattern
        .get_pattern_type()
        .get_value_string()
        .eq_ignore_ascii_case("none")
    {
        return None;
    }
    let color = pattern
        .get_foreground_color()
        .map(|c| c.get_argb().to_string())
        .filter(|s| !s.is_empty())?;
    Some(FillStyle { color: Some(color) })
}

/// Horizontal alignment of a cell, `None` for general
pub fn horizontal_alignment(style: &Style) -> Option<HorizontalAlign> {
    style.get_alignment().and_then(explicit_horizontal)
}

fn explicit_horizontal(alignment: &Alignment) -> Option<HorizontalAlign> {
    HorizontalAlign::parse(alignment.get_horizontal().get_value_string())
        .filter(|h| *h != HorizontalAlign::General)
}

fn alignment_style(alignment: &Alignment) -> Option<AlignmentStyle> {
    let horizontal = explicit_horizontal(alignment);
    let vertical = if alignment.get_vertical() != &VerticalAlignmentValues::Bottom {
        Some(alignment.get_vertical().get_value_string().to_string())
    } else {
        None
    };

    if horizontal.is_none() && vertical.is_none() {
        return None;
    }
    Some(AlignmentStyle {
        horizontal,
        vertical,
    })
}
