// Overlay Filter Builder
// Turns overlay settings into drawtext clauses reading live-updated text files

use std::path::Path;

use crate::models::{HorizontalAnchor, OverlayLayout, OverlaySettings};

/// Text sources for one station's overlay
#[derive(Debug, Clone, Copy)]
pub struct OverlayTextSources<'a> {
    /// Combined "Artist - Title"
    pub combined: &'a Path,
    pub artist: &'a Path,
    pub title: &'a Path,
    /// Static label drawn above the track lines
    pub label: Option<&'a str>,
}

fn escape_chars(value: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Filter option level: the `:` separator and quoting
fn escape_option(value: &str) -> String {
    escape_chars(value, &[':', '\''])
}

/// Filtergraph level: quoting plus the chain and link delimiters
fn escape_graph(value: &str) -> String {
    escape_chars(value, &['\'', ',', ';', '[', ']'])
}

/// Escape literal drawtext `text`
///
/// The value passes the filtergraph parser, the option parser, then drawtext's
/// own `%` expansion, so it carries all three levels.
pub fn escape_text(text: &str) -> String {
    escape_graph(&escape_option(&escape_chars(text, &['%'])))
}

/// Escape a literal option value such as a color or font family
pub fn escape_value(value: &str) -> String {
    escape_graph(&escape_option(value))
}

/// Escape a file path used as a drawtext `textfile`/`fontfile` value
pub fn escape_path(path: &Path) -> String {
    escape_value(&path.to_string_lossy())
}

struct Line {
    source: LineSource,
    font_size: u32,
    color: String,
}

enum LineSource {
    Literal(String),
    File(String),
}

/// Build the ordered drawtext clauses for the overlay
///
/// Returns nothing when the overlay is disabled or the renderer has no text
/// support; callers still apply normalization and scaling.
pub fn build_overlay_filters(
    settings: &OverlaySettings,
    sources: &OverlayTextSources<'_>,
    text_supported: bool,
) -> Vec<String> {
    if !settings.enabled || !text_supported {
        return Vec::new();
    }

    let label = sources
        .label
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| Line {
            source: LineSource::Literal(escape_text(l)),
            font_size: settings.label_font_size.max(1),
            color: settings.label_font_color.clone(),
        });

    let track_line = |path: &Path| Line {
        source: LineSource::File(escape_path(path)),
        font_size: settings.font_size.max(1),
        color: settings.font_color.clone(),
    };

    // Top-to-bottom visual order
    let mut lines: Vec<Line> = Vec::new();
    lines.extend(label);
    match settings.layout {
        OverlayLayout::Stacked => {
            lines.push(track_line(sources.artist));
            lines.push(track_line(sources.title));
        }
        OverlayLayout::SingleLine => lines.push(track_line(sources.combined)),
    }

    let ys = vertical_offsets(settings, &lines);
    let x = horizontal_expr(settings.position.horizontal(), settings.margin);
    let font = font_option(settings);

    lines
        .iter()
        .zip(ys)
        .map(|(line, y)| drawtext_clause(settings, line, &font, &x, &y))
        .collect()
}

/// y expression for each line, in the same order as `lines`
fn vertical_offsets(settings: &OverlaySettings, lines: &[Line]) -> Vec<String> {
    let gap = settings.line_gap;
    let margin = settings.margin;

    if settings.position.is_top() {
        let mut y = margin;
        lines
            .iter()
            .map(|line| {
                let expr = y.to_string();
                y += line.font_size + gap;
                expr
            })
            .collect()
    } else {
        // Walk upward from the bottom line
        let mut from_bottom = margin;
        let mut ys: Vec<String> = lines
            .iter()
            .rev()
            .map(|line| {
                from_bottom += line.font_size;
                let expr = format!("h-{from_bottom}");
                from_bottom += gap;
                expr
            })
            .collect();
        ys.reverse();
        ys
    }
}

fn horizontal_expr(anchor: HorizontalAnchor, margin: u32) -> String {
    match anchor {
        HorizontalAnchor::Left => margin.to_string(),
        HorizontalAnchor::Center => "(w-text_w)/2".to_string(),
        HorizontalAnchor::Right => format!("w-text_w-{margin}"),
    }
}

/// Uploaded font file, then named family, then renderer default
fn font_option(settings: &OverlaySettings) -> Option<String> {
    if let Some(file) = settings.font_file.as_deref() {
        if !file.as_os_str().is_empty() {
            return Some(format!("fontfile={}", escape_path(file)));
        }
    }
    let family = settings.font_family.trim();
    if family.is_empty() {
        None
    } else {
        Some(format!("font={}", escape_value(family)))
    }
}

fn drawtext_clause(
    settings: &OverlaySettings,
    line: &Line,
    font: &Option<String>,
    x: &str,
    y: &str,
) -> String {
    let mut opts: Vec<String> = Vec::new();
    match &line.source {
        LineSource::File(path) => {
            opts.push(format!("textfile={path}"));
            opts.push("reload=1".to_string());
        }
        LineSource::Literal(text) => opts.push(format!("text={text}")),
    }
    if let Some(font) = font {
        opts.push(font.clone());
    }
    opts.push(format!("fontsize={}", line.font_size));
    opts.push(format!("fontcolor={}", escape_value(&line.color)));
    opts.push(format!("x={x}"));
    opts.push(format!("y={y}"));

    if settings.shadow_x != 0 || settings.shadow_y != 0 {
        opts.push(format!("shadowx={}", settings.shadow_x));
        opts.push(format!("shadowy={}", settings.shadow_y));
        opts.push(format!("shadowcolor={}", escape_value(&settings.shadow_color)));
    }
    if settings.outline_width > 0 {
        opts.push(format!("borderw={}", settings.outline_width));
        opts.push(format!("bordercolor={}", escape_value(&settings.outline_color)));
    }
    if let Some(bg) = settings.background_color.as_deref().filter(|c| !c.trim().is_empty()) {
        opts.push("box=1".to_string());
        opts.push(format!("boxcolor={}", escape_value(bg)));
        opts.push("boxborderw=8".to_string());
    }

    format!("drawtext={}", opts.join(":"))
}

/// Reverse one escaping level
#[cfg(test)]
pub(crate) fn unescape_level(escaped: &str) -> String {
    let mut out = String::new();
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Reverse both escaping levels applied by `escape_path`
#[cfg(test)]
pub(crate) fn unescape_path(escaped: &str) -> String {
    unescape_level(&unescape_level(escaped))
}
