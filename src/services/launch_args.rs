// Launch Argument Builder
// Builds FFmpeg argument lists for station pipelines, snapshots, and feeders

use std::path::Path;
use thiserror::Error;

use crate::models::{AudioSource, Destination, StationPipelineConfig};

/// Conditions that abort a launch before anything is spawned
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("No enabled audio source configured")]
    NoAudioSource,
    #[error("No enabled destinations configured")]
    NoDestinations,
    #[error("Playlist manifest not found: {0}")]
    MissingManifest(String),
}

/// The enabled audio source with the lowest priority number
pub fn select_audio_source(config: &StationPipelineConfig) -> Result<&AudioSource, LaunchError> {
    config.primary_audio_source().ok_or(LaunchError::NoAudioSource)
}

/// Publish URLs for every enabled destination, stream keys resolved
pub fn destination_urls(config: &StationPipelineConfig) -> Result<Vec<String>, LaunchError> {
    let urls: Vec<String> = config
        .enabled_destinations()
        .into_iter()
        .map(destination_url)
        .collect();
    if urls.is_empty() {
        return Err(LaunchError::NoDestinations);
    }
    Ok(urls)
}

fn destination_url(destination: &Destination) -> String {
    let base = normalize_rtmp_url(&destination.url);
    match destination.stream_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
        Some(key) => format!("{base}/{}", resolve_stream_key(key)),
        None => base,
    }
}

/// Normalize an RTMP URL for consistency
pub fn normalize_rtmp_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    while url.ends_with('/') {
        url.pop();
    }

    if !url.contains("://") {
        if url.contains(":443") {
            url = format!("rtmps://{url}");
        } else {
            url = format!("rtmp://{url}");
        }
    }

    url
}

/// Resolve stream key - supports ${ENV_VAR} syntax
pub fn resolve_stream_key(key: &str) -> String {
    if key.starts_with("${") && key.ends_with('}') && key.len() > 3 {
        let var_name = &key[2..key.len() - 1];
        match std::env::var(var_name) {
            Ok(value) => {
                // Never log the variable name
                log::debug!("Resolved stream key from environment variable");
                value
            }
            Err(_) => {
                log::warn!("Environment variable not found for stream key, check your configuration");
                key.to_string()
            }
        }
    } else {
        key.to_string()
    }
}

/// Mask the stream key of an RTMP URL, keeping scheme, host, and app
pub fn redact_url(url: &str) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some(parts) => parts,
        None => return url.to_string(),
    };
    let (host, path) = match rest.split_once('/') {
        Some(parts) => parts,
        None => return url.to_string(),
    };

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return url.to_string();
    }

    format!("{scheme}://{host}/{}/***", segments[0])
}

/// Redact every RTMP URL inside an argument or output line, including tee lists
pub fn redact_arg(arg: &str) -> String {
    if !(arg.contains("rtmp://") || arg.contains("rtmps://")) {
        return arg.to_string();
    }

    arg.split('|')
        .map(|segment| {
            let pos = match segment.find("rtmp://").or_else(|| segment.find("rtmps://")) {
                Some(pos) => pos,
                None => return segment.to_string(),
            };
            let url_end = segment[pos..]
                .find(|c: char| c.is_whitespace() || c == '\'' || c == '"')
                .map(|i| pos + i)
                .unwrap_or(segment.len());
            format!(
                "{}{}{}",
                &segment[..pos],
                redact_url(&segment[pos..url_end]),
                &segment[url_end..]
            )
        })
        .collect::<Vec<_>>()
        .join("|")
}

pub fn redact_args(args: &[String]) -> Vec<String> {
    args.iter().map(|arg| redact_arg(arg)).collect()
}

fn double_bitrate_value(bitrate: &str) -> Option<String> {
    let trimmed = bitrate.trim();
    if trimmed.is_empty() {
        return None;
    }

    let split_at = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (value_str, suffix) = trimmed.split_at(split_at);
    if value_str.is_empty() {
        return None;
    }

    let value: f64 = value_str.parse().ok()?;
    Some(format!("{}{suffix}", value * 2.0))
}

fn append_cbr_args(args: &mut Vec<String>, encoder: &str, bitrate: &str) {
    let bufsize = double_bitrate_value(bitrate).unwrap_or_else(|| bitrate.to_string());

    push(args, &["-b:v", bitrate, "-minrate", bitrate, "-maxrate", bitrate, "-bufsize", &bufsize]);

    if encoder.contains("nvenc") || encoder.contains("qsv") || encoder.contains("amf") {
        push(args, &["-rc", "cbr"]);
    }

    if encoder == "libx264" {
        push(args, &["-x264-params", "nal-hrd=cbr:force-cfr=1"]);
    }
}

fn push(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

/// fps → scale → pad; heterogeneous playlist items come out uniform
pub fn normalize_filter(config: &StationPipelineConfig) -> String {
    let v = &config.video;
    let (w, h) = (v.width, v.height);
    format!(
        "fps={fps},scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:color=black,setsar=1",
        fps = v.fps.max(1)
    )
}

/// Normalization followed by the overlay clauses, in that order
pub fn video_filter_chain(config: &StationPipelineConfig, overlay_filters: &[String]) -> String {
    let mut chain = vec![normalize_filter(config)];
    chain.extend(overlay_filters.iter().cloned());
    chain.join(",")
}

fn audio_input_args(args: &mut Vec<String>, source: &AudioSource) {
    let url = source.url.trim();
    push(args, &["-thread_queue_size", "1024"]);
    if url.starts_with("http://") || url.starts_with("https://") {
        push(args, &["-reconnect", "1", "-reconnect_streamed", "1", "-reconnect_delay_max", "5"]);
    }
    push(args, &["-i", url]);
}

fn encode_args(args: &mut Vec<String>, config: &StationPipelineConfig, chain: &str) {
    let video = &config.video;
    let fps = video.fps.max(1).to_string();
    let gop = video.gop_size().to_string();

    push(args, &["-filter_complex", &format!("[0:v]{chain}[vout]")]);
    push(args, &["-map", "[vout]", "-map", "1:a:0"]);

    push(args, &["-c:v", &video.codec]);
    if let Some(preset) = video.preset.as_deref().filter(|p| !p.trim().is_empty()) {
        push(args, &["-preset", preset]);
    }
    append_cbr_args(args, &video.codec, &video.bitrate);
    push(args, &["-pix_fmt", "yuv420p", "-r", &fps, "-fps_mode", "cfr"]);
    push(args, &["-g", &gop, "-keyint_min", &gop, "-sc_threshold", "0"]);
    push(args, &["-force_key_frames", "expr:gte(t,n_forced*2)"]);

    let audio = &config.audio;
    push(args, &["-c:a", "aac", "-b:a", &audio.bitrate]);
    push(args, &["-ar", &audio.sample_rate.to_string(), "-ac", "2"]);
}

fn output_args(args: &mut Vec<String>, urls: &[String]) {
    if let [url] = urls {
        push(args, &["-f", "flv", url]);
        return;
    }

    // Encode once, fan out; one failing destination does not stop the others
    let tee = urls
        .iter()
        .map(|url| format!("[f=flv:onfail=ignore]{url}"))
        .collect::<Vec<_>>()
        .join("|");
    push(args, &["-flags", "+global_header", "-f", "tee", &tee]);
}

/// Single transcoder reading the concat manifest directly
pub fn build_single_args(
    config: &StationPipelineConfig,
    manifest: &Path,
    overlay_filters: &[String],
) -> Result<Vec<String>, LaunchError> {
    let audio = select_audio_source(config)?;
    let urls = destination_urls(config)?;
    if !manifest.is_file() {
        return Err(LaunchError::MissingManifest(manifest.display().to_string()));
    }

    let mut args = Vec::new();
    push(&mut args, &["-hide_banner", "-re"]);
    push(&mut args, &["-f", "concat", "-safe", "0", "-i", &manifest.to_string_lossy()]);
    audio_input_args(&mut args, audio);
    encode_args(&mut args, config, &video_filter_chain(config, overlay_filters));
    output_args(&mut args, &urls);
    Ok(args)
}

/// Long-lived encoder reading the feeder's MPEG-TS from stdin
pub fn build_encoder_args(
    config: &StationPipelineConfig,
    overlay_filters: &[String],
) -> Result<Vec<String>, LaunchError> {
    let audio = select_audio_source(config)?;
    let urls = destination_urls(config)?;

    let mut args = Vec::new();
    push(&mut args, &["-hide_banner", "-fflags", "+genpts", "-thread_queue_size", "1024"]);
    push(&mut args, &["-f", "mpegts", "-i", "pipe:0"]);
    audio_input_args(&mut args, audio);
    encode_args(&mut args, config, &video_filter_chain(config, overlay_filters));
    output_args(&mut args, &urls);
    Ok(args)
}

/// Decode one playlist item at real-time pace into normalized MPEG-TS on stdout
pub fn build_feeder_args(config: &StationPipelineConfig, item: &Path) -> Vec<String> {
    let gop = config.video.gop_size().to_string();
    let mut args = Vec::new();
    push(&mut args, &["-hide_banner", "-nostdin", "-loglevel", "warning", "-re"]);
    push(&mut args, &["-i", &item.to_string_lossy()]);
    push(&mut args, &["-map", "0:v:0", "-an", "-vf", &normalize_filter(config)]);
    push(&mut args, &["-c:v", "libx264", "-preset", "ultrafast", "-crf", "18", "-g", &gop]);
    push(&mut args, &["-pix_fmt", "yuv420p", "-f", "mpegts", "pipe:1"]);
    args
}

/// One still frame of the station output, same normalization and overlay
pub fn build_snapshot_args(
    config: &StationPipelineConfig,
    manifest: &Path,
    overlay_filters: &[String],
    output: &Path,
) -> Result<Vec<String>, LaunchError> {
    if !manifest.is_file() {
        return Err(LaunchError::MissingManifest(manifest.display().to_string()));
    }

    let mut args = Vec::new();
    push(&mut args, &["-hide_banner", "-nostdin", "-loglevel", "error", "-y"]);
    push(&mut args, &["-f", "concat", "-safe", "0", "-i", &manifest.to_string_lossy()]);
    push(&mut args, &["-vf", &video_filter_chain(config, overlay_filters)]);
    push(&mut args, &["-frames:v", "1", "-q:v", "2", "-f", "image2"]);
    push(&mut args, &[&output.to_string_lossy()]);
    Ok(args)
}
