use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use framepipe_channel::{ChannelDescriptor, FrameBuffer};
use framepipe_renderer::{ProcessOutcome, RendererInfo};
use serde::Serialize;

pub const FRAME_SCHEMA: &str = "framepipe/cli/v1/frame";
pub const OUTCOME_SCHEMA: &str = "framepipe/cli/v1/render-outcome";
pub const CHANNEL_SCHEMA: &str = "framepipe/cli/v1/channel";
pub const INFO_SCHEMA: &str = "framepipe/cli/v1/renderer-info";

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    schema_id: &'a str,
    #[serde(flatten)]
    body: &'a T,
}

fn print_json<T: Serialize>(schema_id: &str, body: &T) {
    let envelope = Envelope { schema_id, body };
    println!(
        "{}",
        serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string())
    );
}

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

#[derive(Debug, Serialize)]
pub struct FrameSummary {
    pub frame_number: u64,
    pub timestamp_ns: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: String,
    pub payload_size: usize,
    /// FNV-1a over the pixel payload, for comparing frames across runs.
    pub digest: String,
}

impl FrameSummary {
    pub fn of(frame: &FrameBuffer) -> Self {
        Self {
            frame_number: frame.frame_number(),
            timestamp_ns: frame.timestamp_ns(),
            width: frame.width(),
            height: frame.height(),
            stride: frame.stride(),
            format: frame.format().name().to_string(),
            payload_size: frame.pixels().len(),
            digest: format!("{:016x}", fnv1a(frame.pixels())),
        }
    }
}

fn fnv1a(data: &[u8]) -> u64 {
    data.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

pub fn print_frame(frame: &FrameBuffer, format: OutputFormat) {
    match format {
        OutputFormat::Raw => print_raw(frame.pixels()),
        OutputFormat::Json => print_json(FRAME_SCHEMA, &FrameSummary::of(frame)),
        OutputFormat::Table => {
            let summary = FrameSummary::of(frame);
            let mut table = table(vec!["FRAME", "SIZE", "STRIDE", "FORMAT", "BYTES", "DIGEST"]);
            table.add_row(vec![
                summary.frame_number.to_string(),
                format!("{}x{}", summary.width, summary.height),
                summary.stride.to_string(),
                summary.format,
                summary.payload_size.to_string(),
                summary.digest,
            ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let summary = FrameSummary::of(frame);
            println!(
                "frame={} size={}x{} stride={} format={} ts={} digest={}",
                summary.frame_number,
                summary.width,
                summary.height,
                summary.stride,
                summary.format,
                summary.timestamp_ns,
                summary.digest
            );
        }
    }
}

pub fn print_outcome(outcome: &ProcessOutcome, format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => print_json(OUTCOME_SCHEMA, outcome),
        OutputFormat::Table => {
            let mut table = table(vec!["FRAME", "APPLIED", "SKIPPED", "DISCARDED"]);
            table.add_row(vec![
                frame_label(outcome.frame_number),
                outcome.applied.to_string(),
                outcome.skipped.to_string(),
                outcome.discarded.to_string(),
            ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "frame={} applied={} skipped={}{}",
                frame_label(outcome.frame_number),
                outcome.applied,
                outcome.skipped,
                if outcome.discarded { " (discarded)" } else { "" }
            );
        }
    }
}

fn frame_label(frame_number: Option<u64>) -> String {
    frame_number.map_or_else(|| "-".to_string(), |n| n.to_string())
}

pub fn print_descriptor(descriptor: &ChannelDescriptor, format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => print_json(CHANNEL_SCHEMA, descriptor),
        OutputFormat::Table | OutputFormat::Pretty => {
            let geometry = descriptor.geometry;
            let mut table = table(vec!["FIELD", "VALUE"]);
            table
                .add_row(vec![
                    "name",
                    descriptor.name.as_deref().unwrap_or("(anonymous)"),
                ])
                .add_row(vec!["status", descriptor.status.as_str()])
                .add_row(vec!["generation".to_string(), descriptor.generation.to_string()])
                .add_row(vec!["geometry".to_string(), geometry.to_string()])
                .add_row(vec!["published".to_string(), descriptor.published.to_string()])
                .add_row(vec![
                    "slot_capacity".to_string(),
                    descriptor.slot_capacity.to_string(),
                ])
                .add_row(vec!["writer_pid".to_string(), descriptor.writer_pid.to_string()]);
            println!("{table}");
        }
    }
}

/// Renderer info arrives as JSON from worker processes, so both modes print
/// through the same value.
pub fn print_info(info: &serde_json::Value, format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => print_json(INFO_SCHEMA, info),
        OutputFormat::Table | OutputFormat::Pretty => {
            let mut table = table(vec!["FIELD", "VALUE"]);
            if let Some(fields) = info.as_object() {
                for (key, value) in fields {
                    let text = match value {
                        serde_json::Value::String(text) => text.clone(),
                        serde_json::Value::Null => "-".to_string(),
                        other => other.to_string(),
                    };
                    table.add_row(vec![key.clone(), text]);
                }
            }
            println!("{table}");
        }
    }
}

pub fn info_value(info: &RendererInfo) -> serde_json::Value {
    serde_json::to_value(info).unwrap_or(serde_json::Value::Null)
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn envelope_flattens_body() {
        let outcome = ProcessOutcome {
            frame_number: Some(3),
            applied: 2,
            skipped: 0,
            discarded: false,
        };
        let json = serde_json::to_value(Envelope {
            schema_id: OUTCOME_SCHEMA,
            body: &outcome,
        })
        .unwrap();
        assert_eq!(json["schema_id"], OUTCOME_SCHEMA);
        assert_eq!(json["frame_number"], 3);
        assert_eq!(json["applied"], 2);
    }
}
