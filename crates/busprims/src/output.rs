use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use busprims_link::LinkAddress;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

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
struct MessageOutput<'a> {
    schema_id: &'a str,
    link: String,
    interface: &'a str,
    size: usize,
    payload: String,
    timestamp: String,
}

pub fn print_message(address: &LinkAddress, message: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                schema_id: "https://schemas.3leaps.dev/busprims/cli/v1/link-message.schema.json",
                link: address.to_string(),
                interface: address.interface().as_str(),
                size: message.len(),
                payload: payload_preview(message),
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["LINK", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    address.to_string(),
                    message.len().to_string(),
                    payload_preview(message),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "link={} ({}) size={} payload={}",
                address,
                address.interface(),
                message.len(),
                payload_preview(message)
            );
        }
        OutputFormat::Raw => {
            print_raw(message);
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

/// Printable form of a message. Line terminators are escaped so one message
/// stays on one output line.
fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.escape_debug().to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_escapes_terminators() {
        assert_eq!(payload_preview(b"READY\r\n"), "READY\\r\\n");
        assert_eq!(payload_preview(&[0xff, 0xfe]), "<binary 2 bytes>");
    }
}
