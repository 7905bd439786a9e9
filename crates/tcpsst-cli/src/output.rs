use std::io::IsTerminal;

use clap::ValueEnum;

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    /// Text on a terminal, JSON when piped.
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            OutputFormat::Text
        } else {
            OutputFormat::Json
        }
    }
}

/// Print one received frame to stdout.
pub fn print_frame(stream: u64, payload: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Text => {
            println!(
                "stream={} len={} payload={:?}",
                stream,
                payload.len(),
                String::from_utf8_lossy(payload)
            );
        }
        OutputFormat::Json => {
            let value = serde_json::json!({
                "stream": stream,
                "len": payload.len(),
                "payload": String::from_utf8_lossy(payload),
            });
            println!("{value}");
        }
    }
}
