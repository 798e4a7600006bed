use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use layoutbridge::frame::Response;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
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

#[derive(Serialize, Debug, PartialEq, Eq)]
#[serde(tag = "response", rename_all = "snake_case")]
enum ResponseOutput {
    LayoutChanged {
        opcode: i32,
        layout_handle: i32,
        timestamp: String,
    },
    Error {
        opcode: i32,
        code: i32,
        message: String,
        timestamp: String,
    },
}

impl ResponseOutput {
    fn from_response(response: &Response) -> Self {
        let timestamp = now_unix_seconds();
        match response {
            Response::LayoutChanged { layout_handle } => ResponseOutput::LayoutChanged {
                opcode: response.opcode(),
                layout_handle: *layout_handle,
                timestamp,
            },
            Response::Error { code, message } => ResponseOutput::Error {
                opcode: response.opcode(),
                code: *code,
                message: message_text(message),
                timestamp,
            },
        }
    }
}

pub fn print_response(response: &Response, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ResponseOutput::from_response(response);
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
                .set_header(vec!["RESPONSE", "OPCODE", "VALUE", "MESSAGE"]);
            table.add_row(row(response));
            println!("{table}");
        }
        OutputFormat::Pretty => match response {
            Response::LayoutChanged { layout_handle } => {
                println!("layout changed: handle={layout_handle:#06x}");
            }
            Response::Error { code, message } => {
                println!("error {code:#x}: {}", message_text(message));
            }
        },
    }
}

fn row(response: &Response) -> Vec<String> {
    match response {
        Response::LayoutChanged { layout_handle } => vec![
            "LAYOUT_CHANGED".to_string(),
            response.opcode().to_string(),
            format!("{layout_handle:#06x}"),
            String::new(),
        ],
        Response::Error { code, message } => vec![
            "ERROR".to_string(),
            response.opcode().to_string(),
            code.to_string(),
            message_text(message),
        ],
    }
}

fn message_text(message: &[u8]) -> String {
    match std::str::from_utf8(message) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", message.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
