use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use msgprims_core::Message;
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

/// What `call` reports about one completed invocation.
#[derive(Debug, Serialize)]
pub struct CallOutput<'a> {
    pub service: &'a str,
    pub object_id: &'a str,
    pub method: &'a str,
    pub result: &'a serde_json::Value,
    pub blobs: Vec<usize>,
    pub elapsed_ms: u128,
    pub timestamp: String,
}

impl<'a> CallOutput<'a> {
    pub fn new(
        service: &'a str,
        object_id: &'a str,
        method: &'a str,
        reply: &'a Message,
        elapsed_ms: u128,
    ) -> Self {
        Self {
            service,
            object_id,
            method,
            result: &reply.text,
            blobs: reply.blobs.iter().map(|blob| blob.len()).collect(),
            elapsed_ms,
            timestamp: now_unix_seconds(),
        }
    }
}

pub fn print_call(out: &CallOutput<'_>, reply: &Message, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SERVICE", "METHOD", "ELAPSED", "BLOBS", "RESULT"])
                .add_row(vec![
                    out.service.to_string(),
                    out.method.to_string(),
                    format!("{}ms", out.elapsed_ms),
                    out.blobs.len().to_string(),
                    out.result.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "service={} object={} method={} elapsed={}ms blobs={:?} result={}",
                out.service, out.object_id, out.method, out.elapsed_ms, out.blobs, out.result
            );
        }
        OutputFormat::Raw => {
            if reply.blobs.is_empty() {
                print_raw(out.result.to_string().as_bytes());
            } else {
                for blob in &reply.blobs {
                    print_raw(blob);
                }
            }
        }
    }
}

/// Announce a bound listener.
pub fn print_listening(path: &str, services: &[String], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = serde_json::json!({
                "event": "listening",
                "path": path,
                "services": services,
                "timestamp": now_unix_seconds(),
            });
            println!("{out}");
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_header(vec!["SOCKET", "SERVICES"])
                .add_row(vec![path.to_string(), services.join(", ")]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("listening path={path} services={}", services.join(","));
        }
        OutputFormat::Raw => {}
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn call_output_reports_blob_sizes() {
        let reply = Message::with_blobs(json!({"ok": true}), [vec![1u8, 2, 3], vec![]]);
        let out = CallOutput::new("echo", "id-1", "echo", &reply, 7);
        assert_eq!(out.blobs, [3, 0]);

        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(value["result"], json!({"ok": true}));
        assert_eq!(value["elapsed_ms"], json!(7));
        assert_eq!(value["object_id"], json!("id-1"));
    }
}
