use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::handler::TaskHandler;
use crate::handlers::{parse_payload, FILE_CHUNK};

/// Largest chunk a single task may read.
const MAX_CHUNK_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct FileChunkRequest {
    path: PathBuf,
    #[serde(default)]
    offset: u64,
    /// Reads to the end of file (capped at `MAX_CHUNK_LEN`) when absent
    length: Option<u64>,
}

#[derive(Debug, Serialize, PartialEq)]
struct FileChunkSummary {
    path: PathBuf,
    offset: u64,
    bytes_read: u64,
    lines: u64,
    words: u64,
    /// Adler-32 of the chunk
    checksum: u32,
}

/// Reads a byte range of a file and summarizes it.
pub struct FileChunkHandler;

impl TaskHandler for FileChunkHandler {
    fn handle(&self, payload: Value) -> anyhow::Result<Value> {
        let request: FileChunkRequest = parse_payload(FILE_CHUNK, payload)?;

        let mut file = File::open(&request.path)
            .with_context(|| format!("Failed to open {}", request.path.display()))?;
        file.seek(SeekFrom::Start(request.offset))?;

        let limit = request.length.unwrap_or(MAX_CHUNK_LEN).min(MAX_CHUNK_LEN);
        let mut buf = Vec::new();
        file.take(limit).read_to_end(&mut buf)?;

        let text = String::from_utf8_lossy(&buf);
        let summary = FileChunkSummary {
            path: request.path,
            offset: request.offset,
            bytes_read: buf.len() as u64,
            lines: bytecount_lines(&buf),
            words: text.split_whitespace().count() as u64,
            checksum: adler32(&buf),
        };

        Ok(serde_json::to_value(summary)?)
    }
}

fn bytecount_lines(buf: &[u8]) -> u64 {
    let newlines = buf.iter().filter(|&&b| b == b'\n').count() as u64;
    match buf.last() {
        Some(b'\n') | None => newlines,
        Some(_) => newlines + 1,
    }
}

fn adler32(buf: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    let (mut a, mut b) = (1u32, 0u32);
    for chunk in buf.chunks(5552) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}
