use std::io::{Read, Write};

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::handler::TaskHandler;
use crate::handlers::{parse_payload, COMPRESS, DECOMPRESS};

const ENCODING: &str = "deflate+base64";

#[derive(Debug, Deserialize)]
struct CompressRequest {
    data: String,
}

#[derive(Debug, Serialize)]
struct CompressResponse {
    encoding: &'static str,
    data: String,
    original_size: usize,
    compressed_size: usize,
}

/// Deflates the UTF-8 bytes of `data` and returns them base64 encoded.
pub struct CompressHandler;

impl TaskHandler for CompressHandler {
    fn handle(&self, payload: Value) -> anyhow::Result<Value> {
        let request: CompressRequest = parse_payload(COMPRESS, payload)?;

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(request.data.as_bytes())?;
        let deflated = encoder.finish().context("Failed to deflate data")?;

        let response = CompressResponse {
            encoding: ENCODING,
            original_size: request.data.len(),
            compressed_size: deflated.len(),
            data: STANDARD.encode(&deflated),
        };
        Ok(serde_json::to_value(response)?)
    }
}

#[derive(Debug, Deserialize)]
struct DecompressRequest {
    data: String,
}

pub struct DecompressHandler;

impl TaskHandler for DecompressHandler {
    fn handle(&self, payload: Value) -> anyhow::Result<Value> {
        let request: DecompressRequest = parse_payload(DECOMPRESS, payload)?;
        let deflated = STANDARD
            .decode(request.data.as_bytes())
            .context("Data is not valid base64")?;

        let mut inflated = Vec::new();
        DeflateDecoder::new(deflated.as_slice())
            .read_to_end(&mut inflated)
            .context("Data is not a valid deflate stream")?;
        let data = String::from_utf8(inflated).context("Decompressed data is not UTF-8")?;
        Ok(json!({ "data": data }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn training_log() -> String {
        (1..=50)
            .map(|epoch| {
                format!(
                    "epoch={epoch} loss={:.4} lr=2e-4 adapter=lora rank=16\n",
                    1.0 / epoch as f64
                )
            })
            .collect()
    }

    #[test]
    fn test_compress_shrinks_text() -> anyhow::Result<()> {
        let original = training_log();
        let compressed = CompressHandler.handle(json!({ "data": original }))?;
        assert_eq!(compressed["encoding"], json!(ENCODING));
        assert_eq!(compressed["original_size"], json!(original.len()));

        let compressed_size = compressed["compressed_size"].as_u64().unwrap() as usize;
        assert!(compressed_size < original.len() / 2);
        Ok(())
    }

    #[test]
    fn test_compress_then_decompress() -> anyhow::Result<()> {
        for original in ["", "epoch=1 loss=0.7134 lr=2e-4", "ünïcödé ✓"] {
            let compressed = CompressHandler.handle(json!({ "data": original }))?;
            let restored = DecompressHandler.handle(json!({ "data": compressed["data"] }))?;
            assert_eq!(restored, json!({ "data": original }));
        }
        Ok(())
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(DecompressHandler.handle(json!({"data": "***"})).is_err());
        // 0xFF starts a block with the reserved block type
        assert!(DecompressHandler.handle(json!({"data": "////"})).is_err());
    }
}
