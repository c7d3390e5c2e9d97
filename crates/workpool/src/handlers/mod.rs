//! Built-in task kinds. Each handler deserializes its payload into a typed
//! request, does its work synchronously and returns a JSON value.

mod compress;
mod data;
mod file;
mod parse;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::handler::{FnHandler, HandlerRegistry};

pub use compress::{CompressHandler, DecompressHandler};
pub use data::{AggregateHandler, FilterHandler, SortHandler};
pub use file::FileChunkHandler;
pub use parse::{ParseCsvHandler, ParseJsonHandler};

pub const ECHO: &str = "echo";
pub const FILE_CHUNK: &str = "file_chunk";
pub const PARSE_JSON: &str = "parse_json";
pub const PARSE_CSV: &str = "parse_csv";
pub const COMPRESS: &str = "compress";
pub const DECOMPRESS: &str = "decompress";
pub const AGGREGATE: &str = "aggregate";
pub const FILTER: &str = "filter";
pub const SORT: &str = "sort";

fn echo(payload: Value) -> anyhow::Result<Value> {
    Ok(payload)
}

pub(crate) fn register_builtin(registry: &mut HandlerRegistry) {
    registry
        .register(ECHO, FnHandler::new(echo))
        .register(FILE_CHUNK, FileChunkHandler)
        .register(PARSE_JSON, ParseJsonHandler)
        .register(PARSE_CSV, ParseCsvHandler)
        .register(COMPRESS, CompressHandler)
        .register(DECOMPRESS, DecompressHandler)
        .register(AGGREGATE, AggregateHandler)
        .register(FILTER, FilterHandler)
        .register(SORT, SortHandler);
}

pub(crate) fn parse_payload<T>(kind: &str, payload: Value) -> anyhow::Result<T>
where
    T: DeserializeOwned,
{
    serde_json::from_value(payload).with_context(|| format!("Malformed `{kind}` payload"))
}
