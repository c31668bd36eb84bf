// src/codec.rs
//
// Content-type keyed codec registry. Built once, then shared read-only
// between publishers and consumer bindings; a message's content type picks
// the single codec used for both encode and decode.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::errors::{BoxError, Error, Result};

pub const APPLICATION_JSON: &str = "application/json";

pub type EncodeFn = Arc<dyn Fn(&Value) -> std::result::Result<Vec<u8>, BoxError> + Send + Sync>;
pub type DecodeFn = Arc<dyn Fn(&[u8]) -> std::result::Result<Value, BoxError> + Send + Sync>;

/// One registered encode/decode pair.
#[derive(Clone)]
pub struct CodecEntry {
    content_type: String,
    encode: EncodeFn,
    decode: DecodeFn,
}

impl CodecEntry {
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        (self.encode)(value).map_err(|source| Error::Encoding {
            content_type: self.content_type.clone(),
            source,
        })
    }

    pub fn decode(&self, body: &[u8]) -> Result<Value> {
        (self.decode)(body).map_err(|source| Error::Decoding {
            content_type: self.content_type.clone(),
            source,
        })
    }
}

pub struct CodecRegistryBuilder {
    entries: HashMap<String, CodecEntry>,
    default: Option<String>,
    strict: bool,
}

impl CodecRegistryBuilder {
    /// Starts with `application/json` pre-registered.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(APPLICATION_JSON.to_string(), json_entry());
        CodecRegistryBuilder {
            entries,
            default: None,
            strict: false,
        }
    }

    /// In strict mode, re-registering an existing content type fails
    /// instead of overwriting.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn register(
        mut self,
        content_type: impl Into<String>,
        encode: EncodeFn,
        decode: DecodeFn,
    ) -> Result<Self> {
        let content_type = content_type.into();
        if self.strict && self.entries.contains_key(&content_type) {
            return Err(Error::DuplicateCodec(content_type));
        }
        self.entries.insert(
            content_type.clone(),
            CodecEntry {
                content_type,
                encode,
                decode,
            },
        );
        Ok(self)
    }

    /// Designates the entry returned when no content type is given.
    pub fn default_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.default = Some(content_type.into());
        self
    }

    pub fn build(self) -> Result<CodecRegistry> {
        if let Some(default) = &self.default {
            if !self.entries.contains_key(default) {
                return Err(Error::UnknownCodec(default.clone()));
            }
        }
        Ok(CodecRegistry {
            entries: self.entries,
            default: self.default,
        })
    }
}

impl std::fmt::Debug for CodecRegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistryBuilder")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .field("default", &self.default)
            .field("strict", &self.strict)
            .finish()
    }
}

impl Default for CodecRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .field("default", &self.default)
            .finish()
    }
}

/// Immutable after construction; safe to share without locking.
pub struct CodecRegistry {
    entries: HashMap<String, CodecEntry>,
    default: Option<String>,
}

impl CodecRegistry {
    /// JSON-only registry with `application/json` as the default entry.
    pub fn json() -> CodecRegistry {
        CodecRegistryBuilder::new()
            .default_content_type(APPLICATION_JSON)
            .build()
            .expect("builtin json codec is always registered")
    }

    pub fn resolve(&self, content_type: Option<&str>) -> Result<&CodecEntry> {
        match content_type {
            Some(ct) => self
                .entries
                .get(ct)
                .ok_or_else(|| Error::UnknownCodec(ct.to_string())),
            None => {
                let default = self.default.as_deref().ok_or(Error::NoDefaultCodec)?;
                self.entries
                    .get(default)
                    .ok_or_else(|| Error::UnknownCodec(default.to_string()))
            }
        }
    }
}

fn json_entry() -> CodecEntry {
    CodecEntry {
        content_type: APPLICATION_JSON.to_string(),
        encode: Arc::new(|value| serde_json::to_vec(value).map_err(|e| e.into())),
        decode: Arc::new(|body| serde_json::from_slice(body).map_err(|e| e.into())),
    }
}
