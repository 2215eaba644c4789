use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::roots::{Root, RootContext};

/// Built-in compression root: gzip on stash, gunzip on crack.
pub struct GzipRoot {
    sequence: i32,
    level: Compression,
}

impl GzipRoot {
    pub const DEFAULT_SEQUENCE: i32 = 100;

    #[must_use]
    pub fn new() -> Self {
        Self { sequence: Self::DEFAULT_SEQUENCE, level: Compression::default() }
    }

    #[must_use]
    pub fn with_sequence(sequence: i32) -> Self {
        Self { sequence, level: Compression::default() }
    }
}

impl Default for GzipRoot {
    fn default() -> Self {
        Self::new()
    }
}

impl Root for GzipRoot {
    fn name(&self) -> &str {
        "gzip"
    }

    fn sequence(&self) -> i32 {
        self.sequence
    }

    fn on_stash(
        &self,
        bytes: Vec<u8>,
        _ctx: &RootContext<'_>,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), self.level);
        encoder.write_all(&bytes)?;
        Ok(encoder.finish()?)
    }

    fn on_crack(
        &self,
        bytes: Vec<u8>,
        _ctx: &RootContext<'_>,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        let mut out = Vec::with_capacity(bytes.len() * 2);
        GzDecoder::new(bytes.as_slice()).read_to_end(&mut out)?;
        Ok(out)
    }
}
