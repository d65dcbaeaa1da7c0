//! Purpose: Streaming compression seam between the ring and the bytes that reach disk.
//! Exports: `Codec`, `ZstdCodec`, `PlainCodec`, `CountingFile`.
//! Role: Lets `ring` stay agnostic of the compression format; one encoder per rotation file.
//! Invariants: An encoder is bound to exactly one file and is finalized before that file is released.
//! Invariants: `suffix()` is constant for a codec value; it names every file the codec produces.
use std::fs::File;
use std::io::{self, Write};

use crate::core::error::{Error, ErrorKind};

pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// A streaming encoder factory. Each rotation binds a fresh encoder to the
/// newly opened file; `finish` closes the container and hands the file back.
pub trait Codec: Send + Sync {
    type Encoder: Write + Send;

    fn suffix(&self) -> &str;
    fn encoder(&self, sink: CountingFile) -> Result<Self::Encoder, Error>;
    fn sink<'a>(&self, encoder: &'a Self::Encoder) -> &'a CountingFile;
    fn finish(&self, encoder: Self::Encoder) -> Result<CountingFile, Error>;
}

/// `File` wrapper that tallies the bytes handed to the OS.
#[derive(Debug)]
pub struct CountingFile {
    file: File,
    written: u64,
}

impl CountingFile {
    pub fn new(file: File) -> Self {
        Self { file, written: 0 }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> File {
        self.file
    }
}

impl Write for CountingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    pub fn level(&self) -> i32 {
        self.level
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self::new(DEFAULT_ZSTD_LEVEL)
    }
}

impl Codec for ZstdCodec {
    type Encoder = zstd::stream::write::Encoder<'static, CountingFile>;

    fn suffix(&self) -> &str {
        "zstd"
    }

    fn encoder(&self, sink: CountingFile) -> Result<Self::Encoder, Error> {
        zstd::stream::write::Encoder::new(sink, self.level)
            .map_err(|err| compression_error("could not create zstd encoder", err))
    }

    fn sink<'a>(&self, encoder: &'a Self::Encoder) -> &'a CountingFile {
        encoder.get_ref()
    }

    fn finish(&self, encoder: Self::Encoder) -> Result<CountingFile, Error> {
        encoder
            .finish()
            .map_err(|err| compression_error("could not finish zstd frame", err))
    }
}

/// Identity codec: bytes land on disk as written, under the `log` suffix.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PlainCodec;

impl Codec for PlainCodec {
    type Encoder = CountingFile;

    fn suffix(&self) -> &str {
        "log"
    }

    fn encoder(&self, sink: CountingFile) -> Result<Self::Encoder, Error> {
        Ok(sink)
    }

    fn sink<'a>(&self, encoder: &'a Self::Encoder) -> &'a CountingFile {
        encoder
    }

    fn finish(&self, mut encoder: Self::Encoder) -> Result<CountingFile, Error> {
        encoder.flush().map_err(Error::io)?;
        Ok(encoder)
    }
}

fn compression_error(message: &str, err: io::Error) -> Error {
    Error::new(ErrorKind::Compression)
        .with_message(message)
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::{Codec, CountingFile, PlainCodec, ZstdCodec};
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn zstd_output_decodes_to_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.01.zstd");
        let codec = ZstdCodec::default();
        let file = File::create(&path).expect("create");

        let mut encoder = codec.encoder(CountingFile::new(file)).expect("encoder");
        encoder.write_all(b"hello ring\n").expect("write");
        encoder.write_all(b"second line\n").expect("write");
        let sink = codec.finish(encoder).expect("finish");

        let on_disk = std::fs::read(&path).expect("read");
        assert_eq!(sink.written(), on_disk.len() as u64);
        let decoded = zstd::stream::decode_all(on_disk.as_slice()).expect("decode");
        assert_eq!(decoded, b"hello ring\nsecond line\n");
    }

    #[test]
    fn plain_codec_passes_bytes_through() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.01.log");
        let codec = PlainCodec;
        let file = File::create(&path).expect("create");

        let mut encoder = codec.encoder(CountingFile::new(file)).expect("encoder");
        encoder.write_all(b"abc").expect("write");
        assert_eq!(codec.sink(&encoder).written(), 3);
        codec.finish(encoder).expect("finish");

        assert_eq!(std::fs::read(&path).expect("read"), b"abc");
    }

    #[test]
    fn suffixes_name_the_format() {
        assert_eq!(ZstdCodec::default().suffix(), "zstd");
        assert_eq!(PlainCodec.suffix(), "log");
    }
}
