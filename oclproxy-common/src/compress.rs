// Compression Pipeline (spec.md §4.2; original_source/src/common/dataPack.c).
//
// The original conditionally compiles against zlib/lzo/lzma/bzip2/lz4 or a
// no-op passthrough, selected at build time; both peers must agree on the
// same implementation. oclproxy keeps that "compile-time, identical on both
// peers" contract via a Cargo feature rather than a runtime handshake.

/// A bulk-data packer/unpacker. Implementations carry no framing of their
/// own — compressed lengths travel as explicit Wire Codec sizes.
pub trait Compressor: Send + Sync {
    fn pack(&self, input: &[u8]) -> Vec<u8>;

    /// Inflate `input` into a buffer of exactly `expected_len` bytes.
    fn unpack(&self, input: &[u8], expected_len: usize) -> Vec<u8>;
}

/// No-op passthrough; the default, always-available implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl Compressor for Identity {
    fn pack(&self, input: &[u8]) -> Vec<u8> {
        input.to_vec()
    }

    fn unpack(&self, input: &[u8], expected_len: usize) -> Vec<u8> {
        let mut out = input.to_vec();
        out.resize(expected_len, 0);
        out
    }
}

#[cfg(feature = "deflate")]
#[derive(Debug, Default, Clone, Copy)]
pub struct Deflate;

#[cfg(feature = "deflate")]
impl Compressor for Deflate {
    fn pack(&self, input: &[u8]) -> Vec<u8> {
        use flate2::write::DeflateEncoder;
        use flate2::Compression;
        use std::io::Write;
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        // An in-memory Vec writer cannot fail; this pipeline has no
        // framing of its own to recover to, so an I/O failure here truly is
        // unreachable rather than merely unlikely.
        encoder.write_all(input).expect("in-memory encoder write");
        encoder.finish().expect("in-memory encoder finish")
    }

    fn unpack(&self, input: &[u8], expected_len: usize) -> Vec<u8> {
        use flate2::read::DeflateDecoder;
        use std::io::Read;
        let mut decoder = DeflateDecoder::new(input);
        let mut out = Vec::with_capacity(expected_len);
        decoder
            .read_to_end(&mut out)
            .expect("in-memory decoder read");
        out
    }
}
