//! Little-endian primitive codec with sticky errors.
//!
//! Command payloads are marshalled field by field. To keep that code
//! straight-line, [`Encoder`] and [`Decoder`] accumulate the first error
//! and turn every later primitive into a no-op; callers check once with
//! [`Encoder::finish`]/[`Decoder::finish`] at the end.
//!
//! Strings are u64-length-prefixed UTF-8.

use std::io::{Read, Write};

use daq_core::error::DaqError;

use crate::frame::MAX_FRAME_LEN;

macro_rules! write_primitive {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self, v: $ty) {
            self.write_raw(&v.to_le_bytes());
        }
    };
}

macro_rules! read_primitive {
    ($name:ident, $ty:ty, $len:expr) => {
        pub fn $name(&mut self) -> $ty {
            let mut buf = [0u8; $len];
            self.read_raw(&mut buf);
            <$ty>::from_le_bytes(buf)
        }
    };
}

/// Sticky-error writer over any `io::Write` sink.
pub struct Encoder<W: Write> {
    w: W,
    err: Option<DaqError>,
}

impl<W: Write> Encoder<W> {
    pub fn new(w: W) -> Self {
        Self { w, err: None }
    }

    write_primitive!(write_u8, u8);
    write_primitive!(write_u16, u16);
    write_primitive!(write_u32, u32);
    write_primitive!(write_u64, u64);
    write_primitive!(write_i8, i8);
    write_primitive!(write_i16, i16);
    write_primitive!(write_i32, i32);
    write_primitive!(write_i64, i64);
    write_primitive!(write_f32, f32);
    write_primitive!(write_f64, f64);

    pub fn write_str(&mut self, s: &str) {
        self.write_u64(s.len() as u64);
        self.write_raw(s.as_bytes());
    }

    fn write_raw(&mut self, bytes: &[u8]) {
        if self.err.is_some() {
            return;
        }
        if let Err(e) = self.w.write_all(bytes) {
            self.err = Some(e.into());
        }
    }

    /// Surfaces the first error, if any.
    pub fn finish(self) -> Result<(), DaqError> {
        match self.err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Sticky-error reader over any `io::Read` source. After the first
/// failure, every read returns the zero value of its type.
pub struct Decoder<R: Read> {
    r: R,
    err: Option<DaqError>,
}

impl<R: Read> Decoder<R> {
    pub fn new(r: R) -> Self {
        Self { r, err: None }
    }

    read_primitive!(read_u8, u8, 1);
    read_primitive!(read_u16, u16, 2);
    read_primitive!(read_u32, u32, 4);
    read_primitive!(read_u64, u64, 8);
    read_primitive!(read_i8, i8, 1);
    read_primitive!(read_i16, i16, 2);
    read_primitive!(read_i32, i32, 4);
    read_primitive!(read_i64, i64, 8);
    read_primitive!(read_f32, f32, 4);
    read_primitive!(read_f64, f64, 8);

    pub fn read_str(&mut self) -> String {
        let n = self.read_u64();
        if self.err.is_some() {
            return String::new();
        }
        if n > MAX_FRAME_LEN {
            self.fail(DaqError::Protocol(format!(
                "string length {n} exceeds maximum {MAX_FRAME_LEN}"
            )));
            return String::new();
        }
        let mut buf = vec![0u8; n as usize];
        self.read_raw(&mut buf);
        if self.err.is_some() {
            return String::new();
        }
        match String::from_utf8(buf) {
            Ok(s) => s,
            Err(_) => {
                self.fail(DaqError::Protocol("invalid utf-8 in string".into()));
                String::new()
            }
        }
    }

    fn read_raw(&mut self, buf: &mut [u8]) {
        if self.err.is_some() {
            buf.fill(0);
            return;
        }
        if let Err(e) = self.r.read_exact(buf) {
            self.err = Some(e.into());
            buf.fill(0);
        }
    }

    /// Records an error from layered decoding logic (list bounds etc.).
    pub fn fail(&mut self, err: DaqError) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    /// Surfaces the first error, if any.
    pub fn finish(self) -> Result<(), DaqError> {
        match self.err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
