//! Raw stream writer: frame payloads appended to one file.
//!
//! MJPEG sources produce a plain `.mjpeg` stream this way; raw layouts can be
//! read back with the geometry from [`StreamMode`].

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::capture::StreamMode;
use crate::error::RecordError;
use crate::record::{Encoder, EncoderFactory};
use crate::Frame;

pub struct RawFileEncoderFactory;

impl EncoderFactory for RawFileEncoderFactory {
    fn extension(&self) -> &str {
        "raw"
    }

    fn open(&self, destination: &Path, _mode: &StreamMode) -> Result<Box<dyn Encoder>, RecordError> {
        let file = File::create(destination).map_err(|e| RecordError::SinkUnavailable {
            destination: destination.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(RawFileEncoder {
            out: BufWriter::new(file),
        }))
    }
}

pub struct RawFileEncoder {
    out: BufWriter<File>,
}

impl Encoder for RawFileEncoder {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.out.write_all(&frame.data)
    }

    fn finish(self: Box<Self>) -> io::Result<()> {
        let file = self.out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}
