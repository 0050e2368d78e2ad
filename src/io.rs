use std::{
    convert::TryInto,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    mem::size_of,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use bit_vec::BitVec;

use crate::{error::GraniteError, types::GraniteResult};

/// A cursor over an in-memory byte buffer, used to decode pages and
/// log records.
pub struct GraniteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> GraniteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_exact(&mut self, bytes_count: usize) -> Result<&'a [u8], GraniteError> {
        if self.pos + bytes_count > self.buf.len() {
            return Err(GraniteError::storage(&format!(
                "unexpected end of buffer, want {} bytes, {} left",
                bytes_count,
                self.remaining()
            )));
        }

        let slice = &self.buf[self.pos..self.pos + bytes_count];
        self.pos += bytes_count;
        Ok(slice)
    }

    pub fn read<T: Decodeable>(&mut self) -> Result<T, GraniteError> {
        T::decode_from(self)
    }
}

/// An append-only byte buffer, used to encode pages and log records.
pub struct GraniteWriter {
    buf: Vec<u8>,
}

impl GraniteWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) {
        self.buf.extend_from_slice(obj.encode().as_slice());
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.buf.clone()
    }

    /// Return the buffer padded with zeroes up to `size`. The caller
    /// guarantees the content fits.
    pub fn to_padded_bytes(&self, size: usize) -> Result<Vec<u8>, GraniteError> {
        let mut buf = self.buf.clone();

        if buf.len() > size {
            return Err(GraniteError::internal(&format!(
                "buffer size is larger than the given size: {} > {}",
                buf.len(),
                size
            )));
        }

        buf.resize(size, 0);
        Ok(buf)
    }
}

pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decodeable: Sized {
    fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError>;
}

/// # Format
///
/// - 1 byte (0 for false, 1 for true)
impl Encodeable for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl Decodeable for bool {
    fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError> {
        Ok(u8::decode_from(reader)? == 1)
    }
}

/// # Format
///
/// - 2 bytes: string size in bytes
/// - n bytes: utf-8 payload
impl Encodeable for String {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let len = self.len() as u16;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(self.as_bytes());
        buf
    }
}

impl Decodeable for String {
    fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError> {
        let size = u16::decode_from(reader)?;
        let bytes = reader.read_exact(size as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| GraniteError::storage(&format!("invalid utf-8: {}", e)))
    }
}

/// # Format
///
/// - 4 bytes: payload size
/// - n bytes: payload
impl Encodeable for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let len = self.len() as u32;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(self);
        buf
    }
}

impl Decodeable for Vec<u8> {
    fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError> {
        let size = u32::decode_from(reader)?;
        Ok(reader.read_exact(size as usize)?.to_vec())
    }
}

/// # Format
///
/// - 2 bytes: bytes size
/// - n bytes: bit vector
impl Encodeable for BitVec {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        let payload = self.to_bytes();
        let len = payload.len() as u16;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);

        buf
    }
}

impl Decodeable for BitVec {
    fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError> {
        let size = u16::decode_from(reader)?;
        let buf = reader.read_exact(size as usize)?;
        Ok(BitVec::from_bytes(buf))
    }
}

macro_rules! impl_serialization {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }

            impl Decodeable for $t {
                fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError> {
                    let bytes = reader.read_exact(size_of::<Self>())?;
                    Ok(Self::from_le_bytes(bytes.try_into().unwrap()))
                }
            }
        )*
    }
}

impl_serialization!(for u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, isize, usize, f32, f64);

/// A shared handle to an on-disk file. All positioned reads and writes
/// go through the inner mutex, so a single handle can serve concurrent
/// page reads.
pub struct GraniteFile {
    file: Mutex<File>,
    path: PathBuf,
}

impl GraniteFile {
    pub fn create<P: AsRef<Path>>(file_path: P) -> Result<Self, GraniteError> {
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .open(&file_path)?;

        Ok(Self {
            file: Mutex::new(file),
            path: file_path.as_ref().to_path_buf(),
        })
    }

    pub fn get_path(&self) -> &Path {
        &self.path
    }

    fn get_file(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap()
    }

    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, GraniteError> {
        let mut file = self.get_file();
        file.seek(SeekFrom::Start(offset))?;

        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> GraniteResult {
        let mut file = self.get_file();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Append at the end of the file, return the offset the payload
    /// starts at.
    pub fn append(&self, bytes: &[u8]) -> Result<u64, GraniteError> {
        let mut file = self.get_file();
        let offset = file.seek(SeekFrom::End(0))?;
        file.write_all(bytes)?;
        Ok(offset)
    }

    pub fn get_size(&self) -> Result<u64, GraniteError> {
        let file = self.get_file();
        let metadata = file.metadata()?;
        Ok(metadata.len())
    }

    pub fn set_len(&self, len: u64) -> GraniteResult {
        self.get_file().set_len(len)?;
        Ok(())
    }

    /// Force file content down to the disk.
    pub fn sync(&self) -> GraniteResult {
        self.get_file().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_primitives() {
        let mut writer = GraniteWriter::new();
        writer.write(&42u64);
        writer.write(&(-7i64));
        writer.write(&true);
        writer.write(&"hello".to_string());

        let bytes = writer.to_bytes();
        let mut reader = GraniteReader::new(&bytes);
        assert_eq!(reader.read::<u64>().unwrap(), 42);
        assert_eq!(reader.read::<i64>().unwrap(), -7);
        assert_eq!(reader.read::<bool>().unwrap(), true);
        assert_eq!(reader.read::<String>().unwrap(), "hello");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_reader_underflow() {
        let bytes = vec![1u8, 2];
        let mut reader = GraniteReader::new(&bytes);
        assert!(reader.read::<u64>().is_err());
    }
}
