mod base_page;
mod internal_page;
mod leaf_page;

pub use base_page::{BasePage, BTreePage};
pub use internal_page::InternalPage;
pub use leaf_page::LeafPage;

use crate::{
    error::GraniteError,
    io::{Decodeable, Encodeable, GraniteReader},
    storage::Cell,
};

/// # Format of a key tuple
///
/// - 2 bytes: cell count
/// - n cells, each self-describing
pub fn encode_key(key: &[Cell]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
    for cell in key {
        buf.extend_from_slice(&cell.encode());
    }
    buf
}

pub fn decode_key(reader: &mut GraniteReader) -> Result<Vec<Cell>, GraniteError> {
    let count = u16::decode_from(reader)?;
    let mut key = Vec::with_capacity(count as usize);
    for _ in 0..count {
        key.push(Cell::decode_from(reader)?);
    }
    Ok(key)
}
