use std::fmt;

use crate::{
    error::GraniteError,
    io::{Decodeable, Encodeable, GraniteReader},
};

/// Identifies one B+ tree file: a table's clustering tree or a
/// secondary index tree. Assigned by the catalog.
pub type FileId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageCategory {
    Header,
    Internal,
    Leaf,
}

impl PageCategory {
    pub fn tag(&self) -> u8 {
        match self {
            PageCategory::Header => 0,
            PageCategory::Internal => 1,
            PageCategory::Leaf => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, GraniteError> {
        match tag {
            0 => Ok(PageCategory::Header),
            1 => Ok(PageCategory::Internal),
            2 => Ok(PageCategory::Leaf),
            _ => Err(GraniteError::storage(&format!(
                "invalid page category tag: {}",
                tag
            ))),
        }
    }
}

impl fmt::Display for PageCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PageCategory::Header => "header",
            PageCategory::Internal => "internal",
            PageCategory::Leaf => "leaf",
        };
        write!(f, "{}", name)
    }
}

/// Address of a page: which tree file it belongs to, its index inside
/// the file, and what kind of node lives there. Sibling and child
/// references are stored as page ids (integer handles), never as
/// direct references; all navigation goes through the buffer pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub category: PageCategory,
    pub file_id: FileId,
    pub page_index: u32,
}

impl PageId {
    pub fn new(category: PageCategory, file_id: FileId, page_index: u32) -> Self {
        Self {
            category,
            file_id,
            page_index,
        }
    }

    pub fn header_of(file_id: FileId) -> Self {
        Self::new(PageCategory::Header, file_id, 0)
    }

    /// Byte offset of this page inside its file.
    pub fn offset(&self, page_size: usize) -> u64 {
        self.page_index as u64 * page_size as u64
    }

    pub fn get_short_repr(&self) -> String {
        format!("{}_{}_{}", self.file_id, self.category, self.page_index)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "pid(file: {}, category: {}, index: {})",
            self.file_id, self.category, self.page_index
        )
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Encodeable for PageId {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.category.tag()];
        buf.extend_from_slice(&self.file_id.to_le_bytes());
        buf.extend_from_slice(&self.page_index.to_le_bytes());
        buf
    }
}

impl Decodeable for PageId {
    fn decode_from(reader: &mut GraniteReader) -> Result<Self, GraniteError> {
        let category = PageCategory::from_tag(u8::decode_from(reader)?)?;
        let file_id = u32::decode_from(reader)?;
        let page_index = u32::decode_from(reader)?;
        Ok(PageId::new(category, file_id, page_index))
    }
}
