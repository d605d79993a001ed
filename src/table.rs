//! `@UTF` table packing.
//!
//! A [`Page`] is an ordered set of named, typed values. Pages of the same
//! schema are packed together into one table blob; fields whose value is
//! identical on every page are stored once in the shared region, the rest
//! are stored per page in the unique region.
//!
//! ```text
//! "@UTF" | data_size | unique_ofs | string_ofs | bytes_ofs | name_ofs
//!        | key_count:u16 | unique_stride:u16 | page_count
//!        | shared region | unique region | string pool | byte pool
//! ```
//!
//! Offsets are relative to the byte following `data_size`. All integers
//! are big-endian; `F32` values are little-endian.

use crate::error::{Result, Stage, UsmError};
use encoding_rs::SHIFT_JIS;
use indexmap::IndexMap;

const TABLE_MAGIC: &[u8; 4] = b"@UTF";

/// Header bytes counted by `data_size` and the region offsets
const TABLE_HEADER_TAIL: usize = 24;

/// First entry of every string pool
const NULL_MARKER: &str = "<NULL>";

/// Storage class flags, added to the type tag
const STORAGE_SHARED: u8 = 1 << 5;
const STORAGE_PER_ROW: u8 = 2 << 5;

/// Type tag of a table element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ElementType {
    I8 = 0x10,
    U8 = 0x11,
    I16 = 0x12,
    U16 = 0x13,
    I32 = 0x14,
    U32 = 0x15,
    I64 = 0x16,
    U64 = 0x17,
    F32 = 0x18,
    String = 0x1A,
    Bytes = 0x1B,
}

/// A typed element value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn element_type(&self) -> ElementType {
        match self {
            Value::I8(_) => ElementType::I8,
            Value::U8(_) => ElementType::U8,
            Value::I16(_) => ElementType::I16,
            Value::U16(_) => ElementType::U16,
            Value::I32(_) => ElementType::I32,
            Value::U32(_) => ElementType::U32,
            Value::I64(_) => ElementType::I64,
            Value::U64(_) => ElementType::U64,
            Value::F32(_) => ElementType::F32,
            Value::String(_) => ElementType::String,
            Value::Bytes(_) => ElementType::Bytes,
        }
    }
}

/// A named page of elements, kept in insertion order
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    name: String,
    elements: IndexMap<String, Value>,
}

impl Page {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            elements: IndexMap::new(),
        }
    }

    /// Replace the value of `key`, or append it when the page lacks it.
    /// A replaced key keeps its original position.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.elements.insert(key.into(), value);
        self
    }

    /// Builder form of [`Page::set`]
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.elements.get(key)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.elements.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.elements.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Pack a set of same-schema pages into a table blob.
///
/// An empty set packs to an empty blob.
pub fn pack_pages(pages: &[Page]) -> Result<Vec<u8>> {
    let Some(first) = pages.first() else {
        return Ok(Vec::new());
    };
    check_schema(pages)?;

    let keys: Vec<&str> = first.keys().collect();

    let mut strings = Vec::new();
    push_cstr(&mut strings, NULL_MARKER.as_bytes());
    let page_name_offset = strings.len();
    push_cstr(&mut strings, first.name().as_bytes());

    let mut name_offsets = Vec::with_capacity(keys.len());
    for key in &keys {
        name_offsets.push(strings.len());
        push_cstr(&mut strings, key.as_bytes());
    }

    // A field is shared only when more than one page agrees on it
    let shared: Vec<bool> = keys
        .iter()
        .map(|key| {
            pages.len() > 1 && {
                let value = first.get(key);
                pages[1..].iter().all(|page| page.get(key) == value)
            }
        })
        .collect();

    let mut shared_region = Vec::new();
    let mut unique_region = Vec::new();
    let mut byte_pool = Vec::new();

    for (page_index, page) in pages.iter().enumerate() {
        for (key_index, key) in keys.iter().enumerate() {
            let value = page
                .get(key)
                .ok_or_else(|| UsmError::SchemaMismatch(format!("page {page_index} lacks {key}")))?;
            let tag = value.element_type() as u8;

            if shared[key_index] {
                if page_index != 0 {
                    continue;
                }
                shared_region.push(tag + STORAGE_SHARED);
                push_u32(&mut shared_region, name_offsets[key_index], "element name offset")?;
                pack_value(&mut shared_region, value, &mut strings, &mut byte_pool)?;
            } else {
                if page_index == 0 {
                    shared_region.push(tag + STORAGE_PER_ROW);
                    push_u32(&mut shared_region, name_offsets[key_index], "element name offset")?;
                }
                pack_value(&mut unique_region, value, &mut strings, &mut byte_pool)?;
            }
        }
    }

    let unique_offset = TABLE_HEADER_TAIL + shared_region.len();
    let string_offset = unique_offset + unique_region.len();
    let bytes_offset = string_offset + strings.len();
    let data_size = bytes_offset + byte_pool.len();
    let unique_stride = unique_region.len() / pages.len();

    let mut table = Vec::with_capacity(8 + data_size);
    table.extend_from_slice(TABLE_MAGIC);
    push_u32(&mut table, data_size, "table size")?;
    push_u32(&mut table, unique_offset, "unique region offset")?;
    push_u32(&mut table, string_offset, "string pool offset")?;
    push_u32(&mut table, bytes_offset, "byte pool offset")?;
    push_u32(&mut table, page_name_offset, "page name offset")?;
    push_u16(&mut table, keys.len(), "element count")?;
    push_u16(&mut table, unique_stride, "unique stride")?;
    push_u32(&mut table, pages.len(), "page count")?;
    table.extend_from_slice(&shared_region);
    table.extend_from_slice(&unique_region);
    table.extend_from_slice(&strings);
    table.extend_from_slice(&byte_pool);
    Ok(table)
}

/// Every page must share the first page's name and key order
fn check_schema(pages: &[Page]) -> Result<()> {
    let first = &pages[0];
    for (index, page) in pages.iter().enumerate().skip(1) {
        if page.name() != first.name() {
            return Err(UsmError::SchemaMismatch(format!(
                "page {index} is {} but the set is {}",
                page.name(),
                first.name()
            )));
        }
        if page.len() != first.len() || !page.keys().eq(first.keys()) {
            return Err(UsmError::SchemaMismatch(format!(
                "page {index} of {} has a different field layout",
                first.name()
            )));
        }
        if let Some(((name, _), _)) = page
            .iter()
            .zip(first.iter())
            .find(|((_, a), (_, b))| a.element_type() != b.element_type())
        {
            return Err(UsmError::SchemaMismatch(format!(
                "page {index} of {} stores {} with a different type",
                first.name(),
                name
            )));
        }
    }
    Ok(())
}

fn pack_value(
    target: &mut Vec<u8>,
    value: &Value,
    strings: &mut Vec<u8>,
    byte_pool: &mut Vec<u8>,
) -> Result<()> {
    match value {
        Value::I8(v) => target.extend_from_slice(&v.to_be_bytes()),
        Value::U8(v) => target.push(*v),
        Value::I16(v) => target.extend_from_slice(&v.to_be_bytes()),
        Value::U16(v) => target.extend_from_slice(&v.to_be_bytes()),
        Value::I32(v) => target.extend_from_slice(&v.to_be_bytes()),
        Value::U32(v) => target.extend_from_slice(&v.to_be_bytes()),
        Value::I64(v) => target.extend_from_slice(&v.to_be_bytes()),
        Value::U64(v) => target.extend_from_slice(&v.to_be_bytes()),
        // Readers expect floats little-endian, unlike every integer
        Value::F32(v) => target.extend_from_slice(&v.to_le_bytes()),
        Value::String(s) => {
            let offset = strings.len();
            let (encoded, _, _) = SHIFT_JIS.encode(s);
            push_cstr(strings, &encoded);
            push_u32(target, offset, "string value offset")?;
        }
        Value::Bytes(bytes) => {
            let start = byte_pool.len();
            let end = start + bytes.len();
            push_u32(target, start, "byte value offset")?;
            push_u32(target, end, "byte value end")?;
            byte_pool.extend_from_slice(bytes);
        }
    }
    Ok(())
}

fn push_cstr(pool: &mut Vec<u8>, bytes: &[u8]) {
    pool.extend_from_slice(bytes);
    pool.push(0);
}

fn push_u32(target: &mut Vec<u8>, value: usize, field: &str) -> Result<()> {
    let value = u32::try_from(value).map_err(|_| UsmError::overflow(Stage::BuildMetadata, field))?;
    target.extend_from_slice(&value.to_be_bytes());
    Ok(())
}

fn push_u16(target: &mut Vec<u8>, value: usize, field: &str) -> Result<()> {
    let value = u16::try_from(value).map_err(|_| UsmError::overflow(Stage::BuildMetadata, field))?;
    target.extend_from_slice(&value.to_be_bytes());
    Ok(())
}
