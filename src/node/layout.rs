//! # Struct Layout Builder
//!
//! Every record type describes its on-disk layout by appending fixed-width
//! fields to a [`StructBuilder`]; the builder hands back field handles that
//! carry their byte offset and the final `size()` is what the type's factory
//! reports as its record size.
//!
//! ```ignore
//! let mut b = StructBuilder::new();
//! let name = b.add_string();
//! let line = b.add_int();
//! let parent = b.add_rec_ptr();
//! let children = b.add_array(2);
//! let size = b.size();
//! ```
//!
//! Layout starts immediately after the 2-byte type tag and packs fields
//! back-to-back; the store's accessors handle unaligned offsets, so no
//! padding is inserted. Field handles are plain offsets - `Copy`, free to
//! pass around, and usable from any thread holding the appropriate lock.

use eyre::{ensure, Result};

use crate::array::GrowableArrayDef;
use crate::config::{BYTE_SIZE, INT_SIZE, LONG_SIZE, POOL_STRING, PTR_SIZE, SHORT_SIZE};
use crate::database::Database;
use crate::error::StoreError;
use crate::storage::Address;

/// Size of the leading type tag every record carries.
pub const TYPE_TAG_SIZE: u64 = SHORT_SIZE;

#[derive(Debug, Clone, Copy)]
pub struct FieldByte {
    offset: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldShort {
    offset: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldInt {
    offset: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldLong {
    offset: u64,
}

/// A 4-byte compressed pointer to another record (0 = null).
#[derive(Debug, Clone, Copy)]
pub struct FieldPointer {
    offset: u64,
}

/// A pointer to an owned, length-prefixed string record.
#[derive(Debug, Clone, Copy)]
pub struct FieldString {
    offset: u64,
}

/// An embedded growable array of record pointers.
#[derive(Debug, Clone, Copy)]
pub struct FieldArray {
    offset: u64,
    def: GrowableArrayDef,
}

impl FieldByte {
    pub fn get(&self, db: &Database, base: Address) -> Result<u8> {
        db.store().get_byte(base + self.offset)
    }
    pub fn put(&self, db: &Database, base: Address, value: u8) -> Result<()> {
        db.store().put_byte(base + self.offset, value)
    }
}

impl FieldShort {
    pub fn get(&self, db: &Database, base: Address) -> Result<i16> {
        db.store().get_short(base + self.offset)
    }
    pub fn put(&self, db: &Database, base: Address, value: i16) -> Result<()> {
        db.store().put_short(base + self.offset, value)
    }
}

impl FieldInt {
    pub fn get(&self, db: &Database, base: Address) -> Result<i32> {
        db.store().get_int(base + self.offset)
    }
    pub fn put(&self, db: &Database, base: Address, value: i32) -> Result<()> {
        db.store().put_int(base + self.offset, value)
    }
}

impl FieldLong {
    pub fn get(&self, db: &Database, base: Address) -> Result<i64> {
        db.store().get_long(base + self.offset)
    }
    pub fn put(&self, db: &Database, base: Address, value: i64) -> Result<()> {
        db.store().put_long(base + self.offset, value)
    }
}

impl FieldPointer {
    pub fn get(&self, db: &Database, base: Address) -> Result<Address> {
        db.store().get_rec_ptr(base + self.offset)
    }
    pub fn put(&self, db: &Database, base: Address, value: Address) -> Result<()> {
        db.store().put_rec_ptr(base + self.offset, value)
    }
}

impl FieldString {
    /// Read the string, or `None` when the field is null.
    pub fn get(&self, db: &Database, base: Address) -> Result<Option<String>> {
        let record = db.store().get_rec_ptr(base + self.offset)?;
        if record == 0 {
            return Ok(None);
        }
        let len = db.store().get_short(record)? as u16 as usize;
        let bytes = db.store().read_bytes(record + SHORT_SIZE, len)?;
        let text = String::from_utf8(bytes).map_err(|_| {
            StoreError::IndexCorruption(format!("string record at {record:#x} is not UTF-8"))
        })?;
        Ok(Some(text))
    }

    /// Replace the string, freeing any previous value.
    pub fn put(&self, db: &Database, base: Address, value: &str) -> Result<()> {
        ensure!(
            value.len() <= u16::MAX as usize,
            "string of {} bytes exceeds the {} byte field limit",
            value.len(),
            u16::MAX
        );
        self.free(db, base)?;

        let record = db
            .store()
            .malloc(SHORT_SIZE + value.len() as u64, POOL_STRING)?;
        db.store().put_short(record, value.len() as u16 as i16)?;
        db.store().write_bytes(record + SHORT_SIZE, value.as_bytes())?;
        db.store().put_rec_ptr(base + self.offset, record)
    }

    /// Free the owned string record and null the field. Used from
    /// `destruct_fields`.
    pub fn free(&self, db: &Database, base: Address) -> Result<()> {
        let record = db.store().get_rec_ptr(base + self.offset)?;
        if record != 0 {
            db.store().free(record, POOL_STRING)?;
            db.store().put_rec_ptr(base + self.offset, 0)?;
        }
        Ok(())
    }
}

impl FieldArray {
    pub fn def(&self) -> &GrowableArrayDef {
        &self.def
    }

    pub fn size(&self, db: &Database, base: Address) -> Result<u32> {
        self.def.size(db, base + self.offset)
    }

    pub fn is_empty(&self, db: &Database, base: Address) -> Result<bool> {
        self.def.is_empty(db, base + self.offset)
    }

    pub fn add(&self, db: &Database, base: Address, value: Address) -> Result<u32> {
        self.def.add(db, base + self.offset, value)
    }

    pub fn get(&self, db: &Database, base: Address, index: u32) -> Result<Address> {
        self.def.get(db, base + self.offset, index)
    }

    pub fn remove(&self, db: &Database, base: Address, index: u32) -> Result<Address> {
        self.def.remove(db, base + self.offset, index)
    }

    pub fn ensure_capacity(&self, db: &Database, base: Address, desired: u32) -> Result<()> {
        self.def.ensure_capacity(db, base + self.offset, desired)
    }

    pub fn capacity(&self, db: &Database, base: Address) -> Result<u32> {
        self.def.capacity(db, base + self.offset)
    }

    /// Free the array's blocks. Used from `destruct_fields`; never touches
    /// the records the elements point to.
    pub fn destruct(&self, db: &Database, base: Address) -> Result<()> {
        self.def.destruct(db, base + self.offset)
    }
}

/// Appends fields back-to-back, starting after the type tag.
pub struct StructBuilder {
    next_offset: u64,
}

impl StructBuilder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            next_offset: TYPE_TAG_SIZE,
        }
    }

    fn take(&mut self, width: u64) -> u64 {
        let offset = self.next_offset;
        self.next_offset += width;
        offset
    }

    pub fn add_byte(&mut self) -> FieldByte {
        FieldByte {
            offset: self.take(BYTE_SIZE),
        }
    }

    pub fn add_short(&mut self) -> FieldShort {
        FieldShort {
            offset: self.take(SHORT_SIZE),
        }
    }

    pub fn add_int(&mut self) -> FieldInt {
        FieldInt {
            offset: self.take(INT_SIZE),
        }
    }

    pub fn add_long(&mut self) -> FieldLong {
        FieldLong {
            offset: self.take(LONG_SIZE),
        }
    }

    pub fn add_rec_ptr(&mut self) -> FieldPointer {
        FieldPointer {
            offset: self.take(PTR_SIZE),
        }
    }

    pub fn add_string(&mut self) -> FieldString {
        FieldString {
            offset: self.take(PTR_SIZE),
        }
    }

    /// Embed a growable array with `inline_size` inline slots.
    pub fn add_array(&mut self, inline_size: u32) -> FieldArray {
        let def = GrowableArrayDef::new(inline_size);
        FieldArray {
            offset: self.take(def.record_size()),
            def,
        }
    }

    /// Total record size declared so far, including the type tag.
    pub fn size(&self) -> u64 {
        self.next_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_sequential_and_packed() {
        let mut b = StructBuilder::new();
        let byte = b.add_byte();
        let short = b.add_short();
        let int = b.add_int();
        let long = b.add_long();
        let ptr = b.add_rec_ptr();

        assert_eq!(byte.offset, 2);
        assert_eq!(short.offset, 3);
        assert_eq!(int.offset, 5);
        assert_eq!(long.offset, 9);
        assert_eq!(ptr.offset, 17);
        assert_eq!(b.size(), 21);
    }

    #[test]
    fn array_field_reserves_header_plus_inline_slots() {
        let mut b = StructBuilder::new();
        let array = b.add_array(2);

        // block pointer + two inline slots
        assert_eq!(array.def().record_size(), PTR_SIZE + 2 * PTR_SIZE);
        assert_eq!(b.size(), TYPE_TAG_SIZE + PTR_SIZE + 2 * PTR_SIZE);
    }
}
