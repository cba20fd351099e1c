//! Byte-level class-file structure: a reader that preserves every span it does
//! not understand, and a constant-pool editor for appended probe constants.
//!
//! The semantic view of a class comes from `jclassfile` (see `ir`); this module
//! exists because splicing instructions requires re-emitting the container
//! with full fidelity, including attributes and constant-pool entries the
//! semantic parser has no reason to surface.

use std::collections::BTreeMap;

use anyhow::{Context, Result};

pub(crate) const CLASS_MAGIC: u32 = 0xCAFEBABE;

pub(crate) fn read_u8(data: &[u8], offset: &mut usize) -> Result<u8> {
    let byte = *data.get(*offset).context("class file out of bounds")?;
    *offset += 1;
    Ok(byte)
}

pub(crate) fn read_u16(data: &[u8], offset: &mut usize) -> Result<u16> {
    let bytes = read_bytes(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32> {
    let bytes = read_bytes(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn read_bytes<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8]> {
    let start = *offset;
    let end = start.checked_add(len).context("class file out of bounds")?;
    let slice = data.get(start..end).context("class file out of bounds")?;
    *offset = end;
    Ok(slice)
}

pub(crate) fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// One constant-pool slot: a raw entry (tag byte included) or the phantom
/// second slot occupied by long/double constants.
#[derive(Clone, Debug)]
enum PoolSlot {
    Unused,
    Entry(Vec<u8>),
    Phantom,
}

/// Constant pool with verbatim entries plus a deduplicating appender.
///
/// Existing Utf8/Class/String/NameAndType/ref entries are indexed during the
/// scan so appended constants reuse them instead of growing the pool.
pub(crate) struct PoolEditor {
    slots: Vec<PoolSlot>,
    utf8: BTreeMap<String, u16>,
    classes: BTreeMap<u16, u16>,
    strings: BTreeMap<u16, u16>,
    name_and_types: BTreeMap<(u16, u16), u16>,
    field_refs: BTreeMap<(u16, u16), u16>,
    method_refs: BTreeMap<(u16, u16), u16>,
}

impl PoolEditor {
    /// Parse the constant pool starting at `offset` (the count field).
    pub(crate) fn parse(data: &[u8], offset: &mut usize) -> Result<Self> {
        let count = read_u16(data, offset)?;
        let mut editor = Self {
            slots: vec![PoolSlot::Unused],
            utf8: BTreeMap::new(),
            classes: BTreeMap::new(),
            strings: BTreeMap::new(),
            name_and_types: BTreeMap::new(),
            field_refs: BTreeMap::new(),
            method_refs: BTreeMap::new(),
        };
        let mut index = 1u16;
        while index < count {
            let start = *offset;
            let tag = read_u8(data, offset)?;
            let mut wide = false;
            match tag {
                1 => {
                    let len = read_u16(data, offset)? as usize;
                    let bytes = read_bytes(data, offset, len)?;
                    let value = String::from_utf8_lossy(bytes).to_string();
                    editor.utf8.entry(value).or_insert(index);
                }
                7 => {
                    let name_index = read_u16(data, offset)?;
                    editor.classes.entry(name_index).or_insert(index);
                }
                8 => {
                    let string_index = read_u16(data, offset)?;
                    editor.strings.entry(string_index).or_insert(index);
                }
                9 => {
                    let class_index = read_u16(data, offset)?;
                    let name_and_type = read_u16(data, offset)?;
                    editor
                        .field_refs
                        .entry((class_index, name_and_type))
                        .or_insert(index);
                }
                10 => {
                    let class_index = read_u16(data, offset)?;
                    let name_and_type = read_u16(data, offset)?;
                    editor
                        .method_refs
                        .entry((class_index, name_and_type))
                        .or_insert(index);
                }
                12 => {
                    let name_index = read_u16(data, offset)?;
                    let descriptor_index = read_u16(data, offset)?;
                    editor
                        .name_and_types
                        .entry((name_index, descriptor_index))
                        .or_insert(index);
                }
                3 | 4 => {
                    read_bytes(data, offset, 4)?;
                }
                5 | 6 => {
                    read_bytes(data, offset, 8)?;
                    wide = true;
                }
                11 | 17 | 18 => {
                    read_bytes(data, offset, 4)?;
                }
                15 => {
                    read_bytes(data, offset, 3)?;
                }
                16 | 19 | 20 => {
                    read_bytes(data, offset, 2)?;
                }
                _ => anyhow::bail!("unsupported constant pool tag: {}", tag),
            }
            editor.slots.push(PoolSlot::Entry(data[start..*offset].to_vec()));
            index += 1;
            if wide {
                editor.slots.push(PoolSlot::Phantom);
                index += 1;
            }
        }
        Ok(editor)
    }

    /// Pool count field value (number of slots including the unused zeroth).
    pub(crate) fn count(&self) -> u16 {
        self.slots.len() as u16
    }

    pub(crate) fn utf8(&mut self, value: &str) -> Result<u16> {
        if let Some(&index) = self.utf8.get(value) {
            return Ok(index);
        }
        let mut bytes = vec![1u8];
        // Probe constants are plain ASCII, so the modified-UTF8 encoding is
        // the byte encoding.
        write_u16(&mut bytes, value.len() as u16);
        bytes.extend_from_slice(value.as_bytes());
        let index = self.push(bytes)?;
        self.utf8.insert(value.to_string(), index);
        Ok(index)
    }

    pub(crate) fn class(&mut self, name: &str) -> Result<u16> {
        let name_index = self.utf8(name)?;
        if let Some(&index) = self.classes.get(&name_index) {
            return Ok(index);
        }
        let mut bytes = vec![7u8];
        write_u16(&mut bytes, name_index);
        let index = self.push(bytes)?;
        self.classes.insert(name_index, index);
        Ok(index)
    }

    pub(crate) fn string(&mut self, value: &str) -> Result<u16> {
        let utf8_index = self.utf8(value)?;
        if let Some(&index) = self.strings.get(&utf8_index) {
            return Ok(index);
        }
        let mut bytes = vec![8u8];
        write_u16(&mut bytes, utf8_index);
        let index = self.push(bytes)?;
        self.strings.insert(utf8_index, index);
        Ok(index)
    }

    pub(crate) fn name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let key = (self.utf8(name)?, self.utf8(descriptor)?);
        if let Some(&index) = self.name_and_types.get(&key) {
            return Ok(index);
        }
        let mut bytes = vec![12u8];
        write_u16(&mut bytes, key.0);
        write_u16(&mut bytes, key.1);
        let index = self.push(bytes)?;
        self.name_and_types.insert(key, index);
        Ok(index)
    }

    pub(crate) fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> Result<u16> {
        let key = (self.class(class)?, self.name_and_type(name, descriptor)?);
        if let Some(&index) = self.field_refs.get(&key) {
            return Ok(index);
        }
        let mut bytes = vec![9u8];
        write_u16(&mut bytes, key.0);
        write_u16(&mut bytes, key.1);
        let index = self.push(bytes)?;
        self.field_refs.insert(key, index);
        Ok(index)
    }

    pub(crate) fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> Result<u16> {
        let key = (self.class(class)?, self.name_and_type(name, descriptor)?);
        if let Some(&index) = self.method_refs.get(&key) {
            return Ok(index);
        }
        let mut bytes = vec![10u8];
        write_u16(&mut bytes, key.0);
        write_u16(&mut bytes, key.1);
        let index = self.push(bytes)?;
        self.method_refs.insert(key, index);
        Ok(index)
    }

    fn push(&mut self, bytes: Vec<u8>) -> Result<u16> {
        if self.slots.len() >= u16::MAX as usize {
            anyhow::bail!("constant pool overflow while appending probe constants");
        }
        let index = self.slots.len() as u16;
        self.slots.push(PoolSlot::Entry(bytes));
        Ok(index)
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        write_u16(out, self.count());
        for slot in &self.slots {
            if let PoolSlot::Entry(bytes) = slot {
                out.extend_from_slice(bytes);
            }
        }
    }
}

/// A method_info record with attribute payloads kept verbatim.
#[derive(Clone, Debug)]
pub(crate) struct RawMethod {
    pub(crate) access_flags: u16,
    pub(crate) name_index: u16,
    pub(crate) descriptor_index: u16,
    pub(crate) attributes: Vec<RawAttribute>,
}

/// One attribute: resolved name plus unparsed payload.
#[derive(Clone, Debug)]
pub(crate) struct RawAttribute {
    pub(crate) name_index: u16,
    pub(crate) name: String,
    pub(crate) payload: Vec<u8>,
}

impl RawAttribute {
    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        write_u16(out, self.name_index);
        write_u32(out, self.payload.len() as u32);
        out.extend_from_slice(&self.payload);
    }
}

/// Whole class file with everything the rewriter does not touch held as raw
/// spans, ready for re-emission.
pub(crate) struct RawClass {
    pub(crate) minor_version: u16,
    pub(crate) major_version: u16,
    pub(crate) pool: PoolEditor,
    pub(crate) access_flags: u16,
    pub(crate) this_class: u16,
    pub(crate) super_class: u16,
    /// Interface table including its count field.
    pub(crate) interfaces: Vec<u8>,
    /// Field table including its count field.
    pub(crate) fields: Vec<u8>,
    pub(crate) methods: Vec<RawMethod>,
    /// Class-level attribute table including its count field.
    pub(crate) class_attributes: Vec<u8>,
}

impl RawClass {
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        let mut offset = 0usize;
        let magic = read_u32(data, &mut offset)?;
        if magic != CLASS_MAGIC {
            anyhow::bail!("invalid class file magic");
        }
        let minor_version = read_u16(data, &mut offset)?;
        let major_version = read_u16(data, &mut offset)?;
        let pool = PoolEditor::parse(data, &mut offset).context("parse constant pool")?;
        let access_flags = read_u16(data, &mut offset)?;
        let this_class = read_u16(data, &mut offset)?;
        let super_class = read_u16(data, &mut offset)?;

        let interfaces_start = offset;
        let interface_count = read_u16(data, &mut offset)? as usize;
        read_bytes(data, &mut offset, interface_count * 2)?;
        let interfaces = data[interfaces_start..offset].to_vec();

        let fields_start = offset;
        let field_count = read_u16(data, &mut offset)?;
        for _ in 0..field_count {
            read_bytes(data, &mut offset, 6)?;
            skip_attributes(data, &mut offset)?;
        }
        let fields = data[fields_start..offset].to_vec();

        let method_count = read_u16(data, &mut offset)?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            let access_flags = read_u16(data, &mut offset)?;
            let name_index = read_u16(data, &mut offset)?;
            let descriptor_index = read_u16(data, &mut offset)?;
            let attributes =
                parse_attributes(data, &mut offset, &pool).context("parse method attributes")?;
            methods.push(RawMethod {
                access_flags,
                name_index,
                descriptor_index,
                attributes,
            });
        }

        let class_attributes = data[offset..].to_vec();
        Ok(Self {
            minor_version,
            major_version,
            pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            class_attributes,
        })
    }

    pub(crate) fn emit(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u32(&mut out, CLASS_MAGIC);
        write_u16(&mut out, self.minor_version);
        write_u16(&mut out, self.major_version);
        self.pool.write(&mut out);
        write_u16(&mut out, self.access_flags);
        write_u16(&mut out, self.this_class);
        write_u16(&mut out, self.super_class);
        out.extend_from_slice(&self.interfaces);
        out.extend_from_slice(&self.fields);
        write_u16(&mut out, self.methods.len() as u16);
        for method in &self.methods {
            write_u16(&mut out, method.access_flags);
            write_u16(&mut out, method.name_index);
            write_u16(&mut out, method.descriptor_index);
            write_u16(&mut out, method.attributes.len() as u16);
            for attribute in &method.attributes {
                attribute.write(&mut out);
            }
        }
        out.extend_from_slice(&self.class_attributes);
        out
    }
}

fn parse_attributes(
    data: &[u8],
    offset: &mut usize,
    pool: &PoolEditor,
) -> Result<Vec<RawAttribute>> {
    let count = read_u16(data, offset)?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = read_u16(data, offset)?;
        let length = read_u32(data, offset)? as usize;
        let payload = read_bytes(data, offset, length)?.to_vec();
        let name = pool.utf8_at(name_index).unwrap_or_default();
        attributes.push(RawAttribute {
            name_index,
            name,
            payload,
        });
    }
    Ok(attributes)
}

fn skip_attributes(data: &[u8], offset: &mut usize) -> Result<()> {
    let count = read_u16(data, offset)?;
    for _ in 0..count {
        read_bytes(data, offset, 2)?;
        let length = read_u32(data, offset)? as usize;
        read_bytes(data, offset, length)?;
    }
    Ok(())
}

/// Exception-table row of a Code attribute.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ExceptionEntry {
    pub(crate) start_pc: u16,
    pub(crate) end_pc: u16,
    pub(crate) handler_pc: u16,
    pub(crate) catch_type: u16,
}

/// Parsed Code attribute payload.
#[derive(Clone, Debug)]
pub(crate) struct CodeAttribute {
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
    pub(crate) code: Vec<u8>,
    pub(crate) exception_table: Vec<ExceptionEntry>,
    pub(crate) attributes: Vec<RawAttribute>,
}

impl CodeAttribute {
    pub(crate) fn parse(payload: &[u8], pool: &PoolEditor) -> Result<Self> {
        let mut offset = 0usize;
        let max_stack = read_u16(payload, &mut offset)?;
        let max_locals = read_u16(payload, &mut offset)?;
        let code_length = read_u32(payload, &mut offset)? as usize;
        let code = read_bytes(payload, &mut offset, code_length)?.to_vec();
        let handler_count = read_u16(payload, &mut offset)?;
        let mut exception_table = Vec::with_capacity(handler_count as usize);
        for _ in 0..handler_count {
            exception_table.push(ExceptionEntry {
                start_pc: read_u16(payload, &mut offset)?,
                end_pc: read_u16(payload, &mut offset)?,
                handler_pc: read_u16(payload, &mut offset)?,
                catch_type: read_u16(payload, &mut offset)?,
            });
        }
        let attributes =
            parse_attributes(payload, &mut offset, pool).context("parse code attributes")?;
        Ok(Self {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    pub(crate) fn emit(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_u16(&mut out, self.max_stack);
        write_u16(&mut out, self.max_locals);
        write_u32(&mut out, self.code.len() as u32);
        out.extend_from_slice(&self.code);
        write_u16(&mut out, self.exception_table.len() as u16);
        for entry in &self.exception_table {
            write_u16(&mut out, entry.start_pc);
            write_u16(&mut out, entry.end_pc);
            write_u16(&mut out, entry.handler_pc);
            write_u16(&mut out, entry.catch_type);
        }
        write_u16(&mut out, self.attributes.len() as u16);
        for attribute in &self.attributes {
            attribute.write(&mut out);
        }
        out
    }
}

impl PoolEditor {
    /// Resolve an existing Utf8 entry, decoding it on demand.
    pub(crate) fn utf8_at(&self, index: u16) -> Option<String> {
        match self.slots.get(index as usize)? {
            PoolSlot::Entry(bytes) if bytes.first() == Some(&1) => {
                let len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
                let value = bytes.get(3..3 + len)?;
                Some(String::from_utf8_lossy(value).to_string())
            }
            _ => None,
        }
    }

    /// Resolve a Class entry to its internal name.
    pub(crate) fn class_name_at(&self, index: u16) -> Option<String> {
        match self.slots.get(index as usize)? {
            PoolSlot::Entry(bytes) if bytes.first() == Some(&7) => {
                let name_index = u16::from_be_bytes([bytes[1], bytes[2]]);
                self.utf8_at(name_index)
            }
            _ => None,
        }
    }
}
