//! Minimal class-file writer for synthesizing instrumentation inputs in tests.

use crate::classfile::{CLASS_MAGIC, write_u16, write_u32};

/// Method definition for generated class files.
pub(crate) struct MethodCode {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) access_flags: u16,
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
    pub(crate) code: Vec<u8>,
    /// (start_pc, end_pc, handler_pc, catch_type)
    pub(crate) exception_table: Vec<(u16, u16, u16, u16)>,
}

/// Constant pool entries needed by generated class files.
enum CpEntry {
    Utf8(String),
    Class(u16),
}

impl CpEntry {
    fn write(&self, bytes: &mut Vec<u8>) {
        match self {
            CpEntry::Utf8(value) => {
                bytes.push(1);
                write_u16(bytes, value.len() as u16);
                bytes.extend_from_slice(value.as_bytes());
            }
            CpEntry::Class(name_index) => {
                bytes.push(7);
                write_u16(bytes, *name_index);
            }
        }
    }
}

struct FieldSpec {
    access_flags: u16,
    name_index: u16,
    descriptor_index: u16,
}

struct MethodSpec {
    access_flags: u16,
    name_index: u16,
    descriptor_index: u16,
    max_stack: u16,
    max_locals: u16,
    code: Vec<u8>,
    exception_table: Vec<(u16, u16, u16, u16)>,
}

/// Builder assembling a small but complete class file.
pub(crate) struct ClassFileBuilder {
    cp: Vec<CpEntry>,
    this_class: u16,
    super_class: u16,
    code_index: u16,
    fields: Vec<FieldSpec>,
    methods: Vec<MethodSpec>,
}

impl ClassFileBuilder {
    pub(crate) fn new(class_name: &str, super_name: &str) -> Self {
        let mut builder = Self {
            cp: Vec::new(),
            this_class: 0,
            super_class: 0,
            code_index: 0,
            fields: Vec::new(),
            methods: Vec::new(),
        };
        builder.code_index = builder.add_utf8("Code");
        builder.this_class = builder.add_class(class_name);
        builder.super_class = builder.add_class(super_name);
        builder
    }

    fn add_utf8(&mut self, value: &str) -> u16 {
        self.cp.push(CpEntry::Utf8(value.to_string()));
        self.cp.len() as u16
    }

    fn add_class(&mut self, name: &str) -> u16 {
        let name_index = self.add_utf8(name);
        self.cp.push(CpEntry::Class(name_index));
        self.cp.len() as u16
    }

    pub(crate) fn field(mut self, name: &str, descriptor: &str, access_flags: u16) -> Self {
        let name_index = self.add_utf8(name);
        let descriptor_index = self.add_utf8(descriptor);
        self.fields.push(FieldSpec {
            access_flags,
            name_index,
            descriptor_index,
        });
        self
    }

    pub(crate) fn method(mut self, method: MethodCode) -> Self {
        let name_index = self.add_utf8(&method.name);
        let descriptor_index = self.add_utf8(&method.descriptor);
        self.methods.push(MethodSpec {
            access_flags: method.access_flags,
            name_index,
            descriptor_index,
            max_stack: method.max_stack,
            max_locals: method.max_locals,
            code: method.code,
            exception_table: method.exception_table,
        });
        self
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_u32(&mut bytes, CLASS_MAGIC);
        write_u16(&mut bytes, 0);
        write_u16(&mut bytes, 52);
        write_u16(&mut bytes, (self.cp.len() + 1) as u16);
        for entry in &self.cp {
            entry.write(&mut bytes);
        }
        write_u16(&mut bytes, 0x0021);
        write_u16(&mut bytes, self.this_class);
        write_u16(&mut bytes, self.super_class);
        write_u16(&mut bytes, 0);
        write_u16(&mut bytes, self.fields.len() as u16);
        for field in &self.fields {
            write_u16(&mut bytes, field.access_flags);
            write_u16(&mut bytes, field.name_index);
            write_u16(&mut bytes, field.descriptor_index);
            write_u16(&mut bytes, 0);
        }
        write_u16(&mut bytes, self.methods.len() as u16);
        for method in &self.methods {
            write_u16(&mut bytes, method.access_flags);
            write_u16(&mut bytes, method.name_index);
            write_u16(&mut bytes, method.descriptor_index);
            write_u16(&mut bytes, 1);
            write_u16(&mut bytes, self.code_index);
            let attr_len = 12 + method.code.len() as u32 + 8 * method.exception_table.len() as u32;
            write_u32(&mut bytes, attr_len);
            write_u16(&mut bytes, method.max_stack);
            write_u16(&mut bytes, method.max_locals);
            write_u32(&mut bytes, method.code.len() as u32);
            bytes.extend_from_slice(&method.code);
            write_u16(&mut bytes, method.exception_table.len() as u16);
            for (start_pc, end_pc, handler_pc, catch_type) in &method.exception_table {
                write_u16(&mut bytes, *start_pc);
                write_u16(&mut bytes, *end_pc);
                write_u16(&mut bytes, *handler_pc);
                write_u16(&mut bytes, *catch_type);
            }
            write_u16(&mut bytes, 0);
        }
        write_u16(&mut bytes, 0);
        bytes
    }
}
