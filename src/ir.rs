use anyhow::{Context, Result};
use jclassfile::class_file;
use jclassfile::constant_pool::ConstantPool;
use jclassfile::fields::FieldFlags;
use jclassfile::methods::MethodFlags;

use crate::descriptor::{ReturnKind, is_nullable_field, method_return_kind};

/// Semantic view of one class, extracted ahead of any byte surgery.
#[derive(Clone, Debug)]
pub(crate) struct ClassInfo {
    pub(crate) name: String,
    pub(crate) fields: Vec<FieldInfo>,
    pub(crate) methods: Vec<MethodInfo>,
}

/// Field metadata relevant to nullness sampling.
#[derive(Clone, Debug)]
pub(crate) struct FieldInfo {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) is_static: bool,
}

/// Method metadata relevant to eligibility and probe synthesis.
#[derive(Clone, Debug)]
pub(crate) struct MethodInfo {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) is_static: bool,
    pub(crate) is_abstract: bool,
    pub(crate) has_code: bool,
}

/// Identity of a method being transformed, immutable once computed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MethodSignature {
    pub(crate) class_name: String,
    pub(crate) method_name: String,
    pub(crate) descriptor: String,
    pub(crate) return_kind: ReturnKind,
    pub(crate) is_static: bool,
}

impl MethodSignature {
    pub(crate) fn of(class: &ClassInfo, method: &MethodInfo) -> Result<Self> {
        let return_kind = method_return_kind(&method.descriptor)
            .with_context(|| format!("descriptor of {}.{}", class.name, method.name))?;
        Ok(Self {
            class_name: class.name.clone(),
            method_name: method.name.clone(),
            descriptor: method.descriptor.clone(),
            return_kind,
            is_static: method.is_static,
        })
    }
}

impl ClassInfo {
    /// Instance fields eligible for nullness sampling, in declaration order.
    pub(crate) fn nullable_instance_fields(&self) -> Vec<&FieldInfo> {
        self.fields
            .iter()
            .filter(|field| !field.is_static && is_nullable_field(&field.descriptor))
            .collect()
    }
}

/// Parse class bytes into the semantic view used by eligibility and probes.
pub(crate) fn parse_class_info(data: &[u8]) -> Result<ClassInfo> {
    let class_file = class_file::parse(data).context("parse class file bytes")?;
    let constant_pool = class_file.constant_pool();
    let name =
        resolve_class_name(constant_pool, class_file.this_class()).context("resolve class name")?;

    let mut fields = Vec::new();
    for field in class_file.fields() {
        let field_name =
            resolve_utf8(constant_pool, field.name_index()).context("resolve field name")?;
        let descriptor = resolve_utf8(constant_pool, field.descriptor_index())
            .context("resolve field descriptor")?;
        fields.push(FieldInfo {
            name: field_name,
            descriptor,
            is_static: field.access_flags().contains(FieldFlags::ACC_STATIC),
        });
    }

    let mut methods = Vec::new();
    for method in class_file.methods() {
        let method_name =
            resolve_utf8(constant_pool, method.name_index()).context("resolve method name")?;
        let descriptor = resolve_utf8(constant_pool, method.descriptor_index())
            .context("resolve method descriptor")?;
        let access_flags = method.access_flags();
        let has_code = method
            .attributes()
            .iter()
            .any(|attribute| matches!(attribute, jclassfile::attributes::Attribute::Code { .. }));
        methods.push(MethodInfo {
            name: method_name,
            descriptor,
            is_static: access_flags.contains(MethodFlags::ACC_STATIC),
            is_abstract: access_flags.contains(MethodFlags::ACC_ABSTRACT),
            has_code,
        });
    }

    Ok(ClassInfo {
        name,
        fields,
        methods,
    })
}

pub(crate) fn resolve_class_name(constant_pool: &[ConstantPool], class_index: u16) -> Result<String> {
    let entry = constant_pool
        .get(class_index as usize)
        .context("missing class entry")?;
    match entry {
        ConstantPool::Class { name_index } => resolve_utf8(constant_pool, *name_index),
        _ => anyhow::bail!("unexpected class entry"),
    }
}

pub(crate) fn resolve_utf8(constant_pool: &[ConstantPool], index: u16) -> Result<String> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing utf8 entry")?;
    match entry {
        ConstantPool::Utf8 { value } => Ok(value.clone()),
        _ => anyhow::bail!("unexpected utf8 entry"),
    }
}
