//! Instrumentation synthesizer: splices nullness probes into method bodies.
//!
//! The rewriter never mutates the original instruction stream in place. It
//! decodes the stream into an indexed sequence, attaches synthesized fragments
//! to positions in that sequence, lays the result out afresh (relocating
//! branches, switches, exception ranges, and line numbers), and emits the new
//! body wholesale.
//!
//! Probes call static methods on a JVM-side support class:
//!
//! - `enter(String, String, Object[], Object[]) -> Object` receives the class
//!   id, method id, sampled field values, and sampled parameter values, and
//!   returns a probe handle which is stored in a local slot the original
//!   method never uses;
//! - `exitReturn(Object, Object)` receives the handle and the value about to
//!   be returned, which is left on the operand stack untouched;
//! - `exitThrow(Object)` receives the handle just before an `athrow`.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::debug;

use crate::classfile::{
    CodeAttribute, ExceptionEntry, PoolEditor, RawAttribute, RawClass, write_u16,
};
use crate::descriptor::nullable_param_slots;
use crate::eligibility::{TrackingMode, is_suitable};
use crate::ir::{ClassInfo, MethodSignature, parse_class_info};
use crate::opcodes;
use crate::record::MAX_SLOTS;

pub(crate) const DEFAULT_SUPPORT_CLASS: &str = "nullprobe/runtime/ProbeSupport";

const ENTER_NAME: &str = "enter";
const ENTER_DESC: &str =
    "(Ljava/lang/String;Ljava/lang/String;[Ljava/lang/Object;[Ljava/lang/Object;)Ljava/lang/Object;";
const EXIT_RETURN_NAME: &str = "exitReturn";
const EXIT_RETURN_DESC: &str = "(Ljava/lang/Object;Ljava/lang/Object;)V";
const EXIT_THROW_NAME: &str = "exitThrow";
const EXIT_THROW_DESC: &str = "(Ljava/lang/Object;)V";

/// Deepest operand stack any synthesized fragment needs on its own: the
/// parameter-array population sequence (two strings, two arrays, dup, index,
/// value).
const PROBE_STACK: u16 = 7;

/// Per-run instrumentation configuration.
#[derive(Clone, Debug)]
pub(crate) struct InstrumentOptions {
    pub(crate) mode: TrackingMode,
    pub(crate) support_class: String,
}

impl InstrumentOptions {
    pub(crate) fn new(mode: TrackingMode) -> Self {
        Self {
            mode,
            support_class: DEFAULT_SUPPORT_CLASS.to_string(),
        }
    }
}

/// Result of transforming one class.
#[derive(Debug)]
pub(crate) struct ClassOutcome {
    pub(crate) class_name: String,
    /// Rewritten bytes, or `None` when no method was eligible.
    pub(crate) bytes: Option<Vec<u8>>,
    pub(crate) methods_instrumented: usize,
    pub(crate) methods_skipped: usize,
}

/// Rewrite every eligible method of a class.
///
/// Pure function of its inputs: parses, splices, and re-emits without touching
/// shared state. Capacity violations (more than 64 tracked fields or
/// parameters) and bodies that can no longer be encoded (branch overflow,
/// 64KiB method limit) are errors carrying the offending identity.
pub(crate) fn instrument_class(data: &[u8], options: &InstrumentOptions) -> Result<ClassOutcome> {
    let info = parse_class_info(data)?;
    let mut raw = RawClass::parse(data)
        .with_context(|| format!("re-read class structure of {}", info.name))?;
    if raw.methods.len() != info.methods.len() {
        anyhow::bail!("method table mismatch while reading {}", info.name);
    }

    let mut methods_instrumented = 0usize;
    let mut methods_skipped = 0usize;
    let mut methods = std::mem::take(&mut raw.methods);
    for (index, method) in info.methods.iter().enumerate() {
        if !is_suitable(options.mode, method)
            .with_context(|| format!("decide eligibility of {}.{}", info.name, method.name))?
        {
            methods_skipped += 1;
            continue;
        }
        let raw_method = &mut methods[index];
        let Some(code_index) = raw_method
            .attributes
            .iter()
            .position(|attribute| attribute.name == "Code")
        else {
            methods_skipped += 1;
            continue;
        };
        let code = CodeAttribute::parse(&raw_method.attributes[code_index].payload, &raw.pool)
            .with_context(|| format!("parse code of {}.{}", info.name, method.name))?;
        let signature = MethodSignature::of(&info, method)?;
        let plan = ProbePlan::build(&mut raw.pool, &info, &signature, options, code.max_locals)?;
        let rewritten = splice(&code, &plan)
            .with_context(|| format!("splice probes into {}.{}", info.name, method.name))?;
        raw_method.attributes[code_index].payload = rewritten.emit();
        debug!(
            class = %info.name,
            method = %method.name,
            return_kind = ?signature.return_kind,
            fields = plan.field_refs.len(),
            params = plan.param_slots.len(),
            "instrumented"
        );
        methods_instrumented += 1;
    }
    raw.methods = methods;

    let bytes = if methods_instrumented > 0 {
        Some(raw.emit())
    } else {
        None
    };
    Ok(ClassOutcome {
        class_name: info.name,
        bytes,
        methods_instrumented,
        methods_skipped,
    })
}

/// Constant-pool indices and slot assignments for one method's probes.
struct ProbePlan {
    class_const: u16,
    method_const: u16,
    object_class: u16,
    enter_ref: u16,
    exit_return_ref: u16,
    exit_throw_ref: u16,
    field_refs: Vec<u16>,
    param_slots: Vec<u16>,
    probe_slot: u16,
}

impl ProbePlan {
    fn build(
        pool: &mut PoolEditor,
        class: &ClassInfo,
        signature: &MethodSignature,
        options: &InstrumentOptions,
        max_locals: u16,
    ) -> Result<Self> {
        let fields = if options.mode.tracks_fields() && !signature.is_static {
            class.nullable_instance_fields()
        } else {
            Vec::new()
        };
        if fields.len() > MAX_SLOTS {
            anyhow::bail!(
                "class {} has {} reference-typed instance fields; more than {} is unsupported",
                class.name,
                fields.len(),
                MAX_SLOTS
            );
        }
        let param_slots = if options.mode.tracks_outcomes() {
            nullable_param_slots(&signature.descriptor, signature.is_static).with_context(|| {
                format!("descriptor of {}.{}", class.name, signature.method_name)
            })?
        } else {
            Vec::new()
        };
        if param_slots.len() > MAX_SLOTS {
            anyhow::bail!(
                "method {}.{} has {} reference-typed parameters; more than {} is unsupported",
                class.name,
                signature.method_name,
                param_slots.len(),
                MAX_SLOTS
            );
        }

        let mut field_refs = Vec::with_capacity(fields.len());
        for field in &fields {
            field_refs.push(pool.field_ref(&class.name, &field.name, &field.descriptor)?);
        }
        Ok(Self {
            class_const: pool.string(&signature.class_name)?,
            method_const: pool.string(&signature.method_name)?,
            object_class: pool.class("java/lang/Object")?,
            enter_ref: pool.method_ref(&options.support_class, ENTER_NAME, ENTER_DESC)?,
            exit_return_ref: pool.method_ref(
                &options.support_class,
                EXIT_RETURN_NAME,
                EXIT_RETURN_DESC,
            )?,
            exit_throw_ref: pool.method_ref(
                &options.support_class,
                EXIT_THROW_NAME,
                EXIT_THROW_DESC,
            )?,
            field_refs,
            param_slots,
            probe_slot: max_locals,
        })
    }

    /// Entry fragment: sample fields and parameters, call `enter`, store the
    /// probe handle.
    fn entry_fragment(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_string(&mut out, self.class_const);
        push_string(&mut out, self.method_const);
        push_small_int(&mut out, self.field_refs.len());
        out.push(opcodes::ANEWARRAY);
        write_u16(&mut out, self.object_class);
        for (index, &field_ref) in self.field_refs.iter().enumerate() {
            out.push(opcodes::DUP);
            push_small_int(&mut out, index);
            out.push(opcodes::ALOAD_0);
            out.push(opcodes::GETFIELD);
            write_u16(&mut out, field_ref);
            out.push(opcodes::AASTORE);
        }
        push_small_int(&mut out, self.param_slots.len());
        out.push(opcodes::ANEWARRAY);
        write_u16(&mut out, self.object_class);
        for (index, &slot) in self.param_slots.iter().enumerate() {
            out.push(opcodes::DUP);
            push_small_int(&mut out, index);
            push_aload(&mut out, slot);
            out.push(opcodes::AASTORE);
        }
        out.push(opcodes::INVOKESTATIC);
        write_u16(&mut out, self.enter_ref);
        push_astore(&mut out, self.probe_slot);
        out
    }

    /// Return fragment: duplicate the return value, call `exitReturn`, leave
    /// the stack exactly as found.
    fn return_fragment(&self) -> Vec<u8> {
        let mut out = vec![opcodes::DUP];
        push_aload(&mut out, self.probe_slot);
        out.push(opcodes::SWAP);
        out.push(opcodes::INVOKESTATIC);
        write_u16(&mut out, self.exit_return_ref);
        out
    }

    /// Throw fragment: call `exitThrow` below the pending exception value.
    fn throw_fragment(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_aload(&mut out, self.probe_slot);
        out.push(opcodes::INVOKESTATIC);
        write_u16(&mut out, self.exit_throw_ref);
        out
    }
}

fn push_small_int(out: &mut Vec<u8>, value: usize) {
    // Tracked slot counts never exceed 64.
    if value <= 5 {
        out.push(opcodes::ICONST_0 + value as u8);
    } else {
        out.push(opcodes::BIPUSH);
        out.push(value as u8);
    }
}

fn push_string(out: &mut Vec<u8>, index: u16) {
    if index <= u8::MAX as u16 {
        out.push(opcodes::LDC);
        out.push(index as u8);
    } else {
        out.push(opcodes::LDC_W);
        write_u16(out, index);
    }
}

fn push_aload(out: &mut Vec<u8>, slot: u16) {
    if slot <= 3 {
        out.push(opcodes::ALOAD_0 + slot as u8);
    } else if slot <= u8::MAX as u16 {
        out.push(opcodes::ALOAD);
        out.push(slot as u8);
    } else {
        out.push(opcodes::WIDE);
        out.push(opcodes::ALOAD);
        write_u16(out, slot);
    }
}

fn push_astore(out: &mut Vec<u8>, slot: u16) {
    if slot <= 3 {
        out.push(opcodes::ASTORE_0 + slot as u8);
    } else if slot <= u8::MAX as u16 {
        out.push(opcodes::ASTORE);
        out.push(slot as u8);
    } else {
        out.push(opcodes::WIDE);
        out.push(opcodes::ASTORE);
        write_u16(out, slot);
    }
}

/// One decoded instruction, positioned by its original offset.
#[derive(Clone, Debug)]
pub(crate) struct Insn {
    pub(crate) offset: u32,
    pub(crate) bytes: Vec<u8>,
    pub(crate) kind: InsnKind,
}

impl Insn {
    pub(crate) fn opcode(&self) -> u8 {
        self.bytes[0]
    }
}

/// Instruction shapes the relocator has to re-encode.
#[derive(Clone, Debug)]
pub(crate) enum InsnKind {
    Plain,
    Branch16 { target: u32 },
    Branch32 { target: u32 },
    TableSwitch { default: u32, low: i32, high: i32, targets: Vec<u32> },
    LookupSwitch { default: u32, pairs: Vec<(i32, u32)> },
}

/// Decode a bytecode stream into an indexed instruction sequence.
pub(crate) fn decode(code: &[u8]) -> Result<Vec<Insn>> {
    let mut insns = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let opcode = code[offset];
        let length = opcode_length(code, offset)?;
        if length == 0 || offset + length > code.len() {
            anyhow::bail!("invalid bytecode length at offset {}", offset);
        }
        let bytes = code[offset..offset + length].to_vec();
        let kind = match opcode {
            0x99..=0xa8 | opcodes::IFNULL | opcodes::IFNONNULL => {
                let rel = i16::from_be_bytes([bytes[1], bytes[2]]) as i64;
                InsnKind::Branch16 {
                    target: branch_target(offset, rel, code.len())?,
                }
            }
            opcodes::GOTO_W | opcodes::JSR_W => {
                let rel =
                    i32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as i64;
                InsnKind::Branch32 {
                    target: branch_target(offset, rel, code.len())?,
                }
            }
            opcodes::TABLESWITCH => {
                let base = 1 + padding(offset);
                let mut cursor = base;
                let default = switch_target(&bytes, &mut cursor, offset, code.len())?;
                let low = read_i32_at(&bytes, &mut cursor)?;
                let high = read_i32_at(&bytes, &mut cursor)?;
                let count = (high as i64 - low as i64 + 1) as usize;
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    targets.push(switch_target(&bytes, &mut cursor, offset, code.len())?);
                }
                InsnKind::TableSwitch {
                    default,
                    low,
                    high,
                    targets,
                }
            }
            opcodes::LOOKUPSWITCH => {
                let base = 1 + padding(offset);
                let mut cursor = base;
                let default = switch_target(&bytes, &mut cursor, offset, code.len())?;
                let npairs = read_i32_at(&bytes, &mut cursor)?;
                let mut pairs = Vec::with_capacity(npairs as usize);
                for _ in 0..npairs {
                    let key = read_i32_at(&bytes, &mut cursor)?;
                    let target = switch_target(&bytes, &mut cursor, offset, code.len())?;
                    pairs.push((key, target));
                }
                InsnKind::LookupSwitch { default, pairs }
            }
            _ => InsnKind::Plain,
        };
        insns.push(Insn {
            offset: offset as u32,
            bytes,
            kind,
        });
        offset += length;
    }
    Ok(insns)
}

fn branch_target(offset: usize, rel: i64, code_len: usize) -> Result<u32> {
    let target = offset as i64 + rel;
    if target < 0 || target >= code_len as i64 {
        anyhow::bail!("branch target {} out of bounds at offset {}", target, offset);
    }
    Ok(target as u32)
}

fn switch_target(bytes: &[u8], cursor: &mut usize, offset: usize, code_len: usize) -> Result<u32> {
    let rel = read_i32_at(bytes, cursor)? as i64;
    branch_target(offset, rel, code_len)
}

fn read_i32_at(bytes: &[u8], cursor: &mut usize) -> Result<i32> {
    let slice = bytes
        .get(*cursor..*cursor + 4)
        .context("switch payload out of bounds")?;
    *cursor += 4;
    Ok(i32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

/// Length in bytes of the instruction starting at `offset`.
pub(crate) fn opcode_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code[offset];
    let length = match opcode {
        0x00..=0x0f => 1,
        0x10 => 2,
        0x11 => 3,
        opcodes::LDC => 2,
        opcodes::LDC_W | opcodes::LDC2_W => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x4e => 1,
        0x4f..=0x56 => 1,
        0x57..=0x5f => 1,
        0x60..=0x83 => 1,
        0x84 => 3,
        0x85..=0x98 => 1,
        0x99..=0xa6 => 3,
        opcodes::GOTO | opcodes::JSR => 3,
        opcodes::RET => 2,
        opcodes::TABLESWITCH => tableswitch_length(code, offset)?,
        opcodes::LOOKUPSWITCH => lookupswitch_length(code, offset)?,
        0xac..=0xb1 => 1,
        0xb2..=0xb5 => 3,
        opcodes::INVOKEVIRTUAL | opcodes::INVOKESPECIAL | opcodes::INVOKESTATIC => 3,
        opcodes::INVOKEINTERFACE | opcodes::INVOKEDYNAMIC => 5,
        0xbb => 3,
        0xbc => 2,
        opcodes::ANEWARRAY => 3,
        0xbe | 0xbf => 1,
        0xc0 | 0xc1 => 3,
        0xc2 | 0xc3 => 1,
        opcodes::WIDE => wide_length(code, offset)?,
        0xc5 => 4,
        opcodes::IFNULL | opcodes::IFNONNULL => 3,
        opcodes::GOTO_W | opcodes::JSR_W => 5,
        0xca => 1,
        0xfe | 0xff => 1,
        _ => anyhow::bail!("unsupported opcode 0x{:02x}", opcode),
    };
    Ok(length)
}

fn tableswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = high
        .checked_sub(low)
        .and_then(|v| v.checked_add(1))
        .context("invalid tableswitch range")?;
    if count < 0 {
        anyhow::bail!("invalid tableswitch range");
    }
    Ok(1 + padding + 12 + (count as usize) * 4)
}

fn lookupswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let npairs = read_i32(code, base + 4)?;
    if npairs < 0 {
        anyhow::bail!("invalid lookupswitch pairs");
    }
    Ok(1 + padding + 8 + (npairs as usize) * 8)
}

fn wide_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code.get(offset + 1).copied().context("missing wide opcode")?;
    if opcode == 0x84 { Ok(6) } else { Ok(4) }
}

/// Alignment padding after a switch opcode at `offset`.
pub(crate) fn padding(offset: usize) -> usize {
    (4 - ((offset + 1) % 4)) % 4
}

fn read_i32(code: &[u8], offset: usize) -> Result<i32> {
    let slice = code
        .get(offset..offset + 4)
        .context("bytecode i32 out of bounds")?;
    Ok(i32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

/// Splice the plan's fragments into a method body and re-emit it.
fn splice(code: &CodeAttribute, plan: &ProbePlan) -> Result<CodeAttribute> {
    let insns = decode(&code.code)?;
    let entry = plan.entry_fragment();

    // A fragment attached to an instruction executes on every path reaching
    // it: branches into an exit site land at the fragment start. The entry
    // fragment is not attached to the first instruction, so back edges to
    // offset 0 do not re-run it.
    let prefixes: Vec<Vec<u8>> = insns
        .iter()
        .map(|insn| match insn.opcode() {
            opcodes::ARETURN => plan.return_fragment(),
            opcodes::ATHROW => plan.throw_fragment(),
            _ => Vec::new(),
        })
        .collect();

    let (fragment_starts, positions, new_len) = layout(&insns, &prefixes, entry.len() as u32)?;
    if new_len > u16::MAX as u32 {
        anyhow::bail!("instrumented body grew beyond the 64KiB method limit");
    }

    let target_map: BTreeMap<u32, u32> = insns
        .iter()
        .enumerate()
        .map(|(index, insn)| (insn.offset, fragment_starts[index]))
        .collect();
    let remap = |pc: u32| -> Result<u32> {
        target_map
            .get(&pc)
            .copied()
            .with_context(|| format!("offset {pc} is not an instruction boundary"))
    };

    let mut out = entry;
    for (index, insn) in insns.iter().enumerate() {
        out.extend_from_slice(&prefixes[index]);
        debug_assert_eq!(out.len() as u32, positions[index]);
        encode(insn, positions[index], &remap, &mut out)?;
    }
    debug_assert_eq!(out.len() as u32, new_len);

    let mut exception_table = Vec::with_capacity(code.exception_table.len());
    for entry in &code.exception_table {
        let end_pc = if entry.end_pc as u32 as usize == code.code.len() {
            new_len
        } else {
            remap(entry.end_pc as u32).context("remap exception range end")?
        };
        exception_table.push(ExceptionEntry {
            start_pc: remap(entry.start_pc as u32).context("remap exception range start")? as u16,
            end_pc: end_pc as u16,
            handler_pc: remap(entry.handler_pc as u32).context("remap exception handler")? as u16,
            catch_type: entry.catch_type,
        });
    }

    // StackMapTable and local-variable debug tables are invalidated by the
    // splice; exact frame recomputation is the host driver's concern. Line
    // numbers survive with remapped offsets.
    let mut attributes = Vec::new();
    for attribute in &code.attributes {
        if attribute.name == "LineNumberTable" {
            attributes.push(remap_line_numbers(attribute, &remap)?);
        }
    }

    Ok(CodeAttribute {
        max_stack: code.max_stack.saturating_add(2).max(PROBE_STACK),
        max_locals: plan.probe_slot + 1,
        code: out,
        exception_table,
        attributes,
    })
}

/// Assign positions to fragments and instructions until stable.
///
/// Switch instructions change length with their alignment, so layout iterates;
/// it converges in a few rounds for any realistic body.
fn layout(
    insns: &[Insn],
    prefixes: &[Vec<u8>],
    entry_len: u32,
) -> Result<(Vec<u32>, Vec<u32>, u32)> {
    let mut fragment_starts = vec![0u32; insns.len()];
    let mut positions = vec![0u32; insns.len()];
    let mut new_len = 0u32;
    for _ in 0..16 {
        let mut pos = entry_len;
        let mut changed = false;
        for (index, insn) in insns.iter().enumerate() {
            if fragment_starts[index] != pos {
                fragment_starts[index] = pos;
                changed = true;
            }
            pos += prefixes[index].len() as u32;
            if positions[index] != pos {
                positions[index] = pos;
                changed = true;
            }
            pos += encoded_length(insn, pos);
        }
        if new_len != pos {
            new_len = pos;
            changed = true;
        }
        if !changed {
            return Ok((fragment_starts, positions, new_len));
        }
    }
    anyhow::bail!("instruction layout did not converge");
}

fn encoded_length(insn: &Insn, pos: u32) -> u32 {
    match &insn.kind {
        InsnKind::TableSwitch { targets, .. } => {
            (1 + padding(pos as usize) + 12 + targets.len() * 4) as u32
        }
        InsnKind::LookupSwitch { pairs, .. } => {
            (1 + padding(pos as usize) + 8 + pairs.len() * 8) as u32
        }
        _ => insn.bytes.len() as u32,
    }
}

fn encode<F>(insn: &Insn, pos: u32, remap: &F, out: &mut Vec<u8>) -> Result<()>
where
    F: Fn(u32) -> Result<u32>,
{
    match &insn.kind {
        InsnKind::Plain => out.extend_from_slice(&insn.bytes),
        InsnKind::Branch16 { target } => {
            let rel = remap(*target)? as i64 - pos as i64;
            let rel = i16::try_from(rel)
                .map_err(|_| anyhow::anyhow!("branch offset {rel} overflows 16 bits"))?;
            out.push(insn.opcode());
            out.extend_from_slice(&rel.to_be_bytes());
        }
        InsnKind::Branch32 { target } => {
            let rel = remap(*target)? as i64 - pos as i64;
            out.push(insn.opcode());
            out.extend_from_slice(&(rel as i32).to_be_bytes());
        }
        InsnKind::TableSwitch {
            default,
            low,
            high,
            targets,
        } => {
            out.push(insn.opcode());
            out.resize(out.len() + padding(pos as usize), 0);
            let default_rel = remap(*default)? as i64 - pos as i64;
            out.extend_from_slice(&(default_rel as i32).to_be_bytes());
            out.extend_from_slice(&low.to_be_bytes());
            out.extend_from_slice(&high.to_be_bytes());
            for target in targets {
                let rel = remap(*target)? as i64 - pos as i64;
                out.extend_from_slice(&(rel as i32).to_be_bytes());
            }
        }
        InsnKind::LookupSwitch { default, pairs } => {
            out.push(insn.opcode());
            out.resize(out.len() + padding(pos as usize), 0);
            let default_rel = remap(*default)? as i64 - pos as i64;
            out.extend_from_slice(&(default_rel as i32).to_be_bytes());
            out.extend_from_slice(&(pairs.len() as i32).to_be_bytes());
            for (key, target) in pairs {
                let rel = remap(*target)? as i64 - pos as i64;
                out.extend_from_slice(&key.to_be_bytes());
                out.extend_from_slice(&(rel as i32).to_be_bytes());
            }
        }
    }
    Ok(())
}

fn remap_line_numbers<F>(attribute: &RawAttribute, remap: &F) -> Result<RawAttribute>
where
    F: Fn(u32) -> Result<u32>,
{
    let payload = &attribute.payload;
    let mut offset = 0usize;
    let count = crate::classfile::read_u16(payload, &mut offset)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let start_pc = crate::classfile::read_u16(payload, &mut offset)?;
        let line = crate::classfile::read_u16(payload, &mut offset)?;
        // Entries pointing into the middle of an instruction are dropped
        // rather than guessed at.
        if let Ok(mapped) = remap(start_pc as u32) {
            entries.push((mapped as u16, line));
        }
    }
    let mut rebuilt = Vec::with_capacity(2 + entries.len() * 4);
    write_u16(&mut rebuilt, entries.len() as u16);
    for (start_pc, line) in entries {
        write_u16(&mut rebuilt, start_pc);
        write_u16(&mut rebuilt, line);
    }
    Ok(RawAttribute {
        name_index: attribute.name_index,
        name: attribute.name.clone(),
        payload: rebuilt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ClassFileBuilder, MethodCode};

    fn options() -> InstrumentOptions {
        InstrumentOptions::new(TrackingMode::Full)
    }

    fn rewritten_code(bytes: &[u8]) -> (Vec<Insn>, CodeAttribute) {
        let raw = RawClass::parse(bytes).expect("parse rewritten class");
        let method = raw
            .methods
            .iter()
            .find(|method| {
                raw.pool
                    .utf8_at(method.name_index)
                    .is_some_and(|name| name == "probe_me")
            })
            .expect("find method");
        let code_attr = method
            .attributes
            .iter()
            .find(|attribute| attribute.name == "Code")
            .expect("code attribute");
        let code = CodeAttribute::parse(&code_attr.payload, &raw.pool).expect("parse code");
        (decode(&code.code).expect("decode code"), code)
    }

    fn identity_method() -> MethodCode {
        // aload_1; areturn
        MethodCode {
            name: "probe_me".to_string(),
            descriptor: "(Ljava/lang/String;)Ljava/lang/String;".to_string(),
            access_flags: 0x0001,
            max_stack: 1,
            max_locals: 2,
            code: vec![0x2b, 0xb0],
            exception_table: Vec::new(),
        }
    }

    #[test]
    fn entry_fragment_precedes_original_body() {
        let bytes = ClassFileBuilder::new("com/example/C", "java/lang/Object")
            .method(identity_method())
            .finish();
        let outcome = instrument_class(&bytes, &options()).expect("instrument");
        assert_eq!(outcome.methods_instrumented, 1);
        let rewritten = outcome.bytes.expect("rewritten bytes");
        let (insns, code) = rewritten_code(&rewritten);

        // ldc class, ldc method, field array, param array, enter, astore.
        assert_eq!(insns[0].opcode(), opcodes::LDC);
        assert_eq!(insns[1].opcode(), opcodes::LDC);
        let opcode_run: Vec<u8> = insns.iter().map(Insn::opcode).collect();
        assert!(opcode_run.contains(&opcodes::ANEWARRAY));
        assert!(opcode_run.contains(&opcodes::INVOKESTATIC));
        // Probe handle lands in the fresh slot past the original locals.
        assert_eq!(code.max_locals, 3);
        assert!(code.max_stack >= PROBE_STACK);
        // The original body still ends with areturn, preceded by the exit
        // fragment's invokestatic.
        let last = insns.last().expect("last insn");
        assert_eq!(last.opcode(), opcodes::ARETURN);
        assert_eq!(insns[insns.len() - 2].opcode(), opcodes::INVOKESTATIC);
        assert_eq!(insns[insns.len() - 3].opcode(), opcodes::SWAP);
        // Probe handle loads from slot 2 via the short form.
        assert_eq!(insns[insns.len() - 4].opcode(), opcodes::ALOAD_0 + 2);
        assert_eq!(insns[insns.len() - 5].opcode(), opcodes::DUP);
    }

    #[test]
    fn parameters_are_sampled_in_declaration_order() {
        // static probe_me(String, long, String): slots 0, 1/2, 3.
        let method = MethodCode {
            name: "probe_me".to_string(),
            descriptor: "(Ljava/lang/String;JLjava/lang/String;)Ljava/lang/String;".to_string(),
            access_flags: 0x0009,
            max_stack: 1,
            max_locals: 4,
            code: vec![0x01, 0xb0],
            exception_table: Vec::new(),
        };
        let bytes = ClassFileBuilder::new("com/example/C", "java/lang/Object")
            .method(method)
            .finish();
        let outcome =
            instrument_class(&bytes, &InstrumentOptions::new(TrackingMode::Outcomes))
                .expect("instrument");
        let (insns, _) = rewritten_code(&outcome.bytes.expect("rewritten"));
        let loads: Vec<u8> = insns
            .iter()
            .map(Insn::opcode)
            .filter(|op| (opcodes::ALOAD_0..=opcodes::ALOAD_0 + 3).contains(op))
            .collect();
        // aload_0 then aload_3 for the two reference parameters; the long in
        // between consumed two slots.
        assert_eq!(loads, vec![opcodes::ALOAD_0, opcodes::ALOAD_0 + 3]);
    }

    #[test]
    fn branches_into_an_exit_site_run_the_fragment() {
        // 0: aload_1
        // 1: ifnull -> 5
        // 4: aconst_null
        // 5: areturn
        let method = MethodCode {
            name: "probe_me".to_string(),
            descriptor: "(Ljava/lang/String;)Ljava/lang/String;".to_string(),
            access_flags: 0x0001,
            max_stack: 1,
            max_locals: 2,
            code: vec![0x2b, 0xc6, 0x00, 0x04, 0x01, 0xb0],
            exception_table: Vec::new(),
        };
        let bytes = ClassFileBuilder::new("com/example/C", "java/lang/Object")
            .method(method)
            .finish();
        let outcome = instrument_class(&bytes, &options()).expect("instrument");
        let (insns, _) = rewritten_code(&outcome.bytes.expect("rewritten"));

        let branch = insns
            .iter()
            .find(|insn| insn.opcode() == opcodes::IFNULL)
            .expect("ifnull survived");
        let InsnKind::Branch16 { .. } = branch.kind else {
            panic!("ifnull decoded as branch");
        };
        // Recompute the absolute target from the re-encoded bytes.
        let rel = i16::from_be_bytes([branch.bytes[1], branch.bytes[2]]) as i64;
        let target = (branch.offset as i64 + rel) as u32;
        let areturn = insns
            .iter()
            .rev()
            .find(|insn| insn.opcode() == opcodes::ARETURN)
            .expect("areturn");
        // dup, aload_2 (probe slot short form), swap, invokestatic.
        let fragment_len = 1 + 1 + 1 + 3;
        assert_eq!(target, areturn.offset - fragment_len);
    }

    #[test]
    fn backward_branches_skip_the_entry_fragment() {
        // 0: aload_1      <- loop target
        // 1: ifnull -> 0  (degenerate loop, never taken at run time)
        // 4: aload_1
        // 5: areturn
        let method = MethodCode {
            name: "probe_me".to_string(),
            descriptor: "(Ljava/lang/String;)Ljava/lang/String;".to_string(),
            access_flags: 0x0001,
            max_stack: 1,
            max_locals: 2,
            code: vec![0x2b, 0xc6, 0xff, 0xff, 0x2b, 0xb0],
            exception_table: Vec::new(),
        };
        let bytes = ClassFileBuilder::new("com/example/C", "java/lang/Object")
            .method(method)
            .finish();
        let outcome = instrument_class(&bytes, &options()).expect("instrument");
        let (insns, _) = rewritten_code(&outcome.bytes.expect("rewritten"));
        let branch_index = insns
            .iter()
            .position(|insn| insn.opcode() == opcodes::IFNULL)
            .expect("ifnull");
        let branch = &insns[branch_index];
        // The original first instruction sits right before the branch; the
        // entry fragment's own aload_1 (parameter sampling) precedes both.
        let loop_head = &insns[branch_index - 1];
        assert_eq!(loop_head.opcode(), 0x2b);
        let rel = i16::from_be_bytes([branch.bytes[1], branch.bytes[2]]) as i64;
        assert_eq!((branch.offset as i64 + rel) as u32, loop_head.offset);
        // The back edge lands past the entry fragment, not at code start.
        assert!(loop_head.offset > 0);
    }

    #[test]
    fn exception_table_and_throw_sites_are_remapped() {
        // 0: aload_1
        // 1: areturn
        // 2: athrow     <- handler
        let method = MethodCode {
            name: "probe_me".to_string(),
            descriptor: "(Ljava/lang/String;)Ljava/lang/String;".to_string(),
            access_flags: 0x0001,
            max_stack: 1,
            max_locals: 2,
            code: vec![0x2b, 0xb0, 0xbf],
            exception_table: vec![(0, 2, 2, 0)],
        };
        let bytes = ClassFileBuilder::new("com/example/C", "java/lang/Object")
            .method(method)
            .finish();
        let outcome = instrument_class(&bytes, &options()).expect("instrument");
        let (insns, code) = rewritten_code(&outcome.bytes.expect("rewritten"));

        let athrow = insns
            .iter()
            .find(|insn| insn.opcode() == opcodes::ATHROW)
            .expect("athrow");
        let handler = code.exception_table[0];
        // The handler lands at the throw fragment, not the athrow itself.
        let throw_fragment_len = 1 + 3; // aload_2 (probe slot), invokestatic
        assert_eq!(handler.handler_pc as u32, athrow.offset - throw_fragment_len);
        // The protected range starts at the first original instruction, which
        // follows the entry fragment's trailing astore_2.
        let astore_index = insns
            .iter()
            .position(|insn| insn.opcode() == opcodes::ASTORE_0 + 2)
            .expect("entry fragment astore");
        let first_original = &insns[astore_index + 1];
        assert_eq!(handler.start_pc as u32, first_original.offset);
        assert_eq!(handler.end_pc as u32, athrow.offset - throw_fragment_len);
    }

    #[test]
    fn tableswitch_padding_is_relaid_out() {
        // 0:  iload_2
        // 1:  tableswitch { 0 -> 24, 1 -> 26 } default -> 26 (2 pad bytes)
        // 24: aload_1
        // 25: areturn
        // 26: aconst_null
        // 27: areturn
        let mut code = vec![0x1c, opcodes::TABLESWITCH, 0, 0];
        let rel = |target: i64| ((target - 1) as i32).to_be_bytes();
        code.extend_from_slice(&rel(26)); // default
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&1i32.to_be_bytes());
        code.extend_from_slice(&rel(24));
        code.extend_from_slice(&rel(26));
        code.extend_from_slice(&[0x2b, 0xb0, 0x01, 0xb0]);
        assert_eq!(code.len(), 28);
        let method = MethodCode {
            name: "probe_me".to_string(),
            descriptor: "(Ljava/lang/String;I)Ljava/lang/String;".to_string(),
            access_flags: 0x0001,
            max_stack: 1,
            max_locals: 3,
            code,
            exception_table: Vec::new(),
        };
        let bytes = ClassFileBuilder::new("com/example/C", "java/lang/Object")
            .method(method)
            .finish();
        let outcome = instrument_class(&bytes, &options()).expect("instrument");
        let (insns, _) = rewritten_code(&outcome.bytes.expect("rewritten"));
        let switch = insns
            .iter()
            .find(|insn| insn.opcode() == opcodes::TABLESWITCH)
            .expect("tableswitch");
        let InsnKind::TableSwitch { default, targets, .. } = &switch.kind else {
            panic!("decoded as tableswitch");
        };
        // Every remapped arm still lands on an instruction boundary, and on
        // the same instruction it named before the splice.
        let landing = |target: u32| {
            insns
                .iter()
                .find(|insn| insn.offset == target)
                .expect("switch target is an instruction boundary")
                .opcode()
        };
        assert_eq!(landing(targets[0]), 0x2b); // case 0 -> aload_1
        assert_eq!(landing(targets[1]), 0x01); // case 1 -> aconst_null
        assert_eq!(landing(*default), 0x01);
    }

    #[test]
    fn sixty_five_reference_parameters_fail_fast() {
        let descriptor = format!("({})Ljava/lang/String;", "Ljava/lang/Object;".repeat(65));
        let method = MethodCode {
            name: "probe_me".to_string(),
            descriptor,
            access_flags: 0x0009,
            max_stack: 1,
            max_locals: 66,
            code: vec![0x01, 0xb0],
            exception_table: Vec::new(),
        };
        let bytes = ClassFileBuilder::new("com/example/C", "java/lang/Object")
            .method(method)
            .finish();
        let error = instrument_class(&bytes, &InstrumentOptions::new(TrackingMode::Outcomes))
            .expect_err("65 parameters must be rejected");
        assert!(format!("{error:#}").contains("unsupported"));
    }

    #[test]
    fn sixty_four_reference_parameters_succeed() {
        let descriptor = format!("({})Ljava/lang/String;", "Ljava/lang/Object;".repeat(64));
        let method = MethodCode {
            name: "probe_me".to_string(),
            descriptor,
            access_flags: 0x0009,
            max_stack: 1,
            max_locals: 65,
            code: vec![0x01, 0xb0],
            exception_table: Vec::new(),
        };
        let bytes = ClassFileBuilder::new("com/example/C", "java/lang/Object")
            .method(method)
            .finish();
        let outcome = instrument_class(&bytes, &InstrumentOptions::new(TrackingMode::Outcomes))
            .expect("64 parameters are supported");
        assert_eq!(outcome.methods_instrumented, 1);
    }

    #[test]
    fn field_sampling_reads_the_receiver() {
        let method = MethodCode {
            name: "probe_me".to_string(),
            descriptor: "()Ljava/lang/String;".to_string(),
            access_flags: 0x0001,
            max_stack: 1,
            max_locals: 1,
            code: vec![0x01, 0xb0],
            exception_table: Vec::new(),
        };
        let bytes = ClassFileBuilder::new("com/example/C", "java/lang/Object")
            .field("name", "Ljava/lang/String;", 0x0002)
            .field("count", "I", 0x0002)
            .field("shared", "Ljava/lang/Object;", 0x000a) // static, skipped
            .method(method)
            .finish();
        let outcome = instrument_class(&bytes, &options()).expect("instrument");
        let (insns, _) = rewritten_code(&outcome.bytes.expect("rewritten"));
        let getfields = insns
            .iter()
            .filter(|insn| insn.opcode() == opcodes::GETFIELD)
            .count();
        // Only the one nullable instance field is sampled.
        assert_eq!(getfields, 1);
    }

    #[test]
    fn ineligible_classes_pass_through_untouched() {
        let ctor_only = MethodCode {
            name: "<init>".to_string(),
            descriptor: "()V".to_string(),
            access_flags: 0x0001,
            max_stack: 1,
            max_locals: 1,
            code: vec![0xb1],
            exception_table: Vec::new(),
        };
        let bytes = ClassFileBuilder::new("com/example/C", "java/lang/Object")
            .method(ctor_only)
            .finish();
        let outcome = instrument_class(&bytes, &options()).expect("instrument");
        assert!(outcome.bytes.is_none());
        assert_eq!(outcome.methods_instrumented, 0);
        assert_eq!(outcome.methods_skipped, 1);
    }
}
