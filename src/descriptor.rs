use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::{MethodDescriptor, TypeDescriptor};

/// Whether a value of this type can hold `null`.
///
/// This predicate is the single source of truth for slot tracking: eligibility,
/// probe synthesis, and bitmap decoding all consult it, so bit positions agree
/// between producer and consumer.
pub(crate) fn is_nullable(ty: &TypeDescriptor) -> bool {
    matches!(ty, TypeDescriptor::Object(_) | TypeDescriptor::Array(_, _))
}

/// Field-descriptor form of the same predicate: object (`L...;`) and array
/// (`[...`) descriptors are nullable, primitives are not.
pub(crate) fn is_nullable_field(descriptor: &str) -> bool {
    descriptor.starts_with('L') || descriptor.starts_with('[')
}

/// Return kind of a JVM method descriptor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ReturnKind {
    Void,
    Primitive,
    Reference,
}

/// Determine the return kind from a JVM method descriptor.
pub(crate) fn method_return_kind(descriptor: &str) -> Result<ReturnKind> {
    let descriptor = MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    let kind = match descriptor.return_type() {
        TypeDescriptor::Void => ReturnKind::Void,
        ty if is_nullable(ty) => ReturnKind::Reference,
        _ => ReturnKind::Primitive,
    };
    Ok(kind)
}

/// Walk the parameter list of a method descriptor and return the local slot
/// of every nullable parameter, in declaration order.
///
/// Longs and doubles occupy two consecutive slots, so the walk keeps a running
/// cursor instead of assuming one slot per parameter. Instance methods start
/// at slot 1 (slot 0 is the receiver).
pub(crate) fn nullable_param_slots(descriptor: &str, is_static: bool) -> Result<Vec<u16>> {
    let descriptor = MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    let mut slot: u16 = if is_static { 0 } else { 1 };
    let mut slots = Vec::new();
    for param in descriptor.parameter_types() {
        if is_nullable(param) {
            slots.push(slot);
        }
        slot += if matches!(param, TypeDescriptor::Long | TypeDescriptor::Double) {
            2
        } else {
            1
        };
    }
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_and_array_types_are_nullable() {
        let slots = nullable_param_slots("(Ljava/lang/String;[IJ)V", true).expect("walk");
        assert_eq!(slots, vec![0, 1]);
    }

    #[test]
    fn wide_params_advance_cursor_by_two() {
        // long at slots 1/2, double at 4/5: the trailing object lands at slot 6.
        let slots =
            nullable_param_slots("(JLjava/lang/String;DLjava/lang/Object;)V", false).expect("walk");
        assert_eq!(slots, vec![3, 6]);
    }

    #[test]
    fn static_methods_start_at_slot_zero() {
        let slots = nullable_param_slots("(Ljava/lang/String;)V", true).expect("walk");
        assert_eq!(slots, vec![0]);
        let slots = nullable_param_slots("(Ljava/lang/String;)V", false).expect("walk");
        assert_eq!(slots, vec![1]);
    }

    #[test]
    fn field_descriptors_classify_like_method_parameters() {
        assert!(is_nullable_field("Ljava/lang/String;"));
        assert!(is_nullable_field("[I"));
        assert!(!is_nullable_field("I"));
        assert!(!is_nullable_field("D"));
    }

    #[test]
    fn return_kinds() {
        assert_eq!(method_return_kind("()V").expect("kind"), ReturnKind::Void);
        assert_eq!(
            method_return_kind("()I").expect("kind"),
            ReturnKind::Primitive
        );
        assert_eq!(
            method_return_kind("()Ljava/lang/String;").expect("kind"),
            ReturnKind::Reference
        );
        assert_eq!(
            method_return_kind("()[B").expect("kind"),
            ReturnKind::Reference
        );
    }
}
