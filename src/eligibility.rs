use anyhow::{Context, Result};

use crate::descriptor::{ReturnKind, method_return_kind, nullable_param_slots};
use crate::ir::MethodInfo;

/// Which nullness surfaces the deployment tracks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TrackingMode {
    /// Sample receiver fields at entry only.
    Fields,
    /// Sample parameters at entry and classify every exit.
    Outcomes,
    /// Both of the above.
    Full,
}

impl TrackingMode {
    pub(crate) fn tracks_fields(self) -> bool {
        matches!(self, TrackingMode::Fields | TrackingMode::Full)
    }

    pub(crate) fn tracks_outcomes(self) -> bool {
        matches!(self, TrackingMode::Outcomes | TrackingMode::Full)
    }
}

/// Decide whether a method receives instrumentation.
///
/// Rules apply in order and short-circuit:
/// 1. constructors never qualify (receiver fields are not yet initialized);
/// 2. only methods with a body can be spliced;
/// 3. field tracking needs a receiver, so static methods are out;
/// 4. outcome tracking needs a nullable surface: a reference return type or
///    at least one reference parameter.
pub(crate) fn is_suitable(mode: TrackingMode, method: &MethodInfo) -> Result<bool> {
    if method.name == "<init>" {
        return Ok(false);
    }
    if method.is_abstract || !method.has_code {
        return Ok(false);
    }
    if mode.tracks_fields() && method.is_static {
        return Ok(false);
    }
    if mode.tracks_outcomes() {
        let return_kind = method_return_kind(&method.descriptor)
            .with_context(|| format!("descriptor of {}", method.name))?;
        if return_kind != ReturnKind::Reference
            && nullable_param_slots(&method.descriptor, method.is_static)?.is_empty()
        {
            return Ok(false);
        }
    }
    Ok(true)
}
