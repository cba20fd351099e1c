use anyhow::{Context, Result};

/// Hard capacity of the bitmap representation.
pub(crate) const MAX_SLOTS: usize = 64;

/// Fixed-width nullness bitmap over up to 64 tracked slots.
///
/// Bit convention, used identically by the probe side and the decode side:
/// slots are packed in declaration order by shifting the accumulator left and
/// OR-ing in 1 for a non-null slot, so the FIRST tracked slot ends up as the
/// most significant populated bit. Rendering walks the same order, making the
/// first slot the leftmost character.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct Bitmap {
    bits: u64,
    len: u8,
}

impl Bitmap {
    /// Pack slot states in declaration order; `true` means non-null.
    pub(crate) fn pack(slots: &[bool]) -> Result<Self> {
        if slots.len() > MAX_SLOTS {
            anyhow::bail!(
                "{} tracked slots exceed the supported maximum of {}",
                slots.len(),
                MAX_SLOTS
            );
        }
        let mut bits = 0u64;
        for &non_null in slots {
            bits = (bits << 1) | u64::from(non_null);
        }
        Ok(Self {
            bits,
            len: slots.len() as u8,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.len as usize
    }

    /// State of the i-th tracked slot, in declaration order.
    pub(crate) fn get(&self, index: usize) -> bool {
        debug_assert!(index < self.len());
        let shift = self.len as usize - 1 - index;
        (self.bits >> shift) & 1 == 1
    }

    /// Render MSB-first; the empty string for zero tracked slots.
    pub(crate) fn encode(&self) -> String {
        let mut out = String::with_capacity(self.len());
        for index in 0..self.len() {
            out.push(if self.get(index) { '1' } else { '0' });
        }
        out
    }

    /// Parse the `encode` rendering back into a bitmap.
    pub(crate) fn decode(text: &str) -> Result<Self> {
        if text.len() > MAX_SLOTS {
            anyhow::bail!(
                "bitmap of width {} exceeds the supported maximum of {}",
                text.len(),
                MAX_SLOTS
            );
        }
        let mut bits = 0u64;
        for ch in text.chars() {
            let bit = match ch {
                '0' => 0,
                '1' => 1,
                _ => anyhow::bail!("invalid bitmap character {ch:?}"),
            };
            bits = (bits << 1) | bit;
        }
        Ok(Self {
            bits,
            len: text.len() as u8,
        })
    }
}

/// How an instrumented invocation left the method.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum Outcome {
    ReturnedNull,
    ReturnedNonNull,
    Threw,
}

impl Outcome {
    pub(crate) fn code(self) -> u8 {
        match self {
            Outcome::ReturnedNull => 0,
            Outcome::ReturnedNonNull => 1,
            Outcome::Threw => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Outcome::ReturnedNull),
            1 => Ok(Outcome::ReturnedNonNull),
            2 => Ok(Outcome::Threw),
            other => anyhow::bail!("unknown outcome code {other}"),
        }
    }
}

/// One recorded snapshot of nullness plus outcome for a single invocation.
///
/// Wire format, one observation per line:
/// `class,method,fieldBits,paramBits,outcomeCode` with both bitmaps rendered
/// via [`Bitmap::encode`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Observation {
    pub(crate) class_id: String,
    pub(crate) method_id: String,
    pub(crate) fields: Bitmap,
    pub(crate) params: Bitmap,
    pub(crate) outcome: Outcome,
}

impl Observation {
    /// Build an observation from sampled slot states.
    ///
    /// Fails when either slot list exceeds the 64-slot capacity; truncation is
    /// never performed.
    pub(crate) fn new(
        class_id: impl Into<String>,
        method_id: impl Into<String>,
        field_slots: &[bool],
        param_slots: &[bool],
        outcome: Outcome,
    ) -> Result<Self> {
        let class_id = class_id.into();
        let method_id = method_id.into();
        let fields = Bitmap::pack(field_slots)
            .with_context(|| format!("field slots of {class_id}.{method_id}"))?;
        let params = Bitmap::pack(param_slots)
            .with_context(|| format!("parameter slots of {class_id}.{method_id}"))?;
        Ok(Self {
            class_id,
            method_id,
            fields,
            params,
            outcome,
        })
    }

    /// Parse one probe event line.
    pub(crate) fn parse_line(line: &str) -> Result<Self> {
        let mut parts = line.split(',');
        let mut next = |what: &str| {
            parts
                .next()
                .with_context(|| format!("event line missing {what}: {line:?}"))
        };
        let class_id = next("class")?.to_string();
        let method_id = next("method")?.to_string();
        let fields = Bitmap::decode(next("field bitmap")?).context("field bitmap")?;
        let params = Bitmap::decode(next("parameter bitmap")?).context("parameter bitmap")?;
        let outcome_text = next("outcome")?;
        if parts.next().is_some() {
            anyhow::bail!("event line has trailing fields: {line:?}");
        }
        let code: u8 = outcome_text
            .parse()
            .with_context(|| format!("parse outcome {outcome_text:?}"))?;
        Ok(Self {
            class_id,
            method_id,
            fields,
            params,
            outcome: Outcome::from_code(code)?,
        })
    }

    pub(crate) fn render_line(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.class_id,
            self.method_id,
            self.fields.encode(),
            self.params.encode(),
            self.outcome.code()
        )
    }

    pub(crate) fn key(&self) -> AggregateKey {
        AggregateKey {
            class_id: self.class_id.clone(),
            method_id: self.method_id.clone(),
            fields: self.fields,
            params: self.params,
            outcome: self.outcome,
        }
    }
}

/// Aggregation key: the full signature of an observation.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct AggregateKey {
    pub(crate) class_id: String,
    pub(crate) method_id: String,
    pub(crate) fields: Bitmap,
    pub(crate) params: Bitmap,
    pub(crate) outcome: Outcome,
}
