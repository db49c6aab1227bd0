//! ABOUTME: Single cron field parsing and canonical formatting
//! ABOUTME: Supports *, numbers, ranges, lists and steps within field bounds

use std::collections::BTreeSet;
use std::fmt;

use crate::ClockError;

/// One comma-separated part of a field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldPart {
    Any,
    Value(u32),
    Range(u32, u32),
    /// `*/step`
    Step(u32),
    /// `a-b/step`
    RangeStep(u32, u32, u32),
}

impl fmt::Display for FieldPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Value(v) => write!(f, "{}", v),
            Self::Range(a, b) => write!(f, "{}-{}", a, b),
            Self::Step(s) => write!(f, "*/{}", s),
            Self::RangeStep(a, b, s) => write!(f, "{}-{}/{}", a, b, s),
        }
    }
}

/// A parsed cron field: the original parts for canonical formatting plus the
/// expanded set of allowed values for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    parts: Vec<FieldPart>,
    allowed: BTreeSet<u32>,
    min: u32,
    max: u32,
}

impl FieldSpec {
    /// Parse one whitespace-delimited field against inclusive bounds
    pub fn parse(input: &str, name: &str, min: u32, max: u32) -> Result<Self, ClockError> {
        if input.is_empty() {
            return Err(ClockError::Parse(format!("empty {} field", name)));
        }

        let mut parts = Vec::new();
        let mut allowed = BTreeSet::new();

        for raw in input.split(',') {
            let part = Self::parse_part(raw, name, min, max)?;
            Self::expand(&part, min, max, &mut allowed);
            parts.push(part);
        }

        Ok(Self {
            parts,
            allowed,
            min,
            max,
        })
    }

    fn parse_part(raw: &str, name: &str, min: u32, max: u32) -> Result<FieldPart, ClockError> {
        if raw.is_empty() {
            return Err(ClockError::Parse(format!("empty list entry in {} field", name)));
        }

        let (base, step) = match raw.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step.parse().map_err(|_| {
                    ClockError::Parse(format!("invalid step '{}' in {} field", step, name))
                })?;
                if step == 0 {
                    return Err(ClockError::Parse(format!("zero step in {} field", name)));
                }
                (base, Some(step))
            }
            None => (raw, None),
        };

        let parse_num = |s: &str| -> Result<u32, ClockError> {
            let v: u32 = s.parse().map_err(|_| {
                ClockError::Parse(format!("invalid value '{}' in {} field", s, name))
            })?;
            if v < min || v > max {
                return Err(ClockError::Parse(format!(
                    "value {} out of range {}-{} in {} field",
                    v, min, max, name
                )));
            }
            Ok(v)
        };

        let part = if base == "*" {
            match step {
                Some(s) => FieldPart::Step(s),
                None => FieldPart::Any,
            }
        } else if let Some((a, b)) = base.split_once('-') {
            let a = parse_num(a)?;
            let b = parse_num(b)?;
            if a > b {
                return Err(ClockError::Parse(format!(
                    "inverted range {}-{} in {} field",
                    a, b, name
                )));
            }
            match step {
                Some(s) => FieldPart::RangeStep(a, b, s),
                None => FieldPart::Range(a, b),
            }
        } else {
            let v = parse_num(base)?;
            match step {
                // `a/n` without a range end is not in the accepted grammar
                Some(_) => {
                    return Err(ClockError::Parse(format!(
                        "step requires '*' or a range in {} field",
                        name
                    )))
                }
                None => FieldPart::Value(v),
            }
        };

        Ok(part)
    }

    fn expand(part: &FieldPart, min: u32, max: u32, into: &mut BTreeSet<u32>) {
        match part {
            FieldPart::Any => into.extend(min..=max),
            FieldPart::Value(v) => {
                into.insert(*v);
            }
            FieldPart::Range(a, b) => into.extend(*a..=*b),
            FieldPart::Step(s) => into.extend((min..=max).step_by(*s as usize)),
            FieldPart::RangeStep(a, b, s) => into.extend((*a..=*b).step_by(*s as usize)),
        }
    }

    pub fn contains(&self, value: u32) -> bool {
        self.allowed.contains(&value)
    }

    /// Smallest allowed value strictly greater than `value`
    pub fn next_after(&self, value: u32) -> Option<u32> {
        self.allowed.range(value + 1..).next().copied()
    }

    /// Smallest allowed value
    pub fn first(&self) -> u32 {
        *self.allowed.iter().next().expect("field has at least one value")
    }

    pub fn is_any(&self) -> bool {
        self.allowed.len() == (self.max - self.min + 1) as usize
    }
}

impl fmt::Display for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", part)?;
        }
        Ok(())
    }
}
