//! Glob-imported by every module in `policy-engine`.

pub use crate::strng::{self, Strng};
pub use itertools::Itertools;
