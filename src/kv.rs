//! `KEY=VALUE` environment parsing

use crate::error::{Error, Result};
use std::collections::HashMap;

const SEP: char = '=';

/// Parse a list of `KEY=VALUE` lines into a map.
///
/// The first `=` separates key from value; the value may contain further `=`.
/// Any line without a separator fails the whole parse. Callers that want to
/// tolerate a bad container (the mapper) skip on error instead of aborting.
pub fn parse_kv<S: AsRef<str>>(lines: &[S]) -> Result<HashMap<String, String>> {
    let mut out = HashMap::with_capacity(lines.len());
    for line in lines {
        let line = line.as_ref();
        let (key, value) = line
            .split_once(SEP)
            .ok_or_else(|| Error::InvalidLine(line.to_string()))?;
        out.insert(key.to_string(), value.to_string());
    }
    Ok(out)
}
