//! Parsed forms of cleansing-function arguments.
//!
//! Raw arguments come straight from the pipeline configuration; parsing one
//! is a configuration concern, so failures are [`PipeError::Config`] and the
//! builder surfaces them before any row is processed. Parsed forms are
//! cached per operator instance under the key `function(rawArg)`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cleansing::csv_utils;
use crate::error::{PipeError, PipeResult};

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedArg {
    Concat(ConcatArg),
    FindReplace(FindReplaceArg),
    Substring(SubstringArg),
    Slice(SliceArg),
    IntFormat(IntFormat),
    PhoneFormat(PhoneFormat),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConcatArg {
    pub delimit: String,
    pub column_positions: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindReplaceArg {
    pub find: String,
    pub replace_with: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubstringArg {
    pub start: usize,
    pub end: i64,
}

/// `slice_input` argument: `"delim","v1",…` selects elements by index,
/// `"delim","from",":","to"` selects the half-open range `[from, to)`
/// (`to` may be omitted to run to the end). A leading empty field stands
/// for the argument's own separator character, so `,,1,:,3` reads as
/// delimiter `,`, from 1, to 3.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceArg {
    pub delimit: String,
    pub values: Option<Vec<usize>>,
    pub from: Option<usize>,
    pub to: Option<usize>,
}

/// A `reformat0`-style integer format: literal text around a single
/// `%d` / `%0Nd` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct IntFormat {
    pub prefix: String,
    pub suffix: String,
    pub zero_pad: usize,
}

impl IntFormat {
    pub fn format(&self, v: i64) -> String {
        format!(
            "{}{:0width$}{}",
            self.prefix,
            v,
            self.suffix,
            width = self.zero_pad
        )
    }
}

/// A `format_phone` format: literal text around three `%s` placeholders
/// for (area code, exchange code, subscriber number).
#[derive(Debug, Clone, PartialEq)]
pub struct PhoneFormat {
    pub parts: Vec<String>, // parts.len() == 4: text around the 3 slots
}

impl PhoneFormat {
    pub fn format(&self, area: &str, exchange: &str, subscriber: &str) -> String {
        let mut out = String::new();
        out.push_str(&self.parts[0]);
        out.push_str(area);
        out.push_str(&self.parts[1]);
        out.push_str(exchange);
        out.push_str(&self.parts[2]);
        out.push_str(subscriber);
        out.push_str(&self.parts[3]);
        out
    }
}

/// Per-operator argument cache. Not shared across operators so hot-path
/// lookups stay uncontended.
#[derive(Debug, Default)]
pub struct ArgCache {
    parsed: HashMap<String, Arc<ParsedArg>>,
    divisors: HashMap<String, f64>,
}

impl ArgCache {
    pub fn get_or_parse<F>(&mut self, function: &str, raw: &str, parse: F) -> PipeResult<Arc<ParsedArg>>
    where
        F: FnOnce(&str) -> PipeResult<ParsedArg>,
    {
        let key = format!("{function}({raw})");
        if let Some(arg) = self.parsed.get(&key) {
            return Ok(arg.clone());
        }
        let arg = Arc::new(parse(raw)?);
        self.parsed.insert(key, arg.clone());
        Ok(arg)
    }

    pub fn divisor(&mut self, function: &str, raw: &str) -> PipeResult<f64> {
        if let Some(d) = self.divisors.get(raw) {
            return Ok(*d);
        }
        let d: f64 = raw.parse().map_err(|_| {
            PipeError::config(format!(
                "divisor argument to function {function} is not a double: {raw}"
            ))
        })?;
        self.divisors.insert(raw.to_string(), d);
        Ok(d)
    }
}

fn first_row(function: &str, raw: &str) -> PipeResult<Vec<String>> {
    let rows = csv_utils::parse(raw)?;
    match rows.into_iter().next() {
        Some(row) if !row.is_empty() => Ok(row),
        _ => Err(PipeError::config(format!(
            "argument '{raw}' cannot be parsed as csv or is empty ({function} function)"
        ))),
    }
}

fn parse_index(function: &str, raw: &str, field: &str) -> PipeResult<usize> {
    field.trim().parse().map_err(|_| {
        PipeError::config(format!(
            "invalid argument '{raw}', expecting an int element ({function} function)"
        ))
    })
}

/// `concat`: column names only; `concat_with`: delimiter first, then column
/// names. Names are resolved to input positions at parse time.
pub fn parse_concat(
    function: &str,
    raw: &str,
    input_columns: &HashMap<String, usize>,
) -> PipeResult<ParsedArg> {
    let row = first_row(function, raw)?;
    let (delimit, names) = if function == "concat_with" {
        if row.len() < 2 {
            return Err(PipeError::config(format!(
                "argument '{raw}' must list a delimiter and at least one column ({function} function)"
            )));
        }
        (row[0].clone(), &row[1..])
    } else {
        (String::new(), &row[..])
    };
    let mut column_positions = Vec::with_capacity(names.len());
    for name in names {
        let pos = input_columns.get(name.trim()).ok_or_else(|| {
            PipeError::config(format!(
                "column '{name}' in {function} argument is not an input column"
            ))
        })?;
        column_positions.push(*pos);
    }
    Ok(ParsedArg::Concat(ConcatArg {
        delimit,
        column_positions,
    }))
}

pub fn parse_find_replace(function: &str, raw: &str) -> PipeResult<ParsedArg> {
    let row = first_row(function, raw)?;
    if row.len() != 2 {
        return Err(PipeError::config(format!(
            "argument '{raw}' must be \"find\",\"replace_with\" ({function} function)"
        )));
    }
    Ok(ParsedArg::FindReplace(FindReplaceArg {
        find: row[0].clone(),
        replace_with: row[1].clone(),
    }))
}

pub fn parse_substring(function: &str, raw: &str) -> PipeResult<ParsedArg> {
    let row = first_row(function, raw)?;
    if row.len() != 2 {
        return Err(PipeError::config(format!(
            "argument '{raw}' must be \"start\",\"end\" ({function} function)"
        )));
    }
    let start = parse_index(function, raw, &row[0])?;
    let end: i64 = row[1].trim().parse().map_err(|_| {
        PipeError::config(format!(
            "invalid argument '{raw}', expecting an int end ({function} function)"
        ))
    })?;
    Ok(ParsedArg::Substring(SubstringArg { start, end }))
}

pub fn parse_slice(function: &str, raw: &str) -> PipeResult<ParsedArg> {
    if raw.is_empty() {
        return Err(PipeError::config(format!(
            "unexpected empty argument to {function} function"
        )));
    }
    let sep = csv_utils::detect_delimiter(raw.as_bytes()).unwrap_or(',');
    let row = first_row(function, raw)?;

    // A leading empty field means the delimiter is the separator itself
    // (the unquoted spelling of e.g. `","`), consuming two empty fields.
    let (delimit, rest): (String, &[String]) = if row[0].is_empty() {
        let skip = if row.len() > 1 && row[1].is_empty() { 2 } else { 1 };
        (sep.to_string(), &row[skip..])
    } else {
        (row[0].clone(), &row[1..])
    };

    let arg = match rest.len() {
        0 => SliceArg {
            delimit,
            values: None,
            from: None,
            to: None,
        },
        1 => SliceArg {
            delimit,
            values: Some(vec![parse_index(function, raw, &rest[0])?]),
            from: None,
            to: None,
        },
        _ if rest[1].trim() == ":" => {
            let from = parse_index(function, raw, &rest[0])?;
            let to = match rest.len() {
                2 => None,
                3 => Some(parse_index(function, raw, &rest[2])?),
                _ => {
                    return Err(PipeError::config(format!(
                        "invalid argument '{raw}', expecting \"from\",\":\",\"to\" ({function} function)"
                    )));
                }
            };
            SliceArg {
                delimit,
                values: None,
                from: Some(from),
                to,
            }
        }
        _ => {
            let mut values = Vec::with_capacity(rest.len());
            for f in rest {
                values.push(parse_index(function, raw, f)?);
            }
            SliceArg {
                delimit,
                values: Some(values),
                from: None,
                to: None,
            }
        }
    };
    Ok(ParsedArg::Slice(arg))
}

/// Accepts `%d` or `%0Nd` with arbitrary literal text around it.
pub fn parse_int_format(function: &str, raw: &str) -> PipeResult<ParsedArg> {
    let Some(pct) = raw.find('%') else {
        return Err(PipeError::config(format!(
            "argument '{raw}' has no %d placeholder ({function} function)"
        )));
    };
    let prefix = raw[..pct].to_string();
    let body = &raw[pct + 1..];
    let digits_end = body.find(|c: char| !c.is_ascii_digit()).unwrap_or(body.len());
    let (pad, rest) = body.split_at(digits_end);
    if !rest.starts_with('d') {
        return Err(PipeError::config(format!(
            "argument '{raw}' is not a valid integer format ({function} function)"
        )));
    }
    let zero_pad = if pad.is_empty() {
        0
    } else {
        pad.parse().map_err(|_| {
            PipeError::config(format!(
                "argument '{raw}' has an invalid pad width ({function} function)"
            ))
        })?
    };
    Ok(ParsedArg::IntFormat(IntFormat {
        prefix,
        suffix: rest[1..].to_string(),
        zero_pad,
    }))
}

pub fn parse_phone_format(function: &str, raw: &str) -> PipeResult<ParsedArg> {
    let parts: Vec<String> = raw.split("%s").map(|s| s.to_string()).collect();
    if parts.len() != 4 {
        return Err(PipeError::config(format!(
            "argument '{raw}' must have exactly three %s placeholders ({function} function)"
        )));
    }
    Ok(ParsedArg::PhoneFormat(PhoneFormat { parts }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_arg_compact_range_form() {
        let arg = parse_slice("slice_input", ",,1,:,3").unwrap();
        assert_eq!(
            arg,
            ParsedArg::Slice(SliceArg {
                delimit: ",".to_string(),
                values: None,
                from: Some(1),
                to: Some(3),
            })
        );
    }

    #[test]
    fn slice_arg_index_list() {
        let arg = parse_slice("slice_input", ",,0,2").unwrap();
        assert_eq!(
            arg,
            ParsedArg::Slice(SliceArg {
                delimit: ",".to_string(),
                values: Some(vec![0, 2]),
                from: None,
                to: None,
            })
        );
    }

    #[test]
    fn slice_arg_open_range() {
        let arg = parse_slice("slice_input", "|,2,:").unwrap();
        match arg {
            ParsedArg::Slice(s) => {
                assert_eq!(s.delimit, "|");
                assert_eq!(s.from, Some(2));
                assert_eq!(s.to, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn int_format_round_trip() {
        let ParsedArg::IntFormat(f) = parse_int_format("reformat0", "%09d").unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(f.format(42), "000000042");
        assert!(parse_int_format("reformat0", "no placeholder").is_err());
    }

    #[test]
    fn phone_format_default() {
        let ParsedArg::PhoneFormat(f) = parse_phone_format("format_phone", "+1%s%s%s").unwrap()
        else {
            panic!("wrong variant");
        };
        assert_eq!(f.format("415", "555", "2671"), "+14155552671");
    }

    #[test]
    fn concat_resolves_column_names() {
        let cols: HashMap<String, usize> =
            [("first".to_string(), 0), ("last".to_string(), 2)].into();
        let ParsedArg::Concat(c) = parse_concat("concat_with", "-,first,last", &cols).unwrap()
        else {
            panic!("wrong variant");
        };
        assert_eq!(c.delimit, "-");
        assert_eq!(c.column_positions, vec![0, 2]);
        assert!(parse_concat("concat", "missing", &cols).is_err());
    }
}
