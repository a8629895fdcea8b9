//! The cleansing function library: pure row-level transforms applied by the
//! `map_record` operator. Each function takes the raw column value, the
//! configured argument, and the full input row, and yields either a value
//! (possibly null) or a row-local error message that turns the row into a
//! bad-row record.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use crate::cleansing::args::{self, ArgCache, ParsedArg};
use crate::cleansing::overpunch;
use crate::core::value::{Row, Value, parse_date};
use crate::error::{BadValue, PipeError, PipeResult};

/// Per-operator cleansing state: compiled regexes, parsed arguments and the
/// input column map. Cheap to build, never shared across operators.
pub struct CleansingContext {
    re_cache: HashMap<String, Regex>,
    arg_cache: ArgCache,
    input_columns: Arc<HashMap<String, usize>>,
}

impl CleansingContext {
    pub fn new(input_columns: Arc<HashMap<String, usize>>) -> Self {
        Self {
            re_cache: HashMap::new(),
            arg_cache: ArgCache::default(),
            input_columns,
        }
    }

    /// Validate and cache the argument of a configured function call.
    /// The graph builder calls this for every `map` column before any row is
    /// processed, so a malformed argument aborts the node up front.
    pub fn precompile(&mut self, function: &str, argument: Option<&str>) -> PipeResult<()> {
        let arg = argument.unwrap_or("");
        match function {
            "trim" | "to_upper" | "validate_date" | "to_zip5" | "to_zipext4_from_zip9"
            | "to_zipext4" => Ok(()),
            "parse_amount" => {
                // the divisor argument is optional
                if let Some(raw) = argument {
                    if !raw.is_empty() && raw != "1" {
                        self.arg_cache.divisor(function, raw)?;
                    }
                }
                Ok(())
            }
            "format_phone" => {
                let fmt = if arg.is_empty() { "+1%s%s%s" } else { arg };
                self.arg_cache
                    .get_or_parse(function, fmt, |raw| args::parse_phone_format(function, raw))
                    .map(|_| ())
            }
            "reformat0" => self
                .arg_cache
                .get_or_parse(function, required(function, argument)?, |raw| {
                    args::parse_int_format(function, raw)
                })
                .map(|_| ()),
            "overpunch_number" => {
                let raw = required(function, argument)?;
                raw.parse::<usize>().map(|_| ()).map_err(|_| {
                    PipeError::config(format!(
                        "argument to function {function} is not an int: {raw}"
                    ))
                })
            }
            "apply_regex" => {
                let raw = required(function, argument)?;
                if !self.re_cache.contains_key(raw) {
                    let re = Regex::new(raw).map_err(|e| {
                        PipeError::config(format!("regex argument does not compile: {raw}: {e}"))
                    })?;
                    self.re_cache.insert(raw.to_string(), re);
                }
                Ok(())
            }
            "scale_units" => {
                let raw = required(function, argument)?;
                if raw != "1" {
                    self.arg_cache.divisor(function, raw)?;
                }
                Ok(())
            }
            "concat" | "concat_with" => {
                let raw = required(function, argument)?;
                let cols = self.input_columns.clone();
                self.arg_cache
                    .get_or_parse(function, raw, |raw| args::parse_concat(function, raw, &cols))
                    .map(|_| ())
            }
            "find_and_replace" => self
                .arg_cache
                .get_or_parse(function, required(function, argument)?, |raw| {
                    args::parse_find_replace(function, raw)
                })
                .map(|_| ()),
            "substring" => self
                .arg_cache
                .get_or_parse(function, required(function, argument)?, |raw| {
                    args::parse_substring(function, raw)
                })
                .map(|_| ()),
            "split_on" | "unique_split_on" => required(function, argument).map(|_| ()),
            "slice_input" => self
                .arg_cache
                .get_or_parse(function, required(function, argument)?, |raw| {
                    args::parse_slice(function, raw)
                })
                .map(|_| ()),
            other => Err(PipeError::config(format!(
                "unknown cleansing function: {other}"
            ))),
        }
    }

    /// Apply a precompiled cleansing function to one column value.
    pub fn apply(
        &mut self,
        function: &str,
        argument: Option<&str>,
        input_value: &str,
        input_row: &Row,
    ) -> Result<Value, BadValue> {
        let arg = argument.unwrap_or("");
        match function {
            "trim" => {
                let vv = input_value.trim();
                Ok(text_or_null(vv))
            }

            "to_upper" => Ok(Value::Text(input_value.to_uppercase())),

            "validate_date" => match parse_date(input_value) {
                Ok(_) => Ok(Value::Text(input_value.to_string())),
                Err(e) => Err(e),
            },

            "to_zip5" => to_zip5(input_value),

            "to_zipext4_from_zip9" => to_zipext4_from_zip9(input_value),

            "to_zipext4" => to_zipext4(input_value),

            "format_phone" => {
                let fmt_raw = if arg.is_empty() { "+1%s%s%s" } else { arg };
                let parsed = self.parsed("format_phone", fmt_raw);
                let ParsedArg::PhoneFormat(fmt) = parsed.as_ref() else {
                    return Err(BadValue::new("format_phone argument not compiled"));
                };
                format_phone(input_value, fmt)
            }

            "reformat0" => {
                let parsed = self.parsed("reformat0", arg);
                let ParsedArg::IntFormat(fmt) = parsed.as_ref() else {
                    return Err(BadValue::new("reformat0 argument not compiled"));
                };
                let digits = filter_digits(input_value);
                if digits.is_empty() {
                    return Ok(Value::Null);
                }
                let v: i64 = digits
                    .parse()
                    .map_err(|e| BadValue::new(format!("{e}")))?;
                Ok(Value::Text(fmt.format(v)))
            }

            "overpunch_number" => {
                let npos: usize = arg.parse().map_err(|e| BadValue::new(format!("{e}")))?;
                let vv = overpunch::decode(input_value, npos)?;
                Ok(text_or_null(&vv))
            }

            "apply_regex" => {
                let re = self
                    .re_cache
                    .get(arg)
                    .ok_or_else(|| BadValue::new("apply_regex argument not compiled"))?;
                match re.find(input_value) {
                    Some(m) if !m.as_str().is_empty() => Ok(Value::Text(m.as_str().to_string())),
                    _ => Ok(Value::Null),
                }
            }

            "scale_units" => {
                if arg == "1" {
                    Ok(text_or_null(&filter_double(input_value)))
                } else {
                    let divisor = self
                        .arg_cache
                        .divisor("scale_units", arg)
                        .map_err(|e| BadValue::new(e.to_string()))?;
                    let cleaned = filter_double(input_value);
                    let unit: f64 = cleaned
                        .parse()
                        .map_err(|e| BadValue::new(format!("{e}")))?;
                    Ok(Value::Text(format!("{:.6}", (unit / divisor).ceil())))
                }
            }

            "parse_amount" => {
                let cleaned = filter_double(input_value);
                if cleaned.is_empty() {
                    return Ok(Value::Null);
                }
                if arg.is_empty() || arg == "1" {
                    return Ok(Value::Text(cleaned));
                }
                let divisor = self
                    .arg_cache
                    .divisor("parse_amount", arg)
                    .map_err(|e| BadValue::new(e.to_string()))?;
                let amt: f64 = cleaned
                    .parse()
                    .map_err(|e| BadValue::new(format!("{e}")))?;
                Ok(Value::Text(format!("{:.6}", amt / divisor)))
            }

            "concat" | "concat_with" => {
                let parsed = self.parsed(function, arg);
                let ParsedArg::Concat(c) = parsed.as_ref() else {
                    return Err(BadValue::new("concat argument not compiled"));
                };
                let mut buf = String::from(input_value);
                for pos in &c.column_positions {
                    let v = &input_row[*pos];
                    if !v.is_null() {
                        if !c.delimit.is_empty() {
                            buf.push_str(&c.delimit);
                        }
                        buf.push_str(&v.render());
                    }
                }
                Ok(text_or_null(&buf))
            }

            "find_and_replace" => {
                let parsed = self.parsed(function, arg);
                let ParsedArg::FindReplace(fr) = parsed.as_ref() else {
                    return Err(BadValue::new("find_and_replace argument not compiled"));
                };
                let vv = input_value.replace(&fr.find, &fr.replace_with);
                Ok(text_or_null(&vv))
            }

            "substring" => {
                let parsed = self.parsed(function, arg);
                let ParsedArg::Substring(s) = parsed.as_ref() else {
                    return Err(BadValue::new("substring argument not compiled"));
                };
                let chars: Vec<char> = input_value.chars().collect();
                let end = if s.end < 0 {
                    chars.len() as i64 + s.end
                } else {
                    s.end
                };
                if end > chars.len() as i64 || end <= s.start as i64 {
                    Ok(Value::Null)
                } else {
                    Ok(Value::Text(
                        chars[s.start..end as usize].iter().collect(),
                    ))
                }
            }

            "split_on" => Ok(split_on(input_value, arg)),

            "unique_split_on" => Ok(unique_split_on(input_value, arg)),

            "slice_input" => {
                let parsed = self.parsed(function, arg);
                let ParsedArg::Slice(s) = parsed.as_ref() else {
                    return Err(BadValue::new("slice_input argument not compiled"));
                };
                Ok(slice_input(input_value, s))
            }

            other => Err(BadValue::new(format!("unknown cleansing function: {other}"))),
        }
    }

    /// Fetch a parsed argument from the cache. `precompile` ran at build
    /// time, so a miss can only happen on a programming error upstream;
    /// re-parsing here keeps the row path total.
    fn parsed(&mut self, function: &str, raw: &str) -> Arc<ParsedArg> {
        let cols = self.input_columns.clone();
        self.arg_cache
            .get_or_parse(function, raw, |raw| match function {
                "concat" | "concat_with" => args::parse_concat(function, raw, &cols),
                "find_and_replace" => args::parse_find_replace(function, raw),
                "substring" => args::parse_substring(function, raw),
                "slice_input" => args::parse_slice(function, raw),
                "reformat0" => args::parse_int_format(function, raw),
                "format_phone" => args::parse_phone_format(function, raw),
                _ => Err(PipeError::config(format!(
                    "function {function} takes no parsed argument"
                ))),
            })
            .expect("argument validated by precompile")
    }
}

fn required<'a>(function: &str, argument: Option<&'a str>) -> PipeResult<&'a str> {
    match argument {
        Some(a) if !a.is_empty() => Ok(a),
        _ => Err(PipeError::config(format!(
            "missing argument for function {function}"
        ))),
    }
}

fn text_or_null(v: &str) -> Value {
    if v.is_empty() {
        Value::Null
    } else {
        Value::Text(v.to_string())
    }
}

pub fn filter_digits(input: &str) -> String {
    input.chars().filter(|c| c.is_ascii_digit()).collect()
}

pub fn filter_double(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '-' || *c == '+' || *c == '.')
        .collect()
}

fn zip_or_null(zip: String, zero: &str) -> Value {
    if zip == zero { Value::Null } else { Value::Text(zip) }
}

fn to_zip5(input: &str) -> Result<Value, BadValue> {
    let digits = filter_digits(input);
    let v = match digits.len() {
        0 => Value::Null,
        1..=4 => zip_or_null(format!("{:0>5}", digits), "00000"),
        5 => zip_or_null(digits, "00000"),
        6..=8 => zip_or_null(format!("{:0>9}", digits)[..5].to_string(), "00000"),
        9 => zip_or_null(digits[..5].to_string(), "00000"),
        _ => Value::Null,
    };
    Ok(v)
}

fn to_zipext4_from_zip9(input: &str) -> Result<Value, BadValue> {
    let digits = filter_digits(input);
    let v = match digits.len() {
        0 => Value::Null,
        6..=8 => zip_or_null(format!("{:0>9}", digits)[5..].to_string(), "0000"),
        9 => zip_or_null(digits[5..].to_string(), "0000"),
        _ => Value::Null,
    };
    Ok(v)
}

fn to_zipext4(input: &str) -> Result<Value, BadValue> {
    let digits = filter_digits(input);
    let v = match digits.len() {
        0 => Value::Null,
        1..=3 => zip_or_null(format!("{:0>4}", digits), "0000"),
        4 => zip_or_null(digits, "0000"),
        _ => Value::Null,
    };
    Ok(v)
}

fn format_phone(input: &str, fmt: &args::PhoneFormat) -> Result<Value, BadValue> {
    let mut digits = filter_digits(input);
    if digits.len() < 10 {
        return Err(BadValue::new("too few digits"));
    }
    if digits.starts_with('0') {
        digits.remove(0);
    }
    if digits.starts_with('1') {
        digits.remove(0);
    }
    if digits.len() < 10 {
        return Err(BadValue::new("invalid sequence of digits"));
    }
    let area = &digits[0..3];
    let exchange = &digits[3..6];
    let subscriber = &digits[6..10];
    if area.starts_with('0') || area.starts_with('1') {
        return Err(BadValue::new("invalid area code"));
    }
    if exchange.starts_with('0') || exchange.starts_with('1') {
        return Err(BadValue::new("invalid exchange code"));
    }
    Ok(Value::Text(fmt.format(area, exchange, subscriber)))
}

fn split_on(input: &str, delimiter: &str) -> Value {
    if input.is_empty() || delimiter.is_empty() {
        return Value::Null;
    }
    Value::TextList(input.split(delimiter).map(|s| s.to_string()).collect())
}

/// Split, then make repeated values unique by suffixing each occurrence with
/// its within-group index (`a,b,a` becomes `a-0`, `b-0`, `a-1`). The
/// relative order across distinct values is not part of the contract.
fn unique_split_on(input: &str, delimiter: &str) -> Value {
    if input.is_empty() || delimiter.is_empty() {
        return Value::Null;
    }
    let mut seen: HashMap<&str, usize> = HashMap::new();
    let mut out = Vec::new();
    for part in input.split(delimiter) {
        let n = seen.entry(part).or_insert(0);
        out.push(format!("{part}-{n}"));
        *n += 1;
    }
    Value::TextList(out)
}

fn slice_input(input: &str, arg: &args::SliceArg) -> Value {
    if input.is_empty() {
        return Value::Null;
    }
    let parts: Vec<&str> = input.split(arg.delimit.as_str()).collect();
    let l = parts.len();
    let selected: Vec<String> = match (&arg.values, arg.from, arg.to) {
        (None, None, None) => parts.iter().map(|s| s.to_string()).collect(),
        (Some(values), _, _) => values
            .iter()
            .filter(|i| **i < l)
            .map(|i| parts[*i].to_string())
            .collect(),
        (None, Some(from), to) => {
            let to = to.unwrap_or(l).min(l);
            if from >= to {
                Vec::new()
            } else {
                parts[from..to].iter().map(|s| s.to_string()).collect()
            }
        }
        (None, None, Some(_)) => Vec::new(),
    };
    if selected.is_empty() {
        Value::Null
    } else {
        Value::TextList(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ctx() -> CleansingContext {
        let cols: HashMap<String, usize> = [
            ("first".to_string(), 0),
            ("middle".to_string(), 1),
            ("last".to_string(), 2),
        ]
        .into();
        CleansingContext::new(Arc::new(cols))
    }

    fn apply(function: &str, argument: Option<&str>, value: &str) -> Result<Value, BadValue> {
        let mut ctx = ctx();
        ctx.precompile(function, argument).unwrap();
        ctx.apply(function, argument, value, &vec![])
    }

    #[test]
    fn trim_empties_to_null() {
        assert_eq!(apply("trim", None, "  ab ").unwrap(), Value::Text("ab".into()));
        assert_eq!(apply("trim", None, "   ").unwrap(), Value::Null);
    }

    #[test]
    fn zip5_scenarios() {
        assert_eq!(
            apply("to_zip5", None, "12345-6789").unwrap(),
            Value::Text("12345".into())
        );
        assert_eq!(
            apply("to_zip5", None, "01234").unwrap(),
            Value::Text("01234".into())
        );
        assert_eq!(apply("to_zip5", None, "00000").unwrap(), Value::Null);
        assert_eq!(apply("to_zip5", None, "").unwrap(), Value::Null);
        assert_eq!(
            apply("to_zip5", None, "123").unwrap(),
            Value::Text("00123".into())
        );
        assert_eq!(
            apply("to_zip5", None, "1234567").unwrap(),
            Value::Text("00123".into())
        );
    }

    #[test]
    fn zipext4_variants() {
        assert_eq!(
            apply("to_zipext4_from_zip9", None, "123456789").unwrap(),
            Value::Text("6789".into())
        );
        assert_eq!(
            apply("to_zipext4_from_zip9", None, "1234567").unwrap(),
            Value::Text("4567".into())
        );
        assert_eq!(
            apply("to_zipext4", None, "12").unwrap(),
            Value::Text("0012".into())
        );
        assert_eq!(apply("to_zipext4", None, "0000").unwrap(), Value::Null);
    }

    #[test]
    fn format_phone_scenarios() {
        assert_eq!(
            apply("format_phone", Some("+1%s%s%s"), "+1 (415) 555-2671").unwrap(),
            Value::Text("+14155552671".into())
        );
        assert_eq!(
            apply("format_phone", None, "0415").unwrap_err(),
            BadValue::new("too few digits")
        );
        assert_eq!(
            apply("format_phone", None, "415 155 2671").unwrap_err(),
            BadValue::new("invalid exchange code")
        );
    }

    #[test]
    fn slice_input_scenarios() {
        assert_eq!(
            apply("slice_input", Some(",,1,:,3"), "a,b,c,d,e").unwrap(),
            Value::TextList(vec!["b".into(), "c".into()])
        );
        assert_eq!(
            apply("slice_input", Some(",,0,2"), "a,b,c").unwrap(),
            Value::TextList(vec!["a".into(), "c".into()])
        );
        assert_eq!(apply("slice_input", Some(",,0,2"), "").unwrap(), Value::Null);
    }

    #[test]
    fn concat_with_appends_columns() {
        let mut ctx = ctx();
        ctx.precompile("concat_with", Some("-,first,last")).unwrap();
        let row = vec![
            Value::Text("john".into()),
            Value::Null,
            Value::Text("doe".into()),
        ];
        assert_eq!(
            ctx.apply("concat_with", Some("-,first,last"), "id", &row)
                .unwrap(),
            Value::Text("id-john-doe".into())
        );
    }

    #[test]
    fn unique_split_on_suffixes_duplicates() {
        let v = apply("unique_split_on", Some(","), "a,b,a,c").unwrap();
        let Value::TextList(items) = v else { panic!("expected list") };
        let mut items = items;
        items.sort();
        assert_eq!(items, vec!["a-0", "a-1", "b-0", "c-0"]);
    }

    #[test]
    fn substring_negative_end() {
        assert_eq!(
            apply("substring", Some("1,-1"), "abcdef").unwrap(),
            Value::Text("bcde".into())
        );
        assert_eq!(apply("substring", Some("3,2"), "abcdef").unwrap(), Value::Null);
    }

    #[test]
    fn scale_units_and_parse_amount_format_text() {
        assert_eq!(
            apply("scale_units", Some("10"), "25").unwrap(),
            Value::Text("3.000000".into())
        );
        assert_eq!(
            apply("parse_amount", Some("100"), "$1,250").unwrap(),
            Value::Text("12.500000".into())
        );
        assert_eq!(
            apply("parse_amount", None, "$1,250.75").unwrap(),
            Value::Text("1250.75".into())
        );
    }

    #[test]
    fn unknown_function_is_a_config_error() {
        let mut ctx = ctx();
        assert!(ctx.precompile("not_a_function", None).is_err());
    }

    proptest! {
        // to_zip5 is idempotent: applying twice equals applying once
        #[test]
        fn to_zip5_idempotent(s in "[0-9 -]{0,12}") {
            let once = apply("to_zip5", None, &s).unwrap();
            let again = match &once {
                Value::Text(t) => apply("to_zip5", None, t).unwrap(),
                Value::Null => Value::Null,
                other => panic!("unexpected {other:?}"),
            };
            prop_assert_eq!(once, again);
        }

        // concat with an empty delimiter equals naive concatenation
        #[test]
        fn concat_empty_delimiter(a in "[a-z]{0,6}", b in "[a-z]{0,6}", v in "[a-z]{0,6}") {
            let mut ctx = ctx();
            ctx.precompile("concat", Some("first,last")).unwrap();
            let row = vec![
                Value::Text(a.clone()),
                Value::Null,
                Value::Text(b.clone()),
            ];
            let got = ctx.apply("concat", Some("first,last"), &v, &row).unwrap();
            let expected = format!("{v}{a}{b}");
            if expected.is_empty() {
                prop_assert_eq!(got, Value::Null);
            } else {
                prop_assert_eq!(got, Value::Text(expected));
            }
        }
    }
}
