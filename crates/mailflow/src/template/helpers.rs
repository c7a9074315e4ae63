use chrono::{DateTime, NaiveDate, NaiveDateTime};
use handlebars::{Context, Handlebars, Helper, HelperResult, Output, RenderContext};
use serde_json::Value;

const CUSTOM: &[&str] = &[
    "uppercase",
    "lowercase",
    "default",
    "formatNumber",
    "formatCurrency",
    "formatDate",
];

const BUILT_IN: &[&str] = &[
    "eq", "ne", "gt", "gte", "lt", "lte", "and", "or", "not", "len", "raw", "lookup", "log",
];

pub(super) fn register(registry: &mut Handlebars<'static>) {
    registry.register_helper("uppercase", Box::new(uppercase));
    registry.register_helper("lowercase", Box::new(lowercase));
    registry.register_helper("default", Box::new(default_value));
    registry.register_helper("formatNumber", Box::new(format_number));
    registry.register_helper("formatCurrency", Box::new(format_currency));
    registry.register_helper("formatDate", Box::new(format_date));
}

pub(super) fn is_helper(name: &str) -> bool {
    CUSTOM.contains(&name) || BUILT_IN.contains(&name)
}

fn param<'a>(h: &'a Helper, idx: usize) -> Option<&'a Value> {
    h.param(idx).map(|p| p.value())
}

pub(crate) fn display(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn is_blank(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        _ => false,
    }
}

fn uppercase(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let text = param(h, 0).map(display).unwrap_or_default();
    out.write(&text.to_uppercase())?;
    Ok(())
}

fn lowercase(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let text = param(h, 0).map(display).unwrap_or_default();
    out.write(&text.to_lowercase())?;
    Ok(())
}

fn default_value(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let value = param(h, 0);
    let chosen = if is_blank(value) { param(h, 1) } else { value };
    out.write(&chosen.map(display).unwrap_or_default())?;
    Ok(())
}

fn format_number(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let text = match param(h, 0) {
        Some(v) => number_of(v)
            .map(|n| group_thousands(n, 3))
            .unwrap_or_else(|| display(v)),
        None => String::new(),
    };
    out.write(&text)?;
    Ok(())
}

fn format_currency(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let currency = param(h, 1)
        .and_then(|v| v.as_str())
        .unwrap_or("KRW")
        .to_uppercase();

    let text = match param(h, 0) {
        Some(v) => match number_of(v) {
            Some(n) => currency_string(n, &currency),
            None => display(v),
        },
        None => String::new(),
    };
    out.write(&text)?;
    Ok(())
}

fn format_date(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let Some(raw) = param(h, 0) else {
        return Ok(());
    };
    let pattern = match param(h, 1).and_then(|v| v.as_str()) {
        Some("short") => "%b %-d, %Y",
        Some("long") | None => "%B %-d, %Y",
        Some(custom) => custom,
    };

    let text = match raw.as_str().and_then(parse_date) {
        Some(dt) => {
            let mut s = String::new();
            // An invalid custom pattern leaves the input untouched.
            if std::fmt::Write::write_fmt(&mut s, format_args!("{}", dt.format(pattern))).is_ok() {
                s
            } else {
                display(raw)
            }
        }
        None => display(raw),
    };
    out.write(&text)?;
    Ok(())
}

fn number_of(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn parse_date(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_local());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt);
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// `1234567.891` with three fraction digits becomes `1,234,567.891`;
/// trailing zeros are dropped.
pub(crate) fn group_thousands(n: f64, max_fraction: usize) -> String {
    let negative = n < 0.0;
    let fixed = format!("{:.*}", max_fraction, n.abs());
    let (int_part, frac_part) = match fixed.split_once('.') {
        Some((i, f)) => (i.to_string(), f.trim_end_matches('0').to_string()),
        None => (fixed.clone(), String::new()),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let mut out = String::new();
    if negative && (grouped != "0" || !frac_part.is_empty()) {
        out.push('-');
    }
    out.push_str(&grouped);
    if !frac_part.is_empty() {
        out.push('.');
        out.push_str(&frac_part);
    }
    out
}

fn currency_string(n: f64, currency: &str) -> String {
    let (symbol, fraction) = match currency {
        "KRW" => ("₩", 0),
        "JPY" => ("¥", 0),
        "USD" => ("$", 2),
        "EUR" => ("€", 2),
        "GBP" => ("£", 2),
        _ => ("", 2),
    };

    let mut amount = group_thousands(n, fraction);
    if fraction > 0 {
        // Currency amounts keep their full fraction.
        let have = amount.split_once('.').map(|(_, f)| f.len()).unwrap_or(0);
        if have == 0 {
            amount.push('.');
        }
        for _ in have..fraction {
            amount.push('0');
        }
    }

    if symbol.is_empty() {
        format!("{currency} {amount}")
    } else if let Some(rest) = amount.strip_prefix('-') {
        format!("-{symbol}{rest}")
    } else {
        format!("{symbol}{amount}")
    }
}
