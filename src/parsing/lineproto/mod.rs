use influxdb_line_protocol::{parse_lines, FieldValue, ParsedLine};

pub mod precision;

pub use precision::Precision;

/// Parses a full line protocol payload, failing on the first bad line.
pub fn parse_points(input: &str) -> Result<Vec<ParsedLine<'_>>, influxdb_line_protocol::Error> {
    parse_lines(input).collect()
}

/// Measurement name of a point.
pub fn measurement<'a>(line: &'a ParsedLine<'_>) -> &'a str {
    &line.series.measurement
}

/// Tag keys of a point, in arrival order.
pub fn tag_keys<'a, 'b>(line: &'a ParsedLine<'b>) -> impl Iterator<Item = &'a str> + use<'a, 'b> {
    line.series
        .tag_set
        .iter()
        .flatten()
        .map(|(key, _)| -> &str { key })
}

/// Serializes points back into canonical line protocol, one line per point,
/// each terminated by a newline. Tags are emitted in key order. Points
/// without a timestamp are stamped with the given wall clock time, scaled
/// to the payload precision.
pub fn write_points(
    points: &[ParsedLine<'_>],
    precision: Precision,
    now_nanos: i64,
    out: &mut String,
) {
    for point in points {
        write_point(point, precision, now_nanos, out);
        out.push('\n');
    }
}

fn write_point(point: &ParsedLine<'_>, precision: Precision, now_nanos: i64, out: &mut String) {
    push_escaped(out, &point.series.measurement, &[',', ' ']);

    if let Some(tag_set) = &point.series.tag_set {
        let mut tags: Vec<(&str, &str)> = tag_set.iter().map(|(k, v)| (&**k, &**v)).collect();
        tags.sort_by_key(|(k, _)| *k);

        for (key, value) in tags {
            out.push(',');
            push_escaped(out, key, &[',', '=', ' ']);
            out.push('=');
            push_escaped(out, value, &[',', '=', ' ']);
        }
    }

    out.push(' ');

    for (i, (key, value)) in point.field_set.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_escaped(out, key, &[',', '=', ' ']);
        out.push('=');
        write_field_value(value, out);
    }

    let timestamp = point
        .timestamp
        .unwrap_or_else(|| precision.scale_nanos(now_nanos));
    out.push(' ');
    out.push_str(&timestamp.to_string());
}

fn write_field_value(value: &FieldValue<'_>, out: &mut String) {
    match value {
        FieldValue::I64(v) => {
            out.push_str(&v.to_string());
            out.push('i');
        }
        FieldValue::U64(v) => {
            out.push_str(&v.to_string());
            out.push('u');
        }
        FieldValue::F64(v) => out.push_str(&v.to_string()),
        FieldValue::Boolean(v) => out.push_str(if *v { "true" } else { "false" }),
        FieldValue::String(v) => {
            out.push('"');
            for c in v.chars() {
                if c == '"' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
        }
    }
}

fn push_escaped(out: &mut String, value: &str, specials: &[char]) {
    for c in value.chars() {
        if specials.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}
