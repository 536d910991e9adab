/// Timestamp precision of a line protocol payload, as named by the
/// `precision` query parameter on the write endpoints. Parsed timestamps
/// stay in this unit on the wire; only missing timestamps need the
/// nanosecond conversion.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub enum Precision {
    #[default]
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl Precision {
    /// Interprets the `precision` query parameter. An absent or unknown
    /// value falls back to nanoseconds, like the InfluxDB write endpoint.
    pub fn from_query(value: Option<&str>) -> Precision {
        match value {
            Some("us") => Precision::Microseconds,
            Some("ms") => Precision::Milliseconds,
            Some("s") => Precision::Seconds,
            _ => Precision::Nanoseconds,
        }
    }

    /// Nanoseconds per unit of this precision.
    fn factor(&self) -> i64 {
        match self {
            Precision::Nanoseconds => 1,
            Precision::Microseconds => 1_000,
            Precision::Milliseconds => 1_000_000,
            Precision::Seconds => 1_000_000_000,
        }
    }

    /// Scales a wall clock reading in nanoseconds down to this unit, for
    /// stamping points that arrived without a timestamp.
    pub fn scale_nanos(&self, nanos: i64) -> i64 {
        nanos / self.factor()
    }
}
