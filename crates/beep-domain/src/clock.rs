use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Current wall-clock time as an RFC 3339 string, the format every persisted
/// timestamp in the registry and profile documents uses.
#[must_use]
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_rfc3339_is_parseable() {
        let stamp = now_rfc3339();
        assert!(OffsetDateTime::parse(&stamp, &Rfc3339).is_ok());
    }
}
