//! Canonical semantic field names and their physical-column candidates.
//!
//! Tenants ship wildly different log schemas. Detection rules are written
//! against canonical names; the resolver picks whichever physical column a
//! tenant's table actually has, trying candidates in order.

/// Ordered candidate lists, first match wins.
pub const CANONICAL_FIELDS: &[(&str, &[&str])] = &[
    ("ts", &["ts", "timestamp", "event_time", "time", "@timestamp"]),
    (
        "user",
        &["user", "username", "user_name", "account", "subject_user"],
    ),
    (
        "src_ip",
        &["src_ip", "source_ip", "client_ip", "remote_addr", "ip"],
    ),
    ("dest_ip", &["dest_ip", "destination_ip", "dst_ip", "server_ip"]),
    ("host", &["host", "hostname", "computer", "computer_name"]),
    (
        "event_type",
        &["event_type", "type", "category", "event_category"],
    ),
    ("message", &["message", "msg", "short_message", "body", "raw"]),
    ("event_id", &["event_id", "eventid", "code", "event_code"]),
    ("status", &["status", "result", "outcome", "action"]),
    ("extra", &["extra", "metadata", "attributes", "fields", "data"]),
];

/// Candidate physical names for a canonical field, empty when the name is
/// not canonical.
pub fn candidates(canonical: &str) -> &'static [&'static str] {
    CANONICAL_FIELDS
        .iter()
        .find(|(name, _)| *name == canonical)
        .map(|(_, candidates)| *candidates)
        .unwrap_or(&[])
}

pub fn is_canonical(name: &str) -> bool {
    CANONICAL_FIELDS.iter().any(|(candidate, _)| *candidate == name)
}
